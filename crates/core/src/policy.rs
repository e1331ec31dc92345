use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Observable effect of a reconciliation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Created,
    Patched,
    Updated,
    Unchanged,
    Deleted,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Created => "created",
            Verb::Patched => "patched",
            Verb::Updated => "updated",
            Verb::Unchanged => "unchanged",
            Verb::Deleted => "deleted",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed poll interval plus an overall deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// What a wait loop does with a failed fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchErrors {
    /// Count it as "not ready yet" and keep polling until the deadline.
    #[default]
    Tolerate,
    /// Return the fetch error immediately.
    FailFast,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    pub dry_run: bool,
    /// Field-ownership identifier forwarded to the store.
    pub field_manager: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Propagation {
    /// Dependents are removed before the owner disappears.
    #[default]
    Foreground,
    Background,
    Orphan,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    pub propagation: Propagation,
    pub dry_run: bool,
}

impl DeleteOptions {
    pub fn foreground() -> Self {
        Self { propagation: Propagation::Foreground, dry_run: false }
    }
}

/// Poll policies for the three kinds of waits callers usually need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    /// Optimistic-concurrency update retries.
    pub retry: RetryPolicy,
    /// Readiness waits after a rollout.
    pub readiness: RetryPolicy,
    /// Dependent-termination waits after a cascading delete.
    pub gc: RetryPolicy,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(Duration::from_millis(50), Duration::from_secs(2)),
            readiness: RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(10 * 60)),
            gc: RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(5 * 60)),
        }
    }
}

impl PollSettings {
    /// Defaults overridden by `KEEL_{RETRY,READINESS,GC}_{INTERVAL_MS,TIMEOUT_SECS}`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            retry: policy_from_env("RETRY", d.retry),
            readiness: policy_from_env("READINESS", d.readiness),
            gc: policy_from_env("GC", d.gc),
        }
    }
}

fn policy_from_env(prefix: &str, fallback: RetryPolicy) -> RetryPolicy {
    let interval = env_u64(&format!("KEEL_{}_INTERVAL_MS", prefix))
        .map(Duration::from_millis)
        .unwrap_or(fallback.interval);
    let timeout = env_u64(&format!("KEEL_{}_TIMEOUT_SECS", prefix))
        .map(Duration::from_secs)
        .unwrap_or(fallback.timeout);
    RetryPolicy::new(interval, timeout)
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key = %key, value = %raw, "ignoring unparsable duration override");
            None
        }
    }
}
