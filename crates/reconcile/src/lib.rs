//! Keel reconcile: converge store objects toward a caller-declared state.
//!
//! - [`create_or_patch`] / [`patch`] / [`patch_object`]: fetch, diff, and send only what changed.
//! - [`try_update`]: whole-object update retried on version conflicts.
//! - [`wait_until_ready`]: poll a predicate until it holds or the deadline fires.
//! - [`delete_cascading`]: foreground delete, then wait for dependents to terminate.
//!
//! Every operation re-reads the store; nothing is cached between calls.
//! Polling operations take an explicit [`RetryPolicy`] and a
//! [`CancellationToken`] so callers can abort a wait on shutdown.

#![forbid(unsafe_code)]

use keel_core::{ObjectRef, Verb, WriteOptions};
use keel_patch::MergeKeys;
use metrics::counter;

mod delete;
mod poll;
mod reconciler;
mod update;
mod wait;

pub use delete::{delete_cascading, Dependents};
pub use keel_core::{FetchErrors, RetryPolicy};
pub use poll::{poll_immediate, Step};
pub use reconciler::{create_or_patch, patch, patch_object};
pub use tokio_util::sync::CancellationToken;
pub use update::try_update;
pub use wait::{replicas_ready, wait_until_ready, wait_until_selector_gone, WaitOptions};

/// Options for the create-or-patch path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchOptions {
    pub dry_run: bool,
    pub field_manager: Option<String>,
    /// List merge keys for the kind being patched; empty means plain JSON merge.
    pub merge_keys: MergeKeys,
}

impl PatchOptions {
    pub fn with_merge_keys(mut self, keys: MergeKeys) -> Self {
        self.merge_keys = keys;
        self
    }

    pub fn write(&self) -> WriteOptions {
        WriteOptions { dry_run: self.dry_run, field_manager: self.field_manager.clone() }
    }
}

fn record_verb(target: &ObjectRef, verb: Verb) {
    counter!("reconcile_verb_total", 1, "verb" => verb.as_str(), "kind" => target.kind.kind.clone());
}
