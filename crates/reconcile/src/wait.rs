use keel_core::{Error, FetchErrors, LabelSelector, ManagedResource, ObjectRef, ResourceKind, Result, RetryPolicy};
use keel_store::ResourceStore;
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{poll_immediate, Step};

/// Poll policy plus what to do with fetch errors while polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub policy: RetryPolicy,
    pub fetch_errors: FetchErrors,
}

impl WaitOptions {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, fetch_errors: FetchErrors::default() }
    }

    pub fn fail_fast(mut self) -> Self {
        self.fetch_errors = FetchErrors::FailFast;
        self
    }
}

/// `status.readyReplicas == spec.replicas`, both defaulting to 0.
pub fn replicas_ready(obj: &ManagedResource) -> bool {
    let desired = obj.field("spec.replicas").and_then(Json::as_i64).unwrap_or(0);
    let ready = obj.field("status.readyReplicas").and_then(Json::as_i64).unwrap_or(0);
    desired == ready
}

fn fetch_failed<T>(e: Error, opts: &WaitOptions, target: &ObjectRef, attempt: u32) -> Result<Step<T>> {
    match opts.fetch_errors {
        FetchErrors::Tolerate => {
            debug!(object = %target, attempt, error = %e, "fetch failed; counting as not ready");
            Ok(Step::Pending(Some(e.to_string())))
        }
        FetchErrors::FailFast => Err(e),
    }
}

fn observe(kind: &'static str, started: Instant, res: &Result<impl Sized>) {
    histogram!("wait_latency_ms", started.elapsed().as_secs_f64() * 1000.0, "wait" => kind);
    if matches!(res, Err(e) if e.is_deadline_exceeded()) {
        counter!("wait_timeouts_total", 1, "wait" => kind);
    }
}

/// Poll `target` until `ready` holds for a fetched snapshot, returning that
/// snapshot. With [`FetchErrors::Tolerate`] a failed fetch (absence included)
/// counts as "not ready yet", so a permanently unreachable object only
/// surfaces when the deadline fires.
pub async fn wait_until_ready<S, P>(
    store: &S,
    target: &ObjectRef,
    ready: P,
    opts: &WaitOptions,
    cancel: &CancellationToken,
) -> Result<ManagedResource>
where
    S: ResourceStore + ?Sized,
    P: Fn(&ManagedResource) -> bool,
{
    let started = Instant::now();
    let ready = &ready;
    let res = poll_immediate(target, &opts.policy, cancel, move |attempt| async move {
        match store.get(target).await {
            Ok(obj) if ready(&obj) => Ok(Step::Ready(obj)),
            Ok(_) => {
                debug!(object = %target, attempt, "not ready");
                Ok(Step::Pending(None))
            }
            Err(e) => fetch_failed(e, opts, target, attempt),
        }
    })
    .await;
    observe("ready", started, &res);
    res
}

/// Poll until no object of `kind` in `owner`'s namespace matches `selector`.
/// Errors name `owner`, the object whose dependents are being waited on.
pub async fn wait_until_selector_gone<S>(
    store: &S,
    owner: &ObjectRef,
    kind: &ResourceKind,
    selector: &LabelSelector,
    opts: &WaitOptions,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: ResourceStore + ?Sized,
{
    let started = Instant::now();
    let namespace = owner.namespace.as_deref();
    let res = poll_immediate(owner, &opts.policy, cancel, move |attempt| async move {
        match store.list(kind, namespace, selector).await {
            Ok(items) if items.is_empty() => Ok(Step::Ready(())),
            Ok(items) => {
                debug!(object = %owner, selector = %selector, remaining = items.len(), attempt, "dependents still present");
                Ok(Step::Pending(Some(format!("{} {} still match {}", items.len(), kind.kind, selector))))
            }
            Err(e) => fetch_failed(e, opts, owner, attempt),
        }
    })
    .await;
    observe("dependents", started, &res);
    res
}
