use keel_core::{ManagedResource, ObjectRef, Result, RetryPolicy, Verb, WriteOptions};
use keel_store::ResourceStore;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{poll_immediate, record_verb, Step};

/// Whole-object update under optimistic concurrency.
///
/// Each attempt fetches the latest version and replaces it with
/// `mutate(fresh copy)`. Version conflicts are retried every
/// `policy.interval` until `policy.timeout`; absence and every other error
/// are returned on first occurrence. Running out of time yields
/// `DeadlineExceeded` with the attempt count.
pub async fn try_update<S, F>(
    store: &S,
    target: &ObjectRef,
    mutate: F,
    opts: &WriteOptions,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<ManagedResource>
where
    S: ResourceStore + ?Sized,
    F: Fn(ManagedResource) -> ManagedResource,
{
    let mutate = &mutate;
    let out = poll_immediate(target, policy, cancel, move |attempt| async move {
        counter!("update_attempts_total", 1);
        let current = store.get(target).await?;
        match store.update(&mutate(current), opts).await {
            Ok(updated) => Ok(Step::Ready(updated)),
            Err(e) if e.is_version_conflict() => {
                counter!("update_conflicts_total", 1);
                warn!(object = %target, attempt, error = %e, "update conflicted; retrying");
                Ok(Step::Pending(Some(e.to_string())))
            }
            Err(e) => Err(e),
        }
    })
    .await?;
    record_verb(target, Verb::Updated);
    Ok(out)
}
