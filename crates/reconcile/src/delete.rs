use keel_core::{DeleteOptions, Error, LabelSelector, ObjectRef, ResourceKind, Result, Verb};
use keel_store::ResourceStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{record_verb, wait_until_selector_gone, WaitOptions};

/// Where a target's dependents live: their kind, and the dotted path of the
/// label selector on the target that picks them out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependents {
    pub kind: ResourceKind,
    pub selector_path: String,
}

impl Dependents {
    pub fn new(kind: ResourceKind, selector_path: &str) -> Self {
        Self { kind, selector_path: selector_path.to_string() }
    }

    /// Pods selected by `spec.selector` (Deployments, StatefulSets, ...).
    pub fn pods() -> Self {
        Self::new(ResourceKind::pod(), "spec.selector")
    }
}

impl Default for Dependents {
    fn default() -> Self {
        Self::pods()
    }
}

/// Foreground-delete `target` and wait until its dependents have terminated.
///
/// Deleting an absent object is not an error and returns [`Verb::Unchanged`];
/// the object vanishing between fetch and delete counts as deleted. A target
/// with no selector at `dependents.selector_path` has nothing to wait for.
pub async fn delete_cascading<S>(
    store: &S,
    target: &ObjectRef,
    dependents: &Dependents,
    wait: &WaitOptions,
    cancel: &CancellationToken,
) -> Result<Verb>
where
    S: ResourceStore + ?Sized,
{
    let Some(current) = store.get_opt(target).await? else {
        debug!(object = %target, "already absent");
        return Ok(Verb::Unchanged);
    };
    let selector: Option<LabelSelector> = match current.field(&dependents.selector_path) {
        Some(raw) => Some(serde_json::from_value(raw.clone()).map_err(|e| Error::Invalid {
            target: target.clone(),
            message: format!("{}: {}", dependents.selector_path, e),
        })?),
        None => None,
    };

    info!(object = %target, "deleting with foreground propagation");
    match store.delete(target, &DeleteOptions::foreground()).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => debug!(object = %target, "vanished before delete"),
        Err(e) => return Err(e),
    }
    record_verb(target, Verb::Deleted);

    if let Some(selector) = selector {
        wait_until_selector_gone(store, target, &dependents.kind, &selector, wait, cancel).await?;
    }
    Ok(Verb::Deleted)
}
