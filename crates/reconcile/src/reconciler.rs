use keel_core::{Error, ManagedResource, ObjectRef, Result, Verb};
use keel_store::ResourceStore;
use tracing::{debug, info};

use crate::{record_verb, PatchOptions};

/// Fetch `target`; create it from `mutate(bare object)` when absent,
/// otherwise [`patch`] it. Fetch errors other than absence are returned as-is.
///
/// A create that races another writer surfaces as `AlreadyExists`; the
/// caller is expected to re-run the reconciliation.
pub async fn create_or_patch<S, F>(
    store: &S,
    target: &ObjectRef,
    mutate: F,
    opts: &PatchOptions,
) -> Result<(ManagedResource, Verb)>
where
    S: ResourceStore + ?Sized,
    F: Fn(ManagedResource) -> ManagedResource,
{
    let current = match store.get(target).await {
        Ok(current) => current,
        Err(e) if e.is_not_found() => {
            let desired = mutate(ManagedResource::new(target));
            if desired.object_ref() != *target {
                return Err(Error::Invalid {
                    target: target.clone(),
                    message: format!("mutation changed identity to {}", desired.object_ref()),
                });
            }
            info!(object = %target, dry_run = opts.dry_run, "creating");
            let out = store.create(&desired, &opts.write()).await?;
            record_verb(target, Verb::Created);
            return Ok((out, Verb::Created));
        }
        Err(e) => return Err(e),
    };
    patch(store, &current, mutate, opts).await
}

/// Apply `mutate` to a private copy of `current` and send the difference.
pub async fn patch<S, F>(
    store: &S,
    current: &ManagedResource,
    mutate: F,
    opts: &PatchOptions,
) -> Result<(ManagedResource, Verb)>
where
    S: ResourceStore + ?Sized,
    F: FnOnce(ManagedResource) -> ManagedResource,
{
    let modified = mutate(current.clone());
    patch_object(store, current, &modified, opts).await
}

/// Diff `current` against `modified` and submit the result as a partial
/// update. An empty diff returns `current` untouched with [`Verb::Unchanged`].
pub async fn patch_object<S>(
    store: &S,
    current: &ManagedResource,
    modified: &ManagedResource,
    opts: &PatchOptions,
) -> Result<(ManagedResource, Verb)>
where
    S: ResourceStore + ?Sized,
{
    let target = current.object_ref();
    let patch = keel_patch::two_way(&current.to_json()?, &modified.to_json()?, &opts.merge_keys)
        .map_err(|e| Error::Invalid { target: target.clone(), message: e.to_string() })?;
    if patch.is_empty() {
        debug!(object = %target, "unchanged");
        record_verb(&target, Verb::Unchanged);
        return Ok((current.clone(), Verb::Unchanged));
    }
    let summary = patch.summary();
    info!(
        object = %target,
        adds = summary.adds,
        updates = summary.updates,
        removes = summary.removes,
        strategic = patch.is_strategic(),
        dry_run = opts.dry_run,
        "patching"
    );
    debug!(object = %target, patch = %patch, "patch body");
    let out = store.patch(&target, &patch, &opts.write()).await?;
    record_verb(&target, Verb::Patched);
    Ok((out, Verb::Patched))
}
