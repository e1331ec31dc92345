use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use keel_core::{
    DeleteOptions, Error, LabelSelector, ManagedResource, ObjectRef, Propagation, ResourceKind, Result, WriteOptions,
};
use keel_patch::{MergeKeys, MergePatch};
use tracing::debug;
use uuid::Uuid;

use crate::ResourceStore;

const FOREGROUND_FINALIZER: &str = "foregroundDeletion";
const CONFLICT_MESSAGE: &str = "the object has been modified; please apply your changes to the latest version and try again";

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectRef, ManagedResource>,
    revision: u64,
    writes: u64,
}

impl State {
    fn next_rv(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn dependents_of(&self, uid: &str) -> Vec<ObjectRef> {
        self.objects.iter().filter(|(_, o)| o.metadata.is_owned_by(uid)).map(|(k, _)| k.clone()).collect()
    }

    fn delete(&mut self, key: &ObjectRef, propagation: Propagation, visited: &mut BTreeSet<ObjectRef>) {
        if !visited.insert(key.clone()) {
            return;
        }
        let Some(uid) = self.objects.get(key).map(|o| o.metadata.uid.clone().unwrap_or_default()) else {
            return;
        };
        for dep in self.dependents_of(&uid) {
            match propagation {
                Propagation::Orphan => {
                    let rv = self.next_rv();
                    if let Some(o) = self.objects.get_mut(&dep) {
                        o.metadata.owner_references.retain(|r| r.uid != uid);
                        o.metadata.resource_version = Some(rv);
                    }
                }
                Propagation::Foreground | Propagation::Background => self.delete(&dep, propagation, visited),
            }
        }
        let blocked = propagation == Propagation::Foreground && !self.dependents_of(&uid).is_empty();
        let rv = self.next_rv();
        let now = chrono::Utc::now().to_rfc3339();
        let remove = match self.objects.get_mut(key) {
            Some(o) => {
                if blocked && !o.metadata.finalizers.iter().any(|f| f == FOREGROUND_FINALIZER) {
                    o.metadata.finalizers.push(FOREGROUND_FINALIZER.to_string());
                }
                if o.metadata.finalizers.is_empty() {
                    true
                } else {
                    if o.metadata.deletion_timestamp.is_none() {
                        o.metadata.deletion_timestamp = Some(now);
                        o.metadata.resource_version = Some(rv);
                    }
                    false
                }
            }
            None => false,
        };
        if remove {
            self.objects.remove(key);
        }
    }

    /// Drop terminating objects whose finalizers are done, releasing
    /// foreground owners once their last dependent is gone.
    fn sweep(&mut self) {
        loop {
            let mut changed = false;
            let terminating: Vec<(ObjectRef, String)> = self
                .objects
                .iter()
                .filter(|(_, o)| o.is_terminating())
                .map(|(k, o)| (k.clone(), o.metadata.uid.clone().unwrap_or_default()))
                .collect();
            for (key, uid) in terminating {
                let blocked = !self.dependents_of(&uid).is_empty();
                let remove = match self.objects.get_mut(&key) {
                    Some(o) => {
                        if !blocked && o.metadata.finalizers.iter().any(|f| f == FOREGROUND_FINALIZER) {
                            o.metadata.finalizers.retain(|f| f != FOREGROUND_FINALIZER);
                            changed = true;
                        }
                        o.metadata.finalizers.is_empty()
                    }
                    None => false,
                };
                if remove {
                    debug!(object = %key, "finalized");
                    self.objects.remove(&key);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }
}

/// In-process [`ResourceStore`] with Kubernetes-like semantics: resource
/// versions, uids, owner-reference cascades, finalizers and dry-run.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    merge_keys: BTreeMap<ResourceKind, MergeKeys>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare list merge keys used when applying strategic patches to `kind`.
    pub fn with_merge_keys(mut self, kind: ResourceKind, keys: MergeKeys) -> Self {
        self.merge_keys.insert(kind, keys);
        self
    }

    /// Number of persisted writes so far (dry-runs and no-op writes excluded).
    pub fn writes(&self) -> u64 {
        self.state.lock().map(|s| s.writes).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| Error::Transport(anyhow!("memory store lock poisoned")))
    }

    fn get_now(&self, target: &ObjectRef) -> Result<ManagedResource> {
        self.lock()?.objects.get(target).cloned().ok_or_else(|| Error::NotFound(target.clone()))
    }

    fn create_now(&self, obj: &ManagedResource, opts: &WriteOptions) -> Result<ManagedResource> {
        let key = obj.object_ref();
        if key.name.is_empty() {
            return Err(Error::Invalid { target: key, message: "metadata.name is required".into() });
        }
        if obj.resource_version().is_some() {
            return Err(Error::Invalid {
                target: key,
                message: "resourceVersion should not be set on objects to be created".into(),
            });
        }
        let mut state = self.lock()?;
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists(key));
        }
        let mut stored = obj.clone();
        stored.metadata.uid = Some(Uuid::new_v4().to_string());
        stored.metadata.creation_timestamp = Some(chrono::Utc::now().to_rfc3339());
        stored.metadata.deletion_timestamp = None;
        if opts.dry_run {
            return Ok(stored);
        }
        stored.metadata.resource_version = Some(state.next_rv());
        state.objects.insert(key, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    fn update_now(&self, obj: &ManagedResource, opts: &WriteOptions) -> Result<ManagedResource> {
        let key = obj.object_ref();
        let mut state = self.lock()?;
        let existing = state.objects.get(&key).cloned().ok_or_else(|| Error::NotFound(key.clone()))?;
        if let Some(rv) = obj.resource_version() {
            if Some(rv) != existing.resource_version() {
                return Err(Error::VersionConflict { target: key, message: CONFLICT_MESSAGE.into() });
            }
        }
        let mut next = obj.clone();
        preserve_server_fields(&mut next, &existing);
        next.metadata.resource_version = existing.metadata.resource_version.clone();
        if next == existing || opts.dry_run {
            return Ok(next);
        }
        next.metadata.resource_version = Some(state.next_rv());
        state.objects.insert(key, next.clone());
        state.writes += 1;
        state.sweep();
        Ok(next)
    }

    fn patch_now(&self, target: &ObjectRef, patch: &MergePatch, opts: &WriteOptions) -> Result<ManagedResource> {
        let mut state = self.lock()?;
        let existing = state.objects.get(target).cloned().ok_or_else(|| Error::NotFound(target.clone()))?;
        if let Some(rv) = patch.body().get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|v| v.as_str()) {
            if Some(rv) != existing.resource_version() {
                return Err(Error::VersionConflict { target: target.clone(), message: CONFLICT_MESSAGE.into() });
            }
        }
        // Plain merge patches replace lists wholesale.
        let empty = MergeKeys::new();
        let keys = match self.merge_keys.get(&target.kind) {
            Some(keys) if patch.is_strategic() => keys,
            _ => &empty,
        };
        let merged = keel_patch::apply(&existing.to_json()?, &patch.to_json(), keys)
            .map_err(|e| Error::Invalid { target: target.clone(), message: e.to_string() })?;
        let mut next = ManagedResource::from_json(merged)
            .map_err(|e| Error::Invalid { target: target.clone(), message: e.to_string() })?;
        if next.object_ref() != *target {
            return Err(Error::Invalid { target: target.clone(), message: "identity fields are immutable".into() });
        }
        preserve_server_fields(&mut next, &existing);
        if next == existing || opts.dry_run {
            return Ok(next);
        }
        next.metadata.resource_version = Some(state.next_rv());
        state.objects.insert(target.clone(), next.clone());
        state.writes += 1;
        state.sweep();
        Ok(next)
    }

    fn delete_now(&self, target: &ObjectRef, opts: &DeleteOptions) -> Result<()> {
        let mut state = self.lock()?;
        if !state.objects.contains_key(target) {
            return Err(Error::NotFound(target.clone()));
        }
        if opts.dry_run {
            return Ok(());
        }
        state.delete(target, opts.propagation, &mut BTreeSet::new());
        state.writes += 1;
        state.sweep();
        Ok(())
    }

    fn list_now(&self, kind: &ResourceKind, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<ManagedResource>> {
        let state = self.lock()?;
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| &k.kind == kind)
            .filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
            .filter(|(_, o)| selector.matches(&o.metadata.labels))
            .map(|(_, o)| o.clone())
            .collect())
    }
}

/// Fields clients cannot change through update or patch.
fn preserve_server_fields(next: &mut ManagedResource, existing: &ManagedResource) {
    next.metadata.uid = existing.metadata.uid.clone();
    next.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
    next.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, target: &ObjectRef) -> Result<ManagedResource> {
        self.get_now(target)
    }

    async fn create(&self, obj: &ManagedResource, opts: &WriteOptions) -> Result<ManagedResource> {
        self.create_now(obj, opts)
    }

    async fn update(&self, obj: &ManagedResource, opts: &WriteOptions) -> Result<ManagedResource> {
        self.update_now(obj, opts)
    }

    async fn patch(&self, target: &ObjectRef, patch: &MergePatch, opts: &WriteOptions) -> Result<ManagedResource> {
        self.patch_now(target, patch, opts)
    }

    async fn delete(&self, target: &ObjectRef, opts: &DeleteOptions) -> Result<()> {
        self.delete_now(target, opts)
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<ManagedResource>> {
        self.list_now(kind, namespace, selector)
    }
}
