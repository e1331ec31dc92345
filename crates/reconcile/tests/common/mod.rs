#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use keel_core::{
    DeleteOptions, Error, LabelSelector, ManagedResource, ObjectRef, ResourceKind, Result, WriteOptions,
};
use keel_patch::{MergeKeys, MergePatch};
use keel_store::{MemoryStore, ResourceStore};
use serde_json::json;

pub fn deployment_kind() -> ResourceKind {
    ResourceKind::new("apps", "v1", "Deployment")
}

pub fn deployment_ref(name: &str) -> ObjectRef {
    ObjectRef::new(deployment_kind(), Some("default"), name)
}

pub fn deployment(name: &str, replicas: i64) -> ManagedResource {
    let mut d = ManagedResource::new(&deployment_ref(name));
    d.metadata.labels.insert("app".into(), name.into());
    d.spec = json!({
        "replicas": replicas,
        "selector": { "matchLabels": { "app": name } },
        "template": {
            "metadata": { "labels": { "app": name } },
            "spec": { "containers": [ { "name": "app", "image": format!("{}:1", name) } ] }
        }
    });
    d
}

pub fn pod_for(owner: &ManagedResource, name: &str) -> ManagedResource {
    let mut p = ManagedResource::new(&owner.object_ref().sibling(ResourceKind::pod(), name));
    p.metadata.labels = owner.metadata.labels.clone();
    if let Ok(r) = keel_core::OwnerReference::controller_of(owner) {
        p.metadata.ensure_owner_reference(r);
    }
    p
}

pub fn memory() -> MemoryStore {
    MemoryStore::new().with_merge_keys(deployment_kind(), MergeKeys::workload())
}

type GetHook = Box<dyn Fn(u32, &mut ManagedResource) + Send + Sync>;
type ErrorFactory = Box<dyn Fn(&ObjectRef) -> Error + Send + Sync>;

/// [`MemoryStore`] wrapper that scripts the races and failures a live
/// cluster produces.
pub struct ScriptedStore {
    pub inner: MemoryStore,
    pub gets: AtomicU32,
    pub updates: AtomicU32,
    pub lists: AtomicU32,
    pub patches: Mutex<Vec<MergePatch>>,
    rival_writes: AtomicU32,
    failing_gets: AtomicU32,
    get_error: Mutex<Option<ErrorFactory>>,
    update_error: Mutex<Option<ErrorFactory>>,
    on_get: Mutex<Option<GetHook>>,
    vanish_on_delete: AtomicBool,
}

impl ScriptedStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            gets: AtomicU32::new(0),
            updates: AtomicU32::new(0),
            lists: AtomicU32::new(0),
            patches: Mutex::new(Vec::new()),
            rival_writes: AtomicU32::new(0),
            failing_gets: AtomicU32::new(0),
            get_error: Mutex::new(None),
            update_error: Mutex::new(None),
            on_get: Mutex::new(None),
            vanish_on_delete: AtomicBool::new(false),
        }
    }

    /// A competing writer bumps the object right after each of the next `n` reads.
    pub fn contend(&self, n: u32) {
        self.rival_writes.store(n, Ordering::SeqCst);
    }

    /// The next `n` reads fail with the error built by `make`.
    pub fn fail_gets(&self, n: u32, make: impl Fn(&ObjectRef) -> Error + Send + Sync + 'static) {
        self.failing_gets.store(n, Ordering::SeqCst);
        *self.get_error.lock().expect("lock") = Some(Box::new(make));
    }

    /// Every update fails with the error built by `make`.
    pub fn fail_updates(&self, make: impl Fn(&ObjectRef) -> Error + Send + Sync + 'static) {
        *self.update_error.lock().expect("lock") = Some(Box::new(make));
    }

    /// Rewrite the snapshot returned by the n-th read (1-based).
    pub fn on_get(&self, hook: impl Fn(u32, &mut ManagedResource) + Send + Sync + 'static) {
        *self.on_get.lock().expect("lock") = Some(Box::new(hook));
    }

    /// Deletes go through, but report NotFound as if another writer got there first.
    pub fn vanish_on_delete(&self) {
        self.vanish_on_delete.store(true, Ordering::SeqCst);
    }

    pub fn get_count(&self) -> u32 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> u32 {
        self.updates.load(Ordering::SeqCst)
    }

    async fn rival_write(&self, target: &ObjectRef) -> Result<()> {
        let before = self.inner.get(target).await?;
        let mut after = before.clone();
        let n = after.metadata.annotations.get("rival").and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);
        after.metadata.annotations.insert("rival".into(), (n + 1).to_string());
        let patch = keel_patch::two_way(&before.to_json()?, &after.to_json()?, &MergeKeys::new())
            .map_err(|e| Error::Transport(anyhow::anyhow!(e)))?;
        self.inner.patch(target, &patch, &WriteOptions::default()).await?;
        Ok(())
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

#[async_trait::async_trait]
impl ResourceStore for ScriptedStore {
    async fn get(&self, target: &ObjectRef) -> Result<ManagedResource> {
        let n = self.gets.fetch_add(1, Ordering::SeqCst) + 1;
        if take_one(&self.failing_gets) {
            if let Some(make) = self.get_error.lock().expect("lock").as_ref() {
                return Err(make(target));
            }
        }
        let mut obj = self.inner.get(target).await?;
        if take_one(&self.rival_writes) {
            self.rival_write(target).await?;
        }
        if let Some(hook) = self.on_get.lock().expect("lock").as_ref() {
            hook(n, &mut obj);
        }
        Ok(obj)
    }

    async fn create(&self, obj: &ManagedResource, opts: &WriteOptions) -> Result<ManagedResource> {
        self.inner.create(obj, opts).await
    }

    async fn update(&self, obj: &ManagedResource, opts: &WriteOptions) -> Result<ManagedResource> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if let Some(make) = self.update_error.lock().expect("lock").as_ref() {
            return Err(make(&obj.object_ref()));
        }
        self.inner.update(obj, opts).await
    }

    async fn patch(&self, target: &ObjectRef, patch: &MergePatch, opts: &WriteOptions) -> Result<ManagedResource> {
        self.patches.lock().expect("lock").push(patch.clone());
        self.inner.patch(target, patch, opts).await
    }

    async fn delete(&self, target: &ObjectRef, opts: &DeleteOptions) -> Result<()> {
        self.inner.delete(target, opts).await?;
        if self.vanish_on_delete.load(Ordering::SeqCst) {
            return Err(Error::NotFound(target.clone()));
        }
        Ok(())
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<ManagedResource>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.inner.list(kind, namespace, selector).await
    }
}
