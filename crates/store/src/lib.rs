//! Keel stores: the boundary every reconciliation primitive talks to.
//!
//! [`ResourceStore`] is the only seam; [`MemoryStore`] backs tests and demos
//! and [`KubeStore`] drives a live API server through kube-rs.

#![forbid(unsafe_code)]

use std::sync::Arc;

use keel_core::{DeleteOptions, LabelSelector, ManagedResource, ObjectRef, ResourceKind, Result, WriteOptions};
use keel_patch::MergePatch;

mod cluster;
mod memory;

pub use cluster::KubeStore;
pub use memory::MemoryStore;

/// Versioned object store addressed by (kind, namespace, name).
///
/// Every call returns either a fresh snapshot or a typed error:
/// `NotFound`, `AlreadyExists`, `VersionConflict`, `Invalid`, or `Transport`.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, target: &ObjectRef) -> Result<ManagedResource>;

    async fn create(&self, obj: &ManagedResource, opts: &WriteOptions) -> Result<ManagedResource>;

    /// Whole-object replace guarded by `metadata.resourceVersion`.
    async fn update(&self, obj: &ManagedResource, opts: &WriteOptions) -> Result<ManagedResource>;

    /// Partial merge of a computed description.
    async fn patch(&self, target: &ObjectRef, patch: &MergePatch, opts: &WriteOptions) -> Result<ManagedResource>;

    async fn delete(&self, target: &ObjectRef, opts: &DeleteOptions) -> Result<()>;

    /// Objects of `kind` whose labels match `selector`; `namespace = None` lists all namespaces.
    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>, selector: &LabelSelector)
        -> Result<Vec<ManagedResource>>;

    async fn get_opt(&self, target: &ObjectRef) -> Result<Option<ManagedResource>> {
        match self.get(target).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl<S: ResourceStore + ?Sized> ResourceStore for Arc<S> {
    async fn get(&self, target: &ObjectRef) -> Result<ManagedResource> {
        (**self).get(target).await
    }

    async fn create(&self, obj: &ManagedResource, opts: &WriteOptions) -> Result<ManagedResource> {
        (**self).create(obj, opts).await
    }

    async fn update(&self, obj: &ManagedResource, opts: &WriteOptions) -> Result<ManagedResource> {
        (**self).update(obj, opts).await
    }

    async fn patch(&self, target: &ObjectRef, patch: &MergePatch, opts: &WriteOptions) -> Result<ManagedResource> {
        (**self).patch(target, patch, opts).await
    }

    async fn delete(&self, target: &ObjectRef, opts: &DeleteOptions) -> Result<()> {
        (**self).delete(target, opts).await
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<ManagedResource>> {
        (**self).list(kind, namespace, selector).await
    }
}
