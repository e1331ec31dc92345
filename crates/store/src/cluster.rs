use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::anyhow;
use keel_core::{
    DeleteOptions, Error, LabelSelector, ManagedResource, ObjectRef, Propagation, ResourceKind, Result, WriteOptions,
};
use keel_patch::MergePatch;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    discovery::{self, Scope},
    Client,
};
use serde_json::Value as Json;
use tracing::debug;

use crate::ResourceStore;

/// [`ResourceStore`] backed by a Kubernetes API server.
///
/// Kinds are resolved through discovery once and cached; HTTP 404/409/422
/// responses map onto the shared error taxonomy.
pub struct KubeStore {
    client: Client,
    resources: Mutex<HashMap<ResourceKind, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(HashMap::new()) }
    }

    /// Connect using the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.map_err(|e| Error::Transport(anyhow!(e).context("building kube client")))?;
        Ok(Self::new(client))
    }

    /// Namespace of the active kubeconfig context.
    pub fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }

    async fn find_api_resource(&self, kind: &ResourceKind) -> Result<(ApiResource, bool)> {
        if let Some(hit) = self.resources.lock().ok().and_then(|m| m.get(kind).cloned()) {
            return Ok(hit);
        }
        let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| Error::Transport(anyhow!(e).context(format!("GVK not found: {}", kind))))?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %kind, plural = %ar.plural, namespaced, "resolved api resource");
        if let Ok(mut m) = self.resources.lock() {
            m.insert(kind.clone(), (ar.clone(), namespaced));
        }
        Ok((ar, namespaced))
    }

    async fn api_for(&self, target: &ObjectRef) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.find_api_resource(&target.kind).await?;
        if !namespaced {
            return Ok(Api::all_with(self.client.clone(), &ar));
        }
        match target.namespace.as_deref() {
            Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            None => Err(Error::Invalid { target: target.clone(), message: "namespace required for namespaced kind".into() }),
        }
    }
}

fn map_err(target: &ObjectRef, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(target.clone()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => Error::AlreadyExists(target.clone()),
        kube::Error::Api(ae) if ae.code == 409 => Error::VersionConflict { target: target.clone(), message: ae.message },
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => {
            Error::Invalid { target: target.clone(), message: ae.message }
        }
        other => Error::Transport(anyhow!(other).context(format!("request for {} failed", target))),
    }
}

fn to_dynamic(obj: &ManagedResource) -> Result<DynamicObject> {
    Ok(serde_json::from_value(obj.to_json()?)?)
}

fn from_dynamic(kind: &ResourceKind, mut obj: DynamicObject) -> Result<ManagedResource> {
    // list items come back without apiVersion/kind
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: kind.api_version(), kind: kind.kind.clone() });
    }
    ManagedResource::from_json(serde_json::to_value(obj)?)
}

/// Strategic descriptions need the strategic content type; anything else is RFC 7386.
fn patch_body(patch: &MergePatch) -> Patch<Json> {
    let body = patch.to_json();
    if patch.is_strategic() {
        Patch::Strategic(body)
    } else {
        Patch::Merge(body)
    }
}

fn propagation_policy(p: Propagation) -> PropagationPolicy {
    match p {
        Propagation::Foreground => PropagationPolicy::Foreground,
        Propagation::Background => PropagationPolicy::Background,
        Propagation::Orphan => PropagationPolicy::Orphan,
    }
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, target: &ObjectRef) -> Result<ManagedResource> {
        let api = self.api_for(target).await?;
        let obj = api.get(&target.name).await.map_err(|e| map_err(target, e))?;
        from_dynamic(&target.kind, obj)
    }

    async fn create(&self, obj: &ManagedResource, opts: &WriteOptions) -> Result<ManagedResource> {
        let target = obj.object_ref();
        let api = self.api_for(&target).await?;
        let pp = PostParams { dry_run: opts.dry_run, field_manager: opts.field_manager.clone() };
        let out = api.create(&pp, &to_dynamic(obj)?).await.map_err(|e| map_err(&target, e))?;
        from_dynamic(&target.kind, out)
    }

    async fn update(&self, obj: &ManagedResource, opts: &WriteOptions) -> Result<ManagedResource> {
        let target = obj.object_ref();
        let api = self.api_for(&target).await?;
        let pp = PostParams { dry_run: opts.dry_run, field_manager: opts.field_manager.clone() };
        let out = api.replace(&target.name, &pp, &to_dynamic(obj)?).await.map_err(|e| map_err(&target, e))?;
        from_dynamic(&target.kind, out)
    }

    async fn patch(&self, target: &ObjectRef, patch: &MergePatch, opts: &WriteOptions) -> Result<ManagedResource> {
        let api = self.api_for(target).await?;
        let pp = PatchParams { dry_run: opts.dry_run, field_manager: opts.field_manager.clone(), ..Default::default() };
        let out = api.patch(&target.name, &pp, &patch_body(patch)).await.map_err(|e| map_err(target, e))?;
        from_dynamic(&target.kind, out)
    }

    async fn delete(&self, target: &ObjectRef, opts: &DeleteOptions) -> Result<()> {
        let api = self.api_for(target).await?;
        let dp = DeleteParams {
            dry_run: opts.dry_run,
            propagation_policy: Some(propagation_policy(opts.propagation)),
            ..Default::default()
        };
        api.delete(&target.name, &dp).await.map_err(|e| map_err(target, e))?;
        Ok(())
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<ManagedResource>> {
        let (ar, namespaced) = self.find_api_resource(kind).await?;
        let api: Api<DynamicObject> = match namespace {
            Some(ns) if namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector.to_query());
        }
        let scope = ObjectRef::new(kind.clone(), namespace, "");
        let list = api.list(&lp).await.map_err(|e| map_err(&scope, e))?;
        list.items.into_iter().map(|o| from_dynamic(kind, o)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn target() -> ObjectRef {
        ObjectRef::new(ResourceKind::secret(), Some("ns"), "s")
    }

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} happened", reason),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn status_codes_map_onto_taxonomy() {
        assert!(map_err(&target(), api_err(404, "NotFound")).is_not_found());
        assert!(map_err(&target(), api_err(409, "AlreadyExists")).is_already_exists());
        assert!(map_err(&target(), api_err(409, "Conflict")).is_version_conflict());
        assert!(matches!(map_err(&target(), api_err(422, "Invalid")), Error::Invalid { .. }));
        assert!(matches!(map_err(&target(), api_err(500, "InternalError")), Error::Transport(_)));
    }

    #[test]
    fn patch_content_type_follows_the_description() {
        let containers = |image: &str| {
            serde_json::json!({ "spec": { "template": { "spec": { "containers": [ { "name": "app", "image": image } ] } } } })
        };
        let keyed = keel_patch::two_way(&containers("a:1"), &containers("a:2"), &keel_patch::MergeKeys::workload())
            .expect("diff");
        assert!(matches!(patch_body(&keyed), Patch::Strategic(_)));

        let plain = keel_patch::two_way(&containers("a:1"), &containers("a:2"), &keel_patch::MergeKeys::new())
            .expect("diff");
        match patch_body(&plain) {
            Patch::Merge(body) => assert_eq!(body, containers("a:2")),
            _ => panic!("expected a merge patch"),
        }
    }

    #[test]
    fn list_items_without_type_meta_are_filled_in() {
        let raw = serde_json::json!({ "metadata": { "name": "p", "namespace": "ns" }, "spec": { "x": 1 } });
        let dynamic: DynamicObject = serde_json::from_value(raw).expect("decode");
        let obj = from_dynamic(&ResourceKind::pod(), dynamic).expect("convert");
        assert_eq!(obj.api_version, "v1");
        assert_eq!(obj.kind, "Pod");
        assert_eq!(obj.field("spec.x"), Some(&serde_json::json!(1)));
    }
}
