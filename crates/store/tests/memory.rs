use keel_core::{
    DeleteOptions, Error, LabelSelector, ManagedResource, ObjectRef, OwnerReference, Propagation, ResourceKind,
    WriteOptions,
};
use keel_patch::MergeKeys;
use keel_store::{MemoryStore, ResourceStore};
use serde_json::json;

fn deploy_kind() -> ResourceKind {
    ResourceKind::new("apps", "v1", "Deployment")
}

fn obj(kind: ResourceKind, name: &str) -> ManagedResource {
    let mut o = ManagedResource::new(&ObjectRef::new(kind, Some("default"), name));
    o.metadata.labels.insert("app".into(), "web".into());
    o
}

fn owned_by(owner: &ManagedResource, kind: ResourceKind, name: &str) -> ManagedResource {
    let mut o = obj(kind, name);
    o.metadata.ensure_owner_reference(OwnerReference::controller_of(owner).unwrap());
    o
}

fn write() -> WriteOptions {
    WriteOptions::default()
}

fn delete_with(propagation: Propagation) -> DeleteOptions {
    DeleteOptions { propagation, dry_run: false }
}

#[tokio::test]
async fn create_assigns_server_fields() {
    let store = MemoryStore::new();
    let created = store.create(&obj(deploy_kind(), "web"), &write()).await.unwrap();

    assert!(created.metadata.uid.is_some());
    assert!(created.metadata.creation_timestamp.is_some());
    assert!(created.resource_version().is_some());
    assert_eq!(store.get(&created.object_ref()).await.unwrap(), created);

    let err = store.create(&obj(deploy_kind(), "web"), &write()).await.unwrap_err();
    assert!(err.is_already_exists());
}

#[tokio::test]
async fn create_rejects_versioned_or_nameless_objects() {
    let store = MemoryStore::new();
    let mut versioned = obj(deploy_kind(), "web");
    versioned.metadata.resource_version = Some("7".into());
    assert!(matches!(store.create(&versioned, &write()).await, Err(Error::Invalid { .. })));
    assert!(matches!(store.create(&obj(deploy_kind(), ""), &write()).await, Err(Error::Invalid { .. })));
    assert!(store.is_empty());
}

#[tokio::test]
async fn stale_update_conflicts() {
    let store = MemoryStore::new();
    let v1 = store.create(&obj(deploy_kind(), "web"), &write()).await.unwrap();

    let mut a = v1.clone();
    a.spec = json!({ "replicas": 2 });
    let v2 = store.update(&a, &write()).await.unwrap();
    assert_ne!(v2.resource_version(), v1.resource_version());

    let mut b = v1.clone();
    b.spec = json!({ "replicas": 5 });
    let err = store.update(&b, &write()).await.unwrap_err();
    assert!(err.is_version_conflict(), "got {err:?}");
    assert_eq!(store.get(&v1.object_ref()).await.unwrap().spec, json!({ "replicas": 2 }));
}

#[tokio::test]
async fn update_keeps_identity_and_skips_noops() {
    let store = MemoryStore::new();
    let v1 = store.create(&obj(deploy_kind(), "web"), &write()).await.unwrap();

    let mut tampered = v1.clone();
    tampered.metadata.uid = Some("forged".into());
    let out = store.update(&tampered, &write()).await.unwrap();
    assert_eq!(out.metadata.uid, v1.metadata.uid);
    assert_eq!(out.resource_version(), v1.resource_version());
    assert_eq!(store.writes(), 1);
}

#[tokio::test]
async fn strategic_patch_merges_keyed_lists() {
    let store = MemoryStore::new().with_merge_keys(deploy_kind(), MergeKeys::workload());
    let mut d = obj(deploy_kind(), "web");
    d.spec = json!({ "template": { "spec": { "containers": [
        { "name": "app", "image": "web:1" },
        { "name": "sidecar", "image": "proxy:1" }
    ] } } });
    let before = store.create(&d, &write()).await.unwrap();

    let mut after = before.clone();
    after.spec["template"]["spec"]["containers"][1]["image"] = json!("proxy:2");
    let patch = keel_patch::two_way(&before.to_json().unwrap(), &after.to_json().unwrap(), &MergeKeys::workload()).unwrap();
    let out = store.patch(&before.object_ref(), &patch, &write()).await.unwrap();

    assert_eq!(out.spec, after.spec);
    assert_ne!(out.resource_version(), before.resource_version());
}

#[tokio::test]
async fn patch_honors_resource_version_precondition() {
    let store = MemoryStore::new();
    let v1 = store.create(&obj(deploy_kind(), "web"), &write()).await.unwrap();
    let mut bumped = v1.clone();
    bumped.spec = json!({ "replicas": 1 });
    store.update(&bumped, &write()).await.unwrap();

    let guarded = json!({ "metadata": { "resourceVersion": v1.resource_version() }, "spec": { "replicas": 9 } });
    let patch = keel_patch::two_way(&json!({}), &guarded, &MergeKeys::new()).unwrap();
    let err = store.patch(&v1.object_ref(), &patch, &write()).await.unwrap_err();
    assert!(err.is_version_conflict(), "got {err:?}");
}

#[tokio::test]
async fn dry_run_validates_without_persisting() {
    let store = MemoryStore::new();
    let dry = WriteOptions { dry_run: true, ..write() };
    let preview = store.create(&obj(deploy_kind(), "web"), &dry).await.unwrap();
    assert!(preview.metadata.uid.is_some());
    assert!(store.is_empty());

    let live = store.create(&obj(deploy_kind(), "web"), &write()).await.unwrap();
    let dry_delete = DeleteOptions { dry_run: true, ..DeleteOptions::foreground() };
    store.delete(&live.object_ref(), &dry_delete).await.unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(store.writes(), 1);
}

#[tokio::test]
async fn foreground_delete_waits_on_finalized_dependents() {
    let store = MemoryStore::new();
    let owner = store.create(&obj(deploy_kind(), "web"), &write()).await.unwrap();
    let mut pod = owned_by(&owner, ResourceKind::pod(), "web-0");
    pod.metadata.finalizers.push("example.com/hold".into());
    let pod = store.create(&pod, &write()).await.unwrap();

    store.delete(&owner.object_ref(), &delete_with(Propagation::Foreground)).await.unwrap();

    let held_owner = store.get(&owner.object_ref()).await.unwrap();
    assert!(held_owner.is_terminating());
    assert_eq!(held_owner.metadata.finalizers, vec!["foregroundDeletion".to_string()]);
    let mut held_pod = store.get(&pod.object_ref()).await.unwrap();
    assert!(held_pod.is_terminating());

    held_pod.metadata.finalizers.clear();
    store.update(&held_pod, &write()).await.unwrap();
    assert!(store.is_empty());
}

#[tokio::test]
async fn background_delete_cascades_recursively() {
    let store = MemoryStore::new();
    let deploy = store.create(&obj(deploy_kind(), "web"), &write()).await.unwrap();
    let rs = store.create(&owned_by(&deploy, ResourceKind::new("apps", "v1", "ReplicaSet"), "web-rs"), &write()).await.unwrap();
    store.create(&owned_by(&rs, ResourceKind::pod(), "web-rs-0"), &write()).await.unwrap();
    store.create(&obj(ResourceKind::pod(), "bystander"), &write()).await.unwrap();

    store.delete(&deploy.object_ref(), &delete_with(Propagation::Background)).await.unwrap();

    let left = store.list(&ResourceKind::pod(), None, &LabelSelector::default()).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].metadata.name, "bystander");
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn orphan_delete_strips_owner_links() {
    let store = MemoryStore::new();
    let owner = store.create(&obj(deploy_kind(), "web"), &write()).await.unwrap();
    let pod = store.create(&owned_by(&owner, ResourceKind::pod(), "web-0"), &write()).await.unwrap();

    store.delete(&owner.object_ref(), &delete_with(Propagation::Orphan)).await.unwrap();

    assert!(store.get_opt(&owner.object_ref()).await.unwrap().is_none());
    let orphan = store.get(&pod.object_ref()).await.unwrap();
    assert!(orphan.metadata.owner_references.is_empty());
    assert_ne!(orphan.resource_version(), pod.resource_version());
}

#[tokio::test]
async fn delete_of_absent_is_not_found() {
    let store = MemoryStore::new();
    let missing = ObjectRef::new(deploy_kind(), Some("default"), "ghost");
    assert!(store.delete(&missing, &DeleteOptions::foreground()).await.unwrap_err().is_not_found());
    assert!(store.get_opt(&missing).await.unwrap().is_none());
}

#[tokio::test]
async fn list_filters_by_kind_namespace_and_selector() {
    let store = MemoryStore::new();
    store.create(&obj(ResourceKind::pod(), "a"), &write()).await.unwrap();
    let mut other = obj(ResourceKind::pod(), "b");
    other.metadata.labels.insert("app".into(), "db".into());
    store.create(&other, &write()).await.unwrap();
    let mut elsewhere = ManagedResource::new(&ObjectRef::new(ResourceKind::pod(), Some("kube-system"), "c"));
    elsewhere.metadata.labels.insert("app".into(), "web".into());
    store.create(&elsewhere, &write()).await.unwrap();
    store.create(&obj(deploy_kind(), "web"), &write()).await.unwrap();

    let web = LabelSelector::from_labels([("app", "web")]);
    let names = |items: Vec<ManagedResource>| items.into_iter().map(|o| o.metadata.name).collect::<Vec<_>>();
    assert_eq!(names(store.list(&ResourceKind::pod(), Some("default"), &web).await.unwrap()), vec!["a"]);
    assert_eq!(store.list(&ResourceKind::pod(), None, &web).await.unwrap().len(), 2);
    assert_eq!(store.list(&ResourceKind::pod(), None, &LabelSelector::default()).await.unwrap().len(), 3);
}

#[tokio::test]
async fn plain_merge_patch_replaces_keyed_lists() {
    let store = MemoryStore::new().with_merge_keys(deploy_kind(), MergeKeys::workload());
    let mut d = obj(deploy_kind(), "web");
    // Duplicate names make the list unkeyable, so the diff falls back to replacement.
    d.spec = json!({ "template": { "spec": { "containers": [
        { "name": "app", "image": "web:1" },
        { "name": "app", "image": "web:2" }
    ] } } });
    let before = store.create(&d, &write()).await.unwrap();

    let mut after = before.clone();
    after.spec["template"]["spec"]["containers"] = json!([{ "name": "app", "image": "web:1" }]);
    let patch = keel_patch::two_way(&before.to_json().unwrap(), &after.to_json().unwrap(), &MergeKeys::workload()).unwrap();
    assert!(!patch.is_strategic());
    let out = store.patch(&before.object_ref(), &patch, &write()).await.unwrap();

    assert_eq!(out.spec, after.spec);
}
