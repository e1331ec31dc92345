use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use keel_core::{Error, ManagedResource, ObjectRef, OwnerReference, ResourceKind, Result, Verb};
use keel_reconcile::{patch_object, PatchOptions};
use keel_store::ResourceStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use tracing::{debug, info, warn};

use crate::is_shell_safe;

/// Generated data is redrawn at most this many times before giving up.
pub const MAX_GENERATE_ATTEMPTS: u32 = 32;

pub const OWNER_KIND_LABEL: &str = "keel.dev/owner-kind";
pub const OWNER_NAME_LABEL: &str = "keel.dev/owner-name";

/// Pointer to a provisioned secret, as persisted on the owner's spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub secret_name: String,
}

/// What to provision and where to record it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRequest {
    /// Secret name, in the owner's namespace.
    pub name: String,
    /// Labels stamped on the secret; an existing secret must carry all of them.
    pub labels: BTreeMap<String, String>,
    /// Dotted path on the owner receiving the [`SecretReference`].
    pub reference_field: String,
}

impl SecretRequest {
    /// `<owner>-<suffix>`, labelled with the owner's kind and name, recorded at
    /// `spec.authSecret`.
    pub fn for_owner(owner: &ObjectRef, suffix: &str) -> Self {
        Self {
            name: format!("{}-{}", owner.name, suffix),
            labels: ownership_labels(owner),
            reference_field: "spec.authSecret".to_string(),
        }
    }

    pub fn with_reference_field(mut self, path: &str) -> Self {
        self.reference_field = path.to_string();
        self
    }
}

pub fn ownership_labels(owner: &ObjectRef) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OWNER_KIND_LABEL.to_string(), owner.kind.kind.clone()),
        (OWNER_NAME_LABEL.to_string(), owner.name.clone()),
    ])
}

/// Make sure `owner` references a secret it owns, creating one if needed.
///
/// `owner` is the caller's snapshot. When it already carries a reference at
/// `request.reference_field` that reference is returned and the store is not
/// touched. Otherwise an existing secret with the requested name is adopted
/// only if it carries every requested label; a foreign occupant yields
/// [`Error::ValidationConflict`] and nothing is written. An absent secret is
/// created from `generate()`, redrawn while any value fails
/// [`is_shell_safe`]. Finally the owner is re-fetched and patched to point
/// at the secret.
pub async fn ensure_managed_secret<S, G>(
    store: &S,
    owner: &ManagedResource,
    request: &SecretRequest,
    mut generate: G,
    opts: &PatchOptions,
) -> Result<SecretReference>
where
    S: ResourceStore + ?Sized,
    G: FnMut() -> BTreeMap<String, String>,
{
    let owner_ref = owner.object_ref();
    if let Some(existing) = owner.field(&request.reference_field) {
        match serde_json::from_value::<SecretReference>(existing.clone()) {
            Ok(reference) => {
                debug!(owner = %owner_ref, secret = %reference.secret_name, "already linked");
                return Ok(reference);
            }
            Err(e) => warn!(owner = %owner_ref, field = %request.reference_field, error = %e, "ignoring malformed reference"),
        }
    }

    let target = owner_ref.sibling(ResourceKind::secret(), &request.name);
    match store.get_opt(&target).await? {
        Some(found) => {
            check_ownership(&found, request, &owner_ref)?;
            debug!(owner = %owner_ref, object = %target, "adopting existing secret");
        }
        None => {
            let data = draw_valid(&target, &mut generate)?;
            let secret = build_secret(owner, &target, request, &data)?;
            info!(owner = %owner_ref, object = %target, keys = data.len(), dry_run = opts.dry_run, "creating secret");
            store.create(&secret, &opts.write()).await?;
        }
    }

    let reference = SecretReference { secret_name: request.name.clone() };
    let fresh = store.get(&owner_ref).await?;
    let mut linked = fresh.clone();
    linked.set_field(&request.reference_field, serde_json::to_value(&reference)?)?;
    let (_, verb) = patch_object(store, &fresh, &linked, opts).await?;
    if verb != Verb::Unchanged {
        info!(owner = %owner_ref, secret = %reference.secret_name, "linked secret");
    }
    Ok(reference)
}

fn check_ownership(found: &ManagedResource, request: &SecretRequest, owner: &ObjectRef) -> Result<()> {
    let labels = &found.metadata.labels;
    let owned = request.labels.iter().all(|(k, v)| labels.get(k) == Some(v));
    if owned {
        Ok(())
    } else {
        warn!(object = %found.object_ref(), owner = %owner, "secret exists but is not ours");
        Err(Error::ValidationConflict { target: found.object_ref(), owner: owner.to_string() })
    }
}

fn draw_valid<G>(target: &ObjectRef, generate: &mut G) -> Result<BTreeMap<String, String>>
where
    G: FnMut() -> BTreeMap<String, String>,
{
    for attempt in 1..=MAX_GENERATE_ATTEMPTS {
        let data = generate();
        match data.iter().find(|(_, v)| !is_shell_safe(v)) {
            None => return Ok(data),
            Some((key, _)) => debug!(object = %target, key = %key, attempt, "generated value starts with '-'; redrawing"),
        }
    }
    Err(Error::Invalid {
        target: target.clone(),
        message: format!("no shell-safe data after {} attempts", MAX_GENERATE_ATTEMPTS),
    })
}

fn build_secret(
    owner: &ManagedResource,
    target: &ObjectRef,
    request: &SecretRequest,
    data: &BTreeMap<String, String>,
) -> Result<ManagedResource> {
    let mut secret = ManagedResource::new(target);
    secret.metadata.labels = request.labels.clone();
    secret.metadata.ensure_owner_reference(OwnerReference::controller_of(owner)?);
    let encoded: Map<String, Json> = data.iter().map(|(k, v)| (k.clone(), json!(STANDARD.encode(v)))).collect();
    secret.data.insert("type".to_string(), json!("Opaque"));
    secret.data.insert("data".to_string(), Json::Object(encoded));
    Ok(secret)
}

/// Decode the base64 `data` of a secret.
pub fn decode_data(secret: &ManagedResource) -> Result<BTreeMap<String, String>> {
    let invalid = |message: String| Error::Invalid { target: secret.object_ref(), message };
    let Some(data) = secret.field("data") else {
        return Ok(BTreeMap::new());
    };
    let data = data.as_object().ok_or_else(|| invalid("data is not an object".into()))?;
    data.iter()
        .map(|(k, v)| -> Result<(String, String)> {
            let raw = v.as_str().ok_or_else(|| invalid(format!("data.{} is not a string", k)))?;
            let bytes = STANDARD.decode(raw).map_err(|e| invalid(format!("data.{}: {}", k, e)))?;
            let text = String::from_utf8(bytes).map_err(|e| invalid(format!("data.{}: {}", k, e)))?;
            Ok((k.clone(), text))
        })
        .collect()
}
