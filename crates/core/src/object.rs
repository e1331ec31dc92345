use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{Error, Result};

/// Group/version/kind of a served resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    pub fn secret() -> Self {
        Self::new("", "v1", "Secret")
    }

    pub fn pod() -> Self {
        Self::new("", "v1", "Pod")
    }

    /// Split an `apiVersion` + `kind` pair as found on serialized objects.
    pub fn from_type_meta(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(group, version, kind)),
            _ => Err(Error::InvalidKey(key.to_string())),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gvk_key())
    }
}

/// Identity of a managed object: kind plus (namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        Self { kind, namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    /// Same namespace, different kind and name. Used to address dependents.
    pub fn sibling(&self, kind: ResourceKind, name: &str) -> Self {
        Self { kind, namespace: self.namespace.clone(), name: name.to_string() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind.kind, self.name),
        }
    }
}

/// Linkage from a dependent to the object that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

impl OwnerReference {
    /// Controller reference pointing at `owner`. The owner must have been
    /// persisted already, since the linkage is keyed by uid.
    pub fn controller_of(owner: &ManagedResource) -> Result<Self> {
        let uid = owner.metadata.uid.clone().ok_or_else(|| Error::Invalid {
            target: owner.object_ref(),
            message: "owner has no metadata.uid".to_string(),
        })?;
        Ok(Self {
            api_version: owner.api_version.clone(),
            kind: owner.kind.clone(),
            name: owner.metadata.name.clone(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }

    pub fn is_controller(&self) -> bool {
        self.controller.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Server-populated metadata we do not model (generation, managedFields, ...).
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

impl ObjectMeta {
    /// Insert `owner`, replacing any existing reference with the same uid.
    pub fn ensure_owner_reference(&mut self, owner: OwnerReference) {
        match self.owner_references.iter_mut().find(|r| r.uid == owner.uid) {
            Some(existing) => *existing = owner,
            None => self.owner_references.push(owner),
        }
    }

    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.owner_references.iter().any(|r| r.uid == uid)
    }
}

/// Transient copy of a store object.
///
/// `spec` and `status` are kept as raw JSON since the toolkit does not know
/// resource schemas; any other top-level field (`data`, `type`, ...) lands
/// in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResource {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Json::is_null")]
    pub spec: Json,
    #[serde(default, skip_serializing_if = "Json::is_null")]
    pub status: Json,
    #[serde(flatten)]
    pub data: Map<String, Json>,
}

impl ManagedResource {
    /// Bare object carrying only the identity.
    pub fn new(target: &ObjectRef) -> Self {
        Self {
            api_version: target.kind.api_version(),
            kind: target.kind.kind.clone(),
            metadata: ObjectMeta {
                name: target.name.clone(),
                namespace: target.namespace.clone(),
                ..Default::default()
            },
            spec: Json::Null,
            status: Json::Null,
            data: Map::new(),
        }
    }

    pub fn resource_kind(&self) -> ResourceKind {
        ResourceKind::from_type_meta(&self.api_version, &self.kind)
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            kind: self.resource_kind(),
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
        }
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn to_json(&self) -> Result<Json> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(v: Json) -> Result<Self> {
        Ok(serde_json::from_value(v)?)
    }

    /// Look up a dotted path rooted at `spec`, `status` or a top-level data field,
    /// e.g. `spec.selector` or `status.readyReplicas`.
    pub fn field(&self, path: &str) -> Option<&Json> {
        let mut segs = path.split('.');
        let mut cur = match segs.next()? {
            "spec" => &self.spec,
            "status" => &self.status,
            other => self.data.get(other)?,
        };
        for seg in segs {
            cur = cur.as_object()?.get(seg)?;
        }
        if cur.is_null() { None } else { Some(cur) }
    }

    /// Set a dotted path rooted like [`ManagedResource::field`], creating
    /// intermediate objects as needed.
    pub fn set_field(&mut self, path: &str, value: Json) -> Result<()> {
        let target = self.object_ref();
        let invalid = |message: String| Error::Invalid { target: target.clone(), message };
        let segs: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        let (root, rest) = segs.split_first().ok_or_else(|| invalid(format!("empty field path {:?}", path)))?;
        let mut cur = match *root {
            "spec" => &mut self.spec,
            "status" => &mut self.status,
            other => self.data.entry(other.to_string()).or_insert(Json::Null),
        };
        for seg in rest {
            if cur.is_null() {
                *cur = Json::Object(Map::new());
            }
            cur = cur
                .as_object_mut()
                .ok_or_else(|| invalid(format!("{} crosses a non-object value", path)))?
                .entry(seg.to_string())
                .or_insert(Json::Null);
        }
        *cur = value;
        Ok(())
    }
}
