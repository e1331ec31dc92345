//! Keel patch: two-way merge descriptions between snapshots of one object.
//!
//! Maps merge key by key and removed keys become `null` (RFC 7386). Lists are
//! replaced wholesale unless a merge key is declared for their path, in which
//! case the description uses strategic-merge directives (`$patch: delete`,
//! `$setElementOrder/<field>`). An empty description means "no write".

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

const ORDER_PREFIX: &str = "$setElementOrder/";
const PATCH_DIRECTIVE: &str = "$patch";

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("expected an object at {path:?}, found {found}")]
    NotAnObject { path: String, found: &'static str },
    #[error("list element at {path:?} is missing merge key {key:?}")]
    MissingMergeKey { path: String, key: String },
    #[error("element order directive for {path:?} but no merge key is declared")]
    UndeclaredList { path: String },
}

pub type Result<T, E = PatchError> = std::result::Result<T, E>;

/// Merge keys by dotted field path, e.g. `spec.template.spec.containers -> name`.
/// Paths ignore list positions: fields of keyed list elements continue the
/// list's own path (`spec.template.spec.containers.ports`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeKeys {
    keys: BTreeMap<String, String>,
}

impl MergeKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: &str, key: &str) -> Self {
        self.keys.insert(path.to_string(), key.to_string());
        self
    }

    pub fn key_for(&self, path: &str) -> Option<&str> {
        self.keys.get(path).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys for the pod template of workload kinds (Deployment, StatefulSet, ...).
    pub fn workload() -> Self {
        let pod = "spec.template.spec";
        let mut keys = Self::new();
        for list in ["containers", "initContainers"] {
            let base = format!("{}.{}", pod, list);
            keys = keys
                .with(&base, "name")
                .with(&format!("{}.ports", base), "containerPort")
                .with(&format!("{}.env", base), "name")
                .with(&format!("{}.volumeMounts", base), "mountPath");
        }
        keys.with(&format!("{}.volumes", pod), "name")
    }
}

/// Counts of what a description touches, for logs and dry-run output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0 && self.removes == 0
    }
}

/// A computed merge description.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergePatch {
    body: Map<String, Json>,
    strategic: bool,
    #[serde(skip)]
    summary: DiffSummary,
}

impl MergePatch {
    /// No field differs; callers skip the write.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Whether the description carries strategic-merge directives and must
    /// be submitted as such rather than as a plain JSON merge patch.
    pub fn is_strategic(&self) -> bool {
        self.strategic
    }

    pub fn body(&self) -> &Map<String, Json> {
        &self.body
    }

    pub fn to_json(&self) -> Json {
        Json::Object(self.body.clone())
    }

    pub fn summary(&self) -> DiffSummary {
        self.summary
    }
}

impl fmt::Display for MergePatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.body) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("{}"),
        }
    }
}

/// Compute the description that turns `before` into `after`.
pub fn two_way(before: &Json, after: &Json, keys: &MergeKeys) -> Result<MergePatch> {
    let b = as_object("", before)?;
    let a = as_object("", after)?;
    let mut differ = Differ { keys, summary: DiffSummary::default(), strategic: false };
    let body = differ.diff_maps("", b, a);
    Ok(MergePatch { body, strategic: differ.strategic, summary: differ.summary })
}

/// Apply a description (as produced by [`two_way`], or any JSON merge patch)
/// to `doc`, returning the merged document.
pub fn apply(doc: &Json, patch: &Json, keys: &MergeKeys) -> Result<Json> {
    let patch = as_object("", patch)?;
    let mut out = match doc {
        Json::Null => Map::new(),
        other => as_object("", other)?.clone(),
    };
    apply_map("", &mut out, patch, keys)?;
    Ok(Json::Object(out))
}

fn as_object<'a>(path: &str, v: &'a Json) -> Result<&'a Map<String, Json>> {
    v.as_object().ok_or_else(|| PatchError::NotAnObject { path: path.to_string(), found: type_name(v) })
}

fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

fn join(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", path, field)
    }
}

/// Every element is an object carrying a distinct, non-null merge key.
fn keyed(list: &[Json], key: &str) -> bool {
    let mut seen: Vec<&Json> = Vec::with_capacity(list.len());
    for e in list {
        match e.as_object().and_then(|o| o.get(key)) {
            Some(k) if !k.is_null() && !seen.contains(&k) => seen.push(k),
            _ => return false,
        }
    }
    true
}

struct Differ<'a> {
    keys: &'a MergeKeys,
    summary: DiffSummary,
    strategic: bool,
}

impl Differ<'_> {
    fn diff_maps(&mut self, path: &str, before: &Map<String, Json>, after: &Map<String, Json>) -> Map<String, Json> {
        let mut out = Map::new();
        for (k, bv) in before {
            if !bv.is_null() && !after.contains_key(k) {
                out.insert(k.clone(), Json::Null);
                self.summary.removes += 1;
            }
        }
        for (k, av) in after {
            let Some(bv) = before.get(k).filter(|v| !v.is_null()) else {
                if !av.is_null() {
                    out.insert(k.clone(), av.clone());
                    self.summary.adds += 1;
                }
                continue;
            };
            if bv == av {
                continue;
            }
            let child = join(path, k);
            match (bv, av) {
                (_, Json::Null) => {
                    out.insert(k.clone(), Json::Null);
                    self.summary.removes += 1;
                }
                (Json::Object(bo), Json::Object(ao)) => {
                    let sub = self.diff_maps(&child, bo, ao);
                    if !sub.is_empty() {
                        out.insert(k.clone(), Json::Object(sub));
                    }
                }
                (Json::Array(ba), Json::Array(aa)) => match self.keys.key_for(&child) {
                    Some(key) if keyed(ba, key) && keyed(aa, key) => {
                        self.diff_keyed_list(&child, k, key, ba, aa, &mut out);
                    }
                    _ => {
                        out.insert(k.clone(), av.clone());
                        self.summary.updates += 1;
                    }
                },
                _ => {
                    out.insert(k.clone(), av.clone());
                    self.summary.updates += 1;
                }
            }
        }
        out
    }

    fn diff_keyed_list(
        &mut self,
        path: &str,
        field: &str,
        key: &str,
        before: &[Json],
        after: &[Json],
        out: &mut Map<String, Json>,
    ) {
        let mut items = Vec::new();
        for ae in after {
            let kv = &ae[key];
            match before.iter().find(|be| &be[key] == kv) {
                None => {
                    items.push(ae.clone());
                    self.summary.adds += 1;
                }
                Some(be) if be == ae => {}
                Some(be) => {
                    if let (Some(bo), Some(ao)) = (be.as_object(), ae.as_object()) {
                        let mut sub = self.diff_maps(path, bo, ao);
                        if !sub.is_empty() {
                            sub.insert(key.to_string(), kv.clone());
                            items.push(Json::Object(sub));
                        }
                    }
                }
            }
        }
        for be in before {
            if !after.iter().any(|ae| ae[key] == be[key]) {
                let mut gone = Map::new();
                gone.insert(key.to_string(), be[key].clone());
                gone.insert(PATCH_DIRECTIVE.to_string(), Json::String("delete".into()));
                items.push(Json::Object(gone));
                self.summary.removes += 1;
            }
        }

        let kept_before: Vec<&Json> =
            before.iter().map(|e| &e[key]).filter(|kv| after.iter().any(|ae| &ae[key] == *kv)).collect();
        let kept_after: Vec<&Json> =
            after.iter().map(|e| &e[key]).filter(|kv| before.iter().any(|be| &be[key] == *kv)).collect();
        let reordered = kept_before != kept_after;
        if items.is_empty() && !reordered {
            return;
        }
        if reordered {
            self.summary.updates += 1;
        }
        self.strategic = true;
        if !items.is_empty() {
            out.insert(field.to_string(), Json::Array(items));
        }
        let order = after
            .iter()
            .map(|ae| {
                let mut m = Map::new();
                m.insert(key.to_string(), ae[key].clone());
                Json::Object(m)
            })
            .collect();
        out.insert(format!("{}{}", ORDER_PREFIX, field), Json::Array(order));
    }
}

fn apply_map(path: &str, target: &mut Map<String, Json>, patch: &Map<String, Json>, keys: &MergeKeys) -> Result<()> {
    let mut orders = Vec::new();
    for (k, pv) in patch {
        if let Some(field) = k.strip_prefix(ORDER_PREFIX) {
            orders.push((field, pv));
            continue;
        }
        if k == PATCH_DIRECTIVE {
            continue;
        }
        let child = join(path, k);
        match pv {
            Json::Null => {
                target.remove(k);
            }
            Json::Object(po) => {
                let slot = target.entry(k.clone()).or_insert(Json::Null);
                if !slot.is_object() {
                    *slot = Json::Object(Map::new());
                }
                if let Json::Object(tm) = slot {
                    apply_map(&child, tm, po, keys)?;
                }
            }
            Json::Array(pa) => match keys.key_for(&child) {
                Some(key) => {
                    let slot = target.entry(k.clone()).or_insert(Json::Null);
                    if !slot.is_array() {
                        *slot = Json::Array(Vec::new());
                    }
                    if let Json::Array(ta) = slot {
                        apply_keyed_list(&child, ta, pa, key, keys)?;
                    }
                }
                None => {
                    target.insert(k.clone(), pv.clone());
                }
            },
            _ => {
                target.insert(k.clone(), pv.clone());
            }
        }
    }
    for (field, order) in orders {
        let child = join(path, field);
        let key = keys.key_for(&child).ok_or_else(|| PatchError::UndeclaredList { path: child.clone() })?;
        if let (Some(Json::Array(ta)), Some(order)) = (target.get_mut(field), order.as_array()) {
            reorder(ta, order, key);
        }
    }
    Ok(())
}

fn apply_keyed_list(path: &str, target: &mut Vec<Json>, patch: &[Json], key: &str, keys: &MergeKeys) -> Result<()> {
    for pe in patch {
        let po = as_object(path, pe)?;
        let kv = po
            .get(key)
            .ok_or_else(|| PatchError::MissingMergeKey { path: path.to_string(), key: key.to_string() })?;
        let pos = target.iter().position(|te| te.get(key) == Some(kv));
        if po.get(PATCH_DIRECTIVE).and_then(Json::as_str) == Some("delete") {
            if let Some(i) = pos {
                target.remove(i);
            }
            continue;
        }
        match pos {
            Some(i) => match &mut target[i] {
                Json::Object(tm) => apply_map(path, tm, po, keys)?,
                other => *other = pe.clone(),
            },
            None => {
                let mut fresh = Map::new();
                apply_map(path, &mut fresh, po, keys)?;
                target.push(Json::Object(fresh));
            }
        }
    }
    Ok(())
}

/// Sort `list` by the key order given; elements not named keep their
/// relative order at the end.
fn reorder(list: &mut Vec<Json>, order: &[Json], key: &str) {
    let mut rest = std::mem::take(list);
    for o in order {
        let Some(kv) = o.get(key) else { continue };
        if let Some(i) = rest.iter().position(|e| e.get(key) == Some(kv)) {
            list.push(rest.remove(i));
        }
    }
    list.extend(rest);
}
