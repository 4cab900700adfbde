//! kcop reconcile: merge an observed object with a freshly computed desired one.
//!
//! Who owns which field is declared per kind in an [`OwnershipTable`]. The merge
//! is pure: no I/O, no errors, same inputs give the same output.

#![forbid(unsafe_code)]

pub mod image;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub use image::{ImagePolicy, ImageRef};

/// Pointer of the Keycloak container image inside a StatefulSet.
pub const STS_IMAGE_PATH: &str = "/spec/template/spec/containers/0/image";

/// Server-assigned metadata; never taken from the desired object.
pub const IDENTITY_PATHS: &[&str] = &[
    "/metadata/name",
    "/metadata/namespace",
    "/metadata/uid",
    "/metadata/resourceVersion",
    "/metadata/generation",
    "/metadata/creationTimestamp",
    "/metadata/managedFields",
    "/metadata/selfLink",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Value comes from the desired object.
    Operator,
    /// Value comes from the observed object.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Owner {
    Operator,
    External,
    /// Observed value kept only when the policy says so.
    Image(ImagePolicy),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    /// RFC 6901 JSON pointer.
    pub path: String,
    pub owner: Owner,
}

impl FieldRule {
    pub fn operator(path: &str) -> Self { Self { path: path.to_string(), owner: Owner::Operator } }
    pub fn external(path: &str) -> Self { Self { path: path.to_string(), owner: Owner::External } }
    pub fn image(path: &str, policy: ImagePolicy) -> Self { Self { path: path.to_string(), owner: Owner::Image(policy) } }

    fn depth(&self) -> usize { self.path.matches('/').count() }
}

/// Field ownership for one object kind.
///
/// Fields not covered by a rule belong to `default`. When rules nest, the deeper
/// path wins inside the shallower one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipTable {
    pub kind: String,
    pub default: Side,
    pub rules: Vec<FieldRule>,
}

impl OwnershipTable {
    pub fn new(kind: impl Into<String>, default: Side) -> Self {
        let mut t = Self { kind: kind.into(), default, rules: Vec::new() };
        for p in IDENTITY_PATHS {
            t.rules.push(FieldRule::external(p));
        }
        t.rules.push(FieldRule::external("/status"));
        t
    }

    pub fn rule(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Desired wins everywhere except identity, status and fields other
    /// controllers commonly attach (annotations, finalizers, owner references).
    pub fn generic(kind: impl Into<String>) -> Self {
        Self::new(kind, Side::Operator)
            .rule(FieldRule::external("/metadata/annotations"))
            .rule(FieldRule::external("/metadata/finalizers"))
            .rule(FieldRule::external("/metadata/ownerReferences"))
    }

    /// Keycloak workload. Observed is the base; the pod template pieces the
    /// operator derives from the custom resource are overwritten; the image follows `image`.
    pub fn stateful_set(image: ImagePolicy) -> Self {
        Self::new("StatefulSet", Side::External)
            .rule(FieldRule::operator("/metadata/labels"))
            .rule(FieldRule::operator("/spec/replicas"))
            .rule(FieldRule::operator("/spec/template/spec/volumes"))
            .rule(FieldRule::operator("/spec/template/spec/imagePullSecrets"))
            .rule(FieldRule::operator("/spec/template/spec/affinity"))
            .rule(FieldRule::operator("/spec/template/spec/initContainers"))
            .rule(FieldRule::operator("/spec/template/spec/containers"))
            .rule(FieldRule::image(STS_IMAGE_PATH, image))
    }

    /// Startup script config map: only the data is the operator's.
    pub fn config_map() -> Self {
        Self::new("ConfigMap", Side::External)
            .rule(FieldRule::operator("/metadata/labels"))
            .rule(FieldRule::operator("/data"))
            .rule(FieldRule::operator("/binaryData"))
    }

    /// Built-in table for a kind; anything unknown gets [`OwnershipTable::generic`].
    pub fn for_kind(kind: &str, image: Option<ImagePolicy>) -> Self {
        match (kind, image) {
            ("StatefulSet", Some(policy)) => Self::stateful_set(policy),
            ("ConfigMap", _) => Self::config_map(),
            (k, _) => Self::generic(k),
        }
    }

    pub fn owner_of(&self, path: &str) -> Option<&Owner> {
        self.rules.iter().rev().find(|r| r.path == path).map(|r| &r.owner)
    }
}

/// Produce the object to persist: observed identity and externally-owned
/// fields, desired operator-owned fields.
pub fn reconcile(table: &OwnershipTable, observed: &Json, desired: &Json) -> Json {
    let mut out = match table.default {
        Side::Operator => desired.clone(),
        Side::External => observed.clone(),
    };
    let mut rules: Vec<&FieldRule> = table.rules.iter().collect();
    rules.sort_by_key(|r| r.depth());
    for rule in rules {
        let value = match &rule.owner {
            Owner::Operator => desired.pointer(&rule.path).cloned(),
            Owner::External => observed.pointer(&rule.path).cloned(),
            Owner::Image(policy) => desired.pointer(&rule.path).map(|_| {
                let current = observed.pointer(&rule.path).and_then(|v| v.as_str());
                Json::String(policy.select(current))
            }),
        };
        match value {
            Some(v) => set_pointer(&mut out, &rule.path, v),
            None => remove_pointer(&mut out, &rule.path),
        }
    }
    out
}

/// Typed wrapper around [`reconcile`] for k8s-openapi structs.
pub fn reconcile_typed<K>(table: &OwnershipTable, observed: &K, desired: &K) -> serde_json::Result<K>
where
    K: Serialize + serde::de::DeserializeOwned,
{
    let o = serde_json::to_value(observed)?;
    let d = serde_json::to_value(desired)?;
    serde_json::from_value(reconcile(table, &o, &d))
}

fn unescape(token: &str) -> String { token.replace("~1", "/").replace("~0", "~") }

fn tokens(pointer: &str) -> Vec<String> {
    pointer.strip_prefix('/').map(|p| p.split('/').map(unescape).collect()).unwrap_or_default()
}

/// Write `value` at `pointer`, creating intermediate objects. Array slots must
/// already exist (or be the next index).
fn set_pointer(root: &mut Json, pointer: &str, value: Json) {
    let toks = tokens(pointer);
    let Some((last, parents)) = toks.split_last() else {
        *root = value;
        return;
    };
    let mut cur: &mut Json = root;
    for t in parents {
        cur = match cur {
            Json::Array(arr) => match t.parse::<usize>() {
                Ok(i) if i < arr.len() => &mut arr[i],
                _ => return,
            },
            other => {
                if !other.is_object() {
                    *other = Json::Object(serde_json::Map::new());
                }
                match other {
                    Json::Object(map) => map.entry(t.clone()).or_insert_with(|| Json::Object(serde_json::Map::new())),
                    _ => return,
                }
            }
        };
    }
    match cur {
        Json::Array(arr) => match last.parse::<usize>() {
            Ok(i) if i < arr.len() => arr[i] = value,
            Ok(i) if i == arr.len() => arr.push(value),
            _ => {}
        },
        Json::Object(map) => {
            map.insert(last.clone(), value);
        }
        other => {
            let mut map = serde_json::Map::new();
            map.insert(last.clone(), value);
            *other = Json::Object(map);
        }
    }
}

fn remove_pointer(root: &mut Json, pointer: &str) {
    let toks = tokens(pointer);
    let Some((last, parents)) = toks.split_last() else { return };
    let mut cur: &mut Json = root;
    for t in parents {
        let next = match cur {
            Json::Object(map) => map.get_mut(t.as_str()),
            Json::Array(arr) => t.parse::<usize>().ok().and_then(|i| arr.get_mut(i)),
            _ => None,
        };
        cur = match next {
            Some(n) => n,
            None => return,
        };
    }
    match cur {
        Json::Object(map) => {
            map.remove(last.as_str());
        }
        Json::Array(arr) => {
            if let Ok(i) = last.parse::<usize>() {
                if i < arr.len() {
                    arr.remove(i);
                }
            }
        }
        _ => {}
    }
}

// ---- change reporting ----

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Drop server-populated fields so they do not show up as drift.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

/// Count leaf-level differences of `target` relative to `base`, ignoring noise.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len {
                    if aa[i] != bb[i] { walk(&aa[i], &bb[i], s); }
                }
                if aa.len() > bb.len() { s.adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { s.removes += bb.len() - aa.len(); }
            }
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(&strip_noisy(target.clone()), &strip_noisy(base.clone()), &mut s);
    s
}

fn escape(key: &str) -> String { key.replace('~', "~0").replace('/', "~1") }

/// Drift of a merged object against what the platform currently holds.
///
/// Like [`diff_summary`], except that keys present only in `observed` count as
/// removals only directly under a path the table gives to the operator (for
/// example `/data`). Anywhere else they are server-populated defaults such as
/// a container's `imagePullPolicy` or a Service's `clusterIP`.
pub fn drift_summary(table: &OwnershipTable, merged: &Json, observed: &Json) -> DiffSummary {
    fn walk(table: &OwnershipTable, path: &str, a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(table, &format!("{}/{}", path, escape(k)), av, bv, s),
                        None => s.adds += 1,
                    }
                }
                if matches!(table.owner_of(path), Some(Owner::Operator)) {
                    s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
                }
            }
            (Json::Array(aa), Json::Array(bb)) => {
                for (i, (av, bv)) in aa.iter().zip(bb.iter()).enumerate() {
                    if av != bv { walk(table, &format!("{}/{}", path, i), av, bv, s); }
                }
                if aa.len() > bb.len() { s.adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { s.removes += bb.len() - aa.len(); }
            }
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(table, "", &strip_noisy(merged.clone()), &strip_noisy(observed.clone()), &mut s);
    s
}
