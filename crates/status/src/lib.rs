//! kcop status: fold the outcome of a reconciliation pass into the custom resource status.
//!
//! The tracker never changes anything mid-pass. Callers collect a [`PassOutcome`]
//! while they work and hand it to [`complete_pass`] once the attempt is over.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// No status recorded yet.
    #[default]
    #[serde(rename = "")]
    Uninitialized,
    #[serde(rename = "initialising")]
    Initialising,
    #[serde(rename = "reconciling")]
    Reconciling,
    #[serde(rename = "failing")]
    Failing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Uninitialized => "",
            Phase::Initialising => "initialising",
            Phase::Reconciling => "reconciling",
            Phase::Failing => "failing",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Uninitialized => f.write_str("uninitialized"),
            p => f.write_str(p.as_str()),
        }
    }
}

/// Status subtree of the Keycloak custom resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeycloakStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub ready: bool,
    /// Kind name to the names of the objects created for this resource.
    #[serde(default)]
    pub secondary_resources: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "internalURL")]
    pub internal_url: String,
    #[serde(default)]
    pub credential_secret: String,
}

impl KeycloakStatus {
    /// Body for a JSON merge patch on the status subresource, taking the
    /// cluster from `prev` to `self`.
    ///
    /// A merge patch only deletes keys sent as `null`, so kinds present in
    /// `prev` but not in `self` are nulled out of `secondaryResources`.
    pub fn to_patch(&self, prev: &KeycloakStatus) -> Json {
        let mut patch = serde_json::json!({ "status": self });
        if let Some(index) = patch.pointer_mut("/status/secondaryResources").and_then(Json::as_object_mut) {
            for kind in prev.secondary_resources.keys() {
                if !self.secondary_resources.contains_key(kind) {
                    index.insert(kind.clone(), Json::Null);
                }
            }
        }
        patch
    }

    pub fn from_object(obj: &Json) -> Option<Self> {
        obj.get("status").and_then(|s| serde_json::from_value(s.clone()).ok())
    }
}

/// What one pass touched and how it went.
#[derive(Debug, Clone, Default)]
pub struct PassOutcome {
    resources: BTreeMap<String, BTreeSet<String>>,
    unhealthy: Vec<String>,
    error: Option<String>,
    errors: usize,
    cancelled: bool,
    pub version: Option<String>,
    pub internal_url: Option<String>,
    pub credential_secret: Option<String>,
}

impl PassOutcome {
    pub fn new() -> Self { Self::default() }

    /// Record a secondary resource produced by this pass.
    pub fn resource(&mut self, kind: &str, name: &str, healthy: bool) {
        self.resources.entry(kind.to_string()).or_default().insert(name.to_string());
        if !healthy {
            self.unhealthy.push(format!("{}/{}", kind, name));
        }
    }

    /// Only the first error ends up in the status message.
    pub fn error(&mut self, err: impl fmt::Display) {
        self.errors += 1;
        if self.error.is_none() {
            self.error = Some(err.to_string());
        }
    }

    /// The attempt stopped before finishing; the index stays as it was.
    pub fn cancelled(&mut self) { self.cancelled = true; }

    pub fn failed(&self) -> bool { self.error.is_some() }

    pub fn error_count(&self) -> usize { self.errors }

    pub fn unhealthy(&self) -> &[String] { &self.unhealthy }

    pub fn is_ready(&self) -> bool { !self.cancelled && self.error.is_none() && self.unhealthy.is_empty() }

    fn index(&self) -> BTreeMap<String, Vec<String>> {
        self.resources.iter().map(|(k, names)| (k.clone(), names.iter().cloned().collect())).collect()
    }
}

/// First sighting of a resource: an empty status becomes `initialising`.
pub fn observe(prev: Option<&KeycloakStatus>) -> Option<KeycloakStatus> {
    match prev {
        Some(s) if s.phase != Phase::Uninitialized => None,
        Some(s) => Some(KeycloakStatus { phase: Phase::Initialising, ready: false, ..s.clone() }),
        None => Some(KeycloakStatus { phase: Phase::Initialising, ..Default::default() }),
    }
}

/// Status after a finished attempt.
///
/// Any attempt moves the phase to `reconciling`, or to `failing` when it
/// errored. The secondary index is replaced by exactly this pass's resources.
/// A cancelled attempt keeps the previous index and phase, unless it had
/// already hit an error, which still moves it to `failing`.
pub fn complete_pass(prev: &KeycloakStatus, outcome: &PassOutcome) -> KeycloakStatus {
    let mut next = prev.clone();
    if outcome.cancelled {
        next.ready = false;
        if let Some(msg) = &outcome.error {
            next.phase = Phase::Failing;
            next.message = msg.clone();
        }
        debug!(phase = %next.phase, errors = outcome.errors, "pass cancelled; index kept");
        return next;
    }
    match &outcome.error {
        Some(msg) => {
            next.phase = Phase::Failing;
            next.message = msg.clone();
        }
        None => {
            next.phase = Phase::Reconciling;
            next.message.clear();
        }
    }
    next.ready = outcome.is_ready();
    next.secondary_resources = outcome.index();
    if let Some(v) = &outcome.version { next.version = v.clone(); }
    if let Some(u) = &outcome.internal_url { next.internal_url = u.clone(); }
    if let Some(c) = &outcome.credential_secret { next.credential_secret = c.clone(); }
    debug!(from = %prev.phase, to = %next.phase, ready = next.ready, errors = outcome.errors, "status transition");
    next
}

/// Health of a platform object as read back after a write.
///
/// Workloads need `readyReplicas >= replicas`; anything else counts once it exists.
pub fn resource_ready(obj: &Json) -> bool {
    match obj.get("kind").and_then(Json::as_str) {
        Some("StatefulSet") | Some("Deployment") => {
            let want = obj.pointer("/spec/replicas").and_then(Json::as_i64).unwrap_or(1);
            let have = obj.pointer("/status/readyReplicas").and_then(Json::as_i64).unwrap_or(0);
            have >= want
        }
        _ => !obj.is_null(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn phase_serializes_like_the_crd() {
        assert_eq!(serde_json::to_value(Phase::Uninitialized).unwrap(), json!(""));
        assert_eq!(serde_json::to_value(Phase::Failing).unwrap(), json!("failing"));
        let p: Phase = serde_json::from_value(json!("initialising")).unwrap();
        assert_eq!(p, Phase::Initialising);
    }

    #[test]
    fn status_field_names() {
        let s = KeycloakStatus { internal_url: "https://kc:8443".into(), credential_secret: "creds".into(), ..Default::default() };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["internalURL"], "https://kc:8443");
        assert_eq!(v["credentialSecret"], "creds");
        assert_eq!(v["phase"], "");
        assert_eq!(v["secondaryResources"], json!({}));
    }

    #[test]
    fn workload_health_compares_replicas() {
        let ok = json!({ "kind": "StatefulSet", "spec": { "replicas": 2 }, "status": { "readyReplicas": 2 } });
        let lagging = json!({ "kind": "StatefulSet", "spec": { "replicas": 2 }, "status": { "readyReplicas": 1 } });
        let fresh = json!({ "kind": "Deployment", "spec": { "replicas": 1 } });
        assert!(resource_ready(&ok));
        assert!(!resource_ready(&lagging));
        assert!(!resource_ready(&fresh));
        assert!(resource_ready(&json!({ "kind": "Service" })));
        assert!(!resource_ready(&Json::Null));
    }

    #[test]
    fn only_first_error_is_kept() {
        let mut o = PassOutcome::new();
        o.error("realm missing");
        o.error("later");
        assert_eq!(o.error_count(), 2);
        let s = complete_pass(&KeycloakStatus::default(), &o);
        assert_eq!(s.message, "realm missing");
    }
}
