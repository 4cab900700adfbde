//! kcop reconciliation pass.
//!
//! Frontends (the CLI, an operator loop) depend on the [`Platform`] trait and on
//! [`run_pass`]. [`KubePlatform`] talks to a cluster through kubehub;
//! [`MockPlatform`] keeps objects in memory for tests.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{anyhow, Result};
use kcop_admin::{AdminApi, ScopeAssociation};
use kcop_core::KcError;
use kcop_reconcile::{drift_summary, reconcile, OwnershipTable};
use kcop_status::{complete_pass, observe, resource_ready, KeycloakStatus, PassOutcome};
use kcop_sync::{sync_client_scopes, ScopeTarget, SyncReport};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use kcop_kubehub::ObjectRef;

/// Reads and writes of platform objects.
#[async_trait::async_trait]
pub trait Platform: Send + Sync {
    async fn get(&self, reference: &ObjectRef) -> Result<Option<Json>>;

    async fn create(&self, obj: &Json) -> Result<Json>;

    /// Full update guarded by the resourceVersion carried in `obj`.
    async fn replace(&self, obj: &Json) -> Result<Json>;

    /// Move the owner's status from `prev` (what was last written) to `next`.
    async fn write_status(&self, reference: &ObjectRef, prev: &KeycloakStatus, next: &KeycloakStatus) -> Result<()>;
}

/// An object the operator wants to exist, with the rules for merging it into what is there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredObject {
    pub body: Json,
    pub table: OwnershipTable,
}

impl DesiredObject {
    pub fn new(body: Json, table: OwnershipTable) -> Self { Self { body, table } }
}

/// Scope associations one client should end up with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSpec {
    pub realm: String,
    pub client_id: String,
    #[serde(default)]
    pub assoc: ScopeAssociation,
    pub names: Vec<String>,
}

impl ScopeSpec {
    fn target(&self) -> ScopeTarget<'_> {
        ScopeTarget { realm: &self.realm, client_id: &self.client_id, assoc: self.assoc }
    }
}

/// Everything one pass needs: a single snapshot of the desired state.
#[derive(Debug, Clone, Default)]
pub struct PassInput {
    /// The custom resource whose status is written.
    pub owner: Option<ObjectRef>,
    pub objects: Vec<DesiredObject>,
    pub scopes: Vec<ScopeSpec>,
    pub version: Option<String>,
    pub internal_url: Option<String>,
    pub credential_secret: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub status: KeycloakStatus,
    pub created: Vec<String>,
    pub replaced: Vec<String>,
    pub unchanged: Vec<String>,
    pub scopes: Vec<SyncReport>,
}

enum Converged {
    Created(Json),
    Replaced(Json),
    Unchanged(Json),
}

async fn converge_object<P: Platform + ?Sized>(platform: &P, desired: &DesiredObject, reference: &ObjectRef) -> Result<Converged> {
    let Some(observed) = platform.get(reference).await? else {
        return Ok(Converged::Created(platform.create(&desired.body).await?));
    };
    let merged = reconcile(&desired.table, &observed, &desired.body);
    let drift = drift_summary(&desired.table, &merged, &observed);
    if drift.is_empty() {
        return Ok(Converged::Unchanged(observed));
    }
    debug!(object = %reference, adds = drift.adds, updates = drift.updates, removes = drift.removes, "drift");
    Ok(Converged::Replaced(platform.replace(&merged).await?))
}

/// Run one reconciliation pass: converge every desired object, sync scopes,
/// then write the folded status once.
///
/// Failures of individual objects or scope lists end up in the status; only a
/// failed status write is returned as an error.
pub async fn run_pass<P, A>(
    platform: &P,
    admin: &A,
    input: &PassInput,
    prev: Option<&KeycloakStatus>,
    cancel: &CancellationToken,
) -> Result<PassReport>
where
    P: Platform + ?Sized,
    A: AdminApi + ?Sized,
{
    let t0 = Instant::now();
    let mut prev = prev.cloned().unwrap_or_default();
    if let Some(init) = observe(Some(&prev)) {
        if let Some(owner) = &input.owner {
            platform.write_status(owner, &prev, &init).await?;
        }
        info!(owner = ?input.owner.as_ref().map(|o| o.to_string()), "initialising");
        prev = init;
    }

    let mut report = PassReport::default();
    let mut outcome = PassOutcome::new();
    outcome.version = input.version.clone();
    outcome.internal_url = input.internal_url.clone();
    outcome.credential_secret = input.credential_secret.clone();

    for desired in &input.objects {
        if cancel.is_cancelled() {
            outcome.cancelled();
            break;
        }
        let reference = match ObjectRef::from_object(&desired.body) {
            Ok(r) => r,
            Err(e) => {
                outcome.error(format!("invalid desired object: {:#}", e));
                continue;
            }
        };
        match converge_object(platform, desired, &reference).await {
            Ok(Converged::Created(obj)) => {
                outcome.resource(&reference.kind, &reference.name, resource_ready(&obj));
                report.created.push(reference.to_string());
            }
            Ok(Converged::Replaced(obj)) => {
                outcome.resource(&reference.kind, &reference.name, resource_ready(&obj));
                report.replaced.push(reference.to_string());
            }
            Ok(Converged::Unchanged(obj)) => {
                outcome.resource(&reference.kind, &reference.name, resource_ready(&obj));
                report.unchanged.push(reference.to_string());
            }
            Err(e) => {
                counter!("reconcile_object_err_total", 1u64);
                warn!(object = %reference, error = %e, "object not converged");
                outcome.error(format!("{}: {:#}", reference, e));
            }
        }
    }

    for spec in &input.scopes {
        match sync_client_scopes(admin, spec.target(), spec.names.as_slice(), cancel).await {
            Ok(r) => report.scopes.push(r),
            Err(e) if e.was_cancelled() => {
                for err in e.errors.iter().filter(|err| !matches!(err, KcError::Cancelled { .. })) {
                    outcome.error(err);
                }
                report.scopes.push(e.report);
                outcome.cancelled();
                break;
            }
            Err(e) => {
                outcome.error(&e);
                report.scopes.push(e.report);
            }
        }
    }

    let status = complete_pass(&prev, &outcome);
    if let Some(owner) = &input.owner {
        if status != prev {
            platform.write_status(owner, &prev, &status).await?;
        }
    }
    histogram!("reconcile_pass_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(
        phase = %status.phase,
        ready = status.ready,
        created = report.created.len(),
        replaced = report.replaced.len(),
        unchanged = report.unchanged.len(),
        "pass complete"
    );
    report.status = status;
    Ok(report)
}

// ----------------- In-process implementation -----------------

/// Platform backed by a live cluster.
pub struct KubePlatform {
    hub: kcop_kubehub::KubeHub,
}

impl KubePlatform {
    pub fn new(hub: kcop_kubehub::KubeHub) -> Self { Self { hub } }

    pub async fn connect() -> Result<Self> { Ok(Self::new(kcop_kubehub::KubeHub::connect().await?)) }
}

#[async_trait::async_trait]
impl Platform for KubePlatform {
    async fn get(&self, reference: &ObjectRef) -> Result<Option<Json>> { self.hub.get(reference).await }

    async fn create(&self, obj: &Json) -> Result<Json> { self.hub.create(obj).await }

    async fn replace(&self, obj: &Json) -> Result<Json> { self.hub.replace(obj).await }

    async fn write_status(&self, reference: &ObjectRef, prev: &KeycloakStatus, next: &KeycloakStatus) -> Result<()> {
        self.hub.patch_status(reference, &next.to_patch(prev)).await
    }
}

// ----------------- Mock implementation -----------------

/// In-memory platform for tests. Assigns resourceVersions, rejects stale
/// replaces and applies status writes with merge-patch semantics.
#[derive(Default)]
pub struct MockPlatform {
    objects: Mutex<BTreeMap<String, Json>>,
    writes: Mutex<Vec<String>>,
    statuses: Mutex<Vec<KeycloakStatus>>,
    status_docs: Mutex<BTreeMap<String, Json>>,
    next_rv: Mutex<u64>,
}

impl MockPlatform {
    pub fn new() -> Self { Self::default() }

    fn key(r: &ObjectRef) -> String { format!("{}|{}", r.gvk_key(), r) }

    fn bump(&self) -> Result<String> {
        let mut rv = self.next_rv.lock().map_err(|_| anyhow!("mock poisoned"))?;
        *rv += 1;
        Ok(rv.to_string())
    }

    /// Put an object in place without recording a write.
    pub fn seed(&self, mut obj: Json) -> Result<()> {
        let r = ObjectRef::from_object(&obj)?;
        let rv = self.bump()?;
        if let Some(meta) = obj.get_mut("metadata").and_then(Json::as_object_mut) {
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        self.objects.lock().map_err(|_| anyhow!("mock poisoned"))?.insert(Self::key(&r), obj);
        Ok(())
    }

    pub fn object(&self, r: &ObjectRef) -> Option<Json> { self.objects.lock().ok()?.get(&Self::key(r)).cloned() }

    /// Writes issued so far, as `create <ref>` / `replace <ref>`.
    pub fn writes(&self) -> Vec<String> { self.writes.lock().map(|w| w.clone()).unwrap_or_default() }

    pub fn statuses(&self) -> Vec<KeycloakStatus> { self.statuses.lock().map(|s| s.clone()).unwrap_or_default() }

    /// Put a status in place for `owner` without recording a write.
    pub fn seed_status(&self, owner: &ObjectRef, status: &KeycloakStatus) -> Result<()> {
        let doc = serde_json::to_value(status)?;
        self.status_docs.lock().map_err(|_| anyhow!("mock poisoned"))?.insert(Self::key(owner), serde_json::json!({ "status": doc }));
        Ok(())
    }

    /// Status as stored after every patch so far.
    pub fn stored_status(&self, owner: &ObjectRef) -> Option<KeycloakStatus> {
        self.status_docs.lock().ok()?.get(&Self::key(owner)).and_then(KeycloakStatus::from_object)
    }

    fn store(&self, op: &str, obj: &Json) -> Result<Json> {
        let r = ObjectRef::from_object(obj)?;
        let mut stored = obj.clone();
        let rv = self.bump()?;
        if let Some(meta) = stored.get_mut("metadata").and_then(Json::as_object_mut) {
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        self.objects.lock().map_err(|_| anyhow!("mock poisoned"))?.insert(Self::key(&r), stored.clone());
        self.writes.lock().map_err(|_| anyhow!("mock poisoned"))?.push(format!("{} {}", op, r));
        Ok(stored)
    }
}

#[async_trait::async_trait]
impl Platform for MockPlatform {
    async fn get(&self, reference: &ObjectRef) -> Result<Option<Json>> { Ok(self.object(reference)) }

    async fn create(&self, obj: &Json) -> Result<Json> {
        let r = ObjectRef::from_object(obj)?;
        if self.object(&r).is_some() {
            return Err(anyhow!("{} already exists", r));
        }
        self.store("create", obj)
    }

    async fn replace(&self, obj: &Json) -> Result<Json> {
        let r = ObjectRef::from_object(obj)?;
        let current = self.object(&r).ok_or_else(|| anyhow!("{} not found", r))?;
        let want = obj.pointer("/metadata/resourceVersion");
        if want.is_none() || want != current.pointer("/metadata/resourceVersion") {
            return Err(anyhow!("conflict replacing {}: stale resourceVersion", r));
        }
        self.store("replace", obj)
    }

    async fn write_status(&self, reference: &ObjectRef, prev: &KeycloakStatus, next: &KeycloakStatus) -> Result<()> {
        {
            let mut docs = self.status_docs.lock().map_err(|_| anyhow!("mock poisoned"))?;
            let doc = docs.entry(Self::key(reference)).or_insert_with(|| serde_json::json!({}));
            json_patch::merge(doc, &next.to_patch(prev));
        }
        self.statuses.lock().map_err(|_| anyhow!("mock poisoned"))?.push(next.clone());
        Ok(())
    }
}
