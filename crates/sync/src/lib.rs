//! kcop sync: converge a client's scope associations to a declared name set.
//!
//! Fetch catalog + current associations, diff as sets, then apply adds and
//! removes one by one. Every operation is attempted; the sync fails at the end
//! if any of them failed.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use kcop_admin::{AdminApi, ScopeAssociation};
use kcop_core::{KcError, NamedResource, ResourceContext, ResourceKind};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Set difference between desired and actual names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamePlan {
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
    /// Names present on both sides.
    pub unchanged: BTreeSet<String>,
}

impl NamePlan {
    /// Order of either input is irrelevant; duplicates collapse.
    pub fn compute<D, A>(desired: D, actual: A) -> Self
    where
        D: IntoIterator,
        D::Item: AsRef<str>,
        A: IntoIterator,
        A::Item: AsRef<str>,
    {
        let desired: BTreeSet<String> = desired.into_iter().map(|s| s.as_ref().to_string()).collect();
        let actual: BTreeSet<String> = actual.into_iter().map(|s| s.as_ref().to_string()).collect();
        Self {
            to_add: desired.difference(&actual).cloned().collect(),
            to_remove: actual.difference(&desired).cloned().collect(),
            unchanged: desired.intersection(&actual).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool { self.to_add.is_empty() && self.to_remove.is_empty() }
}

/// What a sync run did. Names are listed in the order the calls were issued.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
}

impl SyncReport {
    pub fn calls(&self) -> usize { self.added.len() + self.removed.len() }
}

/// One or more operations failed. Work done before and after the failures is kept in `report`.
#[derive(Debug)]
pub struct SyncError {
    pub report: SyncReport,
    pub errors: Vec<KcError>,
}

impl SyncError {
    fn single(err: KcError) -> Self { Self { report: SyncReport::default(), errors: vec![err] } }

    /// First fatal error, for status messages.
    pub fn first(&self) -> Option<&KcError> { self.errors.first() }

    /// Retryable only when every failure was transient.
    pub fn is_retryable(&self) -> bool { !self.errors.is_empty() && self.errors.iter().all(|e| e.is_retryable()) }

    pub fn was_cancelled(&self) -> bool { self.errors.iter().any(|e| matches!(e, KcError::Cancelled { .. })) }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.first() {
            Some(e) if self.errors.len() > 1 => write!(f, "client scope sync: {} operations failed; first: {}", self.errors.len(), e),
            Some(e) => write!(f, "client scope sync: {}", e),
            None => f.write_str("client scope sync failed"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors.first().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Address of one client's scope list.
#[derive(Debug, Clone, Copy)]
pub struct ScopeTarget<'a> {
    pub realm: &'a str,
    pub client_id: &'a str,
    pub assoc: ScopeAssociation,
}

impl<'a> ScopeTarget<'a> {
    pub fn default_scopes(realm: &'a str, client_id: &'a str) -> Self {
        Self { realm, client_id, assoc: ScopeAssociation::Default }
    }

    pub fn optional_scopes(realm: &'a str, client_id: &'a str) -> Self {
        Self { realm, client_id, assoc: ScopeAssociation::Optional }
    }

    fn context(&self, name: &str) -> ResourceContext {
        ResourceContext::new(ResourceKind::ClientScopeMapping).realm(self.realm).name(name)
    }
}

/// Converge the target's associations to `desired`.
pub async fn sync_client_scopes<A, S>(
    api: &A,
    target: ScopeTarget<'_>,
    desired: &[S],
    cancel: &CancellationToken,
) -> Result<SyncReport, SyncError>
where
    A: AdminApi + ?Sized,
    S: AsRef<str>,
{
    let catalog: FxHashMap<String, String> = api
        .list_client_scopes(target.realm)
        .await
        .map_err(SyncError::single)?
        .into_iter()
        .filter_map(|s| s.id().map(|id| (s.name().to_string(), id.to_string())))
        .collect();
    let current = api
        .list_client_scopes_for_client(target.realm, target.client_id, target.assoc)
        .await
        .map_err(SyncError::single)?;

    let plan = NamePlan::compute(desired.iter().map(AsRef::<str>::as_ref), current.iter().map(|s| s.name()));
    debug!(realm = target.realm, client = target.client_id, assoc = ?target.assoc, add = plan.to_add.len(), remove = plan.to_remove.len(), "scope plan");
    apply_plan(api, target, &plan, &catalog, cancel).await
}

/// Issue the calls of an already computed plan. `catalog` maps scope name to id.
pub async fn apply_plan<A>(
    api: &A,
    target: ScopeTarget<'_>,
    plan: &NamePlan,
    catalog: &FxHashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<SyncReport, SyncError>
where
    A: AdminApi + ?Sized,
{
    let mut report = SyncReport { unchanged: plan.unchanged.len(), ..Default::default() };
    let mut errors: Vec<KcError> = Vec::new();

    let ops = plan.to_add.iter().map(|n| (true, n)).chain(plan.to_remove.iter().map(|n| (false, n)));
    for (adding, name) in ops {
        let ctx = target.context(name);
        if cancel.is_cancelled() {
            warn!(context = %ctx, "scope sync cancelled; leaving remaining operations for the next pass");
            errors.push(KcError::Cancelled { context: ctx });
            break;
        }
        let Some(id) = catalog.get(name.as_str()) else {
            counter!("scope_sync_err_total", 1u64);
            let reason = if adding { "scope is not defined in the realm" } else { "associated scope is missing from the realm catalog" };
            warn!(context = %ctx, reason, "scope sync");
            errors.push(KcError::Configuration { context: ctx, reason: reason.to_string() });
            continue;
        };
        let res = if adding {
            api.add_client_scope(target.realm, target.client_id, target.assoc, id).await
        } else {
            api.remove_client_scope(target.realm, target.client_id, target.assoc, id).await
        };
        match res {
            Ok(()) if adding => {
                counter!("scope_sync_add_total", 1u64);
                info!(realm = target.realm, client = target.client_id, scope = %name, "scope added");
                report.added.push(name.clone());
            }
            Ok(()) => {
                counter!("scope_sync_remove_total", 1u64);
                info!(realm = target.realm, client = target.client_id, scope = %name, "scope removed");
                report.removed.push(name.clone());
            }
            Err(e) => {
                counter!("scope_sync_err_total", 1u64);
                warn!(error = %e, adding, "scope operation failed");
                errors.push(e);
            }
        }
    }

    if errors.is_empty() { Ok(report) } else { Err(SyncError { report, errors }) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> { items.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn plan_is_a_true_set_difference() {
        let p = NamePlan::compute(["a", "b", "c"], ["a", "b", "d"]);
        assert_eq!(p.to_add, set(&["c"]));
        assert_eq!(p.to_remove, set(&["d"]));
        assert_eq!(p.unchanged, set(&["a", "b"]));
    }

    #[test]
    fn empty_desired_removes_everything() {
        let p = NamePlan::compute(Vec::<String>::new(), ["x", "y"]);
        assert!(p.to_add.is_empty());
        assert_eq!(p.to_remove, set(&["x", "y"]));
    }

    #[test]
    fn empty_actual_only_adds_and_duplicates_collapse() {
        let p = NamePlan::compute(["k", "a", "k"], Vec::<&str>::new());
        assert_eq!(p.to_add, set(&["a", "k"]));
        assert!(p.to_remove.is_empty());
    }

    #[test]
    fn ordering_does_not_matter() {
        let p = NamePlan::compute(["c", "b", "a"], ["a", "c", "b"]);
        assert!(p.is_empty());
        assert_eq!(p.unchanged.len(), 3);
    }

    #[test]
    fn error_display_names_first_failure() {
        let ctx = ResourceContext::new(ResourceKind::ClientScopeMapping).realm("r").name("k");
        let e = SyncError {
            report: SyncReport::default(),
            errors: vec![
                KcError::Configuration { context: ctx.clone(), reason: "scope is not defined in the realm".into() },
                KcError::Transient { context: ctx, status: Some(503), message: String::new() },
            ],
        };
        let s = e.to_string();
        assert!(s.contains("2 operations failed"), "{}", s);
        assert!(s.contains("name=k"), "{}", s);
        assert!(!e.is_retryable());
    }
}
