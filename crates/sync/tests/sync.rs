use std::sync::Mutex;

use kcop_admin::{AdminApi, ClientConfig, KeycloakClient, ScopeAssociation};
use kcop_core::{ClientScope, KcError, KcResult, Realm, ResourceContext, ResourceKind, User};
use kcop_sync::{sync_client_scopes, ScopeTarget};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn scope(id: &str, name: &str) -> ClientScope {
    ClientScope { id: Some(id.to_string()), name: name.to_string(), ..Default::default() }
}

/// In-memory admin API recording association calls.
#[derive(Default)]
struct FakeAdmin {
    catalog: Vec<ClientScope>,
    attached: Vec<ClientScope>,
    failing_ids: Vec<String>,
    cancel_after_first: Option<CancellationToken>,
    fail_listing: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeAdmin {
    fn new(catalog: &[(&str, &str)], attached: &[&str]) -> Self {
        let catalog: Vec<ClientScope> = catalog.iter().map(|(id, n)| scope(id, n)).collect();
        let attached = attached
            .iter()
            .map(|n| catalog.iter().find(|s| s.name == *n).cloned().unwrap_or_else(|| scope(&format!("orphan-{}", n), n)))
            .collect();
        Self { catalog, attached, ..Default::default() }
    }

    fn record(&self, call: String) -> KcResult<()> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(call.clone());
        if let Some(tok) = &self.cancel_after_first { tok.cancel(); }
        let id = call.split(':').nth(1).unwrap_or_default();
        if self.failing_ids.iter().any(|f| f == id) {
            return Err(KcError::Transient {
                context: ResourceContext::new(ResourceKind::ClientScopeMapping).realm("r").name(id),
                status: Some(503),
                message: "unavailable".into(),
            });
        }
        Ok(())
    }

    fn calls(&self) -> Vec<String> { self.calls.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl AdminApi for FakeAdmin {
    async fn list_realms(&self) -> KcResult<Vec<Realm>> { Ok(vec![]) }
    async fn get_realm(&self, _realm: &str) -> KcResult<Option<Realm>> { Ok(None) }
    async fn create_realm(&self, _realm: &Realm) -> KcResult<()> { Ok(()) }
    async fn delete_realm(&self, _realm: &str) -> KcResult<()> { Ok(()) }
    async fn list_users(&self, _realm: &str) -> KcResult<Vec<User>> { Ok(vec![]) }
    async fn get_user(&self, _realm: &str, _user_id: &str) -> KcResult<Option<User>> { Ok(None) }
    async fn create_user(&self, _realm: &str, _user: &User) -> KcResult<()> { Ok(()) }
    async fn delete_user(&self, _realm: &str, _user_id: &str) -> KcResult<()> { Ok(()) }

    async fn list_client_scopes(&self, realm: &str) -> KcResult<Vec<ClientScope>> {
        if self.fail_listing {
            return Err(KcError::Transient { context: ResourceContext::new(ResourceKind::ClientScope).realm(realm), status: Some(502), message: String::new() });
        }
        Ok(self.catalog.clone())
    }
    async fn create_client_scope(&self, _realm: &str, _scope: &ClientScope) -> KcResult<String> { Ok(String::new()) }
    async fn delete_client_scope(&self, _realm: &str, _scope_id: &str) -> KcResult<()> { Ok(()) }

    async fn list_client_scopes_for_client(&self, _realm: &str, _client_id: &str, _assoc: ScopeAssociation) -> KcResult<Vec<ClientScope>> {
        Ok(self.attached.clone())
    }
    async fn add_client_scope(&self, _realm: &str, _client_id: &str, _assoc: ScopeAssociation, scope_id: &str) -> KcResult<()> {
        self.record(format!("add:{}", scope_id))
    }
    async fn remove_client_scope(&self, _realm: &str, _client_id: &str, _assoc: ScopeAssociation, scope_id: &str) -> KcResult<()> {
        self.record(format!("remove:{}", scope_id))
    }
}

const CATALOG: &[(&str, &str)] = &[("id-a", "a"), ("id-b", "b"), ("id-k", "k"), ("id-u", "u")];

#[tokio::test]
async fn end_to_end_adds_missing_and_removes_stray() {
    let server = MockServer::start().await;
    let catalog = serde_json::json!([
        { "id": "12345-6789", "name": "scope:a:b:c" },
        { "id": "6789-12345", "name": "scope:d:e:f" },
        { "id": "12334-6789-12345", "name": "scope:k:t:c" },
        { "id": "888888-6789-12345", "name": "scope:u:r:k:t:c" },
    ]);
    let attached = serde_json::json!([
        { "id": "12345-6789", "name": "scope:a:b:c" },
        { "id": "6789-12345", "name": "scope:d:e:f" },
        { "id": "888888-6789-12345", "name": "scope:u:r:k:t:c" },
    ]);
    let base = "/auth/admin/realms/testrealm/clients/testclient/default-client-scopes";
    Mock::given(method("GET"))
        .and(path("/auth/admin/realms/testrealm/client-scopes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(catalog))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET")).and(path(base)).respond_with(ResponseTemplate::new(200).set_body_json(attached)).expect(1).mount(&server).await;
    Mock::given(method("PUT"))
        .and(path(format!("{}/12334-6789-12345", base)))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/888888-6789-12345", base)))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = KeycloakClient::new(ClientConfig::new(server.uri(), "admin", "secret")).unwrap().with_token("dummy");
    let desired = vec!["scope:a:b:c".to_string(), "scope:d:e:f".to_string(), "scope:k:t:c".to_string()];
    let report = sync_client_scopes(&client, ScopeTarget::default_scopes("testrealm", "testclient"), &desired, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.added, vec!["scope:k:t:c"]);
    assert_eq!(report.removed, vec!["scope:u:r:k:t:c"]);
    assert_eq!(report.unchanged, 2);
}

#[tokio::test]
async fn exactly_one_add_and_one_remove() {
    let api = FakeAdmin::new(CATALOG, &["a", "b", "u"]);
    let report = sync_client_scopes(&api, ScopeTarget::default_scopes("r", "c"), &["a", "b", "k"], &CancellationToken::new()).await.unwrap();
    assert_eq!(api.calls(), vec!["add:id-k", "remove:id-u"]);
    assert_eq!(report.calls(), 2);
}

#[tokio::test]
async fn converged_state_issues_zero_calls() {
    let api = FakeAdmin::new(CATALOG, &["b", "a"]);
    let report = sync_client_scopes(&api, ScopeTarget::optional_scopes("r", "c"), &["a", "b", "a"], &CancellationToken::new()).await.unwrap();
    assert!(api.calls().is_empty());
    assert_eq!(report.calls(), 0);
    assert_eq!(report.unchanged, 2);
}

#[tokio::test]
async fn empty_desired_removes_all_associations() {
    let api = FakeAdmin::new(CATALOG, &["a", "u"]);
    let none: [&str; 0] = [];
    sync_client_scopes(&api, ScopeTarget::default_scopes("r", "c"), &none, &CancellationToken::new()).await.unwrap();
    assert_eq!(api.calls(), vec!["remove:id-a", "remove:id-u"]);
}

#[tokio::test]
async fn unknown_scope_is_configuration_error_but_others_proceed() {
    let api = FakeAdmin::new(CATALOG, &["u"]);
    let err = sync_client_scopes(&api, ScopeTarget::default_scopes("r", "c"), &["nope", "k"], &CancellationToken::new()).await.unwrap_err();
    assert_eq!(api.calls(), vec!["add:id-k", "remove:id-u"]);
    assert_eq!(err.errors.len(), 1);
    match err.first() {
        Some(KcError::Configuration { context, .. }) => assert_eq!(context.name.as_deref(), Some("nope")),
        other => panic!("expected configuration error, got {:?}", other),
    }
    assert_eq!(err.report.added, vec!["k"]);
    assert_eq!(err.report.removed, vec!["u"]);
}

#[tokio::test]
async fn failed_operation_does_not_block_the_rest() {
    let mut api = FakeAdmin::new(CATALOG, &["u"]);
    api.failing_ids = vec!["id-a".to_string()];
    let err = sync_client_scopes(&api, ScopeTarget::default_scopes("r", "c"), &["a", "k"], &CancellationToken::new()).await.unwrap_err();
    assert_eq!(api.calls(), vec!["add:id-a", "add:id-k", "remove:id-u"]);
    assert_eq!(err.errors.len(), 1);
    assert!(err.is_retryable());
    assert_eq!(err.report.added, vec!["k"]);
    assert_eq!(err.report.removed, vec!["u"]);
}

#[tokio::test]
async fn cancellation_stops_further_calls_without_rollback() {
    let tok = CancellationToken::new();
    let mut api = FakeAdmin::new(CATALOG, &["u"]);
    api.cancel_after_first = Some(tok.clone());
    let err = sync_client_scopes(&api, ScopeTarget::default_scopes("r", "c"), &["a", "k"], &tok).await.unwrap_err();
    assert_eq!(api.calls(), vec!["add:id-a"]);
    assert!(err.was_cancelled());
    assert_eq!(err.report.added, vec!["a"]);
}

#[tokio::test]
async fn already_cancelled_pass_issues_nothing() {
    let tok = CancellationToken::new();
    tok.cancel();
    let api = FakeAdmin::new(CATALOG, &["u"]);
    let err = sync_client_scopes(&api, ScopeTarget::default_scopes("r", "c"), &["a"], &tok).await.unwrap_err();
    assert!(api.calls().is_empty());
    assert!(err.was_cancelled());
}

#[tokio::test]
async fn fetch_failure_is_surfaced_unmodified() {
    let mut api = FakeAdmin::new(CATALOG, &[]);
    api.fail_listing = true;
    let err = sync_client_scopes(&api, ScopeTarget::default_scopes("r", "c"), &["a"], &CancellationToken::new()).await.unwrap_err();
    assert!(api.calls().is_empty());
    assert_eq!(err.first().and_then(|e| e.status()), Some(502));
    assert_eq!(err.first().map(|e| e.context().kind), Some(ResourceKind::ClientScope));
}
