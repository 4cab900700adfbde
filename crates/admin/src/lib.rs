//! kcop admin: authenticated client for the identity server's admin REST API.
//!
//! One [`KeycloakClient`] per target endpoint. The bearer token lives inside the
//! client; a rejected token gets exactly one re-login and one retry.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use kcop_core::{ClientScope, KcError, KcResult, Realm, ResourceContext, ResourceKind, User};
use metrics::{counter, histogram};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Token endpoint of the master realm (password grant).
pub const TOKEN_PATH: &str = "/auth/realms/master/protocol/openid-connect/token";
/// Root of the realm admin API.
pub const ADMIN_REALMS_PATH: &str = "/auth/admin/realms";

const ADMIN_CLI: &str = "admin-cli";

/// Which of a client's scope lists an association targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScopeAssociation {
    #[default]
    Default,
    Optional,
}

impl ScopeAssociation {
    pub fn segment(&self) -> &'static str {
        match self {
            ScopeAssociation::Default => "default-client-scopes",
            ScopeAssociation::Optional => "optional-client-scopes",
        }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("username", &self.username).field("password", &"<redacted>").finish()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub credentials: Credentials,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            credentials: Credentials { username: username.into(), password: password.into() },
            timeout: default_timeout(),
        }
    }

    /// Read `KCOP_URL`, `KCOP_ADMIN_USER`, `KCOP_ADMIN_PASSWORD` and `KCOP_HTTP_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("KCOP_URL").map_err(|_| anyhow!("KCOP_URL is not set"))?;
        let username = std::env::var("KCOP_ADMIN_USER").unwrap_or_else(|_| "admin".to_string());
        let password = std::env::var("KCOP_ADMIN_PASSWORD").map_err(|_| anyhow!("KCOP_ADMIN_PASSWORD is not set"))?;
        Ok(Self::new(base_url, username, password))
    }
}

fn default_timeout() -> Duration {
    let ms = std::env::var("KCOP_HTTP_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(10_000);
    Duration::from_millis(ms)
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Admin operations, one method per remote call.
#[async_trait::async_trait]
pub trait AdminApi: Send + Sync {
    async fn list_realms(&self) -> KcResult<Vec<Realm>>;
    async fn get_realm(&self, realm: &str) -> KcResult<Option<Realm>>;
    /// Creating a realm that already exists is a success.
    async fn create_realm(&self, realm: &Realm) -> KcResult<()>;
    /// Deleting a realm that is already gone is a success.
    async fn delete_realm(&self, realm: &str) -> KcResult<()>;

    async fn list_users(&self, realm: &str) -> KcResult<Vec<User>>;
    async fn get_user(&self, realm: &str, user_id: &str) -> KcResult<Option<User>>;
    async fn create_user(&self, realm: &str, user: &User) -> KcResult<()>;
    async fn delete_user(&self, realm: &str, user_id: &str) -> KcResult<()>;

    /// Realm-wide client scope catalog.
    async fn list_client_scopes(&self, realm: &str) -> KcResult<Vec<ClientScope>>;
    /// Returns the server-assigned id. A 409 is surfaced as [`KcError::Conflict`].
    async fn create_client_scope(&self, realm: &str, scope: &ClientScope) -> KcResult<String>;
    async fn delete_client_scope(&self, realm: &str, scope_id: &str) -> KcResult<()>;

    /// Scopes currently attached to a client (`client_id` is the internal id, not the OAuth clientId).
    async fn list_client_scopes_for_client(&self, realm: &str, client_id: &str, assoc: ScopeAssociation) -> KcResult<Vec<ClientScope>>;
    async fn add_client_scope(&self, realm: &str, client_id: &str, assoc: ScopeAssociation, scope_id: &str) -> KcResult<()>;
    async fn remove_client_scope(&self, realm: &str, client_id: &str, assoc: ScopeAssociation, scope_id: &str) -> KcResult<()>;
}

/// HTTP implementation bound to a single identity-server endpoint.
pub struct KeycloakClient {
    http: reqwest::Client,
    base: Url,
    credentials: Credentials,
    token: RwLock<Option<String>>,
}

impl KeycloakClient {
    pub fn new(cfg: ClientConfig) -> Result<Self> {
        let base = Url::parse(&cfg.base_url).with_context(|| format!("parsing identity server url {}", cfg.base_url))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("identity server url {} cannot carry a path", cfg.base_url));
        }
        let http = reqwest::Client::builder().timeout(cfg.timeout).build().context("building http client")?;
        Ok(Self { http, base, credentials: cfg.credentials, token: RwLock::new(None) })
    }

    /// Seed a token obtained elsewhere; it is still replaced on the first 401.
    pub fn with_token(self, token: impl Into<String>) -> Self {
        Self { token: RwLock::new(Some(token.into())), ..self }
    }

    pub async fn has_token(&self) -> bool { self.token.read().await.is_some() }

    /// Exchange credentials for a bearer token and store it on the client.
    pub async fn login(&self) -> KcResult<String> {
        let ctx = ResourceContext::new(ResourceKind::Token).realm("master");
        let url = self.url(&["auth", "realms", "master", "protocol", "openid-connect", "token"]);
        let form = [
            ("grant_type", "password"),
            ("client_id", ADMIN_CLI),
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
        ];
        counter!("kc_login_total", 1u64);
        let resp = self.http.post(url).form(&form).send().await.map_err(|e| transport_error(&ctx, e))?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(KcError::Authentication { context: ctx, status: status.as_u16() });
        }
        if !status.is_success() {
            return Err(status_error(&ctx, status, body_text(resp).await));
        }
        let tr: TokenResponse = decode(&ctx, resp).await?;
        debug!(expires_in = ?tr.expires_in, "admin token refreshed");
        *self.token.write().await = Some(tr.access_token.clone());
        Ok(tr.access_token)
    }

    async fn invalidate(&self) { *self.token.write().await = None; }

    async fn ensure_token(&self) -> KcResult<String> {
        if let Some(t) = self.token.read().await.as_ref() {
            return Ok(t.clone());
        }
        self.login().await
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut u = self.base.clone();
        if let Ok(mut segs) = u.path_segments_mut() {
            segs.pop_if_empty().extend(segments);
        }
        u
    }

    fn realm_url(&self, realm: &str, rest: &[&str]) -> Url {
        let mut segs = vec!["auth", "admin", "realms", realm];
        segs.extend_from_slice(rest);
        self.url(&segs)
    }

    async fn send_once(&self, ctx: &ResourceContext, req: RequestBuilder, token: &str) -> KcResult<Response> {
        let t0 = Instant::now();
        let res = req.bearer_auth(token).send().await;
        histogram!("kc_request_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("kc_requests_total", 1u64, "kind" => ctx.kind.as_str());
        res.map_err(|e| transport_error(ctx, e))
    }

    /// Send with the current token; on 401 log in once and retry once.
    async fn execute<F>(&self, ctx: &ResourceContext, build: F) -> KcResult<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder + Send + Sync,
    {
        let token = self.ensure_token().await?;
        let resp = self.send_once(ctx, build(&self.http), &token).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        warn!(context = %ctx, "admin token rejected; logging in again");
        self.invalidate().await;
        let token = self.login().await?;
        let resp = self.send_once(ctx, build(&self.http), &token).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            counter!("kc_auth_fail_total", 1u64);
            self.invalidate().await;
            return Err(KcError::Authentication { context: ctx.clone(), status: StatusCode::UNAUTHORIZED.as_u16() });
        }
        Ok(resp)
    }

    async fn list<T: DeserializeOwned>(&self, ctx: &ResourceContext, url: Url) -> KcResult<Vec<T>> {
        let resp = self.execute(ctx, |c| c.request(Method::GET, url.clone())).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(ctx, status, body_text(resp).await));
        }
        decode(ctx, resp).await
    }

    async fn get<T: DeserializeOwned>(&self, ctx: &ResourceContext, url: Url) -> KcResult<Option<T>> {
        let resp = self.execute(ctx, |c| c.request(Method::GET, url.clone())).await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(ctx, status, body_text(resp).await));
        }
        decode(ctx, resp).await.map(Some)
    }

    /// POST a representation and return the id from `Location`.
    ///
    /// With `absorb_conflict` a 409 and a response without an id both give
    /// `Ok(None)`. Without it, a missing id is a decode error.
    async fn create<B: Serialize + Sync>(&self, ctx: &ResourceContext, url: Url, body: &B, absorb_conflict: bool) -> KcResult<Option<String>> {
        let resp = self.execute(ctx, |c| c.request(Method::POST, url.clone()).json(body)).await?;
        let status = resp.status();
        if status == StatusCode::CONFLICT && absorb_conflict {
            debug!(context = %ctx, "create: already exists");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(ctx, status, body_text(resp).await));
        }
        let id = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|loc| loc.trim_end_matches('/').rsplit('/').next())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        if id.is_none() && !absorb_conflict {
            return Err(missing_location(ctx));
        }
        info!(context = %ctx, id = ?id, "created");
        Ok(id)
    }

    async fn delete(&self, ctx: &ResourceContext, url: Url) -> KcResult<()> {
        let resp = self.execute(ctx, |c| c.request(Method::DELETE, url.clone())).await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            debug!(context = %ctx, "delete: already gone");
            return Ok(());
        }
        if !status.is_success() {
            return Err(status_error(ctx, status, body_text(resp).await));
        }
        info!(context = %ctx, "deleted");
        Ok(())
    }

    async fn put_empty(&self, ctx: &ResourceContext, url: Url) -> KcResult<()> {
        let resp = self.execute(ctx, |c| c.request(Method::PUT, url.clone())).await?;
        let status = resp.status();
        if status == StatusCode::CONFLICT {
            return Ok(());
        }
        if !status.is_success() {
            return Err(status_error(ctx, status, body_text(resp).await));
        }
        Ok(())
    }
}

fn missing_location(ctx: &ResourceContext) -> KcError {
    KcError::Decode { context: ctx.clone(), message: "create response carried no Location id".to_string() }
}

#[async_trait::async_trait]
impl AdminApi for KeycloakClient {
    async fn list_realms(&self) -> KcResult<Vec<Realm>> {
        let ctx = ResourceContext::new(ResourceKind::Realm);
        self.list(&ctx, self.url(&["auth", "admin", "realms"])).await
    }

    async fn get_realm(&self, realm: &str) -> KcResult<Option<Realm>> {
        let ctx = ResourceContext::new(ResourceKind::Realm).realm(realm).name(realm);
        self.get(&ctx, self.realm_url(realm, &[])).await
    }

    async fn create_realm(&self, realm: &Realm) -> KcResult<()> {
        let ctx = ResourceContext::new(ResourceKind::Realm).realm(&realm.realm).name(&realm.realm);
        self.create(&ctx, self.url(&["auth", "admin", "realms"]), realm, true).await.map(|_| ())
    }

    async fn delete_realm(&self, realm: &str) -> KcResult<()> {
        let ctx = ResourceContext::new(ResourceKind::Realm).realm(realm).name(realm);
        self.delete(&ctx, self.realm_url(realm, &[])).await
    }

    async fn list_users(&self, realm: &str) -> KcResult<Vec<User>> {
        let ctx = ResourceContext::new(ResourceKind::User).realm(realm);
        self.list(&ctx, self.realm_url(realm, &["users"])).await
    }

    async fn get_user(&self, realm: &str, user_id: &str) -> KcResult<Option<User>> {
        let ctx = ResourceContext::new(ResourceKind::User).realm(realm).name(user_id);
        self.get(&ctx, self.realm_url(realm, &["users", user_id])).await
    }

    async fn create_user(&self, realm: &str, user: &User) -> KcResult<()> {
        let ctx = ResourceContext::new(ResourceKind::User).realm(realm).name(&user.username);
        self.create(&ctx, self.realm_url(realm, &["users"]), user, true).await.map(|_| ())
    }

    async fn delete_user(&self, realm: &str, user_id: &str) -> KcResult<()> {
        let ctx = ResourceContext::new(ResourceKind::User).realm(realm).name(user_id);
        self.delete(&ctx, self.realm_url(realm, &["users", user_id])).await
    }

    async fn list_client_scopes(&self, realm: &str) -> KcResult<Vec<ClientScope>> {
        let ctx = ResourceContext::new(ResourceKind::ClientScope).realm(realm);
        self.list(&ctx, self.realm_url(realm, &["client-scopes"])).await
    }

    async fn create_client_scope(&self, realm: &str, scope: &ClientScope) -> KcResult<String> {
        let ctx = ResourceContext::new(ResourceKind::ClientScope).realm(realm).name(&scope.name);
        self.create(&ctx, self.realm_url(realm, &["client-scopes"]), scope, false)
            .await?
            .ok_or_else(|| missing_location(&ctx))
    }

    async fn delete_client_scope(&self, realm: &str, scope_id: &str) -> KcResult<()> {
        let ctx = ResourceContext::new(ResourceKind::ClientScope).realm(realm).name(scope_id);
        self.delete(&ctx, self.realm_url(realm, &["client-scopes", scope_id])).await
    }

    async fn list_client_scopes_for_client(&self, realm: &str, client_id: &str, assoc: ScopeAssociation) -> KcResult<Vec<ClientScope>> {
        let ctx = ResourceContext::new(ResourceKind::ClientScopeMapping).realm(realm).name(client_id);
        self.list(&ctx, self.realm_url(realm, &["clients", client_id, assoc.segment()])).await
    }

    async fn add_client_scope(&self, realm: &str, client_id: &str, assoc: ScopeAssociation, scope_id: &str) -> KcResult<()> {
        let ctx = ResourceContext::new(ResourceKind::ClientScopeMapping).realm(realm).name(scope_id);
        self.put_empty(&ctx, self.realm_url(realm, &["clients", client_id, assoc.segment(), scope_id])).await
    }

    async fn remove_client_scope(&self, realm: &str, client_id: &str, assoc: ScopeAssociation, scope_id: &str) -> KcResult<()> {
        let ctx = ResourceContext::new(ResourceKind::ClientScopeMapping).realm(realm).name(scope_id);
        self.delete(&ctx, self.realm_url(realm, &["clients", client_id, assoc.segment(), scope_id])).await
    }
}

fn transport_error(ctx: &ResourceContext, e: reqwest::Error) -> KcError {
    counter!("kc_transport_err_total", 1u64);
    KcError::Transient { context: ctx.clone(), status: e.status().map(|s| s.as_u16()), message: e.to_string() }
}

/// Map a non-success status to the error taxonomy.
fn status_error(ctx: &ResourceContext, status: StatusCode, body: String) -> KcError {
    let code = status.as_u16();
    match status {
        StatusCode::UNAUTHORIZED => KcError::Authentication { context: ctx.clone(), status: code },
        StatusCode::CONFLICT => KcError::Conflict { context: ctx.clone() },
        StatusCode::TOO_MANY_REQUESTS => KcError::Transient { context: ctx.clone(), status: Some(code), message: body },
        s if s.is_server_error() => KcError::Transient { context: ctx.clone(), status: Some(code), message: body },
        _ => KcError::Remote { context: ctx.clone(), status: code, body },
    }
}

async fn body_text(resp: Response) -> String {
    let mut s = resp.text().await.unwrap_or_default();
    if s.len() > 512 {
        let mut cut = 512;
        while !s.is_char_boundary(cut) { cut -= 1; }
        s.truncate(cut);
    }
    s
}

async fn decode<T: DeserializeOwned>(ctx: &ResourceContext, resp: Response) -> KcResult<T> {
    let bytes = resp.bytes().await.map_err(|e| transport_error(ctx, e))?;
    serde_json::from_slice(&bytes).map_err(|e| KcError::Decode { context: ctx.clone(), message: e.to_string() })
}
