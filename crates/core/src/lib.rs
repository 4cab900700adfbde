//! kcop core types: identity-server models, resource context and the error taxonomy.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kinds of remote resources the admin client talks about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Realm,
    User,
    ClientScope,
    ClientScopeMapping,
    Token,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Realm => "realm",
            ResourceKind::User => "user",
            ResourceKind::ClientScope => "client-scope",
            ResourceKind::ClientScopeMapping => "client-scope-mapping",
            ResourceKind::Token => "token",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Where a remote call was pointed: kind plus realm/name when known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceContext {
    pub kind: ResourceKind,
    pub realm: Option<String>,
    pub name: Option<String>,
}

impl ResourceContext {
    pub fn new(kind: ResourceKind) -> Self { Self { kind, realm: None, name: None } }

    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Display for ResourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(r) = &self.realm { write!(f, " realm={}", r)?; }
        if let Some(n) = &self.name { write!(f, " name={}", n)?; }
        Ok(())
    }
}

/// Errors surfaced by the remote client and the synchronizer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KcError {
    /// The desired state references something the realm does not define.
    #[error("configuration: {context}: {reason}")]
    Configuration { context: ResourceContext, reason: String },
    /// Token rejected even after a fresh login.
    #[error("authentication failed: {context} (status {status})")]
    Authentication { context: ResourceContext, status: u16 },
    /// Network failure, 5xx or 429. Safe to retry on a later pass.
    #[error("transient: {context}: {message}")]
    Transient { context: ResourceContext, status: Option<u16>, message: String },
    #[error("conflict: {context} already exists")]
    Conflict { context: ResourceContext },
    /// Any other non-success status.
    #[error("remote: {context}: status {status}: {body}")]
    Remote { context: ResourceContext, status: u16, body: String },
    #[error("decode: {context}: {message}")]
    Decode { context: ResourceContext, message: String },
    #[error("cancelled before {context}")]
    Cancelled { context: ResourceContext },
}

impl KcError {
    /// Transient failures are the only ones a caller should retry.
    pub fn is_retryable(&self) -> bool { matches!(self, KcError::Transient { .. }) }

    pub fn status(&self) -> Option<u16> {
        match self {
            KcError::Authentication { status, .. } | KcError::Remote { status, .. } => Some(*status),
            KcError::Transient { status, .. } => *status,
            KcError::Conflict { .. } => Some(409),
            _ => None,
        }
    }

    pub fn context(&self) -> &ResourceContext {
        match self {
            KcError::Configuration { context, .. }
            | KcError::Authentication { context, .. }
            | KcError::Transient { context, .. }
            | KcError::Conflict { context }
            | KcError::Remote { context, .. }
            | KcError::Decode { context, .. }
            | KcError::Cancelled { context } => context,
        }
    }
}

pub type KcResult<T> = Result<T, KcError>;

/// A remote resource reconciled by name; the id is server-assigned.
pub trait NamedResource {
    const KIND: ResourceKind;

    fn name(&self) -> &str;
    fn id(&self) -> Option<&str>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Realm {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub realm: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl NamedResource for Realm {
    const KIND: ResourceKind = ResourceKind::Realm;
    fn name(&self) -> &str { &self.realm }
    fn id(&self) -> Option<&str> { self.id.as_deref() }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub enabled: bool,
}

impl NamedResource for User {
    const KIND: ResourceKind = ResourceKind::User;
    fn name(&self) -> &str { &self.username }
    fn id(&self) -> Option<&str> { self.id.as_deref() }
}

/// Reusable bundle of protocol claims attachable to a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

impl ClientScope {
    pub fn named(name: impl Into<String>) -> Self { Self { name: name.into(), ..Default::default() } }
}

impl NamedResource for ClientScope {
    const KIND: ResourceKind = ResourceKind::ClientScope;
    fn name(&self) -> &str { &self.name }
    fn id(&self) -> Option<&str> { self.id.as_deref() }
}

pub mod prelude {
    pub use super::{ClientScope, KcError, KcResult, NamedResource, Realm, ResourceContext, ResourceKind, User};
}
