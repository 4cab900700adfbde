//! kcop kubehub: discovery plus get/create/replace/status writes for dynamic objects.

#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

/// Field manager recorded on every write; `KCOP_FIELD_MANAGER` overrides it.
pub fn field_manager() -> String {
    std::env::var("KCOP_FIELD_MANAGER").ok().filter(|s| !s.is_empty()).unwrap_or_else(|| "kcop".to_string())
}

/// Which object on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self { api_version: api_version.to_string(), kind: kind.to_string(), namespace: namespace.map(str::to_string), name: name.to_string() }
    }

    /// Read the reference out of an object's `apiVersion`, `kind` and metadata.
    pub fn from_object(obj: &Json) -> Result<Self> {
        let field = |p: &str| obj.pointer(p).and_then(Json::as_str);
        let api_version = field("/apiVersion").ok_or_else(|| anyhow!("object missing apiVersion"))?;
        let kind = field("/kind").ok_or_else(|| anyhow!("object missing kind"))?;
        let name = field("/metadata/name").ok_or_else(|| anyhow!("{} missing metadata.name", kind))?;
        Ok(Self::new(api_version, kind, field("/metadata/namespace"), name))
    }

    /// `v1/Kind` or `group/v1/Kind`.
    pub fn gvk_key(&self) -> String { format!("{}/{}", self.api_version, self.kind) }

    pub fn gvk(&self) -> Result<GroupVersionKind> { parse_gvk_key(&self.gvk_key()) }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from the current context")
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

fn record_write(op: &'static str, t0: Instant, ok: bool) {
    histogram!("kube_write_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
    if ok {
        counter!("kube_writes_total", 1u64, "op" => op);
    } else {
        counter!("kube_write_err_total", 1u64, "op" => op);
    }
}

/// Kube gateway for one cluster. Discovery results are cached per GVK.
pub struct KubeHub {
    client: Client,
    field_manager: String,
    resources: Mutex<FxHashMap<String, (ApiResource, bool)>>,
}

impl KubeHub {
    pub fn new(client: Client) -> Self {
        Self { client, field_manager: field_manager(), resources: Mutex::new(FxHashMap::default()) }
    }

    pub async fn connect() -> Result<Self> { Ok(Self::new(get_kube_client().await?)) }

    pub fn field_manager_name(&self) -> &str { &self.field_manager }

    async fn api_for(&self, r: &ObjectRef) -> Result<Api<DynamicObject>> {
        let key = r.gvk_key();
        let cached = self.resources.lock().map_err(|_| anyhow!("discovery cache poisoned"))?.get(&key).cloned();
        let (ar, namespaced) = match cached {
            Some(hit) => hit,
            None => {
                let found = find_api_resource(self.client.clone(), &r.gvk()?).await?;
                debug!(gvk = %key, namespaced = found.1, "discovered api resource");
                self.resources.lock().map_err(|_| anyhow!("discovery cache poisoned"))?.insert(key, found.clone());
                found
            }
        };
        if !namespaced {
            return Ok(Api::all_with(self.client.clone(), &ar));
        }
        match r.namespace.as_deref() {
            Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            None => Err(anyhow!("namespace required for namespaced kind {}", r.kind)),
        }
    }

    /// Current object as JSON, `None` when absent. `managedFields` is dropped.
    pub async fn get(&self, r: &ObjectRef) -> Result<Option<Json>> {
        let api = self.api_for(r).await?;
        let Some(obj) = api.get_opt(&r.name).await.with_context(|| format!("reading {}", r))? else {
            return Ok(None);
        };
        let mut raw = serde_json::to_value(&obj).context("serializing DynamicObject")?;
        strip_managed_fields(&mut raw);
        Ok(Some(raw))
    }

    pub async fn create(&self, obj: &Json) -> Result<Json> {
        let r = ObjectRef::from_object(obj)?;
        let api = self.api_for(&r).await?;
        let data: DynamicObject = serde_json::from_value(obj.clone()).context("decoding object for create")?;
        let pp = PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let t0 = Instant::now();
        let res = api.create(&pp, &data).await;
        record_write("create", t0, res.is_ok());
        let created = res.with_context(|| format!("creating {}", r))?;
        info!(object = %r, "created");
        Ok(serde_json::to_value(&created)?)
    }

    /// Full update. The body must carry the resourceVersion it was computed against.
    pub async fn replace(&self, obj: &Json) -> Result<Json> {
        let r = ObjectRef::from_object(obj)?;
        if obj.pointer("/metadata/resourceVersion").and_then(Json::as_str).is_none() {
            return Err(anyhow!("refusing to replace {} without metadata.resourceVersion", r));
        }
        let api = self.api_for(&r).await?;
        let data: DynamicObject = serde_json::from_value(obj.clone()).context("decoding object for replace")?;
        let pp = PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let t0 = Instant::now();
        let res = api.replace(&r.name, &pp, &data).await;
        record_write("replace", t0, res.is_ok());
        match res {
            Ok(o) => {
                info!(object = %r, rv = ?o.metadata.resource_version, "replaced");
                Ok(serde_json::to_value(&o)?)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                warn!(object = %r, "replace conflict; object changed since it was read");
                Err(anyhow!("conflict replacing {}: {}", r, ae.message))
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("replacing {}", r))),
        }
    }

    /// JSON merge patch against the `status` subresource.
    pub async fn patch_status(&self, r: &ObjectRef, patch: &Json) -> Result<()> {
        let api = self.api_for(r).await?;
        let pp = PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let t0 = Instant::now();
        let res = api.patch_status(&r.name, &pp, &Patch::Merge(patch)).await;
        record_write("status", t0, res.is_ok());
        res.with_context(|| format!("patching status of {}", r))?;
        debug!(object = %r, "status written");
        Ok(())
    }
}
