use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kcop_admin::{AdminApi, ClientConfig, KeycloakClient, ScopeAssociation};
use kcop_api::{run_pass, DesiredObject, KubePlatform, ObjectRef, PassInput, Platform, ScopeSpec};
use kcop_reconcile::{diff_summary, reconcile, ImagePolicy, OwnershipTable};
use kcop_status::KeycloakStatus;
use kcop_sync::{sync_client_scopes, ScopeTarget};
use serde::Deserialize;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kcopctl", version, about = "kcop: Keycloak reconciliation engine CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum TableKind { Statefulset, Configmap, Generic }

/// Identity server connection; flags fall back to the KCOP_* environment.
#[derive(Args, Debug)]
struct Remote {
    #[arg(long = "url", env = "KCOP_URL")]
    url: String,
    #[arg(long = "user", env = "KCOP_ADMIN_USER", default_value = "admin")]
    user: String,
    #[arg(long = "password", env = "KCOP_ADMIN_PASSWORD", hide_env_values = true)]
    password: String,
}

impl Remote {
    fn client(&self) -> Result<KeycloakClient> {
        KeycloakClient::new(ClientConfig::new(self.url.clone(), self.user.clone(), self.password.clone()))
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Merge a desired object into an observed one (offline)
    Reconcile {
        #[arg(long = "kind", value_enum, default_value_t = TableKind::Generic)]
        kind: TableKind,
        /// Observed object, YAML or JSON
        #[arg(long = "observed")]
        observed: PathBuf,
        /// Desired object, YAML or JSON
        #[arg(long = "desired")]
        desired: PathBuf,
        /// Image the operator ships with (statefulset only)
        #[arg(long = "pinned-image")]
        pinned_image: Option<String>,
        #[arg(long = "image-override")]
        image_override: Option<String>,
    },
    /// Evaluate the image selection policy
    Image {
        #[arg(long = "pinned")]
        pinned: String,
        #[arg(long = "observed")]
        observed: Option<String>,
        #[arg(long = "override")]
        override_image: Option<String>,
    },
    /// List realms on the identity server
    Realms {
        #[command(flatten)]
        remote: Remote,
    },
    /// Converge a client's scope associations to the given names
    SyncScopes {
        #[command(flatten)]
        remote: Remote,
        #[arg(long = "realm")]
        realm: String,
        #[arg(long = "client")]
        client: String,
        /// Target optional-client-scopes instead of default-client-scopes
        #[arg(long = "optional", action = ArgAction::SetTrue)]
        optional: bool,
        names: Vec<String>,
    },
    /// Run one reconciliation pass against the current cluster
    Pass {
        #[command(flatten)]
        remote: Remote,
        /// Pass file (owner, objects, scopes), YAML or JSON
        file: PathBuf,
    },
}

/// Input of the `pass` command.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PassFile {
    owner: ObjectRef,
    #[serde(default)]
    pinned_image: Option<String>,
    #[serde(default)]
    image_override: Option<String>,
    #[serde(default)]
    objects: Vec<Json>,
    #[serde(default)]
    scopes: Vec<ScopeSpec>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default, rename = "internalURL")]
    internal_url: Option<String>,
    #[serde(default)]
    credential_secret: Option<String>,
}

impl PassFile {
    fn into_input(self) -> PassInput {
        let policy = self.pinned_image.map(|p| ImagePolicy::pinned(p).with_override(self.image_override));
        let objects = self
            .objects
            .into_iter()
            .map(|body| {
                let kind = body.get("kind").and_then(Json::as_str).unwrap_or_default().to_string();
                DesiredObject::new(body, OwnershipTable::for_kind(&kind, policy.clone()))
            })
            .collect();
        PassInput {
            owner: Some(self.owner),
            objects,
            scopes: self.scopes,
            version: self.version,
            internal_url: self.internal_url,
            credential_secret: self.credential_secret,
        }
    }
}

fn init_tracing() {
    let env = std::env::var("KCOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KCOP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KCOP_METRICS_ADDR; expected host:port");
        }
    }
}

/// Read a YAML or JSON document.
fn load_doc<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn table_for(kind: TableKind, desired: &Json, pinned: Option<String>, override_image: Option<String>) -> Result<OwnershipTable> {
    Ok(match kind {
        TableKind::Statefulset => {
            let pinned = pinned.ok_or_else(|| anyhow!("--pinned-image is required for --kind statefulset"))?;
            OwnershipTable::stateful_set(ImagePolicy::pinned(pinned).with_override(override_image))
        }
        TableKind::Configmap => OwnershipTable::config_map(),
        TableKind::Generic => OwnershipTable::generic(desired.get("kind").and_then(Json::as_str).unwrap_or("Object")),
    })
}

/// Token cancelled once `signal` resolves successfully.
fn cancel_when<F>(signal: F) -> CancellationToken
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let guard = cancel.clone();
    tokio::spawn(async move {
        if signal.await.is_ok() {
            warn!("interrupt received; stopping after the current call");
            guard.cancel();
        }
    });
    cancel
}

fn cancel_on_interrupt() -> CancellationToken { cancel_when(tokio::signal::ctrl_c()) }

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Reconcile { kind, observed, desired, pinned_image, image_override } => {
            let observed: Json = load_doc(&observed)?;
            let desired: Json = load_doc(&desired)?;
            let table = table_for(kind, &desired, pinned_image, image_override)?;
            let merged = reconcile(&table, &observed, &desired);
            let summary = diff_summary(&merged, &observed);
            match cli.output {
                Output::Human => {
                    println!("{}", serde_yaml::to_string(&merged)?);
                    eprintln!("changes vs observed: +{} ~{} -{}", summary.adds, summary.updates, summary.removes);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "object": merged, "summary": summary }))?),
            }
        }
        Commands::Image { pinned, observed, override_image } => {
            let policy = ImagePolicy::pinned(pinned).with_override(override_image);
            let image = policy.select(observed.as_deref());
            match cli.output {
                Output::Human => println!("{}", image),
                Output::Json => println!("{}", serde_json::json!({ "image": image, "policy": policy })),
            }
        }
        Commands::Realms { remote } => {
            let client = remote.client()?;
            let realms = client.list_realms().await?;
            info!(count = realms.len(), "realms listed");
            match cli.output {
                Output::Human => {
                    for r in realms {
                        let state = if r.enabled { "enabled" } else { "disabled" };
                        println!("{} • {}", r.realm, state);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&realms)?),
            }
        }
        Commands::SyncScopes { remote, realm, client, optional, names } => {
            let api = remote.client()?;
            let assoc = if optional { ScopeAssociation::Optional } else { ScopeAssociation::Default };
            let target = ScopeTarget { realm: &realm, client_id: &client, assoc };
            let cancel = cancel_on_interrupt();
            let (report, failure) = match sync_client_scopes(&api, target, names.as_slice(), &cancel).await {
                Ok(r) => (r, None),
                Err(e) => {
                    error!(error = %e, "scope sync failed");
                    let msg = e.to_string();
                    (e.report, Some(msg))
                }
            };
            match cli.output {
                Output::Human => {
                    for n in &report.added { println!("+ {}", n); }
                    for n in &report.removed { println!("- {}", n); }
                    println!("{} unchanged", report.unchanged);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            if let Some(msg) = failure {
                return Err(anyhow!(msg));
            }
        }
        Commands::Pass { remote, file } => {
            let spec: PassFile = load_doc(&file)?;
            let input = spec.into_input();
            let platform = KubePlatform::connect().await?;
            let admin = remote.client()?;
            let owner = input.owner.clone().ok_or_else(|| anyhow!("pass file has no owner"))?;
            let prev: Option<KeycloakStatus> = platform.get(&owner).await?.as_ref().and_then(KeycloakStatus::from_object);
            let report = run_pass(&platform, &admin, &input, prev.as_ref(), &cancel_on_interrupt()).await?;
            match cli.output {
                Output::Human => {
                    for r in &report.created { println!("created {}", r); }
                    for r in &report.replaced { println!("replaced {}", r); }
                    for r in &report.unchanged { println!("unchanged {}", r); }
                    let s = &report.status;
                    println!("phase={} ready={} {}", s.phase, s.ready, s.message);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report.status)?),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_sync_scopes_flags() {
        let cli = Cli::try_parse_from([
            "kcopctl", "-o", "json", "sync-scopes", "--url", "http://kc", "--password", "p", "--realm", "r", "--client", "c", "--optional", "a", "b",
        ])
        .unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::SyncScopes { realm, optional, names, remote, .. } => {
                assert_eq!(realm, "r");
                assert!(optional);
                assert_eq!(names, vec!["a", "b"]);
                assert_eq!(remote.user, "admin");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn statefulset_table_needs_pinned_image() {
        let desired = json!({ "kind": "StatefulSet" });
        assert!(table_for(TableKind::Statefulset, &desired, None, None).is_err());
        let t = table_for(TableKind::Statefulset, &desired, Some("repo:7.0.1".into()), None).unwrap();
        assert_eq!(t.kind, "StatefulSet");
        assert_eq!(table_for(TableKind::Generic, &json!({ "kind": "Service" }), None, None).unwrap().kind, "Service");
    }

    #[tokio::test]
    async fn signal_cancels_the_token() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let cancel = cancel_when(async move { rx.await.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)) });
        assert!(!cancel.is_cancelled());
        tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), cancel.cancelled()).await.unwrap();

        let failed = cancel_when(async { Err(std::io::Error::new(std::io::ErrorKind::Other, "no handler")) });
        tokio::task::yield_now().await;
        assert!(!failed.is_cancelled());
    }

    #[test]
    fn pass_file_picks_tables_per_kind() {
        let file: PassFile = serde_yaml::from_str(
            r#"
owner: { apiVersion: keycloak.org/v1alpha1, kind: Keycloak, namespace: sso, name: example }
pinnedImage: repo:7.0.1
objects:
  - { apiVersion: apps/v1, kind: StatefulSet, metadata: { name: keycloak, namespace: sso } }
  - { apiVersion: v1, kind: ConfigMap, metadata: { name: probes, namespace: sso } }
scopes:
  - { realm: r, clientId: c, names: [a] }
"#,
        )
        .unwrap();
        let input = file.into_input();
        assert_eq!(input.objects[0].table.kind, "StatefulSet");
        assert_eq!(input.objects[1].table.kind, "ConfigMap");
        assert_eq!(input.scopes[0].assoc, ScopeAssociation::Default);
        assert_eq!(input.owner.map(|o| o.name), Some("example".to_string()));
    }
}
