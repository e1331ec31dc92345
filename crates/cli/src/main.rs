use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_core::{ManagedResource, ObjectRef, PollSettings, ResourceKind, Verb, WriteOptions};
use keel_patch::MergeKeys;
use keel_reconcile::{
    create_or_patch, delete_cascading, replicas_ready, try_update, wait_until_ready, CancellationToken, Dependents,
    PatchOptions, WaitOptions,
};
use keel_secret::{ensure_managed_secret, user_password, SecretRequest};
use keel_store::{KubeStore, ResourceStore};
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Converge Kubernetes objects toward a declared state")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true, env = "KEEL_NAMESPACE")]
    namespace: Option<String>,

    /// Ask the server to validate writes without persisting them
    #[arg(long = "dry-run", global = true, action = ArgAction::SetTrue)]
    dry_run: bool,

    /// Field manager recorded on writes
    #[arg(long = "field-manager", global = true, env = "KEEL_FIELD_MANAGER", default_value = "keelctl")]
    field_manager: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
    Yaml,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set or remove labels on an object, sending only what changes
    ApplyLabels {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        name: String,
        /// key=value to set (repeatable)
        #[arg(short = 'l', long = "label", value_parser = parse_label)]
        set: Vec<(String, String)>,
        /// Label key to remove (repeatable)
        #[arg(long = "remove")]
        remove: Vec<String>,
        /// Replace the whole object under optimistic concurrency instead of patching
        #[arg(long = "replace", action = ArgAction::SetTrue)]
        replace: bool,
    },
    /// Wait until status.readyReplicas equals spec.replicas
    WaitReady {
        gvk: String,
        name: String,
        #[arg(long = "timeout-secs")]
        timeout_secs: Option<u64>,
        /// Stop on the first failed fetch instead of treating it as not ready
        #[arg(long = "fail-fast", action = ArgAction::SetTrue)]
        fail_fast: bool,
    },
    /// Foreground-delete an object and wait for its dependents to terminate
    Delete {
        gvk: String,
        name: String,
        /// GVK key of the dependents to wait for
        #[arg(long = "dependents", default_value = "v1/Pod")]
        dependents: String,
        /// Where the target keeps the selector picking its dependents
        #[arg(long = "selector-path", default_value = "spec.selector")]
        selector_path: String,
        #[arg(long = "timeout-secs")]
        timeout_secs: Option<u64>,
    },
    /// Provision a credential secret for an owner and link it on the owner's spec
    EnsureSecret {
        /// Owner GVK key
        gvk: String,
        /// Owner name
        name: String,
        /// Secret is named <owner>-<suffix>
        #[arg(long = "suffix", default_value = "auth")]
        suffix: String,
        /// Username stored next to the generated password
        #[arg(long = "user", default_value = "admin")]
        user: String,
        /// Owner field receiving {"secretName": ...}
        #[arg(long = "field", default_value = "spec.authSecret")]
        field: String,
    },
}

#[derive(Debug, Default, Serialize)]
struct Report {
    object: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    verb: Option<Verb>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ready_replicas: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret: Option<String>,
    dry_run: bool,
}

impl Report {
    fn new(target: &ObjectRef, dry_run: bool) -> Self {
        Self { object: target.to_string(), dry_run, ..Default::default() }
    }

    fn with_object(mut self, obj: &ManagedResource) -> Self {
        self.resource_version = obj.resource_version().map(str::to_string);
        self
    }
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

/// Listener address for the exporter; `Ok(None)` keeps metrics in-process only.
fn metrics_listener(raw: Option<&str>) -> Result<Option<SocketAddr>, String> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(addr) => addr.parse().map(Some).map_err(|_| format!("invalid KEEL_METRICS_ADDR {addr:?}; expected host:port")),
    }
}

fn init_metrics() {
    let raw = std::env::var("KEEL_METRICS_ADDR").ok();
    match metrics_listener(raw.as_deref()) {
        Ok(Some(sock)) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(_) => info!(addr = %sock, "serving metrics"),
            Err(e) => warn!(error = %e, "metrics exporter not installed"),
        },
        Ok(None) => debug!("KEEL_METRICS_ADDR unset; metrics exporter disabled"),
        Err(e) => warn!("{e}"),
    }
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got {:?}", raw)),
    }
}

fn merge_keys_for(kind: &ResourceKind) -> MergeKeys {
    match kind.kind.as_str() {
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" => MergeKeys::workload(),
        _ => MergeKeys::new(),
    }
}

fn relabel(set: &[(String, String)], remove: &[String], mut obj: ManagedResource) -> ManagedResource {
    for key in remove {
        obj.metadata.labels.remove(key);
    }
    for (k, v) in set {
        obj.metadata.labels.insert(k.clone(), v.clone());
    }
    obj
}

fn emit(output: Output, report: &Report) -> Result<()> {
    match output {
        Output::Human => {
            let mut line = report.object.clone();
            if let Some(verb) = report.verb {
                line.push_str(&format!(" {}", verb));
            }
            if let Some(ready) = report.ready_replicas {
                line.push_str(&format!(" ready ({} replicas)", ready));
            }
            if let Some(secret) = &report.secret {
                line.push_str(&format!(" -> secret {}", secret));
            }
            if report.dry_run {
                line.push_str(" (dry run)");
            }
            println!("{}", line);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(report)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let settings = PollSettings::from_env();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; cancelling");
                cancel.cancel();
            }
        }
    });

    let store = KubeStore::try_default().await.context("connecting to cluster")?;
    let namespace = cli.namespace.clone().unwrap_or_else(|| store.default_namespace().to_string());
    let target_of = |gvk: &str, name: &str| -> Result<ObjectRef> {
        let kind = ResourceKind::from_str(gvk).with_context(|| format!("parsing gvk {:?}", gvk))?;
        Ok(ObjectRef::new(kind, Some(&namespace), name))
    };
    let write = WriteOptions { dry_run: cli.dry_run, field_manager: Some(cli.field_manager.clone()) };

    let report = match &cli.command {
        Commands::ApplyLabels { gvk, name, set, remove, replace } => {
            let target = target_of(gvk, name)?;
            info!(object = %target, set = set.len(), remove = remove.len(), replace, "apply-labels invoked");
            if *replace {
                let out = try_update(&store, &target, |o| relabel(set, remove, o), &write, &settings.retry, &cancel).await?;
                Report { verb: Some(Verb::Updated), ..Report::new(&target, cli.dry_run).with_object(&out) }
            } else {
                let opts = PatchOptions {
                    dry_run: cli.dry_run,
                    field_manager: Some(cli.field_manager.clone()),
                    merge_keys: merge_keys_for(&target.kind),
                };
                let (out, verb) = create_or_patch(&store, &target, |o| relabel(set, remove, o), &opts).await?;
                Report { verb: Some(verb), ..Report::new(&target, cli.dry_run).with_object(&out) }
            }
        }
        Commands::WaitReady { gvk, name, timeout_secs, fail_fast } => {
            let target = target_of(gvk, name)?;
            let mut policy = settings.readiness;
            if let Some(secs) = timeout_secs {
                policy.timeout = Duration::from_secs(*secs);
            }
            let mut opts = WaitOptions::new(policy);
            if *fail_fast {
                opts = opts.fail_fast();
            }
            info!(object = %target, timeout = ?policy.timeout, "wait-ready invoked");
            let out = wait_until_ready(&store, &target, replicas_ready, &opts, &cancel).await?;
            let ready = out.field("status.readyReplicas").and_then(Json::as_i64).unwrap_or(0);
            Report { ready_replicas: Some(ready), ..Report::new(&target, false).with_object(&out) }
        }
        Commands::Delete { gvk, name, dependents, selector_path, timeout_secs } => {
            let target = target_of(gvk, name)?;
            let dep_kind = ResourceKind::from_str(dependents).with_context(|| format!("parsing gvk {:?}", dependents))?;
            let mut policy = settings.gc;
            if let Some(secs) = timeout_secs {
                policy.timeout = Duration::from_secs(*secs);
            }
            if cli.dry_run {
                warn!("delete ignores --dry-run");
            }
            info!(object = %target, dependents = %dep_kind, "delete invoked");
            let verb = delete_cascading(
                &store,
                &target,
                &Dependents::new(dep_kind, selector_path),
                &WaitOptions::new(policy),
                &cancel,
            )
            .await?;
            Report { verb: Some(verb), ..Report::new(&target, false) }
        }
        Commands::EnsureSecret { gvk, name, suffix, user, field } => {
            let owner_ref = target_of(gvk, name)?;
            let owner = store.get(&owner_ref).await.with_context(|| format!("fetching {}", owner_ref))?;
            let request = SecretRequest::for_owner(&owner_ref, suffix).with_reference_field(field);
            let opts = PatchOptions { dry_run: cli.dry_run, field_manager: Some(cli.field_manager.clone()), ..Default::default() };
            info!(owner = %owner_ref, secret = %request.name, "ensure-secret invoked");
            let reference = ensure_managed_secret(&store, &owner, &request, user_password(user), &opts).await?;
            Report { secret: Some(reference.secret_name), ..Report::new(&owner_ref, cli.dry_run) }
        }
    };
    emit(cli.output, &report)
}
