use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use arbor_core::{ManifestDeployer, RepoCoordinates};
use arbor_lifecycle::{
    CreateRequest, JournalEntry, Lifecycle, LifecycleOutcome, LifecycleSettings, UpdateRequest, DEFAULT_BASE_PATH,
    DEFAULT_BRANCH,
};
use arbor_persist::{Journal, SqliteJournal};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "arborctl", version, about = "Arbor cluster lifecycle CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace holding root descriptors (default: $ARBOR_ARGOCD_NS or "argocd")
    #[arg(long = "argocd-ns", global = true)]
    argocd_ns: Option<String>,

    /// Namespace holding cluster specs, profiles and bundles
    #[arg(long = "arbor-ns", env = "ARBOR_NS", global = true, default_value = "arbor")]
    arbor_ns: String,

    /// Management cluster URL (default: current kube context)
    #[arg(long = "management-url", env = "ARBOR_MANAGEMENT_URL", global = true)]
    management_url: Option<String>,

    /// Write manifest trees into this local checkout instead of cloning and pushing
    #[arg(long = "local-tree", env = "ARBOR_LOCAL_TREE", global = true)]
    local_tree: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Cluster descriptor lifecycle
    #[command(subcommand)]
    Cluster(ClusterCmd),
}

#[derive(Subcommand, Debug)]
enum ClusterCmd {
    /// Deploy a new cluster: write its manifest tree and register its root descriptor
    Deploy {
        #[arg(long = "cluster-name")]
        cluster_name: String,
        #[arg(long = "repo-url")]
        repo_url: String,
        #[arg(long = "repo-branch", default_value = DEFAULT_BRANCH)]
        repo_branch: String,
        /// Base path; the cluster directory is created under it
        #[arg(long = "repo-path", default_value = DEFAULT_BASE_PATH)]
        repo_path: String,
        #[arg(long = "cluster-spec")]
        cluster_spec: Option<String>,
        #[arg(long = "profile")]
        profile: Option<String>,
        /// Print the root descriptor YAML instead of registering it
        #[arg(long = "output-yaml", action = ArgAction::SetTrue)]
        output_yaml: bool,
    },
    /// Update an existing cluster's profile; provider, repo and path stay fixed
    Update {
        cluster_name: String,
        #[arg(long = "cluster-spec")]
        cluster_spec: Option<String>,
        #[arg(long = "profile")]
        profile: Option<String>,
        #[arg(long = "output-yaml", action = ArgAction::SetTrue)]
        output_yaml: bool,
    },
    /// Register the descriptor of an operation that stopped after its tree deploy
    Resume { cluster_name: String },
    /// Show journaled operations, newest first
    History {
        cluster_name: String,
        #[arg(long = "limit", default_value_t = 10)]
        limit: usize,
    },
}

fn init_tracing() {
    let env = std::env::var("ARBOR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ARBOR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ARBOR_METRICS_ADDR; expected host:port");
        }
    }
}

fn journal_disabled() -> bool {
    matches!(std::env::var("ARBOR_DISABLE_JOURNAL").ok().as_deref(), Some("1") | Some("true") | Some("yes"))
}

fn open_journal() -> Option<Arc<dyn Journal>> {
    if journal_disabled() {
        return None;
    }
    match SqliteJournal::open_default() {
        Ok(j) => Some(Arc::new(j)),
        Err(e) => {
            warn!(error = %e, "journal unavailable; continuing without operation history");
            None
        }
    }
}

async fn build_lifecycle(cli: &Cli) -> Result<Lifecycle> {
    let endpoint = match &cli.management_url {
        Some(u) => u.clone(),
        None => arbor_kubehub::management_endpoint().await.context("inferring management cluster url")?,
    };
    let mut settings = LifecycleSettings::from_env(endpoint);
    if let Some(ns) = &cli.argocd_ns {
        settings.engine_namespace = ns.clone();
    }
    let deployer: Arc<dyn ManifestDeployer> = match &cli.local_tree {
        Some(root) => Arc::new(arbor_tree::DirDeployer::new(root.clone())),
        None => Arc::new(arbor_tree::GitDeployer::from_env()),
    };
    let store = Arc::new(arbor_kubehub::KubeConfigStore::new(cli.arbor_ns.clone()));
    let engine = Arc::new(arbor_kubehub::KubeEngine::new());
    info!(engine_ns = %settings.engine_namespace, arbor_ns = %cli.arbor_ns, endpoint = %settings.management_endpoint, "lifecycle configured");
    let lc = Lifecycle::new(store, deployer, engine, settings);
    Ok(match open_journal() {
        Some(j) => lc.with_journal(j),
        None => lc,
    })
}

fn print_outcome(output: Output, out: &LifecycleOutcome, output_yaml: bool) -> Result<()> {
    if output_yaml {
        print!("{}", out.descriptor.to_yaml()?);
        return Ok(());
    }
    match output {
        Output::Human => {
            let change = out
                .tree_change
                .as_ref()
                .map(|c| match &c.commit {
                    Some(id) => format!("{} written, {} removed, commit {}", c.written, c.removed, id),
                    None => format!("{} written, {} removed, no commit", c.written, c.removed),
                })
                .unwrap_or_else(|| "not deployed in this run".to_string());
            println!("cluster:    {}", out.descriptor.name);
            println!("operation:  {}", out.operation_id);
            println!("tree:       {}", change);
            println!("registered: {}", out.engine_registered);
            println!("source:     {} @ {} : {}", out.descriptor.repo_url, out.descriptor.branch, out.descriptor.path);
        }
        Output::Json => {
            let v = serde_json::json!({
                "operationId": out.operation_id.to_string(),
                "treeDeployed": out.tree_deployed,
                "engineRegistered": out.engine_registered,
                "treeChange": out.tree_change,
                "descriptor": out.descriptor.to_application(),
            });
            println!("{}", serde_json::to_string_pretty(&v)?);
        }
    }
    Ok(())
}

fn print_history(output: Output, entries: &[JournalEntry]) -> Result<()> {
    match output {
        Output::Human => {
            for e in entries {
                let op = uuid::Uuid::from_bytes(e.op_id);
                match &e.detail {
                    Some(d) => println!("{}  {}  {:<7} {:<17} {}", e.ts, op, e.kind, e.stage.as_str(), d),
                    None => println!("{}  {}  {:<7} {}", e.ts, op, e.kind, e.stage.as_str()),
                }
            }
        }
        Output::Json => {
            let rows: Vec<_> = entries
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "operationId": uuid::Uuid::from_bytes(e.op_id).to_string(),
                        "kind": e.kind,
                        "stage": e.stage.as_str(),
                        "ts": e.ts,
                        "detail": e.detail,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let Commands::Cluster(cmd) = &cli.command;
    match cmd {
        ClusterCmd::Deploy { cluster_name, repo_url, repo_branch, repo_path, cluster_spec, profile, output_yaml } => {
            let lc = build_lifecycle(&cli).await?;
            let req = CreateRequest {
                cluster_name: cluster_name.clone(),
                repo: RepoCoordinates::new(repo_url.clone(), repo_branch.clone(), repo_path.clone()),
                cluster_spec: cluster_spec.clone(),
                profile: profile.clone(),
                register: !output_yaml,
            };
            let out = lc.create(req).await?;
            print_outcome(cli.output, &out, *output_yaml)
        }
        ClusterCmd::Update { cluster_name, cluster_spec, profile, output_yaml } => {
            let lc = build_lifecycle(&cli).await?;
            let req = UpdateRequest {
                cluster_name: cluster_name.clone(),
                cluster_spec: cluster_spec.clone(),
                profile: profile.clone(),
                register: !output_yaml,
            };
            let out = lc.update_by_name(req).await?;
            print_outcome(cli.output, &out, *output_yaml)
        }
        ClusterCmd::Resume { cluster_name } => {
            let lc = build_lifecycle(&cli).await?;
            let out = lc.resume(cluster_name).await?;
            print_outcome(cli.output, &out, false)
        }
        ClusterCmd::History { cluster_name, limit } => {
            // Local journal only; no cluster access needed.
            let journal = open_journal().context("operation journal is disabled or unavailable")?;
            let entries = journal.history(cluster_name, *limit)?;
            print_history(cli.output, &entries)
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!(error = %format!("{:#}", e), "command failed");
        std::process::exit(1);
    }
}
