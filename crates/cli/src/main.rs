use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_api::{ControlPlane, NodeStatus, ReconcileOutcome, Settings};
use keel_core::ResourceBundle;
use keel_revision::{MemoryBackend, RevisionBackend};
use keel_xds::{serve_tcp, DiscoveryServer};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel xDS control plane")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Where revisions and desired state live
    #[arg(long = "backend", value_enum, global = true, env = "KEEL_BACKEND", default_value_t = BackendKind::Sqlite)]
    backend: BackendKind,

    /// Kubernetes namespace for the kube backend (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// SQLite database path for the sqlite backend
    #[arg(long = "db", global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum BackendKind { Kube, Sqlite, Memory }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the discovery server and the reconcile loop until ctrl-c
    Serve {
        /// Listen address for discovery streams (overrides KEEL_LISTEN_ADDR)
        #[arg(long = "listen")]
        listen: Option<SocketAddr>,
    },
    /// Set the desired bundle of a node from a JSON or YAML file and reconcile it
    Publish {
        node: String,
        /// Bundle file: `{ "<type>": { "<name>": <payload> } }`; `.yaml`/`.yml` parsed as YAML
        file: PathBuf,
    },
    /// Show a node's revision history, oldest first
    History { node: String },
    /// Show a node's desired/published versions and what is served
    Status { node: String },
    /// Mark a revision as bad (or clear the mark) and reconcile the node
    Taint {
        node: String,
        version: String,
        /// Clear the taint instead of setting it
        #[arg(long = "clear", action = ArgAction::SetTrue)]
        clear: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        }
    } else {
        warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
    }
}

/// Backend plus, for the kube backend, the client and namespace the watchers need.
struct Opened {
    backend: Arc<dyn RevisionBackend>,
    kube: Option<(kube::Client, String)>,
}

async fn open_backend(kind: BackendKind, settings: &Settings) -> Result<Opened> {
    match kind {
        BackendKind::Kube => {
            let client = kube::Client::try_default().await.context("connecting to kubernetes")?;
            let ns = settings.namespace.clone().unwrap_or_else(|| client.default_namespace().to_string());
            let backend = keel_kubehub::KubeBackend::new(client.clone(), &ns);
            info!(ns = %ns, "backend: kube");
            Ok(Opened { backend: Arc::new(backend), kube: Some((client, ns)) })
        }
        BackendKind::Sqlite => {
            let backend = match settings.db_path.as_deref() {
                Some(p) => keel_persist::SqliteBackend::open(p)?,
                None => keel_persist::SqliteBackend::open_default()?,
            };
            Ok(Opened { backend: Arc::new(backend), kube: None })
        }
        BackendKind::Memory => {
            warn!("backend: memory; nothing survives this process");
            Ok(Opened { backend: Arc::new(MemoryBackend::new()), kube: None })
        }
    }
}

fn read_bundle(path: &Path) -> Result<ResourceBundle> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"));
    let bundle = if yaml {
        serde_yaml::from_str(&raw).with_context(|| format!("parsing YAML bundle {}", path.display()))?
    } else {
        serde_json::from_str(&raw).with_context(|| format!("parsing JSON bundle {}", path.display()))?
    };
    Ok(bundle)
}

fn print_outcome(output: Output, o: &ReconcileOutcome) -> Result<()> {
    match output {
        Output::Human => println!(
            "{} desired={} published={} state={:?}{}",
            o.node_id,
            o.desired_version,
            o.published_version,
            o.cache_state,
            if o.snapshot_replaced { " (snapshot replaced)" } else { "" }
        ),
        Output::Json => println!("{}", serde_json::to_string_pretty(o)?),
    }
    Ok(())
}

fn print_status(st: &NodeStatus) {
    println!("node:       {}", st.node_id);
    println!("desired:    {}", st.desired_version.as_deref().unwrap_or("-"));
    println!("published:  {}", st.published_version.as_deref().unwrap_or("-"));
    println!("state:      {:?}", st.cache_state);
    println!("history:    {}", st.history.join(" "));
    if st.served.is_empty() {
        println!("served:     nothing in this process");
    }
    for (rt, s) in st.served.iter() {
        println!(
            "  {:<18} {:<18} items={:<4} subscribers={:<3} failing={:.0}%",
            rt.as_str(),
            s.version,
            s.items,
            s.subscribers,
            s.percent_failing * 100.0
        );
    }
}

async fn serve(cp: Arc<ControlPlane>, settings: &Settings, kube: Option<(kube::Client, String)>) -> Result<()> {
    let server = Arc::new(DiscoveryServer::new(cp.cache().clone(), cp.feedback().clone(), settings.server_config()));
    let listener = TcpListener::bind(settings.listen_addr)
        .await
        .with_context(|| format!("binding {}", settings.listen_addr))?;
    info!(addr = %settings.listen_addr, wire = ?settings.wire, history_cap = settings.history_cap, "keel: serving discovery");

    let failed = cp.resync_all().await?;
    if failed > 0 {
        warn!(failed, "keel: some nodes failed their initial reconcile");
    }

    let (cfg_tx, cfg_rx) = mpsc::channel(settings.queue_cap);
    let (live_tx, live_rx) = mpsc::channel(settings.queue_cap);
    let gc = keel_feedback::spawn_gc(cp.feedback().clone(), live_rx);
    let mut watchers = Vec::new();
    if let Some((client, ns)) = kube {
        let (c, n, tx) = (client.clone(), ns.clone(), cfg_tx.clone());
        watchers.push(tokio::spawn(async move {
            if let Err(e) = keel_kubehub::start_watcher(c, Some(n.as_str()), tx).await {
                error!(error = ?e, "config watcher failed");
            }
        }));
        let tx = live_tx.clone();
        watchers.push(tokio::spawn(async move {
            if let Err(e) = keel_kubehub::watch_pods(client, Some(ns.as_str()), tx).await {
                error!(error = ?e, "pod watcher failed");
            }
        }));
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let reconciler = tokio::spawn(cp.clone().drive(cfg_rx, settings.resync, stop_rx));
    let mut serving = tokio::spawn(serve_tcp(server.clone(), listener, settings.shutdown_grace));

    let early = tokio::select! {
        r = signal::ctrl_c() => {
            if let Err(e) = r {
                warn!(error = %e, "waiting for ctrl-c failed; shutting down");
            }
            info!("keel: shutdown requested");
            None
        }
        r = &mut serving => Some(r),
    };
    server.shutdown();
    stop_tx.send_replace(true);
    let served = match early {
        Some(r) => r,
        None => serving.await,
    };
    for w in watchers {
        w.abort();
    }
    drop(cfg_tx);
    drop(live_tx);
    if let Err(e) = reconciler.await {
        warn!(error = %e, "reconcile task ended abnormally");
    }
    let _ = gc.await;
    served.context("discovery server task")??;
    info!("keel: stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    if let Some(ns) = cli.namespace.clone() {
        settings.namespace = Some(ns);
    }
    if let Some(db) = cli.db_path.clone() {
        settings.db_path = Some(db);
    }
    init_metrics(settings.metrics_addr.as_deref());

    let Opened { backend, kube } = open_backend(cli.backend, &settings).await?;
    let cp = Arc::new(ControlPlane::new(backend, &settings));

    match cli.command {
        Commands::Serve { listen } => {
            if let Some(addr) = listen {
                settings.listen_addr = addr;
            }
            serve(cp, &settings, kube).await?;
        }
        Commands::Publish { node, file } => {
            let bundle = read_bundle(&file)?;
            info!(node = %node, resources = bundle.len(), "publish invoked");
            let outcome = cp.publish(&node, bundle).await?;
            print_outcome(cli.output, &outcome)?;
        }
        Commands::History { node } => {
            let items = cp.history(&node).await?;
            match cli.output {
                Output::Human => {
                    for h in items.iter() {
                        let mut marks = Vec::new();
                        if h.published {
                            marks.push("published");
                        }
                        if h.tainted {
                            marks.push("tainted");
                        }
                        println!("{}  {}  resources={}  {}", h.version, h.revision_ref, h.resources, marks.join(","));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
        Commands::Status { node } => {
            // A one-shot process has an empty cache; reconcile first so `served` reflects the store.
            if let Err(e) = cp.reconcile_node(&node).await {
                warn!(node = %node, error = %e, "status: reconcile failed");
            }
            let st = cp.status(&node).await?;
            match cli.output {
                Output::Human => print_status(&st),
                Output::Json => println!("{}", serde_json::to_string_pretty(&st)?),
            }
        }
        Commands::Taint { node, version, clear } => {
            let outcome = cp.taint(&node, &version, !clear).await?;
            print_outcome(cli.output, &outcome)?;
        }
    }
    Ok(())
}
