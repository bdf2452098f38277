use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::config::{KubeConfigOptions, Kubeconfig};
use logharbor_cache::{RedisSharedCache, SharedCache};
use logharbor_k8s::inventory::{AppKind, AppRef, ResourceInventory};
use logharbor_k8s::kube_inventory::KubeResourceInventory;
use logharbor_k8s::log_source::KubeLogSource;
use logharbor_streams::{AppStreamPool, LogHub};
use logharbor_types::{HubConfig, LogEntry, Resume, ServerEvent, SubscribeOptions};
use tokio_util::sync::CancellationToken;

mod config;
use config::GatewayConfig;

/// A multi-tenant log streaming gateway for Kubernetes-like clusters.
#[derive(Parser, Debug)]
#[command(name = "logharbor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Kubeconfig context to use (defaults to the kubeconfig's current context)
    #[arg(long, global = true)]
    context: Option<String>,

    /// Shared cache URL (e.g. redis://127.0.0.1/) enabling cross-replica coordination
    #[arg(long, global = true)]
    shared_cache_url: Option<String>,

    /// Cluster name embedded in shared-cache keys
    #[arg(long, global = true)]
    cluster_name: Option<String>,

    /// Ignore the .logharbor config file in the current directory
    #[arg(long, global = true)]
    no_config: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a .logharbor configuration file in the current directory
    Init,
    /// Tail a single pod's logs through the streaming fabric
    Tail {
        namespace: String,
        pod: String,
        #[arg(long)]
        container: Option<String>,
        #[arg(long, default_value_t = 100)]
        tail: i64,
    },
    /// Tail every pod backing a deployment or stateful set, merged with markers
    TailApp {
        namespace: String,
        app: String,
        #[arg(long, value_enum, default_value = "deployment")]
        kind: AppKindArg,
        #[arg(long)]
        container: Option<String>,
        #[arg(long, default_value_t = 100)]
        tail: i64,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum AppKindArg {
    Deployment,
    StatefulSet,
}

impl From<AppKindArg> for AppKind {
    fn from(kind: AppKindArg) -> Self {
        match kind {
            AppKindArg::Deployment => AppKind::Deployment,
            AppKindArg::StatefulSet => AppKind::StatefulSet,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .with_writer(std::io::stderr)
        .init();

    if let Some(Commands::Init) = cli.command {
        return config::write_default();
    }

    let file_config = if cli.no_config { None } else { GatewayConfig::load() };
    let context = cli.context.or_else(|| file_config.as_ref().and_then(|c| c.context.clone()));
    let shared_cache_url = cli.shared_cache_url.or_else(|| file_config.as_ref().and_then(|c| c.shared_cache_url.clone()));
    let cluster_name = cli.cluster_name.or_else(|| file_config.as_ref().and_then(|c| c.cluster_name.clone()));

    let mut hub_config = file_config.map(|c| c.hub).unwrap_or_default();
    if let Some(cluster_name) = cluster_name {
        hub_config.shared_cache.cluster_name = cluster_name;
    }
    if shared_cache_url.is_some() {
        hub_config.shared_cache.enabled = true;
    }

    let kube_client = build_kube_client(context.as_deref()).await?;
    let upstream = Arc::new(KubeLogSource::new(kube_client.clone()));
    let inventory: Arc<dyn ResourceInventory> = Arc::new(KubeResourceInventory::new(kube_client));

    let cache: Option<Arc<dyn SharedCache>> = match &shared_cache_url {
        Some(url) => Some(Arc::new(RedisSharedCache::connect(url).await.context("connecting to shared cache")?)),
        None => None,
    };

    let hub = Arc::new(LogHub::new(hub_config, cache, upstream));
    let shared_config: Arc<HubConfig> = Arc::new(hub.config().clone());

    let result = match cli.command {
        Some(Commands::Tail { namespace, pod, container, tail }) => run_tail(hub.clone(), namespace, pod, container, tail).await,
        Some(Commands::TailApp { namespace, app, kind, container, tail }) => {
            let pool = AppStreamPool::new(shared_config, hub.clone(), inventory);
            run_tail_app(pool, namespace, app, kind.into(), container, tail).await
        }
        Some(Commands::Init) => unreachable!("handled above"),
        None => {
            eprintln!("no subcommand given; try `logharbor tail <namespace> <pod>`");
            Ok(())
        }
    };

    hub.stop().await;

    if let Err(e) = &result {
        eprintln!("Error: {e:#}");
    }
    result
}

async fn build_kube_client(context: Option<&str>) -> Result<kube::Client> {
    let kubeconfig = Kubeconfig::read().context("reading kubeconfig; is a cluster context configured?")?;
    let options = KubeConfigOptions { context: context.map(|c| c.to_string()), ..Default::default() };
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options).await.context("resolving kubeconfig context")?;
    kube::Client::try_from(config).context("building Kubernetes client")
}

async fn run_tail(hub: Arc<LogHub>, namespace: String, pod: String, container: Option<String>, tail: i64) -> Result<()> {
    // No ctrl_c wiring: the CLI relies on process exit to tear down the
    // subscription, so this token never actually gets cancelled.
    let (_sub, mut rx, replay, _detach) = hub
        .subscribe_pod(&namespace, &pod, container.as_deref().unwrap_or(""), tail, Resume::default(), CancellationToken::new())
        .await;
    for entry in &replay {
        print_entry(entry);
    }
    while let Some(event) = rx.recv().await {
        print_event(&event);
    }
    Ok(())
}

async fn run_tail_app(pool: Arc<AppStreamPool>, namespace: String, app: String, kind: AppKind, container: Option<String>, tail: i64) -> Result<()> {
    let app_ref = AppRef { kind, name: app };
    let options = SubscribeOptions { container: container.unwrap_or_default(), tail, resume: Resume::default() };
    let (_sub, mut rx, _detach) =
        pool.subscribe(&namespace, app_ref, Some(options), CancellationToken::new()).await.map_err(anyhow::Error::new)?;
    while let Some(event) = rx.recv().await {
        print_event(&event);
    }
    Ok(())
}

fn print_entry(entry: &LogEntry) {
    print_event(&ServerEvent::from_entry(entry));
}

fn print_event(event: &ServerEvent) {
    match serde_json::to_string(event) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
    }
}
