use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use ingressor_controller::{Controller, ControllerConfig, Reconciler};
use ingressor_core::{ResourceKey, DEFAULT_ENABLE_ANNOTATION};
use ingressor_kubehub::{wait_for_cache_sync, Informer, KubeIngressStore};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ingressor", version, about = "Keeps an Ingress for every annotated Service")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch
    #[arg(long = "ns", env = "INGRESSOR_NAMESPACE", global = true, default_value = "default")]
    namespace: String,

    /// Watch all namespaces (overrides --ns)
    #[arg(short = 'A', long = "all-namespaces", global = true, action = ArgAction::SetTrue)]
    all_namespaces: bool,

    /// Service annotation whose presence requests an Ingress
    #[arg(long = "annotation", env = "INGRESSOR_ANNOTATION", global = true, default_value = DEFAULT_ENABLE_ANNOTATION)]
    annotation: String,

    /// Seconds to wait for the initial list of Services and Ingresses
    #[arg(long = "sync-timeout", env = "INGRESSOR_SYNC_TIMEOUT_SECS", global = true, default_value_t = 60)]
    sync_timeout: u64,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until interrupted (default)
    Run,
    /// Print what the controller would do for each cached Service, without changing anything
    Plan,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Concurrent workers
    #[arg(long = "workers", env = "INGRESSOR_WORKERS", global = true, default_value_t = ControllerConfig::default().workers)]
    workers: usize,

    /// Retries of a failing key before it is dropped
    #[arg(long = "max-retries", env = "INGRESSOR_MAX_RETRIES", global = true, default_value_t = ControllerConfig::default().max_retries)]
    max_retries: u32,

    /// Reset backoff after every scheduled retry (flat backoff, never drops)
    #[arg(long = "forget-on-retry", global = true, action = ArgAction::SetTrue)]
    forget_on_retry: bool,
}

fn init_tracing() {
    let env = std::env::var("INGRESSOR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("INGRESSOR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid INGRESSOR_METRICS_ADDR; expected host:port");
        }
    }
}

struct Informers {
    services: Informer<Service>,
    ingresses: Informer<Ingress>,
}

fn informers(client: &Client, cli: &Cli) -> Informers {
    if cli.all_namespaces {
        Informers { services: Informer::new(Api::all(client.clone())), ingresses: Informer::new(Api::all(client.clone())) }
    } else {
        Informers {
            services: Informer::new(Api::namespaced(client.clone(), &cli.namespace)),
            ingresses: Informer::new(Api::namespaced(client.clone(), &cli.namespace)),
        }
    }
}

/// Start both informers and wait for their first list. Returns the tasks so
/// the caller can stop them.
async fn start(inf: Informers, timeout: Duration) -> Result<Vec<tokio::task::JoinHandle<()>>> {
    let Informers { services, ingresses } = inf;
    let synced = vec![services.synced(), ingresses.synced()];
    let tasks = vec![tokio::spawn(services.run()), tokio::spawn(ingresses.run())];
    wait_for_cache_sync(synced, timeout).await?;
    info!("caches synced");
    Ok(tasks)
}

async fn run(cli: &Cli, client: Client) -> Result<()> {
    let args = &cli.run;
    let mut inf = informers(&client, cli);
    let config = ControllerConfig {
        workers: args.workers,
        max_retries: args.max_retries,
        annotation: cli.annotation.clone(),
        forget_on_retry: args.forget_on_retry,
    };
    let controller = Controller::new(
        Arc::new(KubeIngressStore::new(client)),
        Arc::new(inf.services.lister()),
        Arc::new(inf.ingresses.lister()),
        config,
    );
    inf.services.add_handler(controller.dispatcher());
    inf.ingresses.add_handler(controller.dispatcher());

    let tasks = start(inf, Duration::from_secs(cli.sync_timeout)).await?;
    controller
        .run(async {
            match signal::ctrl_c().await {
                Ok(()) => info!("interrupt received"),
                Err(e) => error!(error = %e, "listening for ctrl-c failed; stopping"),
            }
        })
        .await;
    for t in tasks {
        t.abort();
    }
    Ok(())
}

async fn plan(cli: &Cli, client: Client) -> Result<()> {
    let inf = informers(&client, cli);
    let services = inf.services.lister();
    let reconciler = Reconciler::new(
        Arc::new(inf.services.lister()),
        Arc::new(inf.ingresses.lister()),
        Arc::new(KubeIngressStore::new(client)),
        cli.annotation.clone(),
    );
    let tasks = start(inf, Duration::from_secs(cli.sync_timeout)).await?;

    let mut keys: Vec<ResourceKey> = services.list().iter().filter_map(|s| ResourceKey::for_resource(s.as_ref()).ok()).collect();
    keys.sort();
    let mut rows = Vec::with_capacity(keys.len());
    for key in keys {
        let action = reconciler.plan(&key).with_context(|| format!("planning {}", key))?;
        rows.push((key, action.as_str()));
    }

    match cli.output {
        Output::Human => {
            println!("{:<20} {:<30} ACTION", "NAMESPACE", "NAME");
            for (key, action) in &rows {
                println!("{:<20} {:<30} {}", key.namespace(), key.name(), action);
            }
        }
        Output::Json => {
            let items: Vec<_> = rows
                .iter()
                .map(|(key, action)| serde_json::json!({ "key": key, "action": action }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
    }
    for t in tasks {
        t.abort();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let scope = if cli.all_namespaces { "<all>".to_string() } else { cli.namespace.clone() };
    info!(namespace = %scope, annotation = %cli.annotation, "ingressor starting");

    let client = ingressor_kubehub::connect().await?;
    match cli.command.as_ref().unwrap_or(&Commands::Run) {
        Commands::Run => run(&cli, client).await,
        Commands::Plan => plan(&cli, client).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_apply_without_subcommand() {
        let cli = Cli::try_parse_from(["ingressor", "--workers", "3", "--max-retries", "1"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.run.workers, 3);
        assert_eq!(cli.run.max_retries, 1);

        let cli = Cli::try_parse_from(["ingressor", "run", "--workers", "7", "--forget-on-retry"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Run)));
        assert_eq!(cli.run.workers, 7);
        assert!(cli.run.forget_on_retry);
    }

    #[test]
    fn run_env_applies_without_subcommand() {
        std::env::set_var("INGRESSOR_WORKERS", "9");
        std::env::set_var("INGRESSOR_MAX_RETRIES", "2");
        let bare = Cli::try_parse_from(["ingressor"]).unwrap();
        let explicit = Cli::try_parse_from(["ingressor", "run"]).unwrap();
        std::env::remove_var("INGRESSOR_WORKERS");
        std::env::remove_var("INGRESSOR_MAX_RETRIES");

        for cli in [bare, explicit] {
            assert_eq!(cli.run.workers, 9);
            assert_eq!(cli.run.max_retries, 2);
        }
    }
}
