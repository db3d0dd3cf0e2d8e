use std::sync::Arc;

use anyhow::{anyhow, Result};
use bollard::Docker;
use tokio::sync::mpsc;
use tracing::{info, warn};

use ofelia_rs::cli::{Cli, Command, RunArgs};
use ofelia_rs::config::GlobalConfig;
use ofelia_rs::discovery::Discovery;
use ofelia_rs::health::HealthMonitor;
use ofelia_rs::reconciler::{Reconciler, ReconcilerConfig};
use ofelia_rs::scheduler::Scheduler;
use ofelia_rs::shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    init_tracing(&args.log_level);

    let docker = Arc::new(docker_client(&args.docker_host)?);
    docker
        .ping()
        .await
        .map_err(|e| anyhow!("docker engine unreachable: {e}"))?;

    if args.config.is_none() {
        warn!("no --config supplied; jobs will only be discovered from container labels");
    }

    let scheduler = Scheduler::with_default_max_runtime(
        docker.clone(),
        args.shutdown_timeout,
        args.max_runtime,
    );
    scheduler.start();

    let health = Arc::new(HealthMonitor::new(docker.clone(), scheduler.clone()));

    let discovery = Discovery::new(docker.clone(), args.poll_interval, args.no_poll);
    let discovery_cancel = scheduler.root_cancellation().child_token();

    let reconciler = Arc::new(Reconciler::new(
        scheduler.clone(),
        discovery.clone(),
        ReconcilerConfig {
            ini_glob: args.config.clone(),
            label_prefix: args.label_prefix.clone(),
            allow_host_jobs_from_labels: args.allow_host_jobs_from_labels,
        },
        GlobalConfig::default(),
        Some(health.clone()),
    ));

    // Initial boot reconcile: INI first, then whatever labels are already
    // present (spec.md §4.7 "runs on initial boot (INI then labels)").
    reconciler.trigger().await;

    let (tx, mut rx) = mpsc::channel(8);
    let watch_handle = discovery.watch(tx, discovery_cancel.clone());
    let ini_watch_handle = reconciler.clone().watch_ini_files(args.poll_interval, discovery_cancel.clone());

    let reconcile_loop = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                reconciler.trigger().await;
            }
        })
    };

    info!(jobs = scheduler.jobs().await.len(), "ofelia-rs running");

    let shutdown = ShutdownManager::new(scheduler.clone(), discovery_cancel, args.shutdown_timeout);
    shutdown.wait_for_signal().await?;

    reconcile_loop.abort();
    ini_watch_handle.abort();
    let _ = watch_handle.await;

    Ok(())
}

fn docker_client(docker_host: &str) -> Result<Docker> {
    if let Some(path) = docker_host.strip_prefix("unix://") {
        return Ok(Docker::connect_with_unix(path, 60, bollard::API_DEFAULT_VERSION)?);
    }
    if docker_host.starts_with("tcp://") {
        // Let bollard read TLS env vars (DOCKER_TLS_VERIFY, DOCKER_CERT_PATH):
        return Ok(Docker::connect_with_local_defaults()?);
    }
    Err(anyhow!("unsupported DOCKER_HOST: {docker_host}"))
}

fn init_tracing(level: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
