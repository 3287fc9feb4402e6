//! digest-watch
//!
//! Watches the images behind this host's containers, reports drift to the
//! configured webhooks and optionally restarts containers on fresh images.

use anyhow::{Context, Result};
use clap::Parser;
use drift_engine::{
    AppConfig, BatchStore, ComposeCli, ConfigError, DigestWatcher, DockerClient, RegistryClient,
    WebhookNotifier,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

// ==================== CLI ====================

#[derive(Parser, Debug)]
#[command(name = "digest-watch")]
#[command(about = "Container image drift detection and remediation")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "DIGEST_WATCH_CONFIG", default_value = "./config.json")]
    config: PathBuf,

    /// Directory holding the persisted notification batch
    #[arg(short, long, env = "DIGEST_WATCH_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Status server bind address, overrides the configured one
    #[arg(long, env = "DIGEST_WATCH_STATUS_ADDR")]
    status_addr: Option<SocketAddr>,

    /// Docker endpoint (unix:// socket or tcp:// URL)
    #[arg(long, env = "DOCKER_HOST")]
    docker_host: Option<String>,

    /// Run one check, print a summary and exit
    #[arg(long)]
    once: bool,
}

// ==================== Main ====================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,drift_engine=debug".into()),
        )
        .init();

    let args = Args::parse();
    info!("Starting digest-watch");

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(ConfigError::NotFound(path)) => {
            warn!("Config {} not found, using defaults", path);
            AppConfig::default()
        }
        Err(e) => return Err(e).context("invalid configuration"),
    };

    std::fs::create_dir_all(&args.data_dir)?;
    let store = BatchStore::new(args.data_dir.join("outdated.txt"));

    // Collaborators
    let docker = DockerClient::connect(
        args.docker_host.as_deref(),
        config.remediation.stop_timeout_secs,
    )
    .await
    .context("cannot connect to docker")?;
    let registry = RegistryClient::new(&config.registry)?;
    let notifier = WebhookNotifier::new(&config.notifications)?;
    let compose = ComposeCli::detect().await;

    let watcher = DigestWatcher::with_parts(
        Arc::new(docker),
        Arc::new(registry),
        Arc::new(notifier),
        Arc::new(compose),
        store,
        &config,
    );
    info!("Node: {}", watcher.node_name().await);
    info!("Schedule: {}", watcher.schedule().describe());

    if args.once {
        let summary = watcher.run_check().await;
        println!(
            "tracked={} resolved={} outdated={} notified={}",
            summary.tracked,
            summary.resolved,
            summary.outdated,
            summary.notified.len()
        );
        return Ok(());
    }

    if config.startup_message {
        watcher.send_startup_message().await;
    }

    // Status server
    if config.status.enabled {
        let addr = match args.status_addr {
            Some(addr) => addr,
            None => config
                .status
                .bind
                .parse()
                .with_context(|| format!("invalid status bind address '{}'", config.status.bind))?,
        };
        let snapshot = watcher.snapshot();
        tokio::spawn(async move {
            if let Err(e) = status_server::serve(addr, snapshot).await {
                error!("Status server error: {}", e);
            }
        });
        info!("Status server: http://{}", addr);
    }

    // Initial check so the status view is populated before the first slot
    watcher.run_check().await;
    watcher.run_forever().await;

    info!("Stopped");
    Ok(())
}
