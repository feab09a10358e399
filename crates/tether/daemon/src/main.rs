//! Tether Daemon - in-cluster delivery agent
//!
//! The daemon:
//! - Holds a persistent channel to the control plane and reconnects with backoff
//! - Applies pushed desired state in weight order through kubectl
//! - Polls informers and reports debounced app status upstream

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tether_channel::WebSocketConnector;
use tether_daemon::{
    AgentConfig, Collaborators, ControlLoop, DaemonError, DaemonResult, UpstreamClient,
};
use tether_deployment::KubectlApplier;
use tether_health::KubeClusterReader;
use tether_task::InMemoryTaskStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tether Daemon CLI
#[derive(Parser)]
#[command(name = "tetherd")]
#[command(about = "Tether - in-cluster delivery agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TETHER_CONFIG")]
    config: Option<String>,

    /// Control-plane endpoint, overrides the configured one
    #[arg(short, long, env = "TETHER_ENDPOINT")]
    endpoint: Option<String>,

    /// Log level, overrides the configured one
    #[arg(long, env = "TETHER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "TETHER_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = AgentConfig::load(cli.config.as_deref())
        .map_err(|e| DaemonError::Config(e.to_string()))?;
    if let Some(endpoint) = cli.endpoint {
        config.upstream.endpoint = endpoint;
    }

    // Initialize tracing
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    config.validate().map_err(DaemonError::Config)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %config.upstream.endpoint,
        "Starting tetherd"
    );

    // Cluster access
    let kube_config = kube::Config::infer()
        .await
        .map_err(|e| DaemonError::Cluster(e.to_string()))?;
    let client = kube::Client::try_from(kube_config.clone())
        .map_err(|e| DaemonError::Cluster(e.to_string()))?;
    let applier = KubectlApplier::from_kube_config(&kube_config)?
        .with_binary(&config.apply.kubectl)
        .with_timeout(Duration::from_secs(config.apply.tool_timeout_secs));

    let upstream = UpstreamClient::new(
        &config.upstream.endpoint,
        &config.upstream.token,
        Duration::from_secs(config.upstream.request_timeout_secs),
    )?;

    let control_loop = ControlLoop::new(
        &config,
        Collaborators {
            connector: Arc::new(WebSocketConnector),
            applier: Arc::new(applier),
            reader: Arc::new(KubeClusterReader::new(client)),
            task_store: Arc::new(InMemoryTaskStore::new()),
            upstream: Some(upstream),
        },
    )?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    control_loop.run(shutdown).await?;
    tracing::info!("tetherd stopped");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
