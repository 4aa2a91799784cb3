//! Health service binary

use anyhow::Context;
use clap::Parser;
use spigot_common::utils::config::load_layered;
use spigot_common::utils::logging::init_logging;
use spigot_health::api::{router, AppState};
use spigot_health::{Detector, DetectorSettings, HealthConfig, JsonRpcProbe};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

/// Node health service CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, env = "HEALTH_CONFIG")]
    config: Option<PathBuf>,

    /// Server address
    #[arg(long)]
    server_addr: Option<String>,

    /// RPC URL of the node to watch
    #[arg(long)]
    rpc_url: Option<String>,

    /// Seconds between polls
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn apply(&self, config: &mut HealthConfig) {
        if let Some(addr) = &self.server_addr {
            config.server_addr = addr.clone();
        }
        if let Some(rpc_url) = &self.rpc_url {
            config.rpc_url = rpc_url.clone();
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval_secs = secs;
        }
        if self.debug {
            config.logging.level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config: HealthConfig =
        load_layered(&HealthConfig::default(), args.config.as_ref(), "HEALTH")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let _log_guard = init_logging(&config.logging)?;

    info!("Starting Spigot Health v{}", env!("CARGO_PKG_VERSION"));
    info!("  Node: {}", config.rpc_url);
    info!(
        "  Poll interval: {:?}, staleness: {:?}",
        config.poll_interval(),
        config.staleness()
    );

    let probe = JsonRpcProbe::new(config.rpc_url.clone(), config.rpc_timeout())
        .context("Failed to build RPC client")?;
    let detector = Arc::new(Detector::new(
        Arc::new(probe),
        DetectorSettings::from_config(&config),
    ));
    let poll_task = detector.clone().spawn();

    let app = router(AppState { detector });

    let addr: SocketAddr = config
        .server_addr
        .parse()
        .with_context(|| format!("Invalid server address {}", config.server_addr))?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down gracefully");
    poll_task.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
