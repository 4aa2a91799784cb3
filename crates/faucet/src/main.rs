//! Faucet service binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use spigot_common::utils::config::load_layered;
use spigot_common::utils::logging::init_logging;
use spigot_faucet::api::{router, AppState};
use spigot_faucet::{
    ChainClient, ChainSubmitter, DisbursementEngine, FaucetConfig, FaucetMetrics, FundingAccount,
    JsonRpcChainClient, QuotaLedger, QuotaSettings, Reconciler, SubmitterSettings,
};
use spigot_storage::{DurableStore, StoreConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

/// Faucet service CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, env = "FAUCET_CONFIG")]
    config: Option<PathBuf>,

    /// Server address
    #[arg(long)]
    server_addr: Option<String>,

    /// RPC URL
    #[arg(long)]
    rpc_url: Option<String>,

    /// Private key (hex)
    #[arg(long)]
    private_key: Option<String>,

    /// File holding the private key
    #[arg(long)]
    private_key_file: Option<PathBuf>,

    /// Database directory
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Amount per request, in whole currency units
    #[arg(long)]
    transfer_amount: Option<u64>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service (default)
    Serve,
    /// Print ledger statistics from the database, read-only
    ///
    /// The database admits one process at a time, so stop the service first.
    Stats {
        /// Also list this many recent reservations
        #[arg(long, default_value_t = 10)]
        recent: usize,
    },
    /// Print the funding account address
    Address,
}

impl Args {
    fn apply(&self, config: &mut FaucetConfig) {
        if let Some(addr) = &self.server_addr {
            config.server_addr = addr.clone();
        }
        if let Some(rpc_url) = &self.rpc_url {
            config.rpc_url = rpc_url.clone();
        }
        if let Some(key) = &self.private_key {
            config.private_key = Some(key.clone());
        }
        if let Some(path) = &self.private_key_file {
            config.private_key_file = Some(path.clone());
        }
        if let Some(path) = &self.db_path {
            config.db.path = path.clone();
        }
        if let Some(amount) = self.transfer_amount {
            config.transfer_amount = amount;
        }
        if self.debug {
            config.logging.level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config: FaucetConfig =
        load_layered(&FaucetConfig::default(), args.config.as_ref(), "FAUCET")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let _log_guard = init_logging(&config.logging)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Stats { recent } => print_stats(config, recent),
        Command::Address => {
            let account = FundingAccount::from_hex(&config.private_key_material()?)?;
            println!("{}", account.address());
            Ok(())
        }
    }
}

async fn serve(config: FaucetConfig) -> anyhow::Result<()> {
    info!("Starting Spigot Faucet v{}", env!("CARGO_PKG_VERSION"));

    let limits = QuotaSettings::from_config(&config)?;
    let account = FundingAccount::from_hex(&config.private_key_material()?)?;

    info!("Configuration:");
    info!("  Server address: {}", config.server_addr);
    info!("  RPC URL: {}", config.rpc_url);
    info!(
        "  Transfer amount: {} (limits: {} per address, {} total)",
        config.transfer_amount, config.address_transfer_limit, config.total_transfer_limit
    );
    info!("  Database: {:?}", config.db.path);

    let store = Arc::new(
        DurableStore::open(config.db.clone())
            .with_context(|| format!("Failed to open database at {:?}", config.db.path))?,
    );
    let ledger = Arc::new(QuotaLedger::open(store.clone(), limits)?);

    let client: Arc<dyn ChainClient> =
        Arc::new(JsonRpcChainClient::new(config.rpc_url.clone(), config.rpc_timeout())?);
    let submitter = Arc::new(
        ChainSubmitter::connect(client, account, SubmitterSettings::from_config(&config))
            .await
            .with_context(|| format!("Failed to reach node at {}", config.rpc_url))?,
    );

    let metrics = Arc::new(
        FaucetMetrics::new()
            .map_err(|e| anyhow::anyhow!("Failed to create metrics registry: {}", e))?,
    );
    metrics.set_global_total(ledger.global_total()?, config.decimals);

    let reconciler = Arc::new(
        Reconciler::new(ledger.clone(), submitter.clone(), metrics.clone())
            .with_stalled_after(config.stalled_submission_after()),
    );
    let report = reconciler.recover().await?;
    if report.still_pending > 0 {
        warn!(
            "{} reservations remain unresolved and will be retried every {:?}",
            report.still_pending,
            config.reconcile_interval()
        );
    }
    let reconcile_task = reconciler.spawn(config.reconcile_interval());

    let engine = Arc::new(DisbursementEngine::new(
        ledger,
        submitter,
        metrics,
        config.submit_retry.clone(),
        config.decimals,
    ));
    let app = router(
        AppState {
            engine,
            metrics_enabled: config.metrics_enabled,
        },
        &config.allowed_origins,
    );

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
    reconcile_task.abort();
    store.flush()?;
    Ok(())
}

fn print_stats(config: FaucetConfig, recent: usize) -> anyhow::Result<()> {
    let limits = QuotaSettings::from_config(&config)?;
    let store = DurableStore::open(StoreConfig {
        read_only: true,
        ..config.db.clone()
    })
    .with_context(|| {
        format!(
            "Failed to open database at {:?} (is the faucet service still running?)",
            config.db.path
        )
    })?;
    let ledger = QuotaLedger::open(Arc::new(store), limits)?;

    let stats = ledger.statistics()?;
    println!("Global total:     {} / {}", stats.global_total, limits.total_limit);
    println!("Unique addresses: {}", stats.unique_addresses);
    println!("Committed:        {}", stats.committed);
    println!("Released:         {}", stats.released);
    println!("Unsettled:        {}", stats.unsettled);

    for record in ledger.recent(recent)? {
        println!(
            "#{:<6} {} {} {:<10} {}",
            record.id,
            record.datetime().to_rfc3339(),
            record.address,
            record.status.name(),
            record.amount
        );
    }
    Ok(())
}

/// Graceful shutdown signal
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
