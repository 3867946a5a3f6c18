//! Casino Cashier Server
//!
//! A headless payment-and-wallet service: cryptocurrency deposit
//! invoices reconciled against per-user fiat ledgers, with an exchange
//! rate cache and a health endpoint for the hosting platform. The chat
//! bot embeds `cashier_core::facade::Cashier` against the same store
//! and hands its orphan-recovery sender to this process's reconciler.

mod server;
mod shutdown;
mod state;

use cashier_core::events::orphan_invoice_channel;
use cashier_core::health::HealthState;
use cashier_core::processors::{RateRefresher, Reconciler, ReconcilerConfig};
use cashier_core::provider::PayProvider;
use cashier_core::rates::RateCache;
use cashier_cryptopay::CryptoPayClient;
use clap::Parser;
use server::{build_router, run_server};
use shutdown::shutdown_signal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Casino Cashier - crypto deposit and wallet service
#[derive(Parser, Debug)]
#[command(name = "cashier-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Crypto Pay API token
    #[arg(long, env = "CRYPTOBOT_API_TOKEN", hide_env_values = true)]
    cryptobot_api_token: String,

    /// Health server port
    #[arg(long, env = "PORT", default_value_t = 10000)]
    port: u16,

    /// Seconds between reconciliation ticks
    #[arg(long, env = "RECONCILE_INTERVAL_SECONDS", default_value_t = 20)]
    reconcile_interval_seconds: u64,

    /// Seconds between exchange-rate refreshes
    #[arg(long, env = "RATE_REFRESH_INTERVAL_SECONDS", default_value_t = 30)]
    rate_refresh_interval_seconds: u64,

    /// Path to the persistent store
    #[arg(long, env = "LEDGER_PATH", default_value = "./cashier.db")]
    ledger_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();
    tracing::info!("Starting cashier-server v{}", env!("CARGO_PKG_VERSION"));

    let client = CryptoPayClient::new(&args.cryptobot_api_token).map_err(|e| {
        tracing::error!(error = %e, "failed to construct the provider client");
        anyhow::anyhow!(e)
    })?;
    let provider: Arc<dyn PayProvider> = Arc::new(client);

    // Open the store.
    tracing::info!("Opening ledger store at {:?}", args.ledger_path);
    let connect_options = SqliteConnectOptions::new()
        .filename(&args.ledger_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(connect_options)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to open the ledger store");
            anyhow::anyhow!(e)
        })?;
    sqlx::migrate!("../migrations").run(&pool).await.map_err(|e| {
        tracing::error!(error = %e, "failed to run store migrations");
        anyhow::anyhow!(e)
    })?;
    tracing::info!("Store ready");

    // Best-effort identity check: a bad token shows up here rather than
    // on the first invoice.
    match provider.get_me().await {
        Ok(app) => tracing::info!(
            app_id = app.app_id,
            name = %app.name,
            bot = %app.payment_processing_bot_username,
            "provider identity verified"
        ),
        Err(e) => tracing::warn!(
            error = %e,
            "provider identity check failed, continuing without it"
        ),
    }

    let health = HealthState::new();
    let rates = RateCache::new(provider.clone());
    match rates.refresh().await {
        Ok(updated) => {
            health.record_rate_refresh();
            tracing::info!(updated, "initial exchange rates loaded");
        }
        Err(e) => tracing::warn!(error = %e, "initial rate refresh failed"),
    }

    // The sender half belongs to the embedding chat layer's `Cashier`;
    // it stays open here so the channel outlives early bot restarts.
    let (_orphan_tx, orphan_rx) = orphan_invoice_channel();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let refresher = RateRefresher::new(
        rates.clone(),
        health.clone(),
        Duration::from_secs(args.rate_refresh_interval_seconds),
    );
    let refresher_handle = tokio::spawn(refresher.run(shutdown_rx.clone()));

    let reconciler = Reconciler::new(
        pool.clone(),
        provider.clone(),
        rates.clone(),
        health.clone(),
        orphan_rx,
        ReconcilerConfig {
            interval: Duration::from_secs(args.reconcile_interval_seconds),
            ..ReconcilerConfig::default()
        },
    );
    let mut reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx.clone()));

    let state = AppState {
        db: pool.clone(),
        health: health.clone(),
        rates: rates.clone(),
        reconcile_interval_secs: args.reconcile_interval_seconds as i64,
    };
    let router = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let server_shutdown = Arc::new(Notify::new());
    let server_handle = tokio::spawn(run_server(router, addr, server_shutdown.clone()));

    // Wait for a shutdown signal, or for the reconciler to abort on the
    // fatal ledger invariant violation.
    let mut early_exit = None;
    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut reconciler_handle => {
            early_exit = Some(result);
        }
    }

    // Shutdown order: cancel the refresher outright, let the in-flight
    // reconciliation tick finish, then stop the health server.
    let _ = shutdown_tx.send(true);
    refresher_handle.abort();
    let reconciler_result = match early_exit {
        Some(result) => result,
        None => reconciler_handle.await,
    };
    let fatal = match reconciler_result {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "reconciler aborted");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "reconciler task failed");
            false
        }
    };

    server_shutdown.notify_one();
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "health server error"),
        Err(e) => tracing::error!(error = %e, "health server task failed"),
    }

    tracing::info!("Closing store connections...");
    pool.close().await;

    if fatal {
        tracing::error!("exiting: ledger invariant violated");
        std::process::exit(2);
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
