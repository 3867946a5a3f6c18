//! Axum server setup and the health endpoints.

use crate::state::AppState;
use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use cashier_core::entities::InvoiceStatus;
use cashier_core::entities::invoices::CountInvoicesByStatus;
use cashier_core::entities::ledger::CountLedgerEntries;
use cashier_core::framework::DatabaseProcessor;
use kanau::processor::Processor;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ping", get(ping))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the server until `shutdown` is notified.
pub async fn run_server(
    router: Router,
    addr: SocketAddr,
    shutdown: Arc<Notify>,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Health server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await
}

#[derive(Serialize)]
pub struct SubsystemStatus {
    healthy: bool,
    detail: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    reconciler: SubsystemStatus,
    rates: SubsystemStatus,
    ledger: SubsystemStatus,
}

/// `GET /health` – 200 only if every subsystem is live.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();

    let tick_age = state.health.reconcile_tick_age(now);
    let reconciler_ok = tick_age <= 2 * state.reconcile_interval_secs;

    let rates_ok = state.rates.has_fresh_rate().await;

    let ledger_ok = sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .is_ok();

    let healthy = reconciler_ok && rates_ok && ledger_ok;
    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        version: env!("CARGO_PKG_VERSION"),
        reconciler: SubsystemStatus {
            healthy: reconciler_ok,
            detail: format!("last tick {tick_age}s ago"),
        },
        rates: SubsystemStatus {
            healthy: rates_ok,
            detail: if rates_ok {
                "fresh rate cached".to_string()
            } else {
                "no rate younger than the staleness ceiling".to_string()
            },
        },
        ledger: SubsystemStatus {
            healthy: ledger_ok,
            detail: if ledger_ok {
                "reachable".to_string()
            } else {
                "store unreachable".to_string()
            },
        },
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// `GET /ping` – liveness of the process itself, nothing more.
async fn ping() -> &'static str {
    "pong"
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pending_invoices: i64,
    ledger_entries: i64,
    last_rate_refresh_age_seconds: i64,
    last_reconcile_tick_age_seconds: i64,
    uptime_seconds: i64,
}

/// `GET /metrics` – small JSON snapshot for the operator.
async fn metrics(State(state): State<AppState>) -> Result<Json<MetricsResponse>, StatusCode> {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let processor = DatabaseProcessor {
        pool: state.db.clone(),
    };

    let pending_invoices = processor
        .process(CountInvoicesByStatus {
            status: InvoiceStatus::Pending,
        })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to count pending invoices");
            StatusCode::SERVICE_UNAVAILABLE
        })?;
    let ledger_entries = processor.process(CountLedgerEntries).await.map_err(|e| {
        tracing::error!(error = %e, "failed to count ledger entries");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(Json(MetricsResponse {
        pending_invoices,
        ledger_entries,
        last_rate_refresh_age_seconds: state.health.rate_refresh_age(now),
        last_reconcile_tick_age_seconds: state.health.reconcile_tick_age(now),
        uptime_seconds: state.health.uptime(now),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashier_core::health::HealthState;
    use cashier_core::provider::PayProvider;
    use cashier_core::rates::RateCache;
    use cashier_cryptopay::CryptoPayClient;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_state() -> AppState {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("../migrations").run(&pool).await.unwrap();

        // The client is never called by the handlers under test; the
        // cache is only read for freshness.
        let provider: std::sync::Arc<dyn PayProvider> =
            std::sync::Arc::new(CryptoPayClient::new("test-token").unwrap());
        AppState {
            db: pool,
            health: HealthState::new(),
            rates: RateCache::new(provider),
            reconcile_interval_secs: 20,
        }
    }

    #[tokio::test]
    async fn ping_always_answers() {
        assert_eq!(ping().await, "pong");
    }

    #[tokio::test]
    async fn health_degrades_without_rates() {
        let state = test_state().await;
        let (code, Json(body)) = health_check(State(state)).await;
        // Reconciler and ledger are fine, but the rate cache is empty.
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "unhealthy");
        assert!(body.reconciler.healthy);
        assert!(body.ledger.healthy);
        assert!(!body.rates.healthy);
    }

    #[tokio::test]
    async fn metrics_snapshot_an_empty_store() {
        let state = test_state().await;
        let Json(body) = metrics(State(state)).await.unwrap();
        assert_eq!(body.pending_invoices, 0);
        assert_eq!(body.ledger_entries, 0);
        assert!(body.last_reconcile_tick_age_seconds <= 1);
    }
}
