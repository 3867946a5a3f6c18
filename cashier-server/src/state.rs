//! Application state shared across all request handlers.

use cashier_core::health::HealthState;
use cashier_core::rates::RateCache;
use sqlx::SqlitePool;

/// Shared state behind the health endpoints.
///
/// Cloneable and cheap to pass around (everything is behind Arc).
#[derive(Clone)]
pub struct AppState {
    /// Store connection pool.
    pub db: SqlitePool,
    /// Liveness signals written by the background processors.
    pub health: HealthState,
    /// Exchange-rate cache (read for freshness only).
    pub rates: RateCache,
    /// Configured reconciliation interval, for the 2x liveness bound.
    pub reconcile_interval_secs: i64,
}
