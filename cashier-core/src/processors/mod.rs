//! Long-running background tasks.
//!
//! - `Reconciler`: discovers newly paid invoices at the provider,
//!   credits the ledger, and expires stale invoices.
//! - `RateRefresher`: keeps the exchange-rate cache warm.
//!
//! Both run until the shared shutdown watch flips to `true`.

pub mod rate_refresher;
pub mod reconciler;

pub use rate_refresher::RateRefresher;
pub use reconciler::{ReconcileError, Reconciler, ReconcilerConfig};
