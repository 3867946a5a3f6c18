//! Background exchange-rate refresher.

use crate::health::HealthState;
use crate::rates::RateCache;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Periodically refetches all exchange rates.
///
/// Failures are logged and never evict cached values; the cache's hard
/// staleness ceiling is the only thing that retires a rate.
pub struct RateRefresher {
    rates: RateCache,
    health: HealthState,
    interval: Duration,
}

impl RateRefresher {
    pub fn new(rates: RateCache, health: HealthState, interval: Duration) -> Self {
        Self {
            rates,
            health,
            interval,
        }
    }

    /// Run until shutdown is signaled. Cancellation-safe at every await
    /// point; the task is aborted outright on shutdown.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "RateRefresher started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("RateRefresher received shutdown signal");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    match self.rates.refresh().await {
                        Ok(updated) => {
                            self.health.record_rate_refresh();
                            debug!(updated, "scheduled rate refresh complete");
                        }
                        Err(e) => {
                            warn!(error = %e, "scheduled rate refresh failed");
                        }
                    }
                }
            }
        }

        info!("RateRefresher shutdown complete");
    }
}
