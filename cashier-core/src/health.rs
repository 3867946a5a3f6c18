//! Shared liveness signals.
//!
//! Written by the long-running processors, read by the health server.
//! Cloning shares the underlying state.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Clone)]
pub struct HealthState {
    inner: Arc<HealthInner>,
}

struct HealthInner {
    started_at_unix: i64,
    last_reconcile_tick_unix: AtomicI64,
    last_rate_refresh_unix: AtomicI64,
}

impl HealthState {
    /// Create the shared state. Both liveness marks start at "now" so a
    /// freshly-started process reports healthy until the first real
    /// signals arrive.
    pub fn new() -> Self {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        Self {
            inner: Arc::new(HealthInner {
                started_at_unix: now,
                last_reconcile_tick_unix: AtomicI64::new(now),
                last_rate_refresh_unix: AtomicI64::new(now),
            }),
        }
    }

    pub fn record_reconcile_tick(&self) {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.inner
            .last_reconcile_tick_unix
            .store(now, Ordering::Relaxed);
    }

    pub fn record_rate_refresh(&self) {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.inner
            .last_rate_refresh_unix
            .store(now, Ordering::Relaxed);
    }

    /// Seconds since the last reconciliation tick (or process start).
    pub fn reconcile_tick_age(&self, now: i64) -> i64 {
        (now - self.inner.last_reconcile_tick_unix.load(Ordering::Relaxed)).max(0)
    }

    /// Seconds since the last successful rate refresh (or process start).
    pub fn rate_refresh_age(&self, now: i64) -> i64 {
        (now - self.inner.last_rate_refresh_unix.load(Ordering::Relaxed)).max(0)
    }

    pub fn uptime(&self, now: i64) -> i64 {
        (now - self.inner.started_at_unix).max(0)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ages_are_measured_from_the_recorded_marks() {
        let health = HealthState::new();
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        assert!(health.reconcile_tick_age(now) <= 1);

        health.record_reconcile_tick();
        health.record_rate_refresh();
        assert!(health.reconcile_tick_age(now + 30) >= 29);
        assert!(health.rate_refresh_age(now + 30) >= 29);
        assert!(health.uptime(now + 30) >= 29);
    }

    #[test]
    fn clones_share_state() {
        let health = HealthState::new();
        let clone = health.clone();
        clone.record_reconcile_tick();
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        assert!(health.reconcile_tick_age(now) <= 1);
    }
}
