//! The exchange-rate cache.
//!
//! Maps each asset to its latest USD rate. Reads past the soft
//! staleness window trigger a lazy refresh behind a single-flight
//! guard; readers that lose the race serve the previous value. Rates
//! past the hard ceiling are never served.

use crate::money::{self, Asset, CryptoAmount, FiatAmount};
use crate::provider::PayProvider;
use cashier_cryptopay::CryptoPayError;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Reads older than this trigger a refresh before answering.
pub const SOFT_STALENESS: Duration = Duration::from_secs(60);
/// Rates older than this are never served.
pub const HARD_STALENESS: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum RateError {
    /// No sufficiently fresh rate for the asset. Retryable after the
    /// next successful refresh.
    #[error("no fresh exchange rate for {asset}")]
    Unavailable { asset: Asset },

    #[error("provider error: {0}")]
    Provider(#[from] CryptoPayError),

    /// The conversion left the representable range.
    #[error("conversion out of range for {asset}")]
    Conversion { asset: Asset },
}

#[derive(Debug, Clone, Copy)]
struct CachedRate {
    usd_per_unit: Decimal,
    observed_at: Instant,
    observed_unix: i64,
}

/// A crypto quote and the observation time of the rate that priced it.
#[derive(Debug, Clone, Copy)]
pub struct CryptoQuote {
    pub crypto: CryptoAmount,
    pub rate_observed_at: i64,
}

#[derive(Clone)]
pub struct RateCache {
    inner: Arc<RateCacheInner>,
}

struct RateCacheInner {
    provider: Arc<dyn PayProvider>,
    rates: RwLock<HashMap<Asset, CachedRate>>,
    refresh_guard: Mutex<()>,
    soft_staleness: Duration,
    hard_staleness: Duration,
}

impl RateCache {
    pub fn new(provider: Arc<dyn PayProvider>) -> Self {
        Self::with_staleness(provider, SOFT_STALENESS, HARD_STALENESS)
    }

    pub fn with_staleness(
        provider: Arc<dyn PayProvider>,
        soft_staleness: Duration,
        hard_staleness: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RateCacheInner {
                provider,
                rates: RwLock::new(HashMap::new()),
                refresh_guard: Mutex::new(()),
                soft_staleness,
                hard_staleness,
            }),
        }
    }

    /// Refetch all rates from the provider.
    ///
    /// Returns the number of assets updated. Failures leave previously
    /// cached values in place.
    pub async fn refresh(&self) -> Result<usize, RateError> {
        let _guard = self.inner.refresh_guard.lock().await;
        self.refresh_locked().await
    }

    /// Convert fiat into crypto at the current rate, rounding the crypto
    /// amount up so the payer never underpays.
    pub async fn quote_crypto_for_fiat(
        &self,
        asset: Asset,
        fiat: FiatAmount,
    ) -> Result<CryptoQuote, RateError> {
        let rate = self.fresh_rate(asset).await?;
        let crypto = money::crypto_for_fiat(asset, fiat, rate.usd_per_unit)
            .ok_or(RateError::Conversion { asset })?;
        Ok(CryptoQuote {
            crypto,
            rate_observed_at: rate.observed_unix,
        })
    }

    /// Convert crypto into fiat at the current rate, rounding down to the
    /// cent so the house never over-credits.
    pub async fn quote_fiat_for_crypto(&self, crypto: CryptoAmount) -> Result<FiatAmount, RateError> {
        let asset = crypto.asset();
        let rate = self.fresh_rate(asset).await?;
        money::fiat_for_crypto(crypto, rate.usd_per_unit).ok_or(RateError::Conversion { asset })
    }

    /// True if any asset has a rate younger than the hard ceiling.
    pub async fn has_fresh_rate(&self) -> bool {
        let rates = self.inner.rates.read().await;
        rates
            .values()
            .any(|r| r.observed_at.elapsed() <= self.inner.hard_staleness)
    }

    async fn fresh_rate(&self, asset: Asset) -> Result<CachedRate, RateError> {
        let cached = self.read_rate(asset).await;
        match cached {
            Some(rate) if rate.observed_at.elapsed() <= self.inner.soft_staleness => {
                return Ok(rate);
            }
            Some(_) => {
                // Soft-stale: refresh unless one is already in flight, in
                // which case the previous value is served below.
                if let Ok(_guard) = self.inner.refresh_guard.try_lock() {
                    if let Err(e) = self.refresh_locked().await {
                        warn!(asset = %asset, error = %e, "lazy rate refresh failed");
                    }
                }
            }
            None => {
                // Nothing to serve: wait for the in-flight refresh (or do
                // one ourselves) before giving up.
                let _guard = self.inner.refresh_guard.lock().await;
                if self.read_rate(asset).await.is_none() {
                    if let Err(e) = self.refresh_locked().await {
                        warn!(asset = %asset, error = %e, "rate refresh failed");
                    }
                }
            }
        }

        let rate = self
            .read_rate(asset)
            .await
            .ok_or(RateError::Unavailable { asset })?;
        if rate.observed_at.elapsed() > self.inner.hard_staleness {
            return Err(RateError::Unavailable { asset });
        }
        Ok(rate)
    }

    async fn read_rate(&self, asset: Asset) -> Option<CachedRate> {
        self.inner.rates.read().await.get(&asset).copied()
    }

    async fn refresh_locked(&self) -> Result<usize, RateError> {
        let items = self.inner.provider.get_exchange_rates().await?;
        let observed_at = Instant::now();
        let observed_unix = time::OffsetDateTime::now_utc().unix_timestamp();

        let mut updated = 0;
        let mut rates = self.inner.rates.write().await;
        for asset in Asset::ALL {
            let Some(item) = items.iter().find(|i| i.is_usd_rate_for(asset.as_str())) else {
                continue;
            };
            match item.parsed_rate() {
                Some(rate) if rate > Decimal::ZERO => {
                    rates.insert(
                        asset,
                        CachedRate {
                            usd_per_unit: rate,
                            observed_at,
                            observed_unix,
                        },
                    );
                    updated += 1;
                }
                _ => {
                    warn!(asset = %asset, raw = %item.rate, "ignoring malformed exchange rate");
                }
            }
        }
        debug!(updated, "exchange rates refreshed");
        Ok(updated)
    }
}
