//! The reconciliation loop.
//!
//! Each tick adopts orphaned invoices, intersects the provider's paid
//! invoices with the local pending set, credits the ledger exactly once
//! per paid invoice, and expires invoices past their deadline. The
//! registry's monotonic state machine plus the ledger's idempotency
//! keys make every tick safe to replay: a crashed or duplicated tick
//! never double-credits.

use crate::entities::ledger::{LedgerEntry, LedgerError};
use crate::entities::invoices::{
    InvoiceRecord, ListPendingInvoices, NewInvoice, RegistryError,
};
use crate::entities::LedgerReason;
use crate::events::OrphanInvoiceReceiver;
use crate::framework::DatabaseProcessor;
use crate::health::HealthState;
use crate::money::{Asset, CryptoAmount};
use crate::provider::PayProvider;
use crate::rates::{RateCache, RateError};
use cashier_cryptopay::CryptoPayError;
use cashier_cryptopay::objects::{GetInvoicesRequest, InvoiceDto, WireInvoiceStatus};
use itertools::Itertools;
use kanau::processor::Processor;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// Invoices younger than this are not yet asked about; the provider
    /// needs a moment before a fresh invoice can possibly be paid.
    pub min_pending_age: Duration,
    /// How long past `expires_at` an invoice is still watched, so a
    /// payment the provider reports late is not expired prematurely.
    pub expiry_grace: Duration,
    /// Page size for the provider's paid-invoice walk.
    pub page_size: u32,
    /// Upper bound on pages per tick.
    pub max_pages: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            min_pending_age: Duration::from_secs(30),
            expiry_grace: Duration::from_secs(300),
            page_size: 100,
            max_pages: 10,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("provider error: {0}")]
    Provider(#[from] CryptoPayError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ReconcileError {
    /// Only the ledger invariant violation takes the process down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReconcileError::Ledger(LedgerError::InvariantViolated { .. })
        )
    }
}

/// What one tick accomplished.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickReport {
    pub adopted: u32,
    pub credited: u32,
    pub expired: u32,
    pub cancelled: u32,
}

impl TickReport {
    fn is_quiet(&self) -> bool {
        self.adopted == 0 && self.credited == 0 && self.expired == 0 && self.cancelled == 0
    }
}

enum Settlement {
    Credited,
    AlreadyCredited,
    Deferred,
    Cancelled,
    Skipped,
}

pub struct Reconciler {
    pool: SqlitePool,
    provider: Arc<dyn PayProvider>,
    rates: RateCache,
    health: HealthState,
    orphan_rx: OrphanInvoiceReceiver,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        pool: SqlitePool,
        provider: Arc<dyn PayProvider>,
        rates: RateCache,
        health: HealthState,
        orphan_rx: OrphanInvoiceReceiver,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            pool,
            provider,
            rates,
            health,
            orphan_rx,
            config,
        }
    }

    /// Run until shutdown is signaled.
    ///
    /// An in-flight tick always finishes before the loop exits; every
    /// provider call inside it carries its own deadline. Returns an
    /// error only for the fatal ledger invariant violation.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), ReconcileError> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Reconciler started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Reconciler received shutdown signal");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    let now = time::OffsetDateTime::now_utc().unix_timestamp();
                    match self.tick(now).await {
                        Ok(report) => {
                            self.health.record_reconcile_tick();
                            if !report.is_quiet() {
                                info!(
                                    adopted = report.adopted,
                                    credited = report.credited,
                                    expired = report.expired,
                                    cancelled = report.cancelled,
                                    "reconciliation tick complete"
                                );
                            }
                        }
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "ledger invariant violated, aborting");
                            return Err(e);
                        }
                        Err(e) => {
                            warn!(error = %e, "reconciliation tick failed, retrying next tick");
                        }
                    }
                }
            }
        }

        info!("Reconciler shutdown complete");
        Ok(())
    }

    /// One reconciliation pass at time `now`.
    pub(crate) async fn tick(&mut self, now: i64) -> Result<TickReport, ReconcileError> {
        let mut report = TickReport {
            adopted: self.adopt_orphans().await?,
            ..TickReport::default()
        };

        let created_before = now - self.config.min_pending_age.as_secs() as i64;
        let processor = DatabaseProcessor {
            pool: self.pool.clone(),
        };
        let pending = processor
            .process(ListPendingInvoices { created_before })
            .await
            .map_err(RegistryError::from)?;

        let grace = self.config.expiry_grace.as_secs() as i64;
        let (overdue, watchable): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|inv| now >= inv.expires_at + grace);

        if !watchable.is_empty() {
            let by_id: HashMap<i64, InvoiceRecord> = watchable
                .into_iter()
                .map(|inv| (inv.provider_invoice_id, inv))
                .collect();
            let paid = self.fetch_paid_matching(&by_id).await?;
            for dto in paid.into_iter().sorted_by_key(|d| d.invoice_id) {
                let Some(invoice) = by_id.get(&dto.invoice_id) else {
                    continue;
                };
                match self.settle_paid(invoice, &dto, now).await? {
                    Settlement::Credited => report.credited += 1,
                    Settlement::Cancelled => report.cancelled += 1,
                    Settlement::AlreadyCredited | Settlement::Deferred | Settlement::Skipped => {}
                }
            }
        }

        for invoice in &overdue {
            match InvoiceRecord::mark_expired(&self.pool, invoice.provider_invoice_id).await {
                Ok((_, true)) => {
                    info!(
                        invoice = invoice.provider_invoice_id,
                        user = %invoice.user_id,
                        "invoice expired unpaid"
                    );
                    report.expired += 1;
                }
                Ok((_, false)) => {}
                Err(RegistryError::IllegalTransition { from, .. }) => {
                    // Raced with a concurrent transition; the winner stands.
                    debug!(
                        invoice = invoice.provider_invoice_id,
                        from = ?from,
                        "skipping expiry of already-settled invoice"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }

    /// Register invoices the facade failed to persist after the provider
    /// had already created them.
    async fn adopt_orphans(&mut self) -> Result<u32, ReconcileError> {
        let mut adopted = 0;
        loop {
            let orphan = match self.orphan_rx.try_recv() {
                Ok(orphan) => orphan,
                Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {
                    break;
                }
            };
            let provider_invoice_id = orphan.provider_invoice_id;
            let result = InvoiceRecord::record_created(
                &self.pool,
                NewInvoice {
                    provider_invoice_id,
                    local_id: orphan.local_id,
                    user: orphan.user,
                    crypto: orphan.crypto,
                    fiat_at_issue: orphan.fiat_at_issue,
                    created_at: orphan.created_at,
                    expires_at: orphan.expires_at,
                },
            )
            .await;
            match result {
                Ok(_) => {
                    info!(invoice = provider_invoice_id, "orphaned invoice adopted");
                    adopted += 1;
                }
                Err(RegistryError::Duplicate(_)) => {
                    debug!(invoice = provider_invoice_id, "orphaned invoice already recorded");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(adopted)
    }

    /// Walk the provider's paid invoices and keep those matching local
    /// pending records.
    async fn fetch_paid_matching(
        &self,
        by_id: &HashMap<i64, InvoiceRecord>,
    ) -> Result<Vec<InvoiceDto>, ReconcileError> {
        let mut matched = Vec::new();
        let mut offset = 0u32;
        for _ in 0..self.config.max_pages {
            let page = self
                .provider
                .get_invoices(GetInvoicesRequest {
                    status: Some(WireInvoiceStatus::Paid),
                    offset,
                    count: self.config.page_size,
                })
                .await?;
            let page_len = page.len() as u32;
            matched.extend(
                page.into_iter()
                    .filter(|dto| by_id.contains_key(&dto.invoice_id)),
            );
            if page_len < self.config.page_size {
                return Ok(matched);
            }
            offset += self.config.page_size;
        }
        warn!(
            pages = self.config.max_pages,
            "paid invoice walk truncated, remaining matches settle next tick"
        );
        Ok(matched)
    }

    /// Transition one matched invoice to `Paid` and credit the ledger,
    /// all inside a single store transaction.
    async fn settle_paid(
        &self,
        invoice: &InvoiceRecord,
        dto: &InvoiceDto,
        now: i64,
    ) -> Result<Settlement, ReconcileError> {
        let id = invoice.provider_invoice_id;

        // A paid record whose asset does not match ours is a definitive
        // provider-side problem for this invoice: surface it to the
        // operator and take the invoice out of the pending set.
        match dto.asset.parse::<Asset>() {
            Ok(asset) if asset == invoice.asset => {}
            _ => {
                error!(
                    invoice = id,
                    recorded_asset = %invoice.asset,
                    provider_asset = %dto.asset,
                    "paid invoice asset mismatch, cancelling"
                );
                return self.cancel_invoice(id).await;
            }
        }

        let Some(expected) = invoice.crypto_amount() else {
            error!(invoice = id, "recorded crypto amount is unrepresentable, cancelling");
            return self.cancel_invoice(id).await;
        };
        match CryptoAmount::parse_wire(invoice.asset, &dto.amount) {
            Some(reported) if reported == expected => {}
            reported => {
                // The ledger credits what was requested at issue time; a
                // differing provider-reported amount is an operator concern.
                warn!(
                    invoice = id,
                    expected = %expected,
                    reported = ?reported,
                    "provider paid amount differs from requested amount"
                );
            }
        }

        // Price at the current rate. Without a fresh rate the invoice
        // stays pending and settles on a later tick.
        let fiat = match self.rates.quote_fiat_for_crypto(expected).await {
            Ok(fiat) => fiat,
            Err(RateError::Unavailable { .. } | RateError::Provider(_)) => {
                warn!(invoice = id, "no fresh rate, deferring credit");
                return Ok(Settlement::Deferred);
            }
            Err(RateError::Conversion { .. }) => {
                error!(invoice = id, "credit conversion out of range, cancelling");
                return self.cancel_invoice(id).await;
            }
        };

        let mut tx = self.pool.begin().await.map_err(RegistryError::from)?;
        let first_time = match InvoiceRecord::mark_paid_tx(&mut tx, id, now).await {
            Ok((_, first_time)) => first_time,
            Err(RegistryError::IllegalTransition { from, .. }) => {
                warn!(invoice = id, from = ?from, "paid report for settled invoice ignored");
                return Ok(Settlement::Skipped);
            }
            Err(e) => return Err(e.into()),
        };
        if !first_time {
            tx.commit().await.map_err(RegistryError::from)?;
            return Ok(Settlement::AlreadyCredited);
        }

        let idempotency_key = format!("invoice:{id}");
        let entry = LedgerEntry::credit_tx(
            &mut tx,
            invoice.user_id,
            fiat,
            LedgerReason::Deposit,
            &idempotency_key,
            now,
        )
        .await?;
        InvoiceRecord::link_ledger_entry_tx(&mut tx, id, entry.id).await?;
        tx.commit().await.map_err(RegistryError::from)?;

        info!(
            invoice = id,
            user = %invoice.user_id,
            amount = %fiat,
            crypto = %expected,
            "deposit credited"
        );

        // Post-credit audit: a discrepancy here is the fatal invariant
        // violation.
        LedgerEntry::audit(&self.pool, invoice.user_id).await?;
        Ok(Settlement::Credited)
    }

    async fn cancel_invoice(&self, provider_invoice_id: i64) -> Result<Settlement, ReconcileError> {
        match InvoiceRecord::mark_cancelled(&self.pool, provider_invoice_id).await {
            Ok((_, true)) => Ok(Settlement::Cancelled),
            Ok((_, false)) => Ok(Settlement::Skipped),
            Err(RegistryError::IllegalTransition { from, .. }) => {
                warn!(
                    invoice = provider_invoice_id,
                    from = ?from,
                    "cannot cancel settled invoice"
                );
                Ok(Settlement::Skipped)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::InvoiceStatus;
    use crate::entities::invoices::GetInvoice;
    use crate::entities::ledger::{CountLedgerEntries, GetBalance, GetLedgerHistory};
    use crate::events::{OrphanInvoice, OrphanInvoiceSender, orphan_invoice_channel};
    use crate::money::{FiatAmount, UserId};
    use crate::test_support::{MockProvider, test_pool};
    use uuid::Uuid;

    const NOW: i64 = 100_000;

    fn usd(dollars: i64) -> FiatAmount {
        FiatAmount::from_cents(u32::try_from(dollars * 100).unwrap())
    }

    async fn fixture(config: ReconcilerConfig) -> (SqlitePool, Arc<MockProvider>, Reconciler, OrphanInvoiceSender) {
        let pool = test_pool().await;
        let mock = Arc::new(MockProvider::new());
        mock.set_rate(Asset::Ltc, "80");
        let provider: Arc<dyn PayProvider> = mock.clone();
        let rates = RateCache::new(provider.clone());
        let (orphan_tx, orphan_rx) = orphan_invoice_channel();
        let reconciler = Reconciler::new(
            pool.clone(),
            provider,
            rates,
            HealthState::new(),
            orphan_rx,
            config,
        );
        (pool, mock, reconciler, orphan_tx)
    }

    async fn record_pending(pool: &SqlitePool, id: i64, created_at: i64) -> InvoiceRecord {
        InvoiceRecord::record_created(
            pool,
            NewInvoice {
                provider_invoice_id: id,
                local_id: Uuid::now_v7(),
                user: UserId(42),
                crypto: CryptoAmount::from_units(Asset::Ltc, 12_500_000).unwrap(),
                fiat_at_issue: usd(10),
                created_at,
                expires_at: created_at + 3600,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn paid_invoice_credits_exactly_once() {
        let (pool, mock, mut reconciler, _orphan_tx) = fixture(ReconcilerConfig::default()).await;
        record_pending(&pool, 101, NOW - 60).await;
        mock.add_paid_invoice(101, Asset::Ltc, "0.12500000");

        let report = reconciler.tick(NOW).await.unwrap();
        assert_eq!(report.credited, 1);

        let processor = DatabaseProcessor { pool: pool.clone() };
        assert_eq!(
            processor.process(GetBalance { user: UserId(42) }).await.unwrap(),
            usd(10)
        );
        let invoice = processor
            .process(GetInvoice { provider_invoice_id: 101 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        let history = processor
            .process(GetLedgerHistory {
                user: UserId(42),
                limit: 10,
                before: None,
            })
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].idempotency_key, "invoice:101");
        assert_eq!(invoice.credited_ledger_entry_id, Some(history[0].id));

        // Replaying the tick against the same provider view changes nothing.
        let report = reconciler.tick(NOW).await.unwrap();
        assert_eq!(report.credited, 0);
        assert_eq!(processor.process(CountLedgerEntries).await.unwrap(), 1);
        assert_eq!(
            processor.process(GetBalance { user: UserId(42) }).await.unwrap(),
            usd(10)
        );
    }

    #[tokio::test]
    async fn young_invoices_are_not_asked_about() {
        let (pool, mock, mut reconciler, _orphan_tx) = fixture(ReconcilerConfig::default()).await;
        record_pending(&pool, 101, NOW - 10).await;
        mock.add_paid_invoice(101, Asset::Ltc, "0.12500000");

        let report = reconciler.tick(NOW).await.unwrap();
        assert_eq!(report.credited, 0);

        // Thirty seconds later the invoice is old enough.
        let report = reconciler.tick(NOW + 30).await.unwrap();
        assert_eq!(report.credited, 1);
    }

    #[tokio::test]
    async fn unpaid_invoice_expires_after_grace() {
        let (pool, _mock, mut reconciler, _orphan_tx) = fixture(ReconcilerConfig::default()).await;
        let created_at = NOW - 3600 - 300;
        record_pending(&pool, 101, created_at).await;

        let report = reconciler.tick(NOW).await.unwrap();
        assert_eq!(report.expired, 1);

        let processor = DatabaseProcessor { pool: pool.clone() };
        let invoice = processor
            .process(GetInvoice { provider_invoice_id: 101 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Expired);
        assert_eq!(
            processor.process(GetBalance { user: UserId(42) }).await.unwrap(),
            FiatAmount::ZERO
        );
    }

    #[tokio::test]
    async fn invoice_within_grace_is_still_watched() {
        let (pool, mock, mut reconciler, _orphan_tx) = fixture(ReconcilerConfig::default()).await;
        // Expired two minutes ago, still inside the five-minute grace.
        record_pending(&pool, 101, NOW - 3720).await;
        mock.add_paid_invoice(101, Asset::Ltc, "0.12500000");

        let report = reconciler.tick(NOW).await.unwrap();
        assert_eq!(report.credited, 1);
        assert_eq!(report.expired, 0);
    }

    #[tokio::test]
    async fn orphaned_invoice_is_adopted_and_settled() {
        let (pool, mock, mut reconciler, orphan_tx) = fixture(ReconcilerConfig::default()).await;
        orphan_tx
            .send(OrphanInvoice {
                provider_invoice_id: 777,
                local_id: Uuid::now_v7(),
                user: UserId(7),
                crypto: CryptoAmount::from_units(Asset::Ltc, 12_500_000).unwrap(),
                fiat_at_issue: usd(10),
                created_at: NOW - 60,
                expires_at: NOW + 3540,
            })
            .await
            .unwrap();
        mock.add_paid_invoice(777, Asset::Ltc, "0.12500000");

        let report = reconciler.tick(NOW).await.unwrap();
        assert_eq!(report.adopted, 1);
        assert_eq!(report.credited, 1);

        let processor = DatabaseProcessor { pool };
        assert_eq!(
            processor.process(GetBalance { user: UserId(7) }).await.unwrap(),
            usd(10)
        );
    }

    #[tokio::test]
    async fn provider_outage_aborts_the_tick() {
        let (pool, mock, mut reconciler, _orphan_tx) = fixture(ReconcilerConfig::default()).await;
        record_pending(&pool, 101, NOW - 60).await;
        mock.fail_list.store(true, std::sync::atomic::Ordering::SeqCst);

        let err = reconciler.tick(NOW).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Provider(_)));
        assert!(!err.is_fatal());

        let processor = DatabaseProcessor { pool };
        let invoice = processor
            .process(GetInvoice { provider_invoice_id: 101 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Pending);
    }

    #[tokio::test]
    async fn missing_rate_defers_the_credit() {
        let (pool, mock, mut reconciler, _orphan_tx) = fixture(ReconcilerConfig::default()).await;
        record_pending(&pool, 101, NOW - 60).await;
        mock.add_paid_invoice(101, Asset::Ltc, "0.12500000");
        mock.rates.lock().unwrap().clear();
        mock.fail_rates.store(true, std::sync::atomic::Ordering::SeqCst);

        let report = reconciler.tick(NOW).await.unwrap();
        assert_eq!(report.credited, 0);

        let processor = DatabaseProcessor { pool: pool.clone() };
        let invoice = processor
            .process(GetInvoice { provider_invoice_id: 101 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Pending);

        // Once a rate is available again the credit lands.
        mock.fail_rates.store(false, std::sync::atomic::Ordering::SeqCst);
        mock.set_rate(Asset::Ltc, "80");
        let report = reconciler.tick(NOW + 20).await.unwrap();
        assert_eq!(report.credited, 1);
        assert_eq!(
            processor.process(GetBalance { user: UserId(42) }).await.unwrap(),
            usd(10)
        );
    }

    #[tokio::test]
    async fn asset_mismatch_cancels_the_invoice() {
        let (pool, mock, mut reconciler, _orphan_tx) = fixture(ReconcilerConfig::default()).await;
        record_pending(&pool, 101, NOW - 60).await;
        mock.add_paid_invoice(101, Asset::Ton, "0.12500000");

        let report = reconciler.tick(NOW).await.unwrap();
        assert_eq!(report.cancelled, 1);

        let processor = DatabaseProcessor { pool };
        let invoice = processor
            .process(GetInvoice { provider_invoice_id: 101 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Cancelled);
        assert!(invoice.credited_ledger_entry_id.is_none());
        assert_eq!(processor.process(CountLedgerEntries).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn paid_walk_pages_through_the_provider() {
        let config = ReconcilerConfig {
            page_size: 1,
            ..ReconcilerConfig::default()
        };
        let (pool, mock, mut reconciler, _orphan_tx) = fixture(config).await;
        record_pending(&pool, 101, NOW - 60).await;
        record_pending(&pool, 102, NOW - 60).await;
        // An unrelated paid invoice sits between the two matches.
        mock.add_paid_invoice(101, Asset::Ltc, "0.12500000");
        mock.add_paid_invoice(999, Asset::Ltc, "1.00000000");
        mock.add_paid_invoice(102, Asset::Ltc, "0.12500000");

        let report = reconciler.tick(NOW).await.unwrap();
        assert_eq!(report.credited, 2);

        let processor = DatabaseProcessor { pool };
        assert_eq!(
            processor.process(GetBalance { user: UserId(42) }).await.unwrap(),
            usd(20)
        );
    }
}
