//! The invoice registry.
//!
//! One row per provider invoice, keyed by the provider-assigned id.
//! Transitions are status-guarded UPDATEs: `mark_paid` is idempotent
//! and elects exactly one winner under concurrency, while transitions
//! out of a different terminal state fail as illegal.

use crate::entities::InvoiceStatus;
use crate::framework::DatabaseProcessor;
use crate::money::{Asset, CryptoAmount, FiatAmount, UserId};
use kanau::processor::Processor;
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use uuid::Uuid;

const SELECT_COLUMNS: &str = "SELECT provider_invoice_id, local_id, user_id, asset, \
     crypto_units, fiat_at_issue, status, created_at, expires_at, paid_at, \
     credited_ledger_entry_id FROM invoices";

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct InvoiceRecord {
    pub provider_invoice_id: i64,
    pub local_id: Uuid,
    pub user_id: UserId,
    pub asset: Asset,
    pub crypto_units: i64,
    pub fiat_at_issue: FiatAmount,
    pub status: InvoiceStatus,
    pub created_at: i64,
    pub expires_at: i64,
    pub paid_at: Option<i64>,
    pub credited_ledger_entry_id: Option<i64>,
}

impl InvoiceRecord {
    pub fn crypto_amount(&self) -> Option<CryptoAmount> {
        CryptoAmount::from_units(self.asset, self.crypto_units)
    }
}

/// Insert payload for [`InvoiceRecord::record_created`].
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub provider_invoice_id: i64,
    pub local_id: Uuid,
    pub user: UserId,
    pub crypto: CryptoAmount,
    pub fiat_at_issue: FiatAmount,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The provider invoice id is already recorded.
    #[error("duplicate invoice {0}")]
    Duplicate(i64),

    #[error("invoice {0} not found")]
    NotFound(i64),

    /// Attempted transition out of a different terminal state. Indicates
    /// a bug or a replayed message.
    #[error("illegal transition of invoice {invoice}: {from:?} -> {to:?}")]
    IllegalTransition {
        invoice: i64,
        from: InvoiceStatus,
        to: InvoiceStatus,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl InvoiceRecord {
    /// Insert a new invoice in `Pending` state.
    pub async fn record_created(
        pool: &SqlitePool,
        invoice: NewInvoice,
    ) -> Result<InvoiceRecord, RegistryError> {
        let record = InvoiceRecord {
            provider_invoice_id: invoice.provider_invoice_id,
            local_id: invoice.local_id,
            user_id: invoice.user,
            asset: invoice.crypto.asset(),
            crypto_units: invoice.crypto.units(),
            fiat_at_issue: invoice.fiat_at_issue,
            status: InvoiceStatus::Pending,
            created_at: invoice.created_at,
            expires_at: invoice.expires_at,
            paid_at: None,
            credited_ledger_entry_id: None,
        };
        let result = sqlx::query(
            "INSERT INTO invoices \
             (provider_invoice_id, local_id, user_id, asset, crypto_units, fiat_at_issue, \
              status, created_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.provider_invoice_id)
        .bind(record.local_id)
        .bind(record.user_id)
        .bind(record.asset)
        .bind(record.crypto_units)
        .bind(record.fiat_at_issue)
        .bind(record.status)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(pool)
        .await;
        match result {
            Ok(_) => Ok(record),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(RegistryError::Duplicate(invoice.provider_invoice_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotent `Pending -> Paid` transition inside `tx`.
    ///
    /// Returns `first_time = true` only for the call that actually
    /// performed the transition; replays see `false` with the existing
    /// record.
    pub async fn mark_paid_tx(
        tx: &mut Transaction<'_, Sqlite>,
        provider_invoice_id: i64,
        paid_at: i64,
    ) -> Result<(InvoiceRecord, bool), RegistryError> {
        let affected = sqlx::query(
            "UPDATE invoices SET status = ?, paid_at = ? \
             WHERE provider_invoice_id = ? AND status = ?",
        )
        .bind(InvoiceStatus::Paid)
        .bind(paid_at)
        .bind(provider_invoice_id)
        .bind(InvoiceStatus::Pending)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        let record = sqlx::query_as::<_, InvoiceRecord>(&format!(
            "{SELECT_COLUMNS} WHERE provider_invoice_id = ?"
        ))
        .bind(provider_invoice_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(RegistryError::NotFound(provider_invoice_id))?;

        if affected == 1 {
            return Ok((record, true));
        }
        if record.status == InvoiceStatus::Paid {
            return Ok((record, false));
        }
        Err(RegistryError::IllegalTransition {
            invoice: provider_invoice_id,
            from: record.status,
            to: InvoiceStatus::Paid,
        })
    }

    /// Idempotent `Pending -> Expired` transition.
    pub async fn mark_expired(
        pool: &SqlitePool,
        provider_invoice_id: i64,
    ) -> Result<(InvoiceRecord, bool), RegistryError> {
        Self::terminalize(pool, provider_invoice_id, InvoiceStatus::Expired).await
    }

    /// Idempotent `Pending -> Cancelled` transition.
    pub async fn mark_cancelled(
        pool: &SqlitePool,
        provider_invoice_id: i64,
    ) -> Result<(InvoiceRecord, bool), RegistryError> {
        Self::terminalize(pool, provider_invoice_id, InvoiceStatus::Cancelled).await
    }

    /// Attach the ledger entry credited for this invoice.
    pub async fn link_ledger_entry_tx(
        tx: &mut Transaction<'_, Sqlite>,
        provider_invoice_id: i64,
        ledger_entry_id: i64,
    ) -> Result<(), RegistryError> {
        sqlx::query("UPDATE invoices SET credited_ledger_entry_id = ? WHERE provider_invoice_id = ?")
            .bind(ledger_entry_id)
            .bind(provider_invoice_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn terminalize(
        pool: &SqlitePool,
        provider_invoice_id: i64,
        to: InvoiceStatus,
    ) -> Result<(InvoiceRecord, bool), RegistryError> {
        let affected = sqlx::query(
            "UPDATE invoices SET status = ? WHERE provider_invoice_id = ? AND status = ?",
        )
        .bind(to)
        .bind(provider_invoice_id)
        .bind(InvoiceStatus::Pending)
        .execute(pool)
        .await?
        .rows_affected();

        let record = sqlx::query_as::<_, InvoiceRecord>(&format!(
            "{SELECT_COLUMNS} WHERE provider_invoice_id = ?"
        ))
        .bind(provider_invoice_id)
        .fetch_optional(pool)
        .await?
        .ok_or(RegistryError::NotFound(provider_invoice_id))?;

        if affected == 1 {
            return Ok((record, true));
        }
        if record.status == to {
            return Ok((record, false));
        }
        Err(RegistryError::IllegalTransition {
            invoice: provider_invoice_id,
            from: record.status,
            to,
        })
    }
}

/// Fetch one invoice by provider id.
#[derive(Debug, Clone, Copy)]
pub struct GetInvoice {
    pub provider_invoice_id: i64,
}

impl Processor<GetInvoice> for DatabaseProcessor {
    type Output = Option<InvoiceRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetInvoice")]
    async fn process(&self, query: GetInvoice) -> Result<Option<InvoiceRecord>, sqlx::Error> {
        sqlx::query_as::<_, InvoiceRecord>(&format!(
            "{SELECT_COLUMNS} WHERE provider_invoice_id = ?"
        ))
        .bind(query.provider_invoice_id)
        .fetch_optional(&self.pool)
        .await
    }
}

/// Pending invoices created at or before `created_before`, oldest first.
#[derive(Debug, Clone, Copy)]
pub struct ListPendingInvoices {
    pub created_before: i64,
}

impl Processor<ListPendingInvoices> for DatabaseProcessor {
    type Output = Vec<InvoiceRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListPendingInvoices")]
    async fn process(&self, query: ListPendingInvoices) -> Result<Vec<InvoiceRecord>, sqlx::Error> {
        sqlx::query_as::<_, InvoiceRecord>(&format!(
            "{SELECT_COLUMNS} WHERE status = ? AND created_at <= ? ORDER BY created_at ASC"
        ))
        .bind(InvoiceStatus::Pending)
        .bind(query.created_before)
        .fetch_all(&self.pool)
        .await
    }
}

/// Count invoices in a given state.
#[derive(Debug, Clone, Copy)]
pub struct CountInvoicesByStatus {
    pub status: InvoiceStatus,
}

impl Processor<CountInvoicesByStatus> for DatabaseProcessor {
    type Output = i64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:CountInvoicesByStatus")]
    async fn process(&self, query: CountInvoicesByStatus) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM invoices WHERE status = ?")
            .bind(query.status)
            .fetch_one(&self.pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    fn new_invoice(id: i64, created_at: i64) -> NewInvoice {
        NewInvoice {
            provider_invoice_id: id,
            local_id: Uuid::now_v7(),
            user: UserId(42),
            crypto: CryptoAmount::from_units(Asset::Ltc, 12_500_000).unwrap(),
            fiat_at_issue: FiatAmount::from_cents(1000),
            created_at,
            expires_at: created_at + 3600,
        }
    }

    #[tokio::test]
    async fn record_and_get() {
        let pool = test_pool().await;
        let created = InvoiceRecord::record_created(&pool, new_invoice(101, 1000))
            .await
            .unwrap();
        assert_eq!(created.status, InvoiceStatus::Pending);

        let processor = DatabaseProcessor { pool };
        let fetched = processor
            .process(GetInvoice {
                provider_invoice_id: 101,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.crypto_amount().unwrap().units(), 12_500_000);
    }

    #[tokio::test]
    async fn duplicate_provider_id_is_rejected() {
        let pool = test_pool().await;
        InvoiceRecord::record_created(&pool, new_invoice(101, 1000))
            .await
            .unwrap();
        let err = InvoiceRecord::record_created(&pool, new_invoice(101, 2000))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(101)));
    }

    #[tokio::test]
    async fn mark_paid_is_idempotent() {
        let pool = test_pool().await;
        InvoiceRecord::record_created(&pool, new_invoice(101, 1000))
            .await
            .unwrap();

        let mut tx = pool.begin().await.unwrap();
        let (record, first) = InvoiceRecord::mark_paid_tx(&mut tx, 101, 1500).await.unwrap();
        tx.commit().await.unwrap();
        assert!(first);
        assert_eq!(record.status, InvoiceStatus::Paid);
        assert_eq!(record.paid_at, Some(1500));

        let mut tx = pool.begin().await.unwrap();
        let (replay, first) = InvoiceRecord::mark_paid_tx(&mut tx, 101, 9999).await.unwrap();
        tx.commit().await.unwrap();
        assert!(!first);
        // The original paid_at is preserved.
        assert_eq!(replay.paid_at, Some(1500));
    }

    #[tokio::test]
    async fn paid_invoice_cannot_expire() {
        let pool = test_pool().await;
        InvoiceRecord::record_created(&pool, new_invoice(101, 1000))
            .await
            .unwrap();
        let mut tx = pool.begin().await.unwrap();
        InvoiceRecord::mark_paid_tx(&mut tx, 101, 1500).await.unwrap();
        tx.commit().await.unwrap();

        let err = InvoiceRecord::mark_expired(&pool, 101).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::IllegalTransition {
                invoice: 101,
                from: InvoiceStatus::Paid,
                to: InvoiceStatus::Expired,
            }
        ));
    }

    #[tokio::test]
    async fn expired_invoice_cannot_be_paid() {
        let pool = test_pool().await;
        InvoiceRecord::record_created(&pool, new_invoice(101, 1000))
            .await
            .unwrap();
        let (_, first) = InvoiceRecord::mark_expired(&pool, 101).await.unwrap();
        assert!(first);
        // Expiring again is a no-op, not an error.
        let (_, again) = InvoiceRecord::mark_expired(&pool, 101).await.unwrap();
        assert!(!again);

        let mut tx = pool.begin().await.unwrap();
        let err = InvoiceRecord::mark_paid_tx(&mut tx, 101, 1500).await.unwrap_err();
        assert!(matches!(err, RegistryError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn unknown_invoice_is_not_found() {
        let pool = test_pool().await;
        let mut tx = pool.begin().await.unwrap();
        let err = InvoiceRecord::mark_paid_tx(&mut tx, 404, 1500).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(404)));
    }

    #[tokio::test]
    async fn list_pending_respects_age_bound() {
        let pool = test_pool().await;
        InvoiceRecord::record_created(&pool, new_invoice(1, 1000))
            .await
            .unwrap();
        InvoiceRecord::record_created(&pool, new_invoice(2, 2000))
            .await
            .unwrap();
        InvoiceRecord::record_created(&pool, new_invoice(3, 3000))
            .await
            .unwrap();
        InvoiceRecord::mark_expired(&pool, 1).await.unwrap();

        let processor = DatabaseProcessor { pool };
        let pending = processor
            .process(ListPendingInvoices {
                created_before: 2500,
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].provider_invoice_id, 2);

        assert_eq!(
            processor
                .process(CountInvoicesByStatus {
                    status: InvoiceStatus::Pending,
                })
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn link_ledger_entry_round_trips() {
        let pool = test_pool().await;
        InvoiceRecord::record_created(&pool, new_invoice(101, 1000))
            .await
            .unwrap();
        let mut tx = pool.begin().await.unwrap();
        InvoiceRecord::mark_paid_tx(&mut tx, 101, 1500).await.unwrap();
        InvoiceRecord::link_ledger_entry_tx(&mut tx, 101, 77).await.unwrap();
        tx.commit().await.unwrap();

        let processor = DatabaseProcessor { pool };
        let record = processor
            .process(GetInvoice {
                provider_invoice_id: 101,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.credited_ledger_entry_id, Some(77));
    }
}
