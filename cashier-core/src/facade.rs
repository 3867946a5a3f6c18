//! The dispatch facade.
//!
//! `Cashier` is the single entry point the chat layer holds: quoting,
//! deposit invoice creation, balance movements, and withdrawals. It
//! owns no background work; the reconciler settles what is created
//! here.

use crate::entities::LedgerReason;
use crate::entities::invoices::{InvoiceRecord, NewInvoice, RegistryError};
use crate::entities::ledger::{GetBalance, GetLedgerHistory, LedgerEntry, LedgerError};
use crate::events::{OrphanInvoice, OrphanInvoiceSender};
use crate::framework::DatabaseProcessor;
use crate::money::{Asset, CryptoAmount, FiatAmount, UserId};
use crate::provider::PayProvider;
use crate::rates::{CryptoQuote, RateCache, RateError};
use cashier_cryptopay::CryptoPayError;
use cashier_cryptopay::objects::{CreateInvoiceRequest, TransferRequest};
use kanau::processor::Processor;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

/// Deposits and withdrawals below this are rejected.
const MIN_AMOUNT_CENTS: u32 = 100;
/// Deposits and withdrawals above this are rejected.
const MAX_AMOUNT_CENTS: u32 = 2_500_000;
/// Invoices are valid for one hour.
const INVOICE_TTL_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum CashierError {
    /// Debit request exceeds the balance. Reported to the caller, never
    /// logged as an error.
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds {
        balance: FiatAmount,
        requested: FiatAmount,
    },

    /// No fresh exchange rate. Retryable after the next refresh.
    #[error("no fresh exchange rate for {asset}")]
    RateUnavailable { asset: Asset },

    #[error("amount {amount} outside allowed range {min} to {max}")]
    AmountOutOfBounds {
        amount: FiatAmount,
        min: FiatAmount,
        max: FiatAmount,
    },

    /// Conversion left the representable range.
    #[error("conversion out of range for {asset}")]
    ConversionOutOfRange { asset: Asset },

    /// Transport-level failure talking to the provider. Retryable.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(#[source] CryptoPayError),

    /// The provider returned a definitive error. The code is for logs,
    /// never for end users.
    #[error("provider rejected the request: {code} {name}")]
    ProviderRejected { code: i32, name: String },

    #[error(transparent)]
    Ledger(LedgerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),
}

impl From<LedgerError> for CashierError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientFunds { balance, requested } => {
                CashierError::InsufficientFunds { balance, requested }
            }
            other => CashierError::Ledger(other),
        }
    }
}

impl From<RateError> for CashierError {
    fn from(e: RateError) -> Self {
        match e {
            RateError::Unavailable { asset } => CashierError::RateUnavailable { asset },
            RateError::Conversion { asset } => CashierError::ConversionOutOfRange { asset },
            RateError::Provider(e) => provider_error(e),
        }
    }
}

fn provider_error(e: CryptoPayError) -> CashierError {
    if e.is_retryable() {
        return CashierError::ProviderUnavailable(e);
    }
    match e {
        CryptoPayError::Api { code, name } => CashierError::ProviderRejected { code, name },
        other => CashierError::ProviderUnavailable(other),
    }
}

/// Reply to a successful `create_deposit`.
#[derive(Debug, Clone, Serialize)]
pub struct DepositReceipt {
    pub provider_invoice_id: i64,
    pub local_id: Uuid,
    pub pay_url: String,
    pub mini_app_url: Option<String>,
    pub crypto: CryptoAmount,
    pub fiat: FiatAmount,
    pub expires_at: i64,
}

/// Reply to a successful `withdraw`.
#[derive(Debug, Clone)]
pub struct WithdrawalReceipt {
    pub entry: LedgerEntry,
    pub transfer_id: i64,
    pub crypto: CryptoAmount,
}

#[derive(Clone)]
pub struct Cashier {
    inner: Arc<CashierInner>,
}

struct CashierInner {
    pool: SqlitePool,
    provider: Arc<dyn PayProvider>,
    rates: RateCache,
    orphan_tx: OrphanInvoiceSender,
}

impl Cashier {
    pub fn new(
        pool: SqlitePool,
        provider: Arc<dyn PayProvider>,
        rates: RateCache,
        orphan_tx: OrphanInvoiceSender,
    ) -> Self {
        Self {
            inner: Arc::new(CashierInner {
                pool,
                provider,
                rates,
                orphan_tx,
            }),
        }
    }

    /// Price a fiat amount in crypto at the current rate.
    pub async fn quote(&self, asset: Asset, fiat: FiatAmount) -> Result<CryptoQuote, CashierError> {
        Ok(self.inner.rates.quote_crypto_for_fiat(asset, fiat).await?)
    }

    /// Current balance (zero for users never seen before).
    pub async fn balance(&self, user: UserId) -> Result<FiatAmount, CashierError> {
        let processor = DatabaseProcessor {
            pool: self.inner.pool.clone(),
        };
        Ok(processor.process(GetBalance { user }).await?)
    }

    /// Recent ledger entries, newest first.
    pub async fn history(
        &self,
        user: UserId,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<LedgerEntry>, CashierError> {
        let processor = DatabaseProcessor {
            pool: self.inner.pool.clone(),
        };
        Ok(processor
            .process(GetLedgerHistory {
                user,
                limit,
                before,
            })
            .await?)
    }

    /// Credit a user's balance (game winnings, manual adjustments).
    pub async fn credit(
        &self,
        user: UserId,
        amount: FiatAmount,
        reason: LedgerReason,
        idempotency_key: &str,
    ) -> Result<LedgerEntry, CashierError> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        Ok(LedgerEntry::credit(&self.inner.pool, user, amount, reason, idempotency_key, now).await?)
    }

    /// Debit a user's balance; fails before writing anything if the
    /// balance does not cover the amount.
    pub async fn debit(
        &self,
        user: UserId,
        amount: FiatAmount,
        reason: LedgerReason,
        idempotency_key: &str,
    ) -> Result<LedgerEntry, CashierError> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        Ok(LedgerEntry::debit(&self.inner.pool, user, amount, reason, idempotency_key, now).await?)
    }

    /// Create a deposit invoice at the provider and record it locally.
    ///
    /// If local persistence fails after the provider invoice exists, the
    /// invoice is queued for adoption by the reconciler and the receipt
    /// is still returned; no payment can be lost, only settled later.
    pub async fn create_deposit(
        &self,
        user: UserId,
        fiat: FiatAmount,
        asset: Asset,
    ) -> Result<DepositReceipt, CashierError> {
        let min = FiatAmount::from_cents(MIN_AMOUNT_CENTS);
        let max = FiatAmount::from_cents(MAX_AMOUNT_CENTS);
        if fiat < min || fiat > max {
            return Err(CashierError::AmountOutOfBounds {
                amount: fiat,
                min,
                max,
            });
        }

        let quote = self.inner.rates.quote_crypto_for_fiat(asset, fiat).await?;
        let request = CreateInvoiceRequest {
            asset: asset.as_str().to_string(),
            amount: quote.crypto.wire_amount(),
            description: format!("Casino deposit - {fiat}"),
            hidden_message: user.to_string(),
            expires_in: INVOICE_TTL_SECS,
            allow_comments: false,
            allow_anonymous: false,
        };
        let dto = self
            .inner
            .provider
            .create_invoice(&request)
            .await
            .map_err(provider_error)?;

        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let expires_at = now + INVOICE_TTL_SECS as i64;
        let local_id = Uuid::now_v7();
        let new_invoice = NewInvoice {
            provider_invoice_id: dto.invoice_id,
            local_id,
            user,
            crypto: quote.crypto,
            fiat_at_issue: fiat,
            created_at: now,
            expires_at,
        };

        if let Err(e) = InvoiceRecord::record_created(&self.inner.pool, new_invoice).await {
            warn!(
                invoice = dto.invoice_id,
                user = %user,
                error = %e,
                "invoice exists at provider but not locally, queueing for adoption"
            );
            let orphan = OrphanInvoice {
                provider_invoice_id: dto.invoice_id,
                local_id,
                user,
                crypto: quote.crypto,
                fiat_at_issue: fiat,
                created_at: now,
                expires_at,
            };
            if let Err(send_err) = self.inner.orphan_tx.send(orphan).await {
                error!(
                    invoice = dto.invoice_id,
                    error = %send_err,
                    "failed to queue orphaned invoice for adoption"
                );
            }
        }

        Ok(DepositReceipt {
            provider_invoice_id: dto.invoice_id,
            local_id,
            pay_url: dto.pay_url,
            mini_app_url: dto.mini_app_invoice_url,
            crypto: quote.crypto,
            fiat,
            expires_at,
        })
    }

    /// Withdraw a user's fiat balance as crypto via the provider.
    ///
    /// The debit lands first, so an insufficient balance never reaches
    /// the provider. A definitive provider rejection refunds the debit;
    /// an unresolved transfer leaves the debit in place for operator
    /// resolution (the provider's `spend_id` dedup makes a manual retry
    /// safe). The sub-unit round-up on the crypto amount (at most 1e-8)
    /// is borne by the house.
    pub async fn withdraw(
        &self,
        user: UserId,
        fiat: FiatAmount,
        asset: Asset,
        idempotency_key: &str,
    ) -> Result<WithdrawalReceipt, CashierError> {
        let min = FiatAmount::from_cents(MIN_AMOUNT_CENTS);
        let max = FiatAmount::from_cents(MAX_AMOUNT_CENTS);
        if fiat < min || fiat > max {
            return Err(CashierError::AmountOutOfBounds {
                amount: fiat,
                min,
                max,
            });
        }

        let quote = self.inner.rates.quote_crypto_for_fiat(asset, fiat).await?;
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let entry = LedgerEntry::debit(
            &self.inner.pool,
            user,
            fiat,
            LedgerReason::Withdrawal,
            idempotency_key,
            now,
        )
        .await?;

        let request = TransferRequest {
            user_id: user.0,
            asset: asset.as_str().to_string(),
            amount: quote.crypto.wire_amount(),
            spend_id: idempotency_key.to_string(),
            comment: Some("Casino withdrawal".to_string()),
        };
        match self.inner.provider.transfer(&request).await {
            Ok(dto) => Ok(WithdrawalReceipt {
                entry,
                transfer_id: dto.transfer_id,
                crypto: quote.crypto,
            }),
            Err(e) => match provider_error(e) {
                CashierError::ProviderRejected { code, name } => {
                    let refund_key = format!("{idempotency_key}:refund");
                    LedgerEntry::credit(
                        &self.inner.pool,
                        user,
                        fiat,
                        LedgerReason::Adjustment,
                        &refund_key,
                        now,
                    )
                    .await?;
                    warn!(
                        user = %user,
                        key = idempotency_key,
                        code,
                        name,
                        "withdrawal rejected by provider, debit refunded"
                    );
                    Err(CashierError::ProviderRejected { code, name })
                }
                unresolved => {
                    // Outcome unknown: the funds may have moved. Never
                    // refund here; the debit stands until the operator
                    // resolves it.
                    error!(
                        user = %user,
                        key = idempotency_key,
                        error = %unresolved,
                        "withdrawal transfer unresolved, operator attention required"
                    );
                    Err(unresolved)
                }
            },
        }
    }
}
