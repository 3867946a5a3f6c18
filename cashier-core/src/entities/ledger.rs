//! The per-user balance ledger.
//!
//! Append-only journal: every movement is an immutable row carrying a
//! globally-unique idempotency key and the balance resulting from it.
//! The latest row per user is the authoritative cached balance;
//! [`LedgerEntry::audit`] recomputes it from the deltas and treats any
//! discrepancy as the fatal invariant violation.

use crate::entities::LedgerReason;
use crate::framework::DatabaseProcessor;
use crate::money::{FiatAmount, FiatDelta, UserId};
use kanau::processor::Processor;
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;

const SELECT_COLUMNS: &str = "SELECT id, user_id, delta, reason, idempotency_key, created_at, \
     resulting_balance FROM ledger_entries";

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: UserId,
    pub delta: FiatDelta,
    pub reason: LedgerReason,
    pub idempotency_key: String,
    pub created_at: i64,
    pub resulting_balance: FiatAmount,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Debit would take the balance below zero. Reported to the caller,
    /// never logged as an error.
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds {
        balance: FiatAmount,
        requested: FiatAmount,
    },

    /// Balance arithmetic left the representable range.
    #[error("balance overflow for user {user}")]
    Overflow { user: UserId },

    /// Cached balance no longer equals the journal sum. Fatal.
    #[error(
        "ledger invariant violated for user {user}: journal sum {journal_units}, cached {cached_units}"
    )]
    InvariantViolated {
        user: UserId,
        journal_units: i64,
        cached_units: i64,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerEntry {
    /// Append a positive-delta entry inside `tx`.
    ///
    /// If `idempotency_key` is already present the prior entry is
    /// returned unchanged and nothing is written.
    pub async fn credit_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user: UserId,
        amount: FiatAmount,
        reason: LedgerReason,
        idempotency_key: &str,
        now: i64,
    ) -> Result<LedgerEntry, LedgerError> {
        if let Some(prior) = Self::find_by_key_tx(tx, idempotency_key).await? {
            return Ok(prior);
        }
        let balance = Self::balance_tx(tx, user).await?;
        let resulting = balance
            .checked_add(amount)
            .ok_or(LedgerError::Overflow { user })?;
        Self::append_tx(
            tx,
            user,
            FiatDelta::credit(amount),
            reason,
            idempotency_key,
            now,
            resulting,
        )
        .await
    }

    /// Append a negative-delta entry inside `tx`.
    ///
    /// Fails with [`LedgerError::InsufficientFunds`] before writing
    /// anything if the balance does not cover `amount`. Replays by
    /// idempotency key return the prior entry.
    pub async fn debit_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user: UserId,
        amount: FiatAmount,
        reason: LedgerReason,
        idempotency_key: &str,
        now: i64,
    ) -> Result<LedgerEntry, LedgerError> {
        if let Some(prior) = Self::find_by_key_tx(tx, idempotency_key).await? {
            return Ok(prior);
        }
        let balance = Self::balance_tx(tx, user).await?;
        let resulting = balance
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientFunds {
                balance,
                requested: amount,
            })?;
        Self::append_tx(
            tx,
            user,
            FiatDelta::debit(amount),
            reason,
            idempotency_key,
            now,
            resulting,
        )
        .await
    }

    /// Single-statement convenience wrapper around [`credit_tx`](Self::credit_tx).
    pub async fn credit(
        pool: &SqlitePool,
        user: UserId,
        amount: FiatAmount,
        reason: LedgerReason,
        idempotency_key: &str,
        now: i64,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut tx = pool.begin().await?;
        let entry = Self::credit_tx(&mut tx, user, amount, reason, idempotency_key, now).await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Single-statement convenience wrapper around [`debit_tx`](Self::debit_tx).
    pub async fn debit(
        pool: &SqlitePool,
        user: UserId,
        amount: FiatAmount,
        reason: LedgerReason,
        idempotency_key: &str,
        now: i64,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut tx = pool.begin().await?;
        let entry = Self::debit_tx(&mut tx, user, amount, reason, idempotency_key, now).await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Recompute the balance from the journal and compare it with the
    /// cached value on the latest row.
    pub async fn audit(pool: &SqlitePool, user: UserId) -> Result<FiatAmount, LedgerError> {
        let journal_units: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(delta), 0) FROM ledger_entries WHERE user_id = ?",
        )
        .bind(user)
        .fetch_one(pool)
        .await?;

        let cached: Option<FiatAmount> = sqlx::query_scalar(
            "SELECT resulting_balance FROM ledger_entries \
             WHERE user_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(user)
        .fetch_optional(pool)
        .await?;
        let cached_units = cached.map(FiatAmount::units).unwrap_or(0);

        if journal_units != cached_units || journal_units < 0 {
            return Err(LedgerError::InvariantViolated {
                user,
                journal_units,
                cached_units,
            });
        }
        // Checked above: the sum is non-negative.
        FiatAmount::from_units(journal_units).ok_or(LedgerError::InvariantViolated {
            user,
            journal_units,
            cached_units,
        })
    }

    async fn find_by_key_tx(
        tx: &mut Transaction<'_, Sqlite>,
        idempotency_key: &str,
    ) -> Result<Option<LedgerEntry>, sqlx::Error> {
        sqlx::query_as::<_, LedgerEntry>(&format!("{SELECT_COLUMNS} WHERE idempotency_key = ?"))
            .bind(idempotency_key)
            .fetch_optional(&mut **tx)
            .await
    }

    async fn balance_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user: UserId,
    ) -> Result<FiatAmount, sqlx::Error> {
        let balance: Option<FiatAmount> = sqlx::query_scalar(
            "SELECT resulting_balance FROM ledger_entries \
             WHERE user_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(user)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(balance.unwrap_or(FiatAmount::ZERO))
    }

    async fn append_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user: UserId,
        delta: FiatDelta,
        reason: LedgerReason,
        idempotency_key: &str,
        now: i64,
        resulting: FiatAmount,
    ) -> Result<LedgerEntry, LedgerError> {
        let result = sqlx::query(
            "INSERT INTO ledger_entries \
             (user_id, delta, reason, idempotency_key, created_at, resulting_balance) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user)
        .bind(delta)
        .bind(reason)
        .bind(idempotency_key)
        .bind(now)
        .bind(resulting)
        .execute(&mut **tx)
        .await?;
        Ok(LedgerEntry {
            id: result.last_insert_rowid(),
            user_id: user,
            delta,
            reason,
            idempotency_key: idempotency_key.to_string(),
            created_at: now,
            resulting_balance: resulting,
        })
    }
}

/// Current balance of a user (zero if the user has no entries).
#[derive(Debug, Clone, Copy)]
pub struct GetBalance {
    pub user: UserId,
}

impl Processor<GetBalance> for DatabaseProcessor {
    type Output = FiatAmount;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetBalance")]
    async fn process(&self, query: GetBalance) -> Result<FiatAmount, sqlx::Error> {
        let balance: Option<FiatAmount> = sqlx::query_scalar(
            "SELECT resulting_balance FROM ledger_entries \
             WHERE user_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(query.user)
        .fetch_optional(&self.pool)
        .await?;
        Ok(balance.unwrap_or(FiatAmount::ZERO))
    }
}

/// Recent entries for a user, newest first, optionally before an entry id.
#[derive(Debug, Clone, Copy)]
pub struct GetLedgerHistory {
    pub user: UserId,
    pub limit: u32,
    pub before: Option<i64>,
}

impl Processor<GetLedgerHistory> for DatabaseProcessor {
    type Output = Vec<LedgerEntry>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetLedgerHistory")]
    async fn process(&self, query: GetLedgerHistory) -> Result<Vec<LedgerEntry>, sqlx::Error> {
        match query.before {
            Some(before) => {
                sqlx::query_as::<_, LedgerEntry>(&format!(
                    "{SELECT_COLUMNS} WHERE user_id = ? AND id < ? ORDER BY id DESC LIMIT ?"
                ))
                .bind(query.user)
                .bind(before)
                .bind(i64::from(query.limit))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, LedgerEntry>(&format!(
                    "{SELECT_COLUMNS} WHERE user_id = ? ORDER BY id DESC LIMIT ?"
                ))
                .bind(query.user)
                .bind(i64::from(query.limit))
                .fetch_all(&self.pool)
                .await
            }
        }
    }
}

/// Total number of journal rows (all users).
#[derive(Debug, Clone, Copy)]
pub struct CountLedgerEntries;

impl Processor<CountLedgerEntries> for DatabaseProcessor {
    type Output = i64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:CountLedgerEntries")]
    async fn process(&self, _query: CountLedgerEntries) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries")
            .fetch_one(&self.pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    fn usd(dollars: i64, cents: i64) -> FiatAmount {
        FiatAmount::from_units((dollars * 100 + cents) * 100).unwrap()
    }

    fn user(id: i64) -> UserId {
        UserId(id)
    }

    #[tokio::test]
    async fn credit_then_balance() {
        let pool = test_pool().await;
        let entry = LedgerEntry::credit(&pool, user(1), usd(10, 0), LedgerReason::Deposit, "k1", 1000)
            .await
            .unwrap();
        assert_eq!(entry.resulting_balance, usd(10, 0));
        assert!(entry.delta.is_credit());

        let processor = DatabaseProcessor { pool };
        let balance = processor.process(GetBalance { user: user(1) }).await.unwrap();
        assert_eq!(balance, usd(10, 0));
    }

    #[tokio::test]
    async fn balance_of_unknown_user_is_zero() {
        let pool = test_pool().await;
        let processor = DatabaseProcessor { pool };
        let balance = processor.process(GetBalance { user: user(99) }).await.unwrap();
        assert_eq!(balance, FiatAmount::ZERO);
    }

    #[tokio::test]
    async fn credit_replay_returns_prior_entry() {
        let pool = test_pool().await;
        let first = LedgerEntry::credit(&pool, user(1), usd(5, 0), LedgerReason::Deposit, "dup", 1000)
            .await
            .unwrap();
        // Same key, different amount: the prior entry wins, nothing is written.
        let replay =
            LedgerEntry::credit(&pool, user(1), usd(9, 99), LedgerReason::Deposit, "dup", 2000)
                .await
                .unwrap();
        assert_eq!(first, replay);

        let processor = DatabaseProcessor { pool };
        assert_eq!(processor.process(CountLedgerEntries).await.unwrap(), 1);
        assert_eq!(
            processor.process(GetBalance { user: user(1) }).await.unwrap(),
            usd(5, 0)
        );
    }

    #[tokio::test]
    async fn debit_below_balance_fails_without_writing() {
        let pool = test_pool().await;
        LedgerEntry::credit(&pool, user(1), usd(2, 50), LedgerReason::Deposit, "k1", 1000)
            .await
            .unwrap();

        let err = LedgerEntry::debit(&pool, user(1), usd(3, 0), LedgerReason::DebitGame, "k2", 1001)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

        let processor = DatabaseProcessor { pool };
        assert_eq!(processor.process(CountLedgerEntries).await.unwrap(), 1);
        assert_eq!(
            processor.process(GetBalance { user: user(1) }).await.unwrap(),
            usd(2, 50)
        );
    }

    #[tokio::test]
    async fn debit_replay_is_a_no_op() {
        let pool = test_pool().await;
        LedgerEntry::credit(&pool, user(1), usd(5, 0), LedgerReason::Deposit, "k1", 1000)
            .await
            .unwrap();
        let first = LedgerEntry::debit(&pool, user(1), usd(1, 0), LedgerReason::DebitGame, "k2", 1001)
            .await
            .unwrap();
        assert_eq!(first.resulting_balance, usd(4, 0));

        let replay =
            LedgerEntry::debit(&pool, user(1), usd(1, 0), LedgerReason::DebitGame, "k2", 1002)
                .await
                .unwrap();
        assert_eq!(first, replay);

        let processor = DatabaseProcessor { pool };
        assert_eq!(
            processor.process(GetBalance { user: user(1) }).await.unwrap(),
            usd(4, 0)
        );
    }

    #[tokio::test]
    async fn cross_user_balances_are_independent() {
        let pool = test_pool().await;
        LedgerEntry::credit(&pool, user(1), usd(5, 0), LedgerReason::Deposit, "a", 1000)
            .await
            .unwrap();
        LedgerEntry::credit(&pool, user(2), usd(7, 0), LedgerReason::Deposit, "b", 1000)
            .await
            .unwrap();
        LedgerEntry::debit(&pool, user(1), usd(2, 0), LedgerReason::DebitGame, "c", 1001)
            .await
            .unwrap();

        let processor = DatabaseProcessor { pool };
        assert_eq!(
            processor.process(GetBalance { user: user(1) }).await.unwrap(),
            usd(3, 0)
        );
        assert_eq!(
            processor.process(GetBalance { user: user(2) }).await.unwrap(),
            usd(7, 0)
        );
    }

    #[tokio::test]
    async fn history_is_newest_first_and_pages_by_id() {
        let pool = test_pool().await;
        for i in 0..5 {
            LedgerEntry::credit(
                &pool,
                user(1),
                usd(1, 0),
                LedgerReason::CreditGame,
                &format!("k{i}"),
                1000 + i,
            )
            .await
            .unwrap();
        }
        let processor = DatabaseProcessor { pool };
        let page = processor
            .process(GetLedgerHistory {
                user: user(1),
                limit: 2,
                before: None,
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].id > page[1].id);

        let older = processor
            .process(GetLedgerHistory {
                user: user(1),
                limit: 10,
                before: Some(page[1].id),
            })
            .await
            .unwrap();
        assert_eq!(older.len(), 3);
        assert!(older.iter().all(|e| e.id < page[1].id));
    }

    #[tokio::test]
    async fn audit_accepts_consistent_journal() {
        let pool = test_pool().await;
        LedgerEntry::credit(&pool, user(1), usd(10, 0), LedgerReason::Deposit, "k1", 1000)
            .await
            .unwrap();
        LedgerEntry::debit(&pool, user(1), usd(4, 0), LedgerReason::DebitGame, "k2", 1001)
            .await
            .unwrap();
        let balance = LedgerEntry::audit(&pool, user(1)).await.unwrap();
        assert_eq!(balance, usd(6, 0));
    }

    #[tokio::test]
    async fn audit_detects_tampered_cache() {
        let pool = test_pool().await;
        LedgerEntry::credit(&pool, user(1), usd(10, 0), LedgerReason::Deposit, "k1", 1000)
            .await
            .unwrap();
        sqlx::query("UPDATE ledger_entries SET resulting_balance = 1 WHERE user_id = 1")
            .execute(&pool)
            .await
            .unwrap();
        let err = LedgerEntry::audit(&pool, user(1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolated { .. }));
    }
}
