//! Store access plumbing.
//!
//! Read queries are [`kanau::processor::Processor`] messages executed by
//! a [`DatabaseProcessor`]; multi-statement writes go through explicit
//! `sqlx::Transaction`s via the `*_tx` functions on the entity types.

use sqlx::SqlitePool;

pub trait DatabaseAccessor {
    fn acquire(&mut self) -> impl sqlx::SqliteExecutor<'_>;
}

pub struct DatabaseProcessor {
    pub pool: SqlitePool,
}

pub struct TransactionProcessor<'b> {
    pub tx: sqlx::Transaction<'b, sqlx::Sqlite>,
}

impl DatabaseAccessor for DatabaseProcessor {
    fn acquire(&mut self) -> impl sqlx::SqliteExecutor<'_> {
        &self.pool
    }
}

impl<'b> DatabaseAccessor for TransactionProcessor<'b> {
    fn acquire(&mut self) -> impl sqlx::SqliteExecutor<'_> {
        &mut *self.tx
    }
}
