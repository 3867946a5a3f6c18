pub mod invoices;
pub mod ledger;

/// Why a ledger row moved a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerReason {
    Deposit,
    DebitGame,
    CreditGame,
    Adjustment,
    Withdrawal,
}

/// Invoice lifecycle state.
///
/// Created as `Pending`, transitions monotonically to exactly one of
/// the terminal states and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Expired,
    Cancelled,
}

impl InvoiceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InvoiceStatus::Pending)
    }
}
