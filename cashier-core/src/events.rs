//! Event channel factories and handles.
//!
//! The only event in the system is orphan recovery: an invoice that was
//! created at the provider but failed to persist locally is handed to
//! the reconciler, which adopts it by provider id on its next tick.

use crate::money::{CryptoAmount, FiatAmount, UserId};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Default buffer size for event channels.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// An invoice that exists at the provider but not yet in the registry.
#[derive(Debug, Clone)]
pub struct OrphanInvoice {
    pub provider_invoice_id: i64,
    pub local_id: Uuid,
    pub user: UserId,
    pub crypto: CryptoAmount,
    pub fiat_at_issue: FiatAmount,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Sender handle for OrphanInvoice events.
pub type OrphanInvoiceSender = mpsc::Sender<OrphanInvoice>;
/// Receiver handle for OrphanInvoice events.
pub type OrphanInvoiceReceiver = mpsc::Receiver<OrphanInvoice>;

/// Create a new OrphanInvoice channel.
pub fn orphan_invoice_channel() -> (OrphanInvoiceSender, OrphanInvoiceReceiver) {
    mpsc::channel(DEFAULT_CHANNEL_BUFFER)
}
