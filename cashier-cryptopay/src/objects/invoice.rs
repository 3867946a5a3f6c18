use serde::{Deserialize, Serialize};

/// Invoice status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireInvoiceStatus {
    Active,
    Paid,
    Expired,
}

impl WireInvoiceStatus {
    /// Query-parameter representation for `GET /getInvoices`.
    pub fn as_query(self) -> &'static str {
        match self {
            WireInvoiceStatus::Active => "active",
            WireInvoiceStatus::Paid => "paid",
            WireInvoiceStatus::Expired => "expired",
        }
    }
}

/// `POST /createInvoice` request body.
///
/// `amount` is a decimal string; the caller formats it to the asset's
/// native precision. Comments and anonymous payments are always
/// disabled for cashier invoices.
#[derive(Debug, Clone, Serialize)]
pub struct CreateInvoiceRequest {
    pub asset: String,
    pub amount: String,
    pub description: String,
    pub hidden_message: String,
    pub expires_in: u64,
    pub allow_comments: bool,
    pub allow_anonymous: bool,
}

/// Filters for `GET /getInvoices`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetInvoicesRequest {
    pub status: Option<WireInvoiceStatus>,
    pub offset: u32,
    pub count: u32,
}

/// Invoice record as returned by `createInvoice` and `getInvoices`.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceDto {
    pub invoice_id: i64,
    pub status: WireInvoiceStatus,
    pub hash: String,
    pub asset: String,
    pub amount: String,
    pub pay_url: String,
    #[serde(default)]
    pub mini_app_invoice_url: Option<String>,
    #[serde(default)]
    pub web_app_invoice_url: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub expiration_date: Option<String>,
    #[serde(default)]
    pub paid_at: Option<String>,
    #[serde(default)]
    pub hidden_message: Option<String>,
}
