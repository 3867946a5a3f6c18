//! Wire objects for the Crypto Pay API.
//!
//! Every endpoint wraps its payload in the same `{ok, result | error}`
//! envelope. Monetary fields arrive as decimal strings and are parsed
//! at the edge; see the helpers on the individual DTOs.

pub mod app;
pub mod invoice;
pub mod rates;
pub mod transfer;

pub use app::AppInfo;
pub use invoice::{CreateInvoiceRequest, GetInvoicesRequest, InvoiceDto, WireInvoiceStatus};
pub use rates::ExchangeRateItem;
pub use transfer::{TransferDto, TransferRequest};

use serde::Deserialize;

/// Response envelope shared by all Crypto Pay endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(default)]
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<ApiError>,
}

/// Provider-side error: `{ok: false, error: {code, name}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    pub code: i32,
    pub name: String,
}
