//! Shared fixtures for the colocated test modules.

use crate::money::Asset;
use crate::provider::PayProvider;
use async_trait::async_trait;
use cashier_cryptopay::CryptoPayError;
use cashier_cryptopay::objects::{
    AppInfo, CreateInvoiceRequest, ExchangeRateItem, GetInvoicesRequest, InvoiceDto, TransferDto,
    TransferRequest, WireInvoiceStatus,
};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Fresh single-connection in-memory store with the schema applied.
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("../migrations").run(&pool).await.unwrap();
    pool
}

/// Scriptable in-memory stand-in for the Crypto Pay API.
#[derive(Default)]
pub(crate) struct MockProvider {
    pub rates: Mutex<Vec<ExchangeRateItem>>,
    pub paid_invoices: Mutex<Vec<InvoiceDto>>,
    pub created_requests: Mutex<Vec<CreateInvoiceRequest>>,
    pub transfer_requests: Mutex<Vec<TransferRequest>>,
    pub next_invoice_id: AtomicI64,
    pub fail_rates: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_list: AtomicBool,
    pub reject_transfer: AtomicBool,
}

impl MockProvider {
    pub fn new() -> Self {
        let mock = Self::default();
        mock.next_invoice_id.store(100, Ordering::SeqCst);
        mock
    }

    pub fn set_rate(&self, asset: Asset, rate: &str) {
        let mut rates = self.rates.lock().unwrap();
        rates.retain(|r| r.source != asset.as_str());
        rates.push(ExchangeRateItem {
            is_valid: true,
            source: asset.as_str().to_string(),
            target: "USD".to_string(),
            rate: rate.to_string(),
        });
    }

    pub fn add_paid_invoice(&self, invoice_id: i64, asset: Asset, amount: &str) {
        self.paid_invoices
            .lock()
            .unwrap()
            .push(paid_dto(invoice_id, asset, amount));
    }

    // Retryable provider failure. reqwest transport errors cannot be
    // constructed without a socket, so a transient API code stands in.
    fn transient_error() -> CryptoPayError {
        CryptoPayError::Api {
            code: 503,
            name: "SERVICE_UNAVAILABLE".to_string(),
        }
    }
}

pub(crate) fn paid_dto(invoice_id: i64, asset: Asset, amount: &str) -> InvoiceDto {
    InvoiceDto {
        invoice_id,
        status: WireInvoiceStatus::Paid,
        hash: format!("hash{invoice_id}"),
        asset: asset.as_str().to_string(),
        amount: amount.to_string(),
        pay_url: format!("https://t.me/CryptoBot?start=hash{invoice_id}"),
        mini_app_invoice_url: None,
        web_app_invoice_url: None,
        created_at: "2025-07-01T12:00:00.000Z".to_string(),
        expiration_date: None,
        paid_at: Some("2025-07-01T12:05:00.000Z".to_string()),
        hidden_message: None,
    }
}

#[async_trait]
impl PayProvider for MockProvider {
    async fn get_me(&self) -> Result<AppInfo, CryptoPayError> {
        Ok(AppInfo {
            app_id: 1,
            name: "mock".to_string(),
            payment_processing_bot_username: "CryptoBot".to_string(),
        })
    }

    async fn get_exchange_rates(&self) -> Result<Vec<ExchangeRateItem>, CryptoPayError> {
        if self.fail_rates.load(Ordering::SeqCst) {
            return Err(Self::transient_error());
        }
        Ok(self.rates.lock().unwrap().clone())
    }

    async fn create_invoice(
        &self,
        request: &CreateInvoiceRequest,
    ) -> Result<InvoiceDto, CryptoPayError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Self::transient_error());
        }
        let id = self.next_invoice_id.fetch_add(1, Ordering::SeqCst);
        let asset: Asset = request.asset.parse().map_err(|_| CryptoPayError::Api {
            code: 400,
            name: "ASSET_NOT_SUPPORTED".to_string(),
        })?;
        let mut dto = paid_dto(id, asset, &request.amount);
        dto.status = WireInvoiceStatus::Active;
        dto.paid_at = None;
        dto.hidden_message = Some(request.hidden_message.clone());
        self.created_requests.lock().unwrap().push(request.clone());
        Ok(dto)
    }

    async fn get_invoices(
        &self,
        request: GetInvoicesRequest,
    ) -> Result<Vec<InvoiceDto>, CryptoPayError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(Self::transient_error());
        }
        let all = self.paid_invoices.lock().unwrap();
        let matches: Vec<InvoiceDto> = all
            .iter()
            .filter(|i| request.status.is_none_or(|s| i.status == s))
            .skip(request.offset as usize)
            .take(request.count as usize)
            .cloned()
            .collect();
        Ok(matches)
    }

    async fn transfer(&self, request: &TransferRequest) -> Result<TransferDto, CryptoPayError> {
        if self.reject_transfer.load(Ordering::SeqCst) {
            return Err(CryptoPayError::Api {
                code: 400,
                name: "NOT_ENOUGH_COINS".to_string(),
            });
        }
        self.transfer_requests.lock().unwrap().push(request.clone());
        Ok(TransferDto {
            transfer_id: 1,
            user_id: request.user_id,
            asset: request.asset.clone(),
            amount: request.amount.clone(),
            status: "completed".to_string(),
            completed_at: "2025-07-01T12:00:00.000Z".to_string(),
        })
    }
}
