//! The Crypto Pay HTTP client.

use crate::objects::{
    ApiResponse, AppInfo, CreateInvoiceRequest, ExchangeRateItem, GetInvoicesRequest, InvoiceDto,
    TransferDto, TransferRequest,
};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

/// Header carrying the shared API token.
const AUTH_HEADER: &str = "Crypto-Pay-API-Token";

/// Hard wall-clock deadline for every request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Provider error codes that are safe to retry (rate limiting and
/// provider-side outages). Everything else is definitive.
const TRANSIENT_API_CODES: &[i32] = &[429, 500, 502, 503];

/// Errors produced by the Crypto Pay client.
#[derive(Debug, thiserror::Error)]
pub enum CryptoPayError {
    /// Transport-level failure (DNS, TLS, connection reset, timeout, …).
    #[error("http error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The provider answered `{ok: false}` with a definitive error.
    #[error("provider error {code}: {name}")]
    Api { code: i32, name: String },

    /// The provider answered `{ok: true}` without a result payload.
    #[error("provider returned ok without a result")]
    MissingResult,

    /// The base URL could not be joined with the endpoint path.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl CryptoPayError {
    /// Whether the operation may succeed if simply retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            CryptoPayError::Transport(_) => true,
            CryptoPayError::Api { code, .. } => TRANSIENT_API_CODES.contains(code),
            CryptoPayError::MissingResult | CryptoPayError::Url(_) => false,
        }
    }
}

/// Typed HTTP client for the Crypto Pay API.
///
/// Stateless apart from the pooled `reqwest::Client`; cloning is cheap
/// and concurrent calls are permitted.
#[derive(Debug, Clone)]
pub struct CryptoPayClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl CryptoPayClient {
    const API_BASE_URL: &str = "https://pay.crypt.bot/api/";

    /// Create a client for the production API.
    pub fn new(token: impl Into<String>) -> Result<Self, CryptoPayError> {
        let base_url = Url::parse(Self::API_BASE_URL)?;
        Self::with_base_url(token, base_url)
    }

    /// Create a client against a custom base URL (testnet, local stub).
    pub fn with_base_url(token: impl Into<String>, base_url: Url) -> Result<Self, CryptoPayError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self {
            http,
            base_url,
            token: token.into(),
        })
    }

    /// `GET /getMe` – identity of the app the token belongs to.
    pub async fn get_me(&self) -> Result<AppInfo, CryptoPayError> {
        let url = self.base_url.join("getMe")?;
        let resp = self
            .http
            .get(url)
            .header(AUTH_HEADER, &self.token)
            .send()
            .await?;
        parse_response(resp).await
    }

    /// `GET /getExchangeRates` – all crypto/fiat rate pairs.
    pub async fn get_exchange_rates(&self) -> Result<Vec<ExchangeRateItem>, CryptoPayError> {
        let url = self.base_url.join("getExchangeRates")?;
        let resp = self
            .http
            .get(url)
            .header(AUTH_HEADER, &self.token)
            .send()
            .await?;
        parse_response(resp).await
    }

    /// `POST /createInvoice` – issue a new payment request.
    pub async fn create_invoice(
        &self,
        request: &CreateInvoiceRequest,
    ) -> Result<InvoiceDto, CryptoPayError> {
        let url = self.base_url.join("createInvoice")?;
        let resp = self
            .http
            .post(url)
            .header(AUTH_HEADER, &self.token)
            .json(request)
            .send()
            .await?;
        parse_response(resp).await
    }

    /// `GET /getInvoices` – paged invoice listing with optional status filter.
    pub async fn get_invoices(
        &self,
        request: GetInvoicesRequest,
    ) -> Result<Vec<InvoiceDto>, CryptoPayError> {
        let url = self.base_url.join("getInvoices")?;
        let mut query: Vec<(&str, String)> = vec![
            ("count", request.count.to_string()),
            ("offset", request.offset.to_string()),
        ];
        if let Some(status) = request.status {
            query.push(("status", status.as_query().to_string()));
        }
        let resp = self
            .http
            .get(url)
            .header(AUTH_HEADER, &self.token)
            .query(&query)
            .send()
            .await?;
        let page: InvoicePage = parse_response(resp).await?;
        Ok(page.items)
    }

    /// `POST /transfer` – send crypto to a Telegram user (withdrawal).
    pub async fn transfer(&self, request: &TransferRequest) -> Result<TransferDto, CryptoPayError> {
        let url = self.base_url.join("transfer")?;
        let resp = self
            .http
            .post(url)
            .header(AUTH_HEADER, &self.token)
            .json(request)
            .send()
            .await?;
        parse_response(resp).await
    }
}

/// `getInvoices` wraps its items one level deeper than the envelope.
#[derive(Debug, Deserialize)]
struct InvoicePage {
    items: Vec<InvoiceDto>,
}

/// Unwrap the `{ok, result | error}` envelope.
async fn parse_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, CryptoPayError> {
    let envelope: ApiResponse<T> = resp.json().await?;
    if envelope.ok {
        envelope.result.ok_or(CryptoPayError::MissingResult)
    } else {
        let (code, name) = envelope
            .error
            .map(|e| (e.code, e.name))
            .unwrap_or((0, "UNKNOWN".to_string()));
        Err(CryptoPayError::Api { code, name })
    }
}
