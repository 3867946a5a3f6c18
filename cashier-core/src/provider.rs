//! Provider abstraction.
//!
//! Processors and the facade talk to the payment provider through this
//! trait so that the reconciliation and quoting logic can be exercised
//! against a scripted stand-in.

use async_trait::async_trait;
use cashier_cryptopay::objects::{
    AppInfo, CreateInvoiceRequest, ExchangeRateItem, GetInvoicesRequest, InvoiceDto, TransferDto,
    TransferRequest,
};
use cashier_cryptopay::{CryptoPayClient, CryptoPayError};

#[async_trait]
pub trait PayProvider: Send + Sync {
    async fn get_me(&self) -> Result<AppInfo, CryptoPayError>;

    async fn get_exchange_rates(&self) -> Result<Vec<ExchangeRateItem>, CryptoPayError>;

    async fn create_invoice(
        &self,
        request: &CreateInvoiceRequest,
    ) -> Result<InvoiceDto, CryptoPayError>;

    async fn get_invoices(
        &self,
        request: GetInvoicesRequest,
    ) -> Result<Vec<InvoiceDto>, CryptoPayError>;

    async fn transfer(&self, request: &TransferRequest) -> Result<TransferDto, CryptoPayError>;
}

#[async_trait]
impl PayProvider for CryptoPayClient {
    async fn get_me(&self) -> Result<AppInfo, CryptoPayError> {
        CryptoPayClient::get_me(self).await
    }

    async fn get_exchange_rates(&self) -> Result<Vec<ExchangeRateItem>, CryptoPayError> {
        CryptoPayClient::get_exchange_rates(self).await
    }

    async fn create_invoice(
        &self,
        request: &CreateInvoiceRequest,
    ) -> Result<InvoiceDto, CryptoPayError> {
        CryptoPayClient::create_invoice(self, request).await
    }

    async fn get_invoices(
        &self,
        request: GetInvoicesRequest,
    ) -> Result<Vec<InvoiceDto>, CryptoPayError> {
        CryptoPayClient::get_invoices(self, request).await
    }

    async fn transfer(&self, request: &TransferRequest) -> Result<TransferDto, CryptoPayError> {
        CryptoPayClient::transfer(self, request).await
    }
}
