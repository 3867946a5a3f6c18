//! Typed client for the CryptoBot Crypto Pay HTTP API.
//!
//! Covers the subset of the API the cashier needs: app identity,
//! exchange rates, invoice creation/listing, and transfers
//! (withdrawals). The client is stateless; concurrent calls share one
//! pooled `reqwest::Client`.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod client;
pub mod objects;

pub use client::{CryptoPayClient, CryptoPayError};
