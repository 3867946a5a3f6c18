use rust_decimal::Decimal;
use serde::Deserialize;

/// One element of the `GET /getExchangeRates` result.
///
/// `rate` is a decimal string on the wire; [`parsed_rate`](Self::parsed_rate)
/// converts it without binary-float drift.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeRateItem {
    pub is_valid: bool,
    pub source: String,
    pub target: String,
    pub rate: String,
}

impl ExchangeRateItem {
    /// Parse the rate string into a `Decimal`, or `None` if malformed.
    pub fn parsed_rate(&self) -> Option<Decimal> {
        self.rate.parse().ok()
    }

    /// True if this item quotes `asset` against USD and is usable.
    pub fn is_usd_rate_for(&self, asset: &str) -> bool {
        self.is_valid && self.source == asset && self.target == "USD"
    }
}
