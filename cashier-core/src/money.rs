//! Money types.
//!
//! Fiat balances are unsigned integer counts of 1/100-cent units
//! (1 USD = 10 000 units); crypto amounts are integer counts of 1e-8
//! units of a specific asset. All arithmetic is checked and exact.
//! `rust_decimal` is used only at the boundaries: parsing provider
//! strings and exchange-rate conversion.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Fiat units per dollar (1/100 of a cent).
const FIAT_UNITS_PER_USD: i64 = 10_000;
/// Fiat units per cent.
const FIAT_UNITS_PER_CENT: i64 = 100;
/// Crypto units per whole coin (8 fractional digits).
const CRYPTO_UNITS_PER_COIN: i64 = 100_000_000;

/// Opaque chat-platform user id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Crypto assets the cashier accepts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum Asset {
    Ltc,
    Ton,
    Sol,
    Usdt,
    Btc,
    Eth,
}

impl Asset {
    pub const ALL: [Asset; 6] = [
        Asset::Ltc,
        Asset::Ton,
        Asset::Sol,
        Asset::Usdt,
        Asset::Btc,
        Asset::Eth,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Asset::Ltc => "LTC",
            Asset::Ton => "TON",
            Asset::Sol => "SOL",
            Asset::Usdt => "USDT",
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
        }
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Asset {
    type Err = UnknownAsset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LTC" => Ok(Asset::Ltc),
            "TON" => Ok(Asset::Ton),
            "SOL" => Ok(Asset::Sol),
            "USDT" => Ok(Asset::Usdt),
            "BTC" => Ok(Asset::Btc),
            "ETH" => Ok(Asset::Eth),
            other => Err(UnknownAsset(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown asset: {0}")]
pub struct UnknownAsset(pub String);

/// Non-negative USD amount in 1/100-cent units.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct FiatAmount(i64);

impl FiatAmount {
    pub const ZERO: FiatAmount = FiatAmount(0);

    /// Construct from whole USD cents.
    pub fn from_cents(cents: u32) -> Self {
        FiatAmount(i64::from(cents) * FIAT_UNITS_PER_CENT)
    }

    /// Construct from raw 1/100-cent units; negative values are rejected.
    pub fn from_units(units: i64) -> Option<Self> {
        (units >= 0).then_some(FiatAmount(units))
    }

    pub fn units(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: FiatAmount) -> Option<FiatAmount> {
        self.0.checked_add(other.0).map(FiatAmount)
    }

    pub fn checked_sub(self, other: FiatAmount) -> Option<FiatAmount> {
        let diff = self.0.checked_sub(other.0)?;
        FiatAmount::from_units(diff)
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, 4)
    }

    /// Convert a USD decimal, rounding *down* to the cent.
    pub fn from_decimal_floor_cents(value: Decimal) -> Option<Self> {
        if value.is_sign_negative() {
            return None;
        }
        let cents = value.round_dp_with_strategy(2, RoundingStrategy::ToZero);
        decimal_to_units(cents, 4).and_then(FiatAmount::from_units)
    }
}

impl std::fmt::Display for FiatAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Whole cents display as dollars-and-cents; sub-cent residue keeps
        // the full four digits.
        if self.0 % FIAT_UNITS_PER_CENT == 0 {
            write!(
                f,
                "${}.{:02}",
                self.0 / FIAT_UNITS_PER_USD,
                (self.0 % FIAT_UNITS_PER_USD) / FIAT_UNITS_PER_CENT
            )
        } else {
            write!(
                f,
                "${}.{:04}",
                self.0 / FIAT_UNITS_PER_USD,
                self.0 % FIAT_UNITS_PER_USD
            )
        }
    }
}

/// Signed fiat movement on a ledger row, in 1/100-cent units.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct FiatDelta(i64);

impl FiatDelta {
    pub fn credit(amount: FiatAmount) -> Self {
        FiatDelta(amount.units())
    }

    pub fn debit(amount: FiatAmount) -> Self {
        FiatDelta(-amount.units())
    }

    pub fn units(self) -> i64 {
        self.0
    }

    pub fn is_credit(self) -> bool {
        self.0 >= 0
    }
}

/// Non-negative amount of a specific crypto asset in 1e-8 units.
///
/// The asset is part of the value; mixing assets is a type error
/// enforced by the conversion functions below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CryptoAmount {
    asset: Asset,
    units: i64,
}

impl CryptoAmount {
    pub fn from_units(asset: Asset, units: i64) -> Option<Self> {
        (units >= 0).then_some(CryptoAmount { asset, units })
    }

    pub fn asset(self) -> Asset {
        self.asset
    }

    pub fn units(self) -> i64 {
        self.units
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.units, 8)
    }

    /// Wire representation at the asset's native precision ("0.12500000").
    pub fn wire_amount(self) -> String {
        format!(
            "{}.{:08}",
            self.units / CRYPTO_UNITS_PER_COIN,
            self.units % CRYPTO_UNITS_PER_COIN
        )
    }

    /// Parse a provider decimal string; amounts finer than 1e-8 are rejected.
    pub fn parse_wire(asset: Asset, raw: &str) -> Option<Self> {
        let value: Decimal = raw.parse().ok()?;
        if value.is_sign_negative() {
            return None;
        }
        decimal_to_units(value, 8).and_then(|units| CryptoAmount::from_units(asset, units))
    }
}

impl std::fmt::Display for CryptoAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.wire_amount(), self.asset)
    }
}

/// Convert a fiat amount into crypto at `usd_per_unit`, rounding the
/// crypto amount *up* to 1e-8 so the payer never underpays.
pub fn crypto_for_fiat(asset: Asset, fiat: FiatAmount, usd_per_unit: Decimal) -> Option<CryptoAmount> {
    if usd_per_unit <= Decimal::ZERO {
        return None;
    }
    let crypto = fiat
        .to_decimal()
        .checked_div(usd_per_unit)?
        .round_dp_with_strategy(8, RoundingStrategy::ToPositiveInfinity);
    decimal_to_units(crypto, 8).and_then(|units| CryptoAmount::from_units(asset, units))
}

/// Convert a crypto amount into fiat at `usd_per_unit`, rounding *down*
/// to the cent so the house never over-credits.
pub fn fiat_for_crypto(crypto: CryptoAmount, usd_per_unit: Decimal) -> Option<FiatAmount> {
    if usd_per_unit <= Decimal::ZERO {
        return None;
    }
    let usd = crypto.to_decimal().checked_mul(usd_per_unit)?;
    FiatAmount::from_decimal_floor_cents(usd)
}

/// Scale a decimal to integer units, rejecting sub-unit residue.
fn decimal_to_units(value: Decimal, scale: u32) -> Option<i64> {
    let scaled = value.checked_mul(Decimal::from(10_i64.pow(scale)))?;
    if !scaled.fract().is_zero() {
        return None;
    }
    scaled.trunc().to_i64()
}
