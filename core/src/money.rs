//! Currency precision and minor-unit conversion.
//!
//! Processors disagree on amount encoding: Stripe and Square send integer
//! minor units, PayPal sends decimal strings. Everything inside the core is
//! a `Decimal` in major units, rounded to the currency's precision.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// ISO 4217 currencies with no minor unit.
const ZERO_DECIMAL: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

/// Decimal places for `currency` (case-insensitive).
pub fn decimals(currency: &str) -> u32 {
    let upper = currency.to_ascii_uppercase();
    if ZERO_DECIMAL.contains(&upper.as_str()) {
        0
    } else {
        2
    }
}

/// A currency code is three ASCII letters.
pub fn is_valid_currency(currency: &str) -> bool {
    currency.len() == 3 && currency.chars().all(|c| c.is_ascii_alphabetic())
}

pub fn normalize_currency(currency: &str) -> String {
    currency.to_ascii_uppercase()
}

/// Integer minor units (cents) → major units.
pub fn from_minor_units(minor: i64, currency: &str) -> Decimal {
    Decimal::new(minor, decimals(currency))
}

/// Major units → integer minor units, rounding to the currency precision.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Option<i64> {
    let scale = decimals(currency);
    let rounded = round(amount, currency);
    let factor = Decimal::from(10i64.pow(scale));
    (rounded * factor).to_i64()
}

/// Parse a decimal string ("12.30") into major units of `currency`.
pub fn parse_decimal(raw: &str, currency: &str) -> Option<Decimal> {
    Decimal::from_str(raw.trim()).ok().map(|d| round(d, currency))
}

/// Banker's rounding to the currency's minor unit.
pub fn round(amount: Decimal, currency: &str) -> Decimal {
    amount.round_dp_with_strategy(decimals(currency), RoundingStrategy::MidpointNearestEven)
}

/// One minor unit of `currency`, the tolerance for fee conservation checks.
pub fn minor_unit(currency: &str) -> Decimal {
    Decimal::new(1, decimals(currency))
}
