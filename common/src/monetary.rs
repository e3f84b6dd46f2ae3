//! Monetary types for the wallet ledger.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, WalletError};

/// Supported wallet currency.
///
/// The set is closed: every account is provisioned with exactly one wallet per
/// variant, and codes outside this list are rejected at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Rub,
}

impl Currency {
    /// Every supported currency, in provisioning order.
    pub const ALL: [Currency; 3] = [Currency::Usd, Currency::Eur, Currency::Rub];

    /// Get the ISO 4217 code.
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Rub => "RUB",
        }
    }

    /// Get the standard decimal places for this currency.
    pub fn decimal_places(&self) -> u32 {
        match self {
            Currency::Usd | Currency::Eur | Currency::Rub => 2,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "RUB" => Ok(Currency::Rub),
            other => Err(WalletError::validation(format!(
                "unsupported currency: {other:?}"
            ))),
        }
    }
}

/// An ordered pair of currencies for exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    /// Currency being sold.
    pub from: Currency,
    /// Currency being bought.
    pub to: Currency,
}

impl CurrencyPair {
    pub fn new(from: Currency, to: Currency) -> Self {
        Self { from, to }
    }

    /// Get the inverse pair.
    pub fn inverse(&self) -> Self {
        Self {
            from: self.to,
            to: self.from,
        }
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.from, self.to)
    }
}

/// A monetary amount with currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// The amount value.
    pub value: Decimal,
    /// Currency of the amount.
    pub currency: Currency,
}

impl Money {
    /// Largest amount a wallet can hold: the range of `NUMERIC(20, 2)`.
    pub const MAX_VALUE: Decimal = Decimal::from_parts(0x630F_FFFF, 0x6BC7_5E2D, 0x5, false, 2);

    /// Create a new Money instance.
    pub fn new(value: Decimal, currency: Currency) -> Self {
        Self { value, currency }
    }

    /// Validate a caller-supplied amount for a balance mutation.
    ///
    /// The amount must be strictly positive, no larger than
    /// [`Money::MAX_VALUE`] and representable in the currency's minor units.
    pub fn positive(value: Decimal, currency: Currency) -> Result<Self> {
        if value <= Decimal::ZERO {
            return Err(WalletError::validation(format!(
                "amount must be positive, got {value}"
            )));
        }
        if value > Self::MAX_VALUE {
            return Err(WalletError::validation(format!(
                "amount exceeds the maximum of {}, got {value}",
                Self::MAX_VALUE
            )));
        }
        if value.normalize().scale() > currency.decimal_places() {
            return Err(WalletError::validation(format!(
                "{currency} amounts allow at most {} decimal places, got {value}",
                currency.decimal_places()
            )));
        }
        Ok(Self { value, currency })
    }

    /// Check if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.value > Decimal::ZERO
    }

    /// Round to the currency's standard decimal places.
    pub fn round(&self) -> Self {
        Self {
            value: self.value.round_dp(self.currency.decimal_places()),
            currency: self.currency,
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.currency)
    }
}

/// Direction of a balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Increase the balance.
    Credit,
    /// Decrease the balance, only if funds suffice.
    Debit,
}

impl Direction {
    /// Apply this direction to an amount, yielding a signed delta.
    pub fn signed(&self, amount: Decimal) -> Decimal {
        match self {
            Direction::Credit => amount,
            Direction::Debit => -amount,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }
}

impl FromStr for Direction {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "credit" => Ok(Direction::Credit),
            "debit" => Ok(Direction::Debit),
            other => Err(WalletError::validation(format!("unknown direction: {other:?}"))),
        }
    }
}

/// Balances of one account, keyed by currency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Balances(BTreeMap<Currency, Decimal>);

impl Balances {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Get the balance for a currency, if the wallet exists.
    pub fn get(&self, currency: Currency) -> Option<Decimal> {
        self.0.get(&currency).copied()
    }

    pub fn insert(&mut self, currency: Currency, balance: Decimal) {
        self.0.insert(currency, balance);
    }

    pub fn iter(&self) -> impl Iterator<Item = (Currency, Decimal)> + '_ {
        self.0.iter().map(|(c, b)| (*c, *b))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(Currency, Decimal)> for Balances {
    fn from_iter<I: IntoIterator<Item = (Currency, Decimal)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_currency_parse() {
        assert_eq!("usd".parse::<Currency>().unwrap(), Currency::Usd);
        assert_eq!(" EUR ".parse::<Currency>().unwrap(), Currency::Eur);
        let err = "GBP".parse::<Currency>().unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_currency_serializes_as_code() {
        let json = serde_json::to_string(&Currency::Rub).unwrap();
        assert_eq!(json, "\"RUB\"");

        let balances: Balances = [(Currency::Usd, dec!(10.50))].into_iter().collect();
        let json = serde_json::to_string(&balances).unwrap();
        assert_eq!(json, "{\"USD\":\"10.50\"}");
    }

    #[test]
    fn test_positive_amount_validation() {
        assert!(Money::positive(dec!(10.25), Currency::Usd).is_ok());
        assert!(Money::positive(dec!(10.2500), Currency::Usd).is_ok());
        assert!(Money::positive(dec!(0), Currency::Usd).is_err());
        assert!(Money::positive(dec!(-5), Currency::Usd).is_err());
        assert!(Money::positive(dec!(0.001), Currency::Eur).is_err());
    }

    #[test]
    fn test_amount_upper_bound() {
        assert_eq!(Money::MAX_VALUE, dec!(999999999999999999.99));
        assert!(Money::positive(dec!(999999999999999999.99), Currency::Rub).is_ok());

        for amount in [dec!(1000000000000000000), Decimal::MAX] {
            let err = Money::positive(amount, Currency::Usd).unwrap_err();
            assert_eq!(err.error_code(), "VALIDATION_ERROR", "{amount}");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_direction_signed() {
        assert_eq!(Direction::Credit.signed(dec!(5)), dec!(5));
        assert_eq!(Direction::Debit.signed(dec!(5)), dec!(-5));
        assert_eq!("debit".parse::<Direction>().unwrap(), Direction::Debit);
    }

    #[test]
    fn test_money_round() {
        let m = Money::new(dec!(44.996), Currency::Eur).round();
        assert_eq!(m.value, dec!(45.00));
        assert_eq!(m.to_string(), "45.00 EUR");
    }
}
