//! Rate quotes and conversion arithmetic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use wallet_common::{Currency, CurrencyPair, Money, WalletError};

/// Rates keyed by currency, as returned by the provider's bulk query.
pub type RateTable = BTreeMap<Currency, Decimal>;

/// A full rate table together with the moment it was fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct RateSnapshot {
    pub rates: RateTable,
    pub observed_at: DateTime<Utc>,
}

/// A single pair rate: units of `pair.to` per one unit of `pair.from`.
#[derive(Debug, Clone, PartialEq)]
pub struct PairQuote {
    pub pair: CurrencyPair,
    pub rate: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl PairQuote {
    pub fn new(pair: CurrencyPair, rate: Decimal) -> Self {
        Self {
            pair,
            rate,
            observed_at: Utc::now(),
        }
    }

    /// Convert a `pair.from` amount into `pair.to`, rounded to the target
    /// currency's minor units.
    pub fn convert(&self, amount: &Money) -> Result<Money, WalletError> {
        if amount.currency != self.pair.from {
            return Err(WalletError::validation(format!(
                "quote for {} cannot convert {}",
                self.pair, amount.currency
            )));
        }

        let value = amount.value.checked_mul(self.rate).ok_or_else(|| {
            WalletError::validation(format!(
                "{amount} at rate {} overflows {}",
                self.rate, self.pair.to
            ))
        })?;
        Ok(Money::new(value, self.pair.to).round())
    }
}
