//! Rate cache and provider error types.

use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;
use wallet_common::{CurrencyPair, WalletError};

/// Errors that can occur while obtaining exchange rates.
#[derive(Debug, Error)]
pub enum FxError {
    /// Rate not available for the requested currency pair.
    #[error("Rate not available for {0}")]
    RateNotAvailable(CurrencyPair),

    /// Provider returned an error.
    #[error("Rate provider error: {0}")]
    ProviderError(String),

    /// A single provider call did not finish in time.
    #[error("Rate provider timed out after {0:?}")]
    Timeout(Duration),

    /// Provider returned a rate that cannot be used for conversion.
    #[error("Invalid rate {rate} for {pair}")]
    InvalidRate { pair: CurrencyPair, rate: Decimal },

    /// Every attempt of a retried call failed.
    #[error("Rate provider failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<FxError> },
}

/// Result type for rate operations.
pub type FxResult<T> = Result<T, FxError>;

impl From<FxError> for WalletError {
    fn from(err: FxError) -> Self {
        WalletError::RateUnavailable(err.to_string())
    }
}
