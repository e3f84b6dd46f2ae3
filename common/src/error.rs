//! Error types for wallet ledger operations.

use crate::{AccountId, Currency};
use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type returned by every ledger operation.
#[derive(Error, Debug)]
pub enum WalletError {
    /// Debit precondition failed. An expected outcome, not a fault.
    #[error("Insufficient funds: {requested} {currency} requested")]
    InsufficientFunds {
        currency: Currency,
        requested: Decimal,
    },

    /// Neither the rate cache nor the rate provider could produce a rate.
    #[error("Exchange rate unavailable: {0}")]
    RateUnavailable(String),

    /// Connection or transaction-level failure in the backing store.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Request rejected before any resource was acquired.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Serializing or writing the notification payload failed.
    #[error("Notification enqueue failed: {0}")]
    NotificationEnqueueFailed(String),

    /// No wallet row exists for the account and currency.
    #[error("Wallet not found: account {account}, currency {currency}")]
    WalletNotFound { account: AccountId, currency: Currency },

    /// The account has no wallets at all.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Wallets were already provisioned for the account.
    #[error("Wallets already provisioned for account {0}")]
    WalletsAlreadyProvisioned(AccountId),

    /// The caller's deadline elapsed before the operation committed.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The operation failed and rolling back its transaction failed too.
    #[error("{error}; rollback also failed: {rollback}")]
    RollbackFailed {
        error: Box<WalletError>,
        rollback: Box<WalletError>,
    },
}

impl WalletError {
    /// Shorthand for a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        WalletError::Validation(message.into())
    }

    /// Merge a failed rollback into the error that triggered it.
    pub fn with_rollback_failure(self, rollback: WalletError) -> Self {
        WalletError::RollbackFailed {
            error: Box::new(self),
            rollback: Box::new(rollback),
        }
    }

    /// The error that caused the operation to fail, looking through a
    /// rollback failure.
    pub fn root_cause(&self) -> &WalletError {
        match self {
            WalletError::RollbackFailed { error, .. } => error.root_cause(),
            other => other,
        }
    }

    /// Check if this error is retryable by the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            WalletError::RateUnavailable(_)
            | WalletError::StoreUnavailable(_)
            | WalletError::DeadlineExceeded => true,
            WalletError::RollbackFailed { error, .. } => error.is_retryable(),
            _ => false,
        }
    }

    /// Check if this is an expected business outcome rather than a fault.
    pub fn is_expected(&self) -> bool {
        matches!(
            self.root_cause(),
            WalletError::InsufficientFunds { .. } | WalletError::Validation(_)
        )
    }

    /// Get a stable error code for the outer API layer.
    pub fn error_code(&self) -> &'static str {
        match self {
            WalletError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            WalletError::RateUnavailable(_) => "RATE_UNAVAILABLE",
            WalletError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            WalletError::Validation(_) => "VALIDATION_ERROR",
            WalletError::NotificationEnqueueFailed(_) => "NOTIFICATION_ENQUEUE_FAILED",
            WalletError::WalletNotFound { .. } => "WALLET_NOT_FOUND",
            WalletError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            WalletError::WalletsAlreadyProvisioned(_) => "WALLETS_ALREADY_PROVISIONED",
            WalletError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            WalletError::RollbackFailed { error, .. } => error.error_code(),
        }
    }
}

/// Result type alias for wallet operations.
pub type Result<T> = std::result::Result<T, WalletError>;
