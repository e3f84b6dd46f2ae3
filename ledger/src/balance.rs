//! Wallet balance snapshots and conditional update outcomes.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use wallet_common::{AccountId, Balances, Currency, WalletId};

/// State of an account right after a balance mutation, as seen by the
/// transaction that made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSnapshot {
    /// The account.
    pub account_id: AccountId,
    /// Wallet that was mutated.
    pub wallet_id: WalletId,
    /// Currency of the mutated wallet.
    pub currency: Currency,
    /// Every balance of the account, including the mutated one.
    pub balances: Balances,
}

impl WalletSnapshot {
    /// Balance of the mutated wallet.
    pub fn balance(&self) -> Decimal {
        self.balances.get(self.currency).unwrap_or(Decimal::ZERO)
    }
}

/// Result of a conditional balance update.
///
/// `InsufficientFunds` is a normal outcome: nothing was written, the
/// transaction is still usable, and the caller decides whether to roll back.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdjustOutcome {
    /// The update was applied.
    Applied(WalletSnapshot),
    /// The debit precondition `balance >= amount` did not hold.
    InsufficientFunds,
}

impl AdjustOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, AdjustOutcome::Applied(_))
    }
}
