//! Results returned by engine operations.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use wallet_common::{AccountId, Balances, Currency, Money};
use wallet_ledger::WalletSnapshot;

/// Outcome of a committed currency exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeReceipt {
    /// Account state after both legs, as seen by the exchanging transaction.
    pub snapshot: WalletSnapshot,
    /// Rate applied, in `target` units per one `source` unit.
    pub rate: Decimal,
    /// Amount debited.
    pub source: Money,
    /// Amount credited.
    pub target: Money,
    /// Human-readable confirmation.
    pub message: String,
}

impl ExchangeReceipt {
    pub fn new(snapshot: WalletSnapshot, rate: Decimal, source: Money, target: Money) -> Self {
        let message = format!("Exchanged {source} for {target} at rate {rate}");
        Self {
            snapshot,
            rate,
            source,
            target,
            message,
        }
    }

    pub fn balances(&self) -> &Balances {
        &self.snapshot.balances
    }
}

/// Comparison of committed balances with the audit log of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub account_id: AccountId,
    /// Committed balances.
    pub balances: Balances,
    /// Net of credits minus debits per currency in the audit log.
    pub audited: Balances,
    /// Currencies where the two disagree.
    pub mismatches: Vec<Currency>,
}

impl IntegrityReport {
    pub fn new(account_id: AccountId, balances: Balances, audited: Balances) -> Self {
        let mismatches = balances
            .iter()
            .filter(|(currency, balance)| {
                audited.get(*currency).unwrap_or(Decimal::ZERO) != *balance
            })
            .map(|(currency, _)| currency)
            .chain(
                audited
                    .iter()
                    .filter(|(currency, _)| balances.get(*currency).is_none())
                    .map(|(currency, _)| currency),
            )
            .collect();

        Self {
            account_id,
            balances,
            audited,
            mismatches,
        }
    }

    /// Check if every balance is explained by the audit log.
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}
