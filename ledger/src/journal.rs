//! Append-only audit records for wallet balance mutations.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use wallet_common::{Balances, Currency, Direction, OperationKind, RecordId, WalletId};

/// A single immutable entry in the transaction audit log.
///
/// Exactly one record exists per committed balance mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Unique record ID.
    pub id: RecordId,
    /// Wallet whose balance changed.
    pub wallet_id: WalletId,
    /// Currency of the wallet.
    pub currency: Currency,
    /// Amount moved, always positive.
    pub amount: Decimal,
    /// Whether the wallet was credited or debited.
    pub direction: Direction,
    /// Operation that caused the mutation.
    pub kind: OperationKind,
    /// The other wallet involved, for exchange legs.
    pub counterparty_wallet_id: Option<WalletId>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Create a record for a mutation of `wallet_id`.
    pub fn new(
        wallet_id: WalletId,
        currency: Currency,
        amount: Decimal,
        direction: Direction,
        kind: OperationKind,
    ) -> Self {
        Self {
            id: RecordId::new(),
            wallet_id,
            currency,
            amount,
            direction,
            kind,
            counterparty_wallet_id: None,
            created_at: Utc::now(),
        }
    }

    /// Name the other wallet of an exchange.
    pub fn with_counterparty(mut self, wallet_id: WalletId) -> Self {
        self.counterparty_wallet_id = Some(wallet_id);
        self
    }

    /// Get the signed effect of this record on its wallet balance.
    pub fn signed_amount(&self) -> Decimal {
        self.direction.signed(self.amount)
    }
}

/// Sum the audit log into per-currency net balances.
///
/// For a wallet provisioned at zero, the result equals the committed balance.
pub fn net_balances<'a>(records: impl IntoIterator<Item = &'a TransactionRecord>) -> Balances {
    let mut net = Balances::new();
    for record in records {
        let current = net.get(record.currency).unwrap_or(Decimal::ZERO);
        net.insert(record.currency, current + record.signed_amount());
    }
    net
}
