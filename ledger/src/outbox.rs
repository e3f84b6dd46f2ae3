//! Transactional outbox for balance-change notifications.
//!
//! Events are written in the same store transaction as the mutation they
//! describe and delivered after commit by an independent publisher.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use wallet_common::{AccountId, Balances, Currency, EventId, OperationKind, Result, WalletError};

/// Notification payload consumed by the external messaging system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Envelope ID, the idempotency key for consumers.
    pub envelope_id: EventId,
    /// Operation that produced the event.
    pub kind: OperationKind,
    /// Account whose balances changed.
    pub account_id: AccountId,
    /// Amount of the operation.
    pub amount: Decimal,
    /// Currency of `amount`.
    pub currency: Currency,
    /// Balances of the account after the mutation.
    pub balance_after: Balances,
    /// When the mutation happened.
    pub occurred_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(
        kind: OperationKind,
        account_id: AccountId,
        amount: Decimal,
        currency: Currency,
        balance_after: Balances,
    ) -> Self {
        Self {
            envelope_id: EventId::new(),
            kind,
            account_id,
            amount,
            currency,
            balance_after,
            occurred_at: Utc::now(),
        }
    }
}

/// A durable outbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Same as the payload's envelope ID.
    pub id: EventId,
    pub kind: OperationKind,
    pub account_id: AccountId,
    /// JSON-encoded [`NotificationEvent`].
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Serialize a notification into an outbox row.
    pub fn from_notification(event: &NotificationEvent) -> Result<Self> {
        let payload = serde_json::to_string(event)
            .map_err(|e| WalletError::NotificationEnqueueFailed(e.to_string()))?;

        Ok(Self {
            id: event.envelope_id,
            kind: event.kind,
            account_id: event.account_id,
            payload,
            created_at: event.occurred_at,
        })
    }

    /// Decode the payload back into a notification.
    pub fn notification(&self) -> Result<NotificationEvent> {
        serde_json::from_str(&self.payload)
            .map_err(|e| WalletError::NotificationEnqueueFailed(e.to_string()))
    }
}
