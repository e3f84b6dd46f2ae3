//! Storage seam for the ledger.
//!
//! Every balance mutation goes through a [`LedgerTransaction`]. Dropping a
//! transaction without committing it discards all of its writes.

use async_trait::async_trait;
use rust_decimal::Decimal;
use wallet_common::{AccountId, Balances, Currency, Direction, EventId, Result};

use crate::balance::AdjustOutcome;
use crate::journal::TransactionRecord;
use crate::outbox::OutboxEvent;

/// Durable wallet balances, audit log and outbox.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Acquire a connection and open a transaction on it.
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>>;

    /// Read committed balances of an account. Empty if it has no wallets.
    async fn read_balances(&self, account: AccountId) -> Result<Balances>;

    /// Read the committed audit log of an account, oldest first.
    async fn transaction_records(&self, account: AccountId) -> Result<Vec<TransactionRecord>>;

    /// Read up to `limit` undelivered outbox events, oldest first.
    async fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEvent>>;

    /// Mark outbox events as delivered.
    async fn mark_published(&self, ids: &[EventId]) -> Result<()>;
}

/// An open store transaction.
#[async_trait]
pub trait LedgerTransaction: Send {
    /// Credit or conditionally debit one wallet.
    ///
    /// A debit is a single atomic read-modify-write that only applies when
    /// `balance >= amount`; otherwise nothing is written and
    /// [`AdjustOutcome::InsufficientFunds`] is returned.
    async fn adjust_balance(
        &mut self,
        account: AccountId,
        currency: Currency,
        amount: Decimal,
        direction: Direction,
    ) -> Result<AdjustOutcome>;

    /// Append an audit record for a mutation made in this transaction.
    async fn append_transaction_record(&mut self, record: &TransactionRecord) -> Result<()>;

    /// Insert one zero-balance wallet per supported currency.
    ///
    /// Not idempotent: provisioning an account twice fails with
    /// `WalletsAlreadyProvisioned`.
    async fn provision_wallets(&mut self, account: AccountId) -> Result<()>;

    /// Write a notification into the outbox.
    async fn enqueue_event(&mut self, event: &OutboxEvent) -> Result<()>;

    /// Make every write of this transaction visible atomically.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every write of this transaction.
    async fn rollback(self: Box<Self>) -> Result<()>;
}
