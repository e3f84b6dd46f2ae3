//! Wallet Ledger
//!
//! Per-currency wallet balances with atomic conditional debits, an
//! append-only audit log and a transactional notification outbox.

pub mod balance;
pub mod journal;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod store;

pub use balance::{AdjustOutcome, WalletSnapshot};
pub use journal::{net_balances, TransactionRecord};
pub use memory::{FaultPoint, MemoryLedgerStore, MemoryStoreConfig};
pub use outbox::{NotificationEvent, OutboxEvent};
pub use postgres::PgLedgerStore;
pub use store::{LedgerStore, LedgerTransaction};
