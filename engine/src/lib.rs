//! Currency Wallet Engine
//!
//! Orchestrates deposits, withdrawals and currency exchange on top of the
//! wallet ledger and the rate cache, and relays committed notifications
//! from the outbox.

pub mod config;
pub mod context;
pub mod engine;
pub mod publisher;
pub mod receipt;

pub use config::{DatabaseConfig, EngineConfig, LedgerConfig, PublisherConfig};
pub use context::RequestContext;
pub use engine::LedgerEngine;
pub use publisher::{ChannelSink, Delivery, EventSink, OutboxPublisher, PublishError, TracingSink};
pub use receipt::{ExchangeReceipt, IntegrityReport};
