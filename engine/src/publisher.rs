//! Outbox publisher.
//!
//! Polls undelivered outbox rows and hands them to an [`EventSink`]. A row is
//! marked published only after the sink accepted it, so delivery is
//! at-least-once: consumers deduplicate on the envelope ID.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use wallet_common::{EventId, WalletError};
use wallet_ledger::{LedgerStore, OutboxEvent};

use crate::config::PublisherConfig;

/// Errors raised while delivering outbox events.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Sink rejected event {id}: {reason}")]
    Rejected { id: EventId, reason: String },

    #[error("Sink is closed")]
    Closed,

    #[error(transparent)]
    Store(#[from] WalletError),
}

/// Destination for published notifications.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, topic: &str, event: &OutboxEvent) -> Result<(), PublishError>;
}

/// Sink that writes each notification as a structured log line.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn publish(&self, topic: &str, event: &OutboxEvent) -> Result<(), PublishError> {
        info!(
            topic = topic,
            event_id = %event.id,
            kind = event.kind.as_str(),
            account = %event.account_id,
            payload = %event.payload,
            "Notification published"
        );
        Ok(())
    }
}

/// A notification delivered through a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub event: OutboxEvent,
}

/// Sink feeding an in-process consumer over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<Delivery>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn publish(&self, topic: &str, event: &OutboxEvent) -> Result<(), PublishError> {
        self.sender
            .send(Delivery {
                topic: topic.to_string(),
                event: event.clone(),
            })
            .await
            .map_err(|_| PublishError::Closed)
    }
}

/// Polling relay from the outbox table to an [`EventSink`].
pub struct OutboxPublisher {
    store: Arc<dyn LedgerStore>,
    sink: Arc<dyn EventSink>,
    config: PublisherConfig,
}

impl OutboxPublisher {
    pub fn new(store: Arc<dyn LedgerStore>, sink: Arc<dyn EventSink>, config: PublisherConfig) -> Self {
        Self {
            store,
            sink,
            config,
        }
    }

    /// Deliver one batch of pending events. Returns how many were delivered.
    ///
    /// Events the sink rejects stay pending and are retried on the next call.
    #[instrument(skip(self), fields(topic = %self.config.topic))]
    pub async fn publish_batch(&self) -> Result<usize, PublishError> {
        let pending = self.store.pending_events(self.config.batch_size).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut delivered = Vec::with_capacity(pending.len());
        for event in &pending {
            match self.sink.publish(&self.config.topic, event).await {
                Ok(()) => delivered.push(event.id),
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "Delivery failed, event stays pending");
                }
            }
        }

        if !delivered.is_empty() {
            self.store.mark_published(&delivered).await?;
        }

        debug!(pending = pending.len(), delivered = delivered.len(), "Outbox batch processed");
        Ok(delivered.len())
    }

    /// Run the polling loop until `shutdown` flips to `true` or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            topic = %self.config.topic,
            "Outbox publisher started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.publish_batch().await {
                        error!(error = %e, "Outbox batch failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Outbox publisher stopped");
    }
}
