//! Wallet Outbox Relay
//!
//! Delivers committed balance-change notifications from the ledger outbox.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wallet_engine::{EngineConfig, OutboxPublisher, TracingSink};
use wallet_ledger::PgLedgerStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting wallet outbox relay");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let store = PgLedgerStore::connect(
        &config.database.url,
        config.database.max_connections,
        config.database.acquire_timeout,
    )
    .await?;
    store.migrate().await?;

    let publisher = OutboxPublisher::new(
        Arc::new(store),
        Arc::new(TracingSink),
        config.publisher.clone(),
    );

    // Set up graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
        let _ = shutdown_tx.send(true);
    });

    publisher.run(shutdown_rx).await;

    info!("Relay shutdown complete");
    Ok(())
}
