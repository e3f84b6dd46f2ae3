//! Engine configuration.

use std::time::Duration;

use rust_decimal::Decimal;
use wallet_fx::{RateCacheConfig, RetryPolicy};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Postgres connection URL.
    pub url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/wallet".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Ledger operation settings.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Deposits and withdrawals of at least this amount emit a notification.
    pub deposit_notify_threshold: Decimal,
    /// Exchanges whose target amount reaches this value emit a notification.
    pub exchange_notify_threshold: Decimal,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            deposit_notify_threshold: Decimal::ONE,
            exchange_notify_threshold: Decimal::TWO,
        }
    }
}

/// Outbox publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Polling interval.
    pub interval: Duration,
    /// Maximum events delivered per tick.
    pub batch_size: usize,
    /// Destination topic handed to the sink.
    pub topic: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 10,
            topic: "wallet.notifications".to_string(),
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    pub rate_cache: RateCacheConfig,
    pub rate_client: RetryPolicy,
    pub publisher: PublisherConfig,
    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            ledger: LedgerConfig::default(),
            rate_cache: RateCacheConfig::default(),
            rate_client: RetryPolicy::default(),
            publisher: PublisherConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }

        if let Some(max) = env_parse("DATABASE_MAX_CONNECTIONS") {
            config.database.max_connections = max;
        }

        if let Some(ms) = env_parse("RATE_CACHE_TTL_MS") {
            config.rate_cache.ttl = Duration::from_millis(ms);
        }

        if let Some(attempts) = env_parse("RATE_CLIENT_MAX_ATTEMPTS") {
            config.rate_client.max_attempts = attempts;
        }

        if let Some(ms) = env_parse("RATE_CLIENT_TIMEOUT_MS") {
            config.rate_client.attempt_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse("OUTBOX_INTERVAL_MS") {
            config.publisher.interval = Duration::from_millis(ms);
        }

        if let Some(size) = env_parse("OUTBOX_BATCH_SIZE") {
            config.publisher.batch_size = size;
        }

        if let Ok(topic) = std::env::var("OUTBOX_TOPIC") {
            config.publisher.topic = topic;
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }

        if self.database.max_connections == 0 {
            return Err("Database pool needs at least one connection".to_string());
        }

        if self.ledger.deposit_notify_threshold <= Decimal::ZERO
            || self.ledger.exchange_notify_threshold <= Decimal::ZERO
        {
            return Err("Notification thresholds must be positive".to_string());
        }

        if self.rate_cache.ttl.is_zero() {
            return Err("Rate cache TTL cannot be zero".to_string());
        }

        if self.rate_client.max_attempts == 0 {
            return Err("Rate client needs at least one attempt".to_string());
        }

        if self.publisher.interval.is_zero() || self.publisher.batch_size == 0 {
            return Err("Publisher interval and batch size must be non-zero".to_string());
        }

        if self.publisher.topic.is_empty() {
            return Err("Publisher topic cannot be empty".to_string());
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.publisher.batch_size, 10);
        assert_eq!(config.rate_cache.ttl, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_config() {
        let mut config = EngineConfig::default();
        config.publisher.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.ledger.exchange_notify_threshold = Decimal::ZERO;
        assert!(config.validate().is_err());
    }
}
