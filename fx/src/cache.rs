//! Read-through rate cache with TTL support.
//!
//! Two independent keyspaces are kept: the bulk rate table and per-pair
//! quotes. Refreshing one never invalidates the other, so during a refresh
//! window the table and a pair quote may disagree.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use wallet_common::CurrencyPair;

use crate::error::{FxError, FxResult};
use crate::provider::RateProvider;
use crate::quote::{PairQuote, RateSnapshot};

/// Cached value with its expiry.
#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    expires_at: Instant,
}

impl<T: Clone> CacheEntry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn fresh(&self) -> Option<T> {
        (Instant::now() < self.expires_at).then(|| self.value.clone())
    }
}

/// Configuration for rate cache.
#[derive(Debug, Clone)]
pub struct RateCacheConfig {
    /// How long a fetched rate stays servable.
    pub ttl: Duration,
}

impl Default for RateCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
        }
    }
}

/// Shared read-through cache in front of a [`RateProvider`].
///
/// Writes are last-writer-wins; two concurrent misses both fetch and both
/// store equivalent values.
pub struct RateCache {
    provider: Arc<dyn RateProvider>,
    all_rates: RwLock<Option<CacheEntry<RateSnapshot>>>,
    pairs: DashMap<CurrencyPair, CacheEntry<PairQuote>>,
    config: RateCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    provider_errors: AtomicU64,
}

impl RateCache {
    /// Create a new rate cache with default configuration.
    pub fn new(provider: Arc<dyn RateProvider>) -> Self {
        Self::with_config(provider, RateCacheConfig::default())
    }

    /// Create a new rate cache with custom configuration.
    pub fn with_config(provider: Arc<dyn RateProvider>, config: RateCacheConfig) -> Self {
        Self {
            provider,
            all_rates: RwLock::new(None),
            pairs: DashMap::new(),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            provider_errors: AtomicU64::new(0),
        }
    }

    /// Get the full rate table, fetching it on a miss.
    #[instrument(skip(self), fields(provider = self.provider.name()))]
    pub async fn get_all_rates(&self) -> FxResult<RateSnapshot> {
        let cached = self.all_rates.read().as_ref().and_then(CacheEntry::fresh);
        if let Some(snapshot) = cached {
            debug!("Cache hit");
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(snapshot);
        }

        debug!("Cache miss");
        self.misses.fetch_add(1, Ordering::Relaxed);

        let rates = match self.provider.get_all_rates().await {
            Ok(rates) => rates,
            Err(e) => return Err(self.provider_failed(e)),
        };
        if let Some((currency, rate)) = rates.iter().find(|(_, rate)| **rate <= Decimal::ZERO) {
            return Err(self.provider_failed(FxError::ProviderError(format!(
                "non-positive rate {rate} for {currency}"
            ))));
        }

        let snapshot = RateSnapshot {
            rates,
            observed_at: Utc::now(),
        };
        *self.all_rates.write() = Some(CacheEntry::new(snapshot.clone(), self.config.ttl));

        Ok(snapshot)
    }

    /// Get the rate for one pair, fetching it on a miss.
    #[instrument(skip(self), fields(pair = %pair, provider = self.provider.name()))]
    pub async fn get_pair_rate(&self, pair: CurrencyPair) -> FxResult<PairQuote> {
        let cached = self.pairs.get(&pair).and_then(|entry| entry.fresh());
        if let Some(quote) = cached {
            debug!("Cache hit");
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(quote);
        }

        debug!("Cache miss");
        self.misses.fetch_add(1, Ordering::Relaxed);

        let rate = match self.provider.get_pair_rate(pair).await {
            Ok(rate) => rate,
            Err(e) => return Err(self.provider_failed(e)),
        };
        if rate <= Decimal::ZERO {
            return Err(self.provider_failed(FxError::InvalidRate { pair, rate }));
        }

        let quote = PairQuote::new(pair, rate);
        self.pairs
            .insert(pair, CacheEntry::new(quote.clone(), self.config.ttl));

        Ok(quote)
    }

    /// Drop every cached value.
    pub fn invalidate(&self) {
        *self.all_rates.write() = None;
        self.pairs.clear();
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            provider_errors: self.provider_errors.load(Ordering::Relaxed),
            cached_pairs: self.pairs.len(),
        }
    }

    fn provider_failed(&self, error: FxError) -> FxError {
        self.provider_errors.fetch_add(1, Ordering::Relaxed);
        warn!(error = %error, "Rate provider failed, no cached rate to serve");
        error
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub provider_errors: u64,
    pub cached_pairs: usize,
}

/// Shared rate cache.
pub type SharedRateCache = Arc<RateCache>;
