//! Rate provider trait and client-side retry policy.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, warn};
use wallet_common::CurrencyPair;

use crate::error::{FxError, FxResult};
use crate::quote::RateTable;

/// The external pricing service, consumed as an opaque capability.
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Get current rates for every quoted currency.
    async fn get_all_rates(&self) -> FxResult<RateTable>;

    /// Get the rate for one currency pair.
    async fn get_pair_rate(&self, pair: CurrencyPair) -> FxResult<Decimal>;
}

/// Retry settings for the provider client.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of calls per request, including the first.
    pub max_attempts: u32,
    /// Timeout applied to each individual call.
    pub attempt_timeout: Duration,
    /// Delay between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(2),
            backoff: Duration::from_millis(100),
        }
    }
}

/// Wraps a provider with a bounded attempt count and per-attempt timeout.
pub struct RetryingRateProvider {
    inner: Arc<dyn RateProvider>,
    policy: RetryPolicy,
}

impl RetryingRateProvider {
    pub fn new(inner: Arc<dyn RateProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> FxResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = FxResult<T>> + Send,
        T: Send,
    {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let error = match tokio::time::timeout(self.policy.attempt_timeout, call()).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(
                            provider = self.inner.name(),
                            operation,
                            attempt,
                            "Rate provider recovered"
                        );
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => FxError::Timeout(self.policy.attempt_timeout),
            };

            warn!(
                provider = self.inner.name(),
                operation,
                attempt,
                max_attempts = attempts,
                error = %error,
                "Rate provider call failed"
            );
            last_error = Some(error);

            if attempt < attempts {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }

        Err(FxError::RetriesExhausted {
            attempts,
            last: Box::new(
                last_error.unwrap_or_else(|| FxError::ProviderError("no attempt made".into())),
            ),
        })
    }
}

#[async_trait]
impl RateProvider for RetryingRateProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_all_rates(&self) -> FxResult<RateTable> {
        self.with_retry("get_all_rates", || self.inner.get_all_rates())
            .await
    }

    async fn get_pair_rate(&self, pair: CurrencyPair) -> FxResult<Decimal> {
        self.with_retry("get_pair_rate", || self.inner.get_pair_rate(pair))
            .await
    }
}

/// Mock rate provider for testing.
#[cfg(any(test, feature = "test-utils"))]
pub struct MockRateProvider {
    name: String,
    rates: parking_lot::RwLock<RateTable>,
    pairs: dashmap::DashMap<CurrencyPair, Decimal>,
    failures_remaining: std::sync::atomic::AtomicU32,
    delay: parking_lot::RwLock<Option<Duration>>,
    all_rates_calls: std::sync::atomic::AtomicUsize,
    pair_calls: std::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "test-utils"))]
impl MockRateProvider {
    /// Create a new mock provider.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rates: parking_lot::RwLock::new(RateTable::new()),
            pairs: dashmap::DashMap::new(),
            failures_remaining: std::sync::atomic::AtomicU32::new(0),
            delay: parking_lot::RwLock::new(None),
            all_rates_calls: std::sync::atomic::AtomicUsize::new(0),
            pair_calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Set the rate returned for a currency in the bulk query.
    pub fn set_rate(&self, currency: wallet_common::Currency, rate: Decimal) {
        self.rates.write().insert(currency, rate);
    }

    /// Set the rate returned for a currency pair.
    pub fn set_pair_rate(&self, pair: CurrencyPair, rate: Decimal) {
        self.pairs.insert(pair, rate);
    }

    /// Fail the next `count` calls with a provider error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    /// Delay every call by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write() = delay;
    }

    /// Number of bulk queries served or attempted.
    pub fn all_rates_calls(&self) -> usize {
        self.all_rates_calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Number of pair queries served or attempted.
    pub fn pair_calls(&self) -> usize {
        self.pair_calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn simulate_call(&self) -> FxResult<()> {
        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_remaining
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| n.checked_sub(1),
            )
            .is_ok();
        if failing {
            return Err(FxError::ProviderError("injected failure".into()));
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl RateProvider for MockRateProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_all_rates(&self) -> FxResult<RateTable> {
        self.all_rates_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.simulate_call().await?;
        Ok(self.rates.read().clone())
    }

    async fn get_pair_rate(&self, pair: CurrencyPair) -> FxResult<Decimal> {
        self.pair_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.simulate_call().await?;
        self.pairs
            .get(&pair)
            .map(|r| *r)
            .ok_or(FxError::RateNotAvailable(pair))
    }
}
