//! Currency Wallet FX
//!
//! Exchange rate access for the wallet ledger.
//!
//! # Features
//!
//! - Opaque [`RateProvider`] seam for the external pricing service
//! - Bounded retry with per-attempt timeout on the provider client
//! - Read-through rate cache with a short TTL and no stale fallback
//!
//! # Example
//!
//! ```rust,ignore
//! use wallet_fx::{RateCache, RetryingRateProvider, RetryPolicy};
//! use wallet_common::{Currency, CurrencyPair};
//!
//! let provider = Arc::new(RetryingRateProvider::new(client, RetryPolicy::default()));
//! let cache = RateCache::new(provider);
//!
//! let quote = cache.get_pair_rate(CurrencyPair::new(Currency::Usd, Currency::Eur)).await?;
//! ```

pub mod provider;
pub mod cache;
pub mod quote;
pub mod error;

pub use provider::{RateProvider, RetryPolicy, RetryingRateProvider};
#[cfg(any(test, feature = "test-utils"))]
pub use provider::MockRateProvider;
pub use cache::{CacheStats, RateCache, RateCacheConfig, SharedRateCache};
pub use quote::{PairQuote, RateSnapshot, RateTable};
pub use error::{FxError, FxResult};
