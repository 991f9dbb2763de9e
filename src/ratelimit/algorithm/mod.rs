//! Interchangeable admission algorithms.
//!
//! Each strategy touches bucket state only through atomic
//! [`CounterStore`] primitives, so concurrent callers sharing a bucket
//! can never over-admit.

pub mod fixed_window;
pub mod sliding_window;
pub mod token_bucket;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    ratelimit::{
        Decision,
        policy::{Algorithm, RateLimitPolicy},
    },
    store::{CounterStore, StoreResult},
};

pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

#[async_trait]
pub trait RateLimitStrategy: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    fn storage_key(&self, bucket_key: &str) -> String {
        format!("{bucket_key}:{}", self.algorithm().key_suffix())
    }

    async fn evaluate(
        &self,
        store: &dyn CounterStore,
        bucket_key: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Decision>;
}

pub fn strategy_for(algorithm: Algorithm) -> Arc<dyn RateLimitStrategy> {
    match algorithm {
        Algorithm::FixedWindow => Arc::new(FixedWindow),
        Algorithm::SlidingWindow => Arc::new(SlidingWindow),
        Algorithm::TokenBucket => Arc::new(TokenBucket),
    }
}

/// `now + d`, saturating at the latest representable instant.
pub(crate) fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn ratio(used: u64, limit: u64) -> f64 {
    used as f64 / limit.max(1) as f64
}
