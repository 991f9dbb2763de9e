use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    ratelimit::{
        Decision,
        algorithm::{RateLimitStrategy, after},
        policy::{Algorithm, RateLimitPolicy},
    },
    store::{CounterStore, StoreError, StoreResult},
};

/// Optimistic write attempts before a contended request is denied.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Continuous refill at `refill_rate` tokens per second up to a capacity
/// of `max_requests`; each admitted request spends one token.
///
/// State is read with `get` and written back with `compare_and_set`
/// against the exact value read, so a concurrent writer forces a retry
/// instead of a lost update.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenBucket;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_ms: i64,
}

impl BucketState {
    pub fn full(capacity: f64, now_ms: i64) -> Self {
        Self {
            tokens: capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Tokens available at `now_ms`, clamped to `[0, capacity]`. A clock
    /// that went backwards refills nothing.
    pub fn refilled(&self, now_ms: i64, rate: f64, capacity: f64) -> Self {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms).max(0);
        let tokens = (self.tokens + elapsed_ms as f64 / 1000.0 * rate).clamp(0.0, capacity);
        Self {
            tokens,
            last_refill_ms: now_ms.max(self.last_refill_ms),
        }
    }
}

#[async_trait]
impl RateLimitStrategy for TokenBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    async fn evaluate(
        &self,
        store: &dyn CounterStore,
        bucket_key: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Decision> {
        let key = self.storage_key(bucket_key);
        let limit = policy.max_requests();
        let capacity = limit as f64;
        let rate = policy.refill_rate();
        let now_ms = now.timestamp_millis();
        let ttl = state_ttl(capacity, rate);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = store.get(&key).await?;
            let current = match raw.as_deref().map(serde_json::from_str::<BucketState>) {
                None => BucketState::full(capacity, now_ms),
                Some(Ok(state)) => state,
                Some(Err(err)) => {
                    tracing::warn!(bucket_key, error = %err, "discarding unreadable token bucket state");
                    BucketState::full(capacity, now_ms)
                }
            };

            let refilled = current.refilled(now_ms, rate, capacity);
            let admitted = refilled.tokens >= 1.0;
            let next = BucketState {
                tokens: if admitted { refilled.tokens - 1.0 } else { refilled.tokens },
                ..refilled
            };

            let encoded = serde_json::to_string(&next).map_err(|err| StoreError::Corrupt {
                key: key.clone(),
                reason: err.to_string(),
            })?;
            if !store
                .compare_and_set(&key, raw.as_deref(), &encoded, ttl)
                .await?
            {
                continue;
            }

            let reset_at = after(now, secs((capacity - next.tokens) / rate));
            let utilization = 1.0 - next.tokens / capacity;
            return Ok(if admitted {
                Decision::admit(limit, next.tokens.floor() as u64, reset_at, utilization)
            } else {
                Decision::deny(limit, reset_at, secs((1.0 - next.tokens) / rate), utilization)
            });
        }

        tracing::warn!(
            bucket_key,
            attempts = MAX_CAS_ATTEMPTS,
            "token bucket write kept conflicting, denying"
        );
        let retry = secs(1.0 / rate);
        Ok(Decision::deny(limit, after(now, retry), retry, 1.0))
    }
}

/// Twice the time a drained bucket needs to refill, at least one second.
fn state_ttl(capacity: f64, rate: f64) -> Duration {
    Duration::from_secs(((capacity / rate).ceil() * 2.0).max(1.0) as u64)
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::task::JoinSet;

    use super::*;
    use crate::{
        clock::Clock,
        ratelimit::algorithm::testing,
        store::{Counter, StoreOp, StoreReply, WindowAdmission, in_memory::InMemoryCounterStore},
    };

    fn policy(max: u64, rate: f64) -> RateLimitPolicy {
        RateLimitPolicy::builder("tb")
            .algorithm(Algorithm::TokenBucket)
            .max_requests(max)
            .refill_rate(rate)
            .build()
            .unwrap()
    }

    async fn admitted_now(
        store: &dyn CounterStore,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
        attempts: usize,
    ) -> usize {
        let mut admitted = 0;
        for _ in 0..attempts {
            let decision = TokenBucket.evaluate(store, "k", policy, now).await.unwrap();
            admitted += usize::from(decision.admitted);
        }
        admitted
    }

    #[tokio::test]
    async fn drained_bucket_refills_at_the_configured_rate() {
        let (store, clock) = testing::store();
        let policy = policy(10, 1.0);
        let drained = BucketState {
            tokens: 0.0,
            last_refill_ms: clock.now().timestamp_millis(),
        };
        store
            .set("k:tb", &serde_json::to_string(&drained).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(5));
        assert_eq!(admitted_now(store.as_ref(), &policy, clock.now(), 5).await, 5);

        let sixth = TokenBucket
            .evaluate(store.as_ref(), "k", &policy, clock.now())
            .await
            .unwrap();
        assert!(!sixth.admitted);
        assert_eq!(sixth.retry_after, Some(Duration::from_secs(1)));
        assert_eq!(sixth.reset_at, clock.now() + chrono::Duration::seconds(10));
    }

    #[tokio::test]
    async fn fresh_bucket_allows_a_burst_up_to_capacity() {
        let (store, clock) = testing::store();
        let policy = policy(10, 0.5);

        let first = TokenBucket
            .evaluate(store.as_ref(), "k", &policy, clock.now())
            .await
            .unwrap();
        assert_eq!(first.remaining, 9);
        assert_eq!(admitted_now(store.as_ref(), &policy, clock.now(), 12).await, 9);
    }

    #[tokio::test]
    async fn long_idle_never_overfills() {
        let (store, clock) = testing::store();
        let policy = policy(4, 1.0);

        admitted_now(store.as_ref(), &policy, clock.now(), 4).await;
        clock.advance(Duration::from_secs(3_600));

        assert_eq!(admitted_now(store.as_ref(), &policy, clock.now(), 6).await, 4);
        let state: BucketState =
            serde_json::from_str(&store.get("k:tb").await.unwrap().unwrap()).unwrap();
        assert!((0.0..=4.0).contains(&state.tokens));
    }

    #[tokio::test]
    async fn unreadable_state_is_replaced_by_a_full_bucket() {
        let (store, clock) = testing::store();
        let policy = policy(3, 1.0);
        store.set("k:tb", "not json", Duration::from_secs(60)).await.unwrap();

        let decision = TokenBucket
            .evaluate(store.as_ref(), "k", &policy, clock.now())
            .await
            .unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 2);
    }

    #[test]
    fn state_ttl_covers_a_full_refill_twice() {
        assert_eq!(state_ttl(10.0, 1.0), Duration::from_secs(20));
        assert_eq!(state_ttl(1_000.0, 50.0), Duration::from_secs(40));
        assert_eq!(state_ttl(1.0, 100.0), Duration::from_secs(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_spenders_drain_exactly_the_capacity() {
        let (store, clock) = testing::store();
        let policy = Arc::new(policy(10, 0.001));
        let now = clock.now();

        let mut tasks = JoinSet::new();
        for _ in 0..30 {
            let store = store.clone();
            let policy = policy.clone();
            tasks.spawn(async move {
                TokenBucket
                    .evaluate(store.as_ref(), "shared", &policy, now)
                    .await
                    .unwrap()
                    .admitted
            });
        }

        let mut admitted = 0;
        while let Some(result) = tasks.join_next().await {
            admitted += u32::from(result.unwrap());
        }
        assert_eq!(admitted, 10);
    }

    /// Loses every compare-and-set race.
    struct ContendedStore(InMemoryCounterStore);

    #[async_trait]
    impl CounterStore for ContendedStore {
        async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<Counter> {
            self.0.incr_with_expiry(key, ttl).await
        }

        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
            self.0.set(key, value, ttl).await
        }

        async fn compare_and_set(
            &self,
            _key: &str,
            _expected: Option<&str>,
            _value: &str,
            _ttl: Duration,
        ) -> StoreResult<bool> {
            Ok(false)
        }

        async fn delete(&self, key: &str) -> StoreResult<bool> {
            self.0.delete(key).await
        }

        async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
            self.0.ttl(key).await
        }

        async fn window_admit(
            &self,
            key: &str,
            now_ms: i64,
            window: Duration,
            limit: u64,
            member: &str,
        ) -> StoreResult<WindowAdmission> {
            self.0.window_admit(key, now_ms, window, limit, member).await
        }

        async fn pipeline(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<StoreReply>> {
            self.0.pipeline(ops).await
        }
    }

    #[tokio::test]
    async fn persistent_contention_denies_conservatively() {
        let store = ContendedStore(InMemoryCounterStore::new());
        let policy = policy(10, 2.0);

        let decision = TokenBucket
            .evaluate(&store, "k", &policy, Utc::now())
            .await
            .unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.retry_after, Some(Duration::from_millis(500)));
    }
}
