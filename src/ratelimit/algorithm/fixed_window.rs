use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    ratelimit::{
        Decision,
        algorithm::{RateLimitStrategy, after, ratio},
        policy::{Algorithm, RateLimitPolicy},
    },
    store::{CounterStore, StoreResult},
};

/// One counter per window, created by the first request and expiring with
/// the window.
///
/// A burst straddling a window boundary can see up to `2 * max - 1`
/// admissions in a short span; that is inherent to the algorithm.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedWindow;

#[async_trait]
impl RateLimitStrategy for FixedWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    async fn evaluate(
        &self,
        store: &dyn CounterStore,
        bucket_key: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Decision> {
        let window = policy.window();
        let limit = policy.max_requests();

        let counter = store
            .incr_with_expiry(&self.storage_key(bucket_key), window)
            .await?;
        let count = u64::try_from(counter.value).unwrap_or(0);
        let reset_in = counter.ttl.unwrap_or(window).min(window);
        let reset_at = after(now, reset_in);

        if count <= limit {
            Ok(Decision::admit(limit, limit - count, reset_at, ratio(count, limit)))
        } else {
            Ok(Decision::deny(limit, reset_at, reset_in, 1.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::task::JoinSet;

    use super::*;
    use crate::{clock::Clock, ratelimit::algorithm::testing};

    fn policy(max: u64) -> RateLimitPolicy {
        RateLimitPolicy::builder("fw")
            .window(Duration::from_secs(60))
            .max_requests(max)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn admits_up_to_ceiling_then_denies() {
        let (store, clock) = testing::store();
        let policy = policy(5);

        let mut remaining = Vec::new();
        for _ in 0..5 {
            let decision = FixedWindow
                .evaluate(store.as_ref(), "fw:ip:k", &policy, clock.now())
                .await
                .unwrap();
            assert!(decision.admitted);
            remaining.push(decision.remaining);
            clock.advance(Duration::from_secs(1));
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let denied = FixedWindow
            .evaluate(store.as_ref(), "fw:ip:k", &policy, clock.now())
            .await
            .unwrap();
        assert!(!denied.admitted);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(55)));
        assert_eq!(denied.retry_after_secs(), 55);
        assert_eq!(denied.reset_at, testing::start() + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn new_window_starts_fresh() {
        let (store, clock) = testing::store();
        let policy = policy(2);

        for _ in 0..3 {
            FixedWindow
                .evaluate(store.as_ref(), "k", &policy, clock.now())
                .await
                .unwrap();
        }

        clock.advance(Duration::from_secs(60));
        let decision = FixedWindow
            .evaluate(store.as_ref(), "k", &policy, clock.now())
            .await
            .unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    async fn boundary_burst_admits_up_to_twice_the_ceiling() {
        let (store, clock) = testing::store();
        let policy = policy(3);
        let mut admitted = 0;

        clock.advance(Duration::from_secs(59));
        for _ in 0..3 {
            let decision = FixedWindow
                .evaluate(store.as_ref(), "k", &policy, clock.now())
                .await
                .unwrap();
            admitted += u32::from(decision.admitted);
        }

        clock.advance(Duration::from_secs(60));
        for _ in 0..4 {
            let decision = FixedWindow
                .evaluate(store.as_ref(), "k", &policy, clock.now())
                .await
                .unwrap();
            admitted += u32::from(decision.admitted);
        }

        assert_eq!(admitted, 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_admit_exactly_the_ceiling() {
        let (store, clock) = testing::store();
        let policy = Arc::new(policy(10));
        let now = clock.now();

        let mut tasks = JoinSet::new();
        for _ in 0..50 {
            let store = store.clone();
            let policy = policy.clone();
            tasks.spawn(async move {
                FixedWindow
                    .evaluate(store.as_ref(), "shared", &policy, now)
                    .await
                    .unwrap()
                    .admitted
            });
        }

        let mut admitted = 0;
        let mut denied = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap() {
                admitted += 1;
            } else {
                denied += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(denied, 40);
    }
}
