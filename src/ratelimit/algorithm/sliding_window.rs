use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    ratelimit::{
        Decision,
        algorithm::{RateLimitStrategy, after, ratio},
        policy::{Algorithm, RateLimitPolicy},
    },
    store::{CounterStore, StoreResult, duration_to_millis},
};

/// Sorted set of admitted request timestamps covering `(now - window, now]`.
///
/// Trim, count, conditional insert and expiry refresh are a single
/// [`CounterStore::window_admit`] call, so only admitted requests ever
/// occupy the window. Members carry a fresh id per evaluation; nothing the
/// client sends can make two requests share one entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlidingWindow;

#[async_trait]
impl RateLimitStrategy for SlidingWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    async fn evaluate(
        &self,
        store: &dyn CounterStore,
        bucket_key: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Decision> {
        let key = self.storage_key(bucket_key);
        let window = policy.window();
        let window_ms = duration_to_millis(window);
        let limit = policy.max_requests();
        let now_ms = now.timestamp_millis();
        let member = format!("{now_ms}-{}", Uuid::new_v4().simple());

        let admission = store
            .window_admit(&key, now_ms, window, limit, &member)
            .await?;

        // The oldest surviving entry leaves the window first.
        let oldest_ms = admission.oldest_ms.unwrap_or(now_ms);
        let frees_in = Duration::from_millis(
            u64::try_from(oldest_ms.saturating_add(window_ms).saturating_sub(now_ms)).unwrap_or(0),
        );
        let reset_at = after(now, frees_in);

        if admission.admitted {
            let used = admission.count.min(limit);
            return Ok(Decision::admit(limit, limit - used, reset_at, ratio(used, limit)));
        }

        Ok(Decision::deny(limit, reset_at, frees_in, 1.0))
    }
}
