use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    clock::{Clock, SystemClock},
    context::RequestContext,
    ratelimit::{
        Verdict,
        algorithm::{RateLimitStrategy, strategy_for},
        key::{bucket_key, resolve_key},
        metrics::Outcome,
        observe::{Observer, RateLimitEvent},
        policy::{AccessCheck, Algorithm, FailureMode, RateLimitPolicy},
    },
    store::{CounterStore, StoreError, StoreOp, StoreResult},
};

/// The decision pipeline for one policy: key resolution, allow/deny
/// short-circuit, bounded algorithm evaluation, failure-mode handling and
/// observability.
#[derive(Clone)]
pub struct RateLimiter {
    policy: Arc<RateLimitPolicy>,
    store: Arc<dyn CounterStore>,
    strategy: Arc<dyn RateLimitStrategy>,
    observer: Observer,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy, store: Arc<dyn CounterStore>, observer: Observer) -> Self {
        let strategy = strategy_for(policy.algorithm());
        Self {
            policy: Arc::new(policy),
            store,
            strategy,
            observer,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Never fails: store trouble resolves to `FailedOpen` or `Unavailable`
    /// according to the policy's failure mode.
    pub async fn check(&self, ctx: &RequestContext) -> Verdict {
        let policy = self.policy.as_ref();
        let resolved = resolve_key(ctx, policy);

        match policy.check(ctx.client_ip) {
            AccessCheck::Denied => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    policy = policy.id(),
                    client_ip = ?ctx.client_ip,
                    "request from deny-listed address blocked"
                );
                self.observer.record(Outcome::Blocked);
                return Verdict::Blocked;
            }
            AccessCheck::Allowed => {
                self.observer.record(Outcome::Bypassed);
                return Verdict::Bypassed;
            }
            AccessCheck::Continue => {}
        }

        let bucket = bucket_key(policy, &resolved);
        let now = self.clock.now();
        let timeout = policy.store_timeout();

        let evaluated = tokio::time::timeout(
            timeout,
            self.strategy
                .evaluate(self.store.as_ref(), &bucket, policy, now),
        )
        .await
        .unwrap_or(Err(StoreError::Timeout(timeout)));

        match evaluated {
            Ok(decision) => {
                self.observer.observe(RateLimitEvent {
                    bucket_key: bucket,
                    policy_id: policy.id().to_string(),
                    algorithm: policy.algorithm(),
                    admitted: decision.admitted,
                    utilization: decision.utilization,
                    alert_threshold: policy.alert_threshold(),
                    window: policy.window(),
                    timestamp: now,
                });
                if decision.admitted {
                    Verdict::Admitted(decision)
                } else {
                    Verdict::Limited(decision)
                }
            }
            Err(err) => {
                self.observer.store_error();
                tracing::error!(
                    request_id = %ctx.request_id,
                    bucket_key = %bucket,
                    policy = policy.id(),
                    algorithm = %policy.algorithm(),
                    failure_mode = ?policy.failure_mode(),
                    error = %err,
                    "rate limit store call failed"
                );
                match policy.failure_mode() {
                    FailureMode::FailOpen => {
                        self.observer.record(Outcome::FailedOpen);
                        Verdict::FailedOpen
                    }
                    FailureMode::FailClosed => {
                        self.observer.record(Outcome::Unavailable);
                        Verdict::Unavailable
                    }
                }
            }
        }
    }

    /// Clears every algorithm's state for a resolved key such as
    /// `ip:10.0.0.1`.
    pub async fn reset(&self, resolved_key: &str) -> StoreResult<()> {
        let bucket = bucket_key(&self.policy, resolved_key);
        let ops = Algorithm::ALL
            .iter()
            .map(|algorithm| StoreOp::Delete {
                key: format!("{bucket}:{}", algorithm.key_suffix()),
            })
            .collect();
        self.store.pipeline(ops).await?;
        tracing::info!(policy = self.policy.id(), bucket_key = %bucket, "rate limit bucket reset");
        Ok(())
    }
}
