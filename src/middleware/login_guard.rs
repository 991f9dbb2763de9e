use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware},
    ratelimit::metrics::MetricsRegistry,
    store::{CounterStore, StoreError, StoreOp, StoreReply, StoreResult},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginGuardConfig {
    pub path: String,
    pub max_failures: u64,
    pub window: Duration,
    pub store_timeout: Duration,
}

impl Default for LoginGuardConfig {
    fn default() -> Self {
        Self {
            path: "/api/auth/login".to_string(),
            max_failures: 5,
            window: Duration::from_secs(15 * 60),
            store_timeout: Duration::from_millis(250),
        }
    }
}

/// Throttles credential guessing on the login endpoint.
///
/// Failed attempts (upstream answered 401 or 403) are counted per source
/// address and per submitted email; once either counter reaches the limit
/// further attempts are refused until the window lapses. A successful login
/// clears both counters.
pub struct LoginGuardMiddleware {
    store: Arc<dyn CounterStore>,
    config: LoginGuardConfig,
    metrics: Arc<MetricsRegistry>,
}

impl LoginGuardMiddleware {
    pub fn new(
        store: Arc<dyn CounterStore>,
        config: LoginGuardConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    fn applies_to(&self, ctx: &RequestContext) -> bool {
        ctx.method == Method::POST && ctx.uri.path() == self.config.path
    }

    async fn bounded<T>(&self, call: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        tokio::time::timeout(self.config.store_timeout, call)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.config.store_timeout)))
    }

    /// Returns the retry hint in seconds if any counter is exhausted.
    async fn exhausted(&self, keys: &[String]) -> StoreResult<Option<u64>> {
        let ops = keys
            .iter()
            .map(|key| StoreOp::Get { key: key.clone() })
            .collect();
        let replies = self.bounded(self.store.pipeline(ops)).await?;

        let Some(key) = keys.iter().zip(&replies).find_map(|(key, reply)| {
            let failures = reply
                .as_value()
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(0);
            (failures >= self.config.max_failures).then_some(key)
        }) else {
            return Ok(None);
        };

        let ttl = self.bounded(self.store.ttl(key)).await?;
        let wait = ttl.unwrap_or(self.config.window);
        Ok(Some(wait.as_secs().max(1)))
    }

    async fn record_failure(&self, keys: &[String]) -> StoreResult<()> {
        for key in keys {
            self.bounded(self.store.incr_with_expiry(key, self.config.window))
                .await?;
        }
        Ok(())
    }

    async fn clear(&self, keys: &[String]) -> StoreResult<Vec<StoreReply>> {
        let ops = keys
            .iter()
            .map(|key| StoreOp::Delete { key: key.clone() })
            .collect();
        self.bounded(self.store.pipeline(ops)).await
    }
}

/// Counter keys for the attempt: source address and lower-cased email
/// from a JSON body, whichever are present.
pub fn failure_keys(ctx: &RequestContext) -> Vec<String> {
    let mut keys = Vec::with_capacity(2);
    if let Some(ip) = ctx.client_ip {
        keys.push(format!("login:failed:ip:{ip}"));
    }

    let email = serde_json::from_slice::<serde_json::Value>(&ctx.body)
        .ok()
        .and_then(|body| body.get("email")?.as_str().map(str::trim).map(str::to_lowercase))
        .filter(|email| !email.is_empty());
    if let Some(email) = email {
        keys.push(format!("login:failed:email:{email}"));
    }
    keys
}

#[async_trait]
impl GatewayMiddleware for LoginGuardMiddleware {
    fn name(&self) -> &'static str {
        "login-guard"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        if !self.applies_to(ctx) {
            return Ok(ControlFlow::Continue);
        }
        let keys = failure_keys(ctx);
        if keys.is_empty() {
            return Ok(ControlFlow::Continue);
        }

        match self.exhausted(&keys).await {
            Ok(None) => Ok(ControlFlow::Continue),
            Ok(Some(retry_after_secs)) => {
                self.metrics.login_throttled();
                tracing::warn!(
                    request_id = %ctx.request_id,
                    client_ip = ?ctx.client_ip,
                    retry_after_secs,
                    "login attempts throttled"
                );
                Ok(ControlFlow::ShortCircuit(
                    GatewayError::LoginThrottled { retry_after_secs }.into_response(),
                ))
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    error = %err,
                    "login guard store check failed, allowing attempt"
                );
                Ok(ControlFlow::Continue)
            }
        }
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        if !self.applies_to(ctx) {
            return Ok(());
        }
        let keys = failure_keys(ctx);
        if keys.is_empty() {
            return Ok(());
        }

        let status = response.status();
        let result = if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            self.record_failure(&keys).await
        } else if status.is_success() {
            self.clear(&keys).await.map(|_| ())
        } else {
            Ok(())
        };

        if let Err(err) = result {
            tracing::warn!(
                request_id = %ctx.request_id,
                status = %status,
                error = %err,
                "login guard could not update failure counters"
            );
        }
        Ok(())
    }
}
