use std::{
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::{
        Body,
        to_bytes,
    },
    http::{
        HeaderName,
        HeaderValue,
        Request,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use uuid::Uuid;

use crate::{
    config::{GatewayConfig, RateLimitBackendConfig},
    context::{RequestContext, source_address},
    error::GatewayError,
    middleware::{
        ControlFlow,
        GatewayMiddleware,
        logging::RequestLoggingMiddleware,
        login_guard::LoginGuardMiddleware,
        rate_limit::RateLimitMiddleware,
    },
    ratelimit::{
        RateLimiter,
        metrics::MetricsRegistry,
        observe::{AlertSink, LogAlertSink, Observer, WebhookAlertSink},
    },
    store::{
        CounterStore,
        in_memory::InMemoryCounterStore,
        redis_backend::RedisCounterStore,
    },
    upstream::Upstream,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct Gateway {
    middlewares: Vec<Arc<dyn GatewayMiddleware>>,
    upstream: Upstream,
    metrics: Arc<MetricsRegistry>,
    max_body_bytes: usize,
    trust_forwarded_for: bool,
    principal_header: Option<HeaderName>,
}

impl Gateway {
    pub fn new(upstream: Upstream, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            middlewares: vec![Arc::new(RequestLoggingMiddleware)],
            upstream,
            metrics,
            max_body_bytes: 1_048_576,
            trust_forwarded_for: false,
            principal_header: None,
        }
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn GatewayMiddleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn principal_header(mut self, header: HeaderName) -> Self {
        self.principal_header = Some(header);
        self
    }

    /// Wires the store, observer and middleware chain described by `config`.
    /// Must run inside a tokio runtime: it spawns the observer worker and,
    /// for the in-memory backend, the expiry sweeper.
    pub async fn from_config(config: GatewayConfig) -> anyhow::Result<Self> {
        let metrics = Arc::new(MetricsRegistry::new());
        let upstream = Upstream::new(&config.upstream).context("building upstream client")?;

        let store: Arc<dyn CounterStore> = match &config.rate_limit.backend {
            RateLimitBackendConfig::InMemory => {
                let store = Arc::new(InMemoryCounterStore::new());
                store.spawn_sweeper(SWEEP_INTERVAL);
                store
            }
            RateLimitBackendConfig::Redis { url, key_prefix } => Arc::new(
                RedisCounterStore::new(url.clone(), key_prefix.clone())
                    .await
                    .with_context(|| format!("connecting to redis at {url}"))?,
            ),
        };

        let mut gateway = Self::new(upstream, metrics.clone())
            .max_body_bytes(config.max_body_bytes)
            .trust_forwarded_for(config.trust_forwarded_for)
            .principal_header(config.principal_header.clone());

        if config.rate_limit.enabled {
            let sink: Arc<dyn AlertSink> = match &config.rate_limit.alert_webhook {
                Some(url) => Arc::new(WebhookAlertSink::new(url.clone())?),
                None => Arc::new(LogAlertSink),
            };
            let observer = Observer::spawn(sink, metrics.clone());
            let limiter = RateLimiter::new(config.rate_limit.policy.clone(), store.clone(), observer);
            tracing::info!(
                policy = limiter.policy().id(),
                algorithm = %limiter.policy().algorithm(),
                max_requests = limiter.policy().max_requests(),
                window_secs = limiter.policy().window().as_secs(),
                "rate limiting enabled"
            );
            gateway = gateway.with_middleware(Arc::new(RateLimitMiddleware::new(limiter)));
        }

        if let Some(login) = config.login_guard.clone() {
            tracing::info!(path = %login.path, max_failures = login.max_failures, "login guard enabled");
            gateway = gateway.with_middleware(Arc::new(LoginGuardMiddleware::new(
                store,
                login,
                metrics.clone(),
            )));
        }

        Ok(gateway)
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub async fn handle_http(
        &self,
        request: Request<Body>,
        peer: Option<IpAddr>,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let body = match to_bytes(body, self.max_body_bytes).await {
            Ok(body) => body,
            Err(_) => {
                let mut response = GatewayError::PayloadTooLarge.into_response();
                attach_request_id(&request_id, &mut response);
                return response;
            }
        };

        let client_ip = source_address(&parts.headers, peer, self.trust_forwarded_for);
        let principal = self.principal_header.as_ref().and_then(|name| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
        });

        let mut ctx = RequestContext::new(
            request_id,
            parts.method,
            parts.uri,
            parts.headers,
            body,
            client_ip,
        )
        .with_principal(principal);

        let mut executed = Vec::new();

        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(&mut ctx).await {
                Ok(ControlFlow::Continue) => executed.push(idx),
                Ok(ControlFlow::ShortCircuit(mut response)) => {
                    self.apply_response_middlewares(&executed, &ctx, &mut response)
                        .await;
                    attach_request_id(&ctx.request_id, &mut response);
                    return response;
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        middleware = middleware.name(),
                        error = %err,
                        "middleware rejected request"
                    );
                    let mut response = err.into_response();
                    self.apply_response_middlewares(&executed, &ctx, &mut response)
                        .await;
                    attach_request_id(&ctx.request_id, &mut response);
                    return response;
                }
            }
        }

        let mut response = match self.upstream.forward(&ctx).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        };
        self.apply_response_middlewares(&executed, &ctx, &mut response)
            .await;
        attach_request_id(&ctx.request_id, &mut response);
        response
    }

    async fn apply_response_middlewares(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) {
        for idx in executed.iter().rev() {
            let middleware = &self.middlewares[*idx];
            if let Err(err) = middleware.on_response(ctx, response).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    middleware = middleware.name(),
                    error = %err,
                    "middleware post-response hook failed"
                );
            }
        }
    }
}

fn attach_request_id(request_id: &str, response: &mut Response<Body>) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
}
