use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware},
    ratelimit::{Decision, RateLimiter, Verdict},
};

pub const LIMIT_KEY: &str = "ratelimit.limit";
pub const REMAINING_KEY: &str = "ratelimit.remaining";
pub const RESET_KEY: &str = "ratelimit.reset";

const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Runs the decision pipeline for every request and maps its verdict onto
/// the chain: forward with rate-limit headers, or answer 429, 403 or 503.
pub struct RateLimitMiddleware {
    limiter: RateLimiter,
}

impl RateLimitMiddleware {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn header_values(&self, decision: &Decision) -> [(&'static str, String); 3] {
        [
            (LIMIT_KEY, decision.limit.to_string()),
            (REMAINING_KEY, decision.remaining.to_string()),
            (RESET_KEY, decision.reset_after_secs(self.limiter.now()).to_string()),
        ]
    }

    fn limited_response(&self, decision: &Decision) -> Response<Body> {
        let mut response = GatewayError::RateLimited {
            retry_after_secs: decision.retry_after_secs(),
            message: self.limiter.policy().message().to_string(),
        }
        .into_response();

        for (key, value) in self.header_values(decision) {
            insert_header(&mut response, key, &value);
        }
        response
    }
}

fn header_for(key: &str) -> Option<HeaderName> {
    match key {
        LIMIT_KEY => Some(LIMIT_HEADER),
        REMAINING_KEY => Some(REMAINING_HEADER),
        RESET_KEY => Some(RESET_HEADER),
        _ => None,
    }
}

fn insert_header(response: &mut Response<Body>, key: &str, value: &str) {
    if let Some(name) = header_for(key)
        && let Ok(value) = HeaderValue::from_str(value)
    {
        response.headers_mut().insert(name, value);
    }
}

#[async_trait]
impl GatewayMiddleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        match self.limiter.check(ctx).await {
            Verdict::Admitted(decision) => {
                for (key, value) in self.header_values(&decision) {
                    ctx.metadata.insert(key.to_string(), value);
                }
                Ok(ControlFlow::Continue)
            }
            Verdict::Bypassed | Verdict::FailedOpen => Ok(ControlFlow::Continue),
            Verdict::Limited(decision) => {
                Ok(ControlFlow::ShortCircuit(self.limited_response(&decision)))
            }
            Verdict::Blocked => Ok(ControlFlow::ShortCircuit(
                GatewayError::IpBlocked.into_response(),
            )),
            Verdict::Unavailable => Ok(ControlFlow::ShortCircuit(
                GatewayError::RateLimitUnavailable.into_response(),
            )),
        }
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        for key in [LIMIT_KEY, REMAINING_KEY, RESET_KEY] {
            if let Some(value) = ctx.metadata.get(key) {
                insert_header(response, key, value);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::http::StatusCode;
    use bytes::Bytes;
    use http::{HeaderMap, Method};

    use super::*;
    use crate::{
        ratelimit::{
            RateLimitPolicy,
            algorithm::testing,
            metrics::MetricsRegistry,
            observe::{LogAlertSink, Observer},
        },
        store::CounterStore,
    };

    fn middleware(policy: RateLimitPolicy) -> RateLimitMiddleware {
        let (store, clock) = testing::store();
        let observer = Observer::spawn(Arc::new(LogAlertSink), Arc::new(MetricsRegistry::new()));
        let store: Arc<dyn CounterStore> = store;
        RateLimitMiddleware::new(RateLimiter::new(policy, store, observer).with_clock(Arc::new(clock)))
    }

    fn request(ip: &str) -> RequestContext {
        RequestContext::new(
            "req".to_string(),
            Method::GET,
            "/api/test".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            Some(ip.parse().unwrap()),
        )
    }

    fn header<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[tokio::test]
    async fn admitted_responses_carry_rate_limit_headers() {
        let middleware = middleware(
            RateLimitPolicy::builder("default")
                .max_requests(5)
                .window(Duration::from_secs(60))
                .build()
                .unwrap(),
        );

        let mut ctx = request("192.168.1.100");
        assert!(matches!(middleware.on_request(&mut ctx).await.unwrap(), ControlFlow::Continue));

        let mut response = Response::new(Body::empty());
        middleware.on_response(&ctx, &mut response).await.unwrap();
        assert_eq!(header(&response, "x-ratelimit-limit"), Some("5"));
        assert_eq!(header(&response, "x-ratelimit-remaining"), Some("4"));
        assert_eq!(header(&response, "x-ratelimit-reset"), Some("60"));
    }

    #[tokio::test]
    async fn sixth_request_gets_429_with_retry_hint() {
        let middleware = middleware(RateLimitPolicy::builder("default").max_requests(5).build().unwrap());

        for _ in 0..5 {
            let mut ctx = request("192.168.1.100");
            assert!(matches!(middleware.on_request(&mut ctx).await.unwrap(), ControlFlow::Continue));
        }

        let mut ctx = request("192.168.1.100");
        let ControlFlow::ShortCircuit(response) = middleware.on_request(&mut ctx).await.unwrap() else {
            panic!("expected a 429");
        };
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "retry-after"), Some("60"));
        assert_eq!(header(&response, "x-ratelimit-remaining"), Some("0"));
    }

    #[tokio::test]
    async fn deny_listed_address_gets_403() {
        let middleware = middleware(
            RateLimitPolicy::builder("default")
                .deny(["192.168.1.0/24"])
                .build()
                .unwrap(),
        );

        let mut ctx = request("192.168.1.100");
        let ControlFlow::ShortCircuit(response) = middleware.on_request(&mut ctx).await.unwrap() else {
            panic!("expected a 403");
        };
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(ctx.metadata.is_empty());
    }

    #[tokio::test]
    async fn bypassed_requests_carry_no_headers() {
        let middleware = middleware(RateLimitPolicy::standard("default").build().unwrap());

        let mut ctx = request("127.0.0.1");
        assert!(matches!(middleware.on_request(&mut ctx).await.unwrap(), ControlFlow::Continue));

        let mut response = Response::new(Body::empty());
        middleware.on_response(&ctx, &mut response).await.unwrap();
        assert_eq!(header(&response, "x-ratelimit-limit"), None);
    }
}
