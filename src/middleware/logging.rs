use async_trait::async_trait;
use axum::{
    body::Body,
    http::StatusCode,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::GatewayResult,
    middleware::{
        ControlFlow,
        GatewayMiddleware,
        rate_limit::{LIMIT_KEY, REMAINING_KEY},
    },
};

/// Access log. Runs first in the chain so its completion line also covers
/// requests rejected by later stages.
pub struct RequestLoggingMiddleware;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessLevel {
    Info,
    Warn,
    Error,
}

fn access_level(status: StatusCode) -> AccessLevel {
    if status.is_server_error() {
        AccessLevel::Error
    } else if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
        AccessLevel::Warn
    } else {
        AccessLevel::Info
    }
}

#[async_trait]
impl GatewayMiddleware for RequestLoggingMiddleware {
    fn name(&self) -> &'static str {
        "access-log"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        tracing::debug!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            client_ip = ?ctx.client_ip,
            "request received"
        );
        Ok(ControlFlow::Continue)
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        let status = response.status();
        let latency_ms = ctx.started_at.elapsed().as_millis() as u64;
        let limit = ctx.metadata.get(LIMIT_KEY).map(String::as_str);
        let remaining = ctx.metadata.get(REMAINING_KEY).map(String::as_str);

        macro_rules! access {
            ($level:ident) => {
                tracing::$level!(
                    request_id = %ctx.request_id,
                    method = %ctx.method,
                    path = %ctx.uri.path(),
                    status = status.as_u16(),
                    client_ip = ?ctx.client_ip,
                    principal = ctx.principal.as_deref(),
                    rate_limit = limit,
                    rate_limit_remaining = remaining,
                    latency_ms,
                    "request completed"
                )
            };
        }

        match access_level(status) {
            AccessLevel::Info => access!(info),
            AccessLevel::Warn => access!(warn),
            AccessLevel::Error => access!(error),
        }
        Ok(())
    }
}
