use axum::{
    body::Body,
    response::Response,
};
use http::header::HeaderName;
use std::time::Duration;

use crate::{
    config::UpstreamConfig,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
};

/// Forwards admitted requests to the single protected application.
#[derive(Clone)]
pub struct Upstream {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl Upstream {
    pub fn new(config: &UpstreamConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    pub async fn forward(&self, ctx: &RequestContext) -> GatewayResult<Response<Body>> {
        let path_and_query = ctx
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or(ctx.uri.path());
        let target_url = format!("{}{}", self.base_url, path_and_query);

        let mut request = self
            .client
            .request(ctx.method.clone(), &target_url)
            .body(ctx.body.clone());

        for (name, value) in &ctx.headers {
            if should_forward_header(name) {
                request = request.header(name, value);
            }
        }

        request = request.header("x-request-id", ctx.request_id.clone());
        if let Some(client_ip) = ctx.client_ip {
            request = request.header("x-forwarded-for", client_ip.to_string());
        }

        let upstream_response = request.timeout(self.timeout).send().await.map_err(|err| {
            tracing::warn!(
                request_id = %ctx.request_id,
                upstream = %target_url,
                error = %err,
                "upstream call failed"
            );
            GatewayError::from(err)
        })?;

        let status = upstream_response.status();
        let headers = upstream_response.headers().clone();
        let body = upstream_response.bytes().await?;

        let mut builder = Response::builder().status(status);
        for (name, value) in &headers {
            if should_forward_header(name) {
                builder = builder.header(name, value);
            }
        }

        builder
            .body(Body::from(body))
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }
}

fn should_forward_header(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_stay_behind() {
        for name in ["connection", "transfer-encoding", "host", "content-length"] {
            assert!(!should_forward_header(&HeaderName::from_static(name)));
        }
        for name in ["authorization", "content-type", "x-user-id"] {
            assert!(should_forward_header(&HeaderName::from_static(name)));
        }
    }
}
