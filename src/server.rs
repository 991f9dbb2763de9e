use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, header},
    response::{IntoResponse, Response},
    routing::get,
};

use crate::gateway::Gateway;

/// Gateway's own endpoints plus the proxy fallback. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .fallback(proxy_handler)
        .with_state(gateway)
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gateway.metrics().render_prometheus(),
    )
}

async fn proxy_handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    gateway.handle_http(request, Some(addr.ip())).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::{
        body::to_bytes,
        extract::connect_info::MockConnectInfo,
        http::StatusCode,
        routing::post,
    };
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    use super::*;
    use crate::config::GatewayConfig;

    async fn spawn_upstream() -> String {
        let app = Router::new()
            .route("/api/auth/login", post(|| async { StatusCode::UNAUTHORIZED }))
            .fallback(|| async { "upstream ok" });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn app(peer: [u8; 4], vars: &[(&str, &str)]) -> Router {
        let mut vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        vars.insert("UPSTREAM_URL".to_string(), spawn_upstream().await);

        let config = GatewayConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();
        let gateway = Arc::new(Gateway::from_config(config).await.unwrap());
        router(gateway).layer(MockConnectInfo(SocketAddr::from((peer, 40_000))))
    }

    fn get_request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    fn header(response: &Response, name: &str) -> Option<String> {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    }

    async fn json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_served_locally() {
        let app = app([10, 0, 0, 1], &[]).await;
        let response = app.oneshot(get_request("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn forwards_until_the_limit_then_answers_429() {
        let app = app([10, 0, 0, 1], &[("RATE_LIMIT_MAX_REQUESTS", "2")]).await;

        for remaining in ["1", "0"] {
            let response = app.clone().oneshot(get_request("/api/items")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(header(&response, "x-ratelimit-limit").as_deref(), Some("2"));
            assert_eq!(header(&response, "x-ratelimit-remaining").as_deref(), Some(remaining));
            assert!(header(&response, "x-request-id").is_some());
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&body[..], b"upstream ok");
        }

        let response = app.clone().oneshot(get_request("/api/items")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(header(&response, "retry-after").is_some());
        let body = json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "RATE_LIMIT_EXCEEDED");
        assert!(body["retryAfter"].as_u64().unwrap() >= 1);

        let response = app.oneshot(get_request("/metrics")).await.unwrap();
        let text = String::from_utf8(
            to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec(),
        )
        .unwrap();
        assert!(text.contains("ratelimit_decisions_total{outcome=\"admitted\"} 2"));
        assert!(text.contains("ratelimit_decisions_total{outcome=\"limited\"} 1"));
    }

    #[tokio::test]
    async fn deny_listed_peer_gets_403() {
        let app = app([192, 0, 2, 66], &[("RATE_LIMIT_DENY_LIST", "192.0.2.0/24")]).await;

        let response = app.oneshot(get_request("/api/items")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json(response).await["error"], "IP_BLOCKED");
    }

    #[tokio::test]
    async fn loopback_bypasses_limits() {
        let app = app([127, 0, 0, 1], &[("RATE_LIMIT_MAX_REQUESTS", "1")]).await;

        for _ in 0..5 {
            let response = app.clone().oneshot(get_request("/api/items")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(header(&response, "x-ratelimit-limit").is_none());
        }
    }

    #[tokio::test]
    async fn failed_logins_are_throttled() {
        let app = app([10, 0, 0, 7], &[("LOGIN_MAX_FAILURES", "2")]).await;
        let login = || {
            Request::builder()
                .method("POST")
                .uri("/api/auth/login")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"email":"user@example.com","password":"nope"}"#))
                .unwrap()
        };

        for _ in 0..2 {
            let response = app.clone().oneshot(login()).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let response = app.oneshot(login()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json(response).await["error"], "LOGIN_THROTTLED");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let app = app([10, 0, 0, 1], &[("MAX_BODY_BYTES", "8")]).await;
        let request = Request::builder()
            .method("POST")
            .uri("/api/items")
            .body(Body::from("far more than eight bytes"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json(response).await["error"], "PAYLOAD_TOO_LARGE");
    }
}
