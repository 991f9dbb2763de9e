use std::{
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Context;
use ratelimit_gateway::{
    config::{GatewayConfig, LogFormat},
    gateway::Gateway,
    init_tracing,
    server,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = GatewayConfig::from_env();
    init_tracing(cfg.as_ref().map_or(LogFormat::Compact, |cfg| cfg.log_format));

    let cfg = cfg.context("failed to build gateway config")?;
    let bind_addr = cfg.bind_addr;
    let upstream = cfg.upstream.base_url.clone();

    let gateway = Arc::new(Gateway::from_config(cfg).await?);
    let app = server::router(gateway);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(addr = %bind_addr, upstream = %upstream, "rate limit gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
