//! Metrics and health endpoints.

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Serve `/metrics` (Prometheus text format) and `/healthz` until the token
/// is cancelled.
pub async fn serve(
    listen: String,
    registry: Registry,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(registry);

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", listen))?;

    info!(listen = %listen, "Metrics endpoint up");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("metrics server failed")
}

async fn metrics(State(registry): State<Registry>) -> Result<String, StatusCode> {
    let families = registry.gather();
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&families, &mut buf)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buf).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
