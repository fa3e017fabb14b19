//! Health and metrics endpoints

use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use zbroker_observability::metrics;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always true while the process serves requests
    pub ok: bool,
    /// Server version
    pub version: String,
}

/// Liveness probe
pub async fn healthcheck() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus exposition
pub async fn prometheus() -> impl IntoResponse {
    let Some(m) = metrics() else {
        return (StatusCode::NOT_FOUND, "metrics are disabled".to_string()).into_response();
    };
    match m.encode() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
