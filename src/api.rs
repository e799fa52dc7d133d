//! Status endpoints for operating the indexer.
use crate::error::{IndexerError, Result};
use crate::metrics::IndexerMetrics;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tracing::info;

/// Serves `/health`, `/stats` and `/metrics`.
pub struct StatusServer {
    metrics: Arc<IndexerMetrics>,
    bind_address: String,
}

#[derive(Clone)]
struct AppState {
    metrics: Arc<IndexerMetrics>,
}

impl StatusServer {
    pub fn new(metrics: Arc<IndexerMetrics>, bind_address: &str) -> Self {
        Self {
            metrics,
            bind_address: bind_address.to_string(),
        }
    }

    pub async fn run(self) -> Result<()> {
        let state = AppState {
            metrics: self.metrics,
        };

        let app = Router::new()
            .route("/health", get(health_check))
            .route("/stats", get(get_stats))
            .route("/metrics", get(get_metrics))
            .with_state(state);

        info!("status endpoints listening on http://{}", self.bind_address);
        let listener = tokio::net::TcpListener::bind(&self.bind_address)
            .await
            .map_err(|e| IndexerError::Connection(e.to_string()))?;

        axum::serve(listener, app)
            .await
            .map_err(|e| IndexerError::Connection(e.to_string()))?;

        Ok(())
    }
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.to_json())
}

async fn get_metrics(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export(),
    )
        .into_response()
}
