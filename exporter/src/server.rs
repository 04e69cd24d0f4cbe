//! The scrape endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use log::error;
use tokio::sync::{mpsc, Mutex};

use crate::pipeline::Pipeline;
use crate::render::render;

pub struct AppState {
    /// Scrapes are serialized here: a request that arrives while another
    /// scrape is in flight waits for the lock, then runs its own scrape.
    pub pipeline: Mutex<Pipeline>,
    /// Fatal errors reported by a scrape; `main` exits non-zero on receipt.
    pub fatal: mpsc::Sender<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut pipeline = state.pipeline.lock().await;
    match pipeline.scrape().await {
        Ok(metrics) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            render(&metrics),
        )
            .into_response(),
        Err(err) => {
            if err.is_fatal() {
                error!("[server] fatal error during scrape: {err}");
                let _ = state.fatal.try_send(err.to_string());
            }
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("collection failed: {err}\n"),
            )
                .into_response()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
