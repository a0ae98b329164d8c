//! HTTP route handlers: `/health`, `/status`, and the `/media/{token}`
//! websocket upgrade.
//!
//! All handlers are thin - they delegate to the Runtime State snapshot or
//! the Media Bridge for business logic.

use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::ws::media_handler;
use crate::api::AppState;
use crate::protocol_constants::{APP_NAME, SERVICE_ID};

/// Builds the full router for the media bridge.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/media/{token}", get(media_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "service": SERVICE_ID,
        "status": "ok",
    }))
}

async fn status_handler(axum::extract::State(state): axum::extract::State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.runtime.snapshot();
    Json(json!({
        "app": APP_NAME,
        "active_calls": snapshot.active_calls,
        "total_calls_started": snapshot.total_calls_started,
        "total_calls_ended": snapshot.total_calls_ended,
        "calls": snapshot.calls,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::state::{Config, RuntimeState};

    fn test_state() -> AppState {
        let mut cfg = Config::default();
        cfg.speech_service_endpoint = "wss://example.invalid".into();
        let runtime = Arc::new(RuntimeState::new());
        AppState::builder()
            .config(cfg)
            .runtime(runtime)
            .build()
    }

    #[tokio::test]
    async fn health_reports_service_id() {
        let Json(body) = health_handler().await;
        assert_eq!(body["service"], SERVICE_ID);
    }

    #[tokio::test]
    async fn status_reports_zero_calls_initially() {
        let state = test_state();
        let Json(body) = status_handler(axum::extract::State(state)).await;
        assert_eq!(body["active_calls"], 0);
        assert_eq!(body["total_calls_started"], 0);
    }
}
