//! HTTP/WebSocket API layer.
//!
//! This module contains thin handlers that delegate to the Media Bridge and
//! Runtime State. It provides the router construction and server startup
//! functionality.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::state::{Config, RuntimeState};

pub mod call_manager;
pub mod http;
pub mod ws;

pub use call_manager::{CallGuard, CallManager};

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer.
///
/// A thin wrapper holding references to the runtime aggregator, the call
/// manager, and the live configuration - all business logic lives in
/// `media_bridge` and `speech_session`.
#[derive(Clone)]
pub struct AppState {
    /// Live configuration.
    pub config: Arc<RwLock<Config>>,
    /// Process-wide call metrics aggregator.
    pub runtime: Arc<RuntimeState>,
    /// Tracks active calls and supports force-close.
    pub calls: Arc<CallManager>,
}

/// Builder for constructing an `AppState`.
#[derive(Default)]
pub struct AppStateBuilder {
    config: Option<Config>,
    runtime: Option<Arc<RuntimeState>>,
}

impl AppStateBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the runtime state aggregator. If unset, a fresh empty one is used.
    pub fn runtime(mut self, runtime: Arc<RuntimeState>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Builds the `AppState`, panicking if required fields are missing.
    pub fn build(self) -> AppState {
        let runtime = self
            .runtime
            .unwrap_or_else(|| Arc::new(RuntimeState::new()));
        let config = self.config.expect("config is required");
        let calls = Arc::new(CallManager::new(Arc::clone(&runtime)));
        AppState {
            config: Arc::new(RwLock::new(config)),
            runtime,
            calls,
        }
    }
}

impl AppState {
    /// Creates a new builder for constructing an `AppState`.
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::new()
    }
}

/// Starts the HTTP server on the configured port (0 lets the OS pick one).
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let preferred_port = state.config.read().preferred_port;
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], preferred_port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let bound = listener.local_addr()?;

    log::info!("[Server] listening on http://{bound}");
    let app = http::create_router(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_runtime_when_unset() {
        let mut cfg = Config::default();
        cfg.speech_service_endpoint = "wss://example.invalid".into();
        let state = AppState::builder().config(cfg).build();
        assert_eq!(state.runtime.snapshot().active_calls, 0);
        assert_eq!(state.calls.active_call_count(), 0);
    }

    #[test]
    #[should_panic(expected = "config is required")]
    fn builder_panics_without_config() {
        AppState::builder().build();
    }
}
