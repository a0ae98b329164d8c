//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where the
//! runtime state aggregator, the call manager, and the validated
//! configuration are instantiated and wired into an [`AppState`]. Keeping
//! this in one place (rather than letting `main` construct each piece ad
//! hoc) is what lets the binary and the test suite build an identical
//! `AppState` from a `Config` alone.

use crate::api::AppState;
use crate::error::BridgeResult;
use crate::state::Config;

/// Container for all bootstrapped services.
///
/// Thin today because the media bridge's state is just `AppState` -
/// the runtime aggregator and the call manager. Kept as its own type
/// (rather than handing back `AppState` directly) so the composition root
/// has a single place to grow additional process-wide services without
/// changing every call site that only needs `AppState`.
pub struct BootstrappedServices {
    pub app_state: AppState,
}

impl BootstrappedServices {
    /// Initiates graceful shutdown: force-closes every active call, which
    /// cancels its tasks and tears down both websocket legs per call.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] beginning graceful shutdown");
        let closed = self.app_state.calls.close_all();
        log::info!("[Bootstrap] force-closed {closed} active call(s)");
    }
}

/// Bootstraps the application: validates `config`, then wires a fresh
/// [`crate::state::RuntimeState`] and [`crate::api::CallManager`] into an
/// [`AppState`].
///
/// # Errors
///
/// Returns [`crate::error::BridgeError::Configuration`] if `config` fails
/// validation - per the error handling design, a configuration error at
/// startup is fatal and the process should refuse to start.
pub fn bootstrap_services(config: Config) -> BridgeResult<BootstrappedServices> {
    config.validate()?;
    let app_state = AppState::builder().config(config).build();
    Ok(BootstrappedServices { app_state })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut cfg = Config::default();
        cfg.speech_service_endpoint = "wss://example.invalid/voice-live".into();
        cfg
    }

    #[test]
    fn bootstrap_succeeds_with_valid_config() {
        let services = bootstrap_services(valid_config()).unwrap();
        assert_eq!(services.app_state.calls.active_call_count(), 0);
    }

    #[test]
    fn bootstrap_rejects_invalid_config() {
        let err = bootstrap_services(Config::default()).unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }

    #[tokio::test]
    async fn shutdown_force_closes_active_calls() {
        let services = bootstrap_services(valid_config()).unwrap();
        let guard = services.app_state.calls.register("call-1".to_string());
        let token = guard.cancel_token().clone();
        services.shutdown().await;
        assert!(token.is_cancelled());
    }
}
