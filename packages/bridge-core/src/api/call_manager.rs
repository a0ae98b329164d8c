//! Per-call tracking with force-close capability.
//!
//! - `CallManager`: tracks all active calls, keyed by call token.
//! - `CallGuard`: RAII guard that releases the call's Runtime State and
//!   connection-map slot on drop, even across a panic unwind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::state::RuntimeState;

struct CallState {
    call_token: String,
}

/// Tracks all active calls. Thread-safe and designed for concurrent access
/// from multiple media bridge handlers.
pub struct CallManager {
    calls: DashMap<u64, CallState>,
    next_id: AtomicU64,
    global_cancel: RwLock<CancellationToken>,
    runtime: Arc<RuntimeState>,
}

impl CallManager {
    pub fn new(runtime: Arc<RuntimeState>) -> Self {
        Self {
            calls: DashMap::new(),
            next_id: AtomicU64::new(1),
            global_cancel: RwLock::new(CancellationToken::new()),
            runtime,
        }
    }

    /// Registers a new call and returns a guard for RAII cleanup.
    pub fn register(self: &Arc<Self>, call_token: String) -> CallGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel_token = self.global_cancel.read().child_token();

        self.calls.insert(
            id,
            CallState {
                call_token: call_token.clone(),
            },
        );
        self.runtime.call_begin(&call_token);
        log::info!(
            "[Bridge] call={} registered (active: {})",
            call_token,
            self.calls.len()
        );

        CallGuard {
            id,
            call_token,
            manager: Arc::clone(self),
            cancel_token,
            end_reason: RwLock::new(None),
        }
    }

    fn unregister(&self, id: u64, call_token: &str, end_reason: &str) {
        if self.calls.remove(&id).is_some() {
            self.runtime.call_end(call_token, end_reason);
            log::info!(
                "[Bridge] call={} unregistered reason={} (remaining: {})",
                call_token,
                end_reason,
                self.calls.len()
            );
        }
    }

    #[must_use]
    pub fn active_call_count(&self) -> usize {
        self.calls.len()
    }

    /// Force-closes all calls.
    pub fn close_all(&self) -> usize {
        let count = self.calls.len();
        if count > 0 {
            log::info!("[Bridge] force-closing {count} call(s)");
            let mut guard = self.global_cancel.write();
            guard.cancel();
            *guard = CancellationToken::new();
        }
        count
    }
}

/// RAII guard that unregisters a call when dropped, recording the reason
/// set via [`CallGuard::set_end_reason`] (defaulting to `"disconnect"`).
pub struct CallGuard {
    id: u64,
    call_token: String,
    manager: Arc<CallManager>,
    cancel_token: CancellationToken,
    end_reason: RwLock<Option<String>>,
}

impl CallGuard {
    pub fn call_token(&self) -> &str {
        &self.call_token
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Records why the call ended; read by `Drop` to report to Runtime State.
    pub fn set_end_reason(&self, reason: impl Into<String>) {
        *self.end_reason.write() = Some(reason.into());
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        let reason = self
            .end_reason
            .read()
            .clone()
            .unwrap_or_else(|| "disconnect".to_string());
        self.manager.unregister(self.id, &self.call_token, &reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_drop_updates_counts() {
        let runtime = Arc::new(RuntimeState::new());
        let manager = Arc::new(CallManager::new(Arc::clone(&runtime)));
        {
            let guard = manager.register("call-1".to_string());
            assert_eq!(manager.active_call_count(), 1);
            assert_eq!(guard.call_token(), "call-1");
        }
        assert_eq!(manager.active_call_count(), 0);
        let snap = runtime.snapshot();
        assert_eq!(snap.total_calls_started, 1);
        assert_eq!(snap.total_calls_ended, 1);
    }

    #[test]
    fn end_reason_defaults_to_disconnect() {
        let runtime = Arc::new(RuntimeState::new());
        let manager = Arc::new(CallManager::new(Arc::clone(&runtime)));
        let guard = manager.register("call-2".to_string());
        drop(guard);
        let snap = runtime.snapshot();
        let call = snap
            .calls
            .into_iter()
            .find(|c| c.call_token == "call-2")
            .unwrap();
        assert_eq!(call.end_reason.as_deref(), Some("disconnect"));
    }

    #[test]
    fn close_all_cancels_tokens() {
        let runtime = Arc::new(RuntimeState::new());
        let manager = Arc::new(CallManager::new(runtime));
        let guard = manager.register("call-3".to_string());
        let token = guard.cancel_token().clone();
        assert!(!token.is_cancelled());
        manager.close_all();
        assert!(token.is_cancelled());
    }
}
