//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Call Token Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Generates a fresh call token (UUID v4, hyphenated lowercase).
///
/// Used when the telephony provider does not already supply a stable
/// identifier in the `/media/{token}` path and `media_token_mode` is
/// configured as [`crate::state::TokenMode::Opaque`] with no token present.
#[must_use]
pub fn new_call_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_millis_is_nonzero() {
        assert!(now_millis() > 0);
    }

    #[test]
    fn call_tokens_are_unique() {
        assert_ne!(new_call_token(), new_call_token());
    }
}
