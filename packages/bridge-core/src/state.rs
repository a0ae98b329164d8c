//! Core application state: typed configuration and the runtime metrics
//! aggregator.
//!
//! [`Config`] groups every tunable named in the external interface table
//! into a single typed, validated struct (mirroring the reference
//! codebase's `StreamingConfig`/`Config` + `validate()` pattern). [`RuntimeState`]
//! is the process-wide, explicitly-passed counters/metadata aggregator: it
//! is constructed once at startup and threaded through the composition root
//! the same way `AppState` is threaded through request handlers, never
//! reached for as a module-level singleton.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::protocol_constants::*;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Output wire format for frames sent back to the telephony socket.
///
/// Per the resolved open question in the design notes, only these two
/// shapes are implemented; the source's `multi` mode (which duplicated
/// audio) is deliberately not carried over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// `{"kind":"AudioData","audioData":{"data":"<base64>"}}` text frames.
    JsonSimple,
    /// Raw binary PCM16 frames.
    Binary,
}

impl FromStr for OutputFormat {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json_simple" => Ok(Self::JsonSimple),
            "binary" => Ok(Self::Binary),
            other => Err(BridgeError::Configuration(format!(
                "media_out_format must be 'json_simple' or 'binary', got '{other}'"
            ))),
        }
    }
}

/// How the `/media/{token}` path segment should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenMode {
    /// The token is an opaque identifier with no further structure.
    Opaque,
    /// The token is itself the call id used for correlation/logging.
    CallId,
}

/// Whether telephony audio is a single mixed channel or kept unmixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioChannelType {
    Mixed,
    Unmixed,
}

/// Typed, validated configuration for the media bridge.
///
/// Loaded from an optional YAML file and overridable by environment
/// variables and CLI flags (server binary's `ServerConfig::load()`
/// precedence), then checked once with [`Config::validate`] before any
/// listener is bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Telephony frame geometry.
    pub frame_bytes: usize,
    pub frame_interval_ms: u32,
    pub telephony_sample_rate: u32,

    // Media bridging gates.
    pub media_bidirectional: bool,
    pub media_enable_vl_in: bool,
    pub media_enable_vl_out: bool,
    pub media_out_format: OutputFormat,
    pub media_token_mode: TokenMode,
    pub media_audio_channel_type: AudioChannelType,
    pub outbound_ring_capacity: usize,

    // Call lifecycle.
    pub call_timeout_sec: u64,
    pub call_idle_timeout_sec: u64,

    // Commit controller.
    pub adaptive_min_ms: u64,
    pub safety_ms: u64,
    pub max_buffer_ms: u64,
    pub silence_commit_ms: u64,
    pub no_speech_commit_ms: u64,
    pub min_speech_frames_for_commit: u32,
    pub bootstrap_min_speech_frames: u32,
    pub commit_min_user_ms: u64,

    // Bootstrap VAD tuning.
    pub bootstrap_duration_ms: u64,
    pub bootstrap_offset: f64,
    pub offset_decay_step: f64,
    pub offset_decay_interval_ms: u64,
    pub offset_decay_min: f64,

    // Steady-state VAD tuning.
    pub dynamic_rms_offset: f64,
    pub dynamic_rms_min: f64,
    pub dynamic_rms_max: f64,

    // Barge-in detector.
    pub barge_in_enabled: bool,
    pub barge_in_offset: f64,
    pub barge_in_consecutive_frames: u32,
    pub barge_in_min_agent_ms: u64,
    pub barge_in_min_user_ms: u64,
    pub barge_in_relative_factor: f64,
    pub barge_in_cooldown_ms: u64,
    pub barge_in_release_frames: u32,
    pub barge_in_lock_ms: u64,
    pub barge_in_min_snr_db: f64,
    pub barge_in_abs_min_rms: f64,

    // Speech service connection (external collaborator, §6).
    pub speech_service_endpoint: String,
    pub speech_service_api_key: String,
    pub speech_service_voice: String,
    pub auto_response: bool,

    /// Preferred HTTP bind port; 0 lets the server pick any free port.
    pub preferred_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame_bytes: DEFAULT_FRAME_BYTES,
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
            telephony_sample_rate: DEFAULT_TELEPHONY_SAMPLE_RATE,

            media_bidirectional: true,
            media_enable_vl_in: true,
            media_enable_vl_out: true,
            media_out_format: OutputFormat::JsonSimple,
            media_token_mode: TokenMode::Opaque,
            media_audio_channel_type: AudioChannelType::Mixed,
            outbound_ring_capacity: DEFAULT_OUTBOUND_RING_CAPACITY,

            call_timeout_sec: DEFAULT_CALL_TIMEOUT_SEC,
            call_idle_timeout_sec: DEFAULT_CALL_IDLE_TIMEOUT_SEC,

            adaptive_min_ms: DEFAULT_ADAPTIVE_MIN_MS,
            safety_ms: DEFAULT_SAFETY_MS,
            max_buffer_ms: DEFAULT_MAX_BUFFER_MS,
            silence_commit_ms: DEFAULT_SILENCE_COMMIT_MS,
            no_speech_commit_ms: DEFAULT_NO_SPEECH_COMMIT_MS,
            min_speech_frames_for_commit: DEFAULT_MIN_SPEECH_FRAMES_FOR_COMMIT,
            bootstrap_min_speech_frames: DEFAULT_BOOTSTRAP_MIN_SPEECH_FRAMES,
            commit_min_user_ms: DEFAULT_COMMIT_MIN_USER_MS,

            bootstrap_duration_ms: DEFAULT_BOOTSTRAP_DURATION_MS,
            bootstrap_offset: DEFAULT_BOOTSTRAP_OFFSET,
            offset_decay_step: DEFAULT_OFFSET_DECAY_STEP,
            offset_decay_interval_ms: DEFAULT_OFFSET_DECAY_INTERVAL_MS,
            offset_decay_min: DEFAULT_OFFSET_DECAY_MIN,

            dynamic_rms_offset: DEFAULT_DYNAMIC_RMS_OFFSET,
            dynamic_rms_min: DEFAULT_DYNAMIC_RMS_MIN,
            dynamic_rms_max: DEFAULT_DYNAMIC_RMS_MAX,

            barge_in_enabled: true,
            barge_in_offset: DEFAULT_BARGE_IN_OFFSET,
            barge_in_consecutive_frames: DEFAULT_BARGE_IN_CONSECUTIVE_FRAMES,
            barge_in_min_agent_ms: DEFAULT_BARGE_IN_MIN_AGENT_MS,
            barge_in_min_user_ms: DEFAULT_BARGE_IN_MIN_USER_MS,
            barge_in_relative_factor: DEFAULT_BARGE_IN_RELATIVE_FACTOR,
            barge_in_cooldown_ms: DEFAULT_BARGE_IN_COOLDOWN_MS,
            barge_in_release_frames: DEFAULT_BARGE_IN_RELEASE_FRAMES,
            barge_in_lock_ms: DEFAULT_BARGE_IN_LOCK_MS,
            barge_in_min_snr_db: DEFAULT_BARGE_IN_MIN_SNR_DB,
            barge_in_abs_min_rms: DEFAULT_BARGE_IN_ABS_MIN_RMS,

            speech_service_endpoint: String::new(),
            speech_service_api_key: String::new(),
            speech_service_voice: "alloy".to_string(),
            auto_response: true,

            preferred_port: 0,
        }
    }
}

impl Config {
    /// Validates the configuration, returning a [`BridgeError::Configuration`]
    /// describing the first problem found.
    ///
    /// Called once at process startup; on failure the process refuses to
    /// start (§7, error kind 7).
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.speech_service_endpoint.trim().is_empty() {
            return Err(BridgeError::Configuration(
                "speech_service_endpoint must be set".into(),
            ));
        }
        if self.frame_bytes == 0 || self.frame_bytes % 2 != 0 {
            return Err(BridgeError::Configuration(format!(
                "frame_bytes must be a positive even number, got {}",
                self.frame_bytes
            )));
        }
        let expected = (self.telephony_sample_rate as u64 * self.frame_interval_ms as u64 * 2
            / 1000) as usize;
        if self.frame_bytes != expected {
            return Err(BridgeError::Configuration(format!(
                "frame_bytes ({}) does not match telephony_sample_rate ({}) * frame_interval_ms ({}) geometry (expected {})",
                self.frame_bytes, self.telephony_sample_rate, self.frame_interval_ms, expected
            )));
        }
        if self.outbound_ring_capacity == 0 {
            return Err(BridgeError::Configuration(
                "outbound_ring_capacity must be > 0".into(),
            ));
        }
        if self.dynamic_rms_min >= self.dynamic_rms_max {
            return Err(BridgeError::Configuration(format!(
                "dynamic_rms_min ({}) must be less than dynamic_rms_max ({})",
                self.dynamic_rms_min, self.dynamic_rms_max
            )));
        }
        if self.call_timeout_sec == 0 || self.call_idle_timeout_sec == 0 {
            return Err(BridgeError::Configuration(
                "call_timeout_sec and call_idle_timeout_sec must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime State
// ─────────────────────────────────────────────────────────────────────────────

/// Current commit-controller phase, surfaced for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPhase {
    Idle,
    Accumulating,
    CommitSent,
    ErrorBackoff,
}

/// Per-call counters and lifecycle metadata tracked by [`RuntimeState`].
///
/// This never owns audio buffers or sockets; it is a pure bookkeeping
/// record so the `/status` endpoint can describe a call without holding
/// any of its real resources.
#[derive(Debug, Clone, Serialize)]
pub struct CallMetrics {
    pub call_token: String,
    pub started_at_ms: u64,
    pub ended_at_ms: Option<u64>,
    pub end_reason: Option<String>,

    pub media_ws_open: bool,
    pub speech_session_open: bool,

    pub inbound_frames: u64,
    pub inbound_bytes: u64,
    pub outbound_frames: u64,
    pub outbound_bytes: u64,

    pub decode_errors: u64,
    pub dropped_frames: u64,
    pub ring_high_water_mark: usize,

    pub commit_successes: u64,
    pub commit_errors: u64,
    pub commit_blocks: HashMap<String, u64>,
    pub first_commit_latency_ms: Option<u64>,

    pub barge_in_triggers: u64,

    pub peak_rms: f64,
    pub rms_sum: f64,
    pub rms_samples: u64,
    pub silent_frames: u64,
    pub non_silent_frames: u64,
    pub drift_events: u64,

    pub negotiated_input_rate: Option<u32>,
    pub negotiated_output_rate: Option<u32>,
    pub voice: Option<String>,
    pub session_id: Option<String>,

    pub commit_phase: CommitPhase,
    pub last_error: Option<String>,
}

impl CallMetrics {
    fn new(call_token: String) -> Self {
        Self {
            call_token,
            started_at_ms: now_millis(),
            ended_at_ms: None,
            end_reason: None,
            media_ws_open: false,
            speech_session_open: false,
            inbound_frames: 0,
            inbound_bytes: 0,
            outbound_frames: 0,
            outbound_bytes: 0,
            decode_errors: 0,
            dropped_frames: 0,
            ring_high_water_mark: 0,
            commit_successes: 0,
            commit_errors: 0,
            commit_blocks: HashMap::new(),
            first_commit_latency_ms: None,
            barge_in_triggers: 0,
            peak_rms: 0.0,
            rms_sum: 0.0,
            rms_samples: 0,
            silent_frames: 0,
            non_silent_frames: 0,
            drift_events: 0,
            negotiated_input_rate: None,
            negotiated_output_rate: None,
            voice: None,
            session_id: None,
            commit_phase: CommitPhase::Idle,
            last_error: None,
        }
    }
}

/// Deep-copied, JSON-serializable view returned by [`RuntimeState::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    pub active_calls: usize,
    pub total_calls_started: u64,
    pub total_calls_ended: u64,
    pub calls: Vec<CallMetrics>,
}

struct RuntimeStateInner {
    total_calls_started: u64,
    total_calls_ended: u64,
}

/// Process-wide, explicitly-passed counters/metadata aggregator.
///
/// Construction happens once in the composition root (`bootstrap`) and the
/// resulting `Arc<RuntimeState>` is threaded through every component that
/// records a metric, per the design note requiring an explicit handle
/// rather than a module-level singleton.
pub struct RuntimeState {
    calls: DashMap<String, CallMetrics>,
    inner: ReentrantMutex<RefCell<RuntimeStateInner>>,
}

impl RuntimeState {
    /// Creates a fresh, empty runtime state.
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
            inner: ReentrantMutex::new(RefCell::new(RuntimeStateInner {
                total_calls_started: 0,
                total_calls_ended: 0,
            })),
        }
    }

    /// Records the start of a new call. Idempotent-safe: re-inserting the
    /// same token resets its metrics.
    pub fn call_begin(&self, call_token: &str) {
        self.calls
            .insert(call_token.to_string(), CallMetrics::new(call_token.to_string()));
        let guard = self.inner.lock();
        guard.borrow_mut().total_calls_started += 1;
    }

    /// Records the end of a call with a human-readable reason
    /// (`"disconnect"`, `"call_timeout"`, `"idle_timeout"`, `"error"`, ...).
    pub fn call_end(&self, call_token: &str, reason: &str) {
        if let Some(mut entry) = self.calls.get_mut(call_token) {
            entry.ended_at_ms = Some(now_millis());
            entry.end_reason = Some(reason.to_string());
            entry.media_ws_open = false;
            entry.speech_session_open = false;
        }
        let guard = self.inner.lock();
        guard.borrow_mut().total_calls_ended += 1;
    }

    pub fn media_ws_open(&self, call_token: &str) {
        self.with_call(call_token, |m| m.media_ws_open = true);
    }

    pub fn media_ws_closed(&self, call_token: &str) {
        self.with_call(call_token, |m| m.media_ws_open = false);
    }

    pub fn speech_session_begin(&self, call_token: &str) {
        self.with_call(call_token, |m| m.speech_session_open = true);
    }

    pub fn speech_session_end(&self, call_token: &str) {
        self.with_call(call_token, |m| m.speech_session_open = false);
    }

    pub fn record_inbound_frame(&self, call_token: &str, bytes: usize) {
        self.with_call(call_token, |m| {
            m.inbound_frames += 1;
            m.inbound_bytes += bytes as u64;
        });
    }

    pub fn record_outbound_frame(&self, call_token: &str, bytes: usize) {
        self.with_call(call_token, |m| {
            m.outbound_frames += 1;
            m.outbound_bytes += bytes as u64;
        });
    }

    pub fn record_decode_error(&self, call_token: &str) {
        self.with_call(call_token, |m| m.decode_errors += 1);
    }

    pub fn record_dropped_frame(&self, call_token: &str, new_high_water: usize) {
        self.with_call(call_token, |m| {
            m.dropped_frames += 1;
            if new_high_water > m.ring_high_water_mark {
                m.ring_high_water_mark = new_high_water;
            }
        });
    }

    pub fn record_ring_high_water(&self, call_token: &str, level: usize) {
        self.with_call(call_token, |m| {
            if level > m.ring_high_water_mark {
                m.ring_high_water_mark = level;
            }
        });
    }

    pub fn record_commit_success(&self, call_token: &str) {
        self.with_call(call_token, |m| {
            m.commit_successes += 1;
            m.commit_phase = CommitPhase::Accumulating;
        });
    }

    pub fn record_commit_error(&self, call_token: &str) {
        self.with_call(call_token, |m| {
            m.commit_errors += 1;
            m.commit_phase = CommitPhase::ErrorBackoff;
        });
    }

    pub fn record_commit_sent(&self, call_token: &str) {
        self.with_call(call_token, |m| m.commit_phase = CommitPhase::CommitSent);
    }

    pub fn record_commit_block(&self, call_token: &str, reason: &str) {
        self.with_call(call_token, |m| {
            *m.commit_blocks.entry(reason.to_string()).or_insert(0) += 1;
        });
    }

    pub fn record_first_commit_latency(&self, call_token: &str, latency_ms: u64) {
        self.with_call(call_token, |m| {
            if m.first_commit_latency_ms.is_none() {
                m.first_commit_latency_ms = Some(latency_ms);
            }
        });
    }

    pub fn record_barge_in(&self, call_token: &str) {
        self.with_call(call_token, |m| m.barge_in_triggers += 1);
    }

    pub fn record_rms(&self, call_token: &str, rms: f64, is_speech: bool) {
        self.with_call(call_token, |m| {
            m.rms_sum += rms;
            m.rms_samples += 1;
            if rms > m.peak_rms {
                m.peak_rms = rms;
            }
            if is_speech {
                m.non_silent_frames += 1;
            } else {
                m.silent_frames += 1;
            }
        });
    }

    pub fn record_drift_event(&self, call_token: &str) {
        self.with_call(call_token, |m| m.drift_events += 1);
    }

    pub fn record_negotiated_formats(
        &self,
        call_token: &str,
        input_rate: u32,
        output_rate: u32,
        voice: &str,
        session_id: &str,
    ) {
        self.with_call(call_token, |m| {
            m.negotiated_input_rate = Some(input_rate);
            m.negotiated_output_rate = Some(output_rate);
            m.voice = Some(voice.to_string());
            m.session_id = Some(session_id.to_string());
        });
    }

    pub fn record_last_error(&self, call_token: &str, error: &str) {
        self.with_call(call_token, |m| m.last_error = Some(error.to_string()));
    }

    fn with_call(&self, call_token: &str, f: impl FnOnce(&mut CallMetrics)) {
        if let Some(mut entry) = self.calls.get_mut(call_token) {
            f(&mut entry);
        }
    }

    /// Returns a deep-copied, JSON-serializable snapshot of all tracked calls.
    pub fn snapshot(&self) -> RuntimeSnapshot {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        let calls: Vec<CallMetrics> = self.calls.iter().map(|e| e.value().clone()).collect();
        RuntimeSnapshot {
            active_calls: calls.iter().filter(|c| c.ended_at_ms.is_none()).count(),
            total_calls_started: inner.total_calls_started,
            total_calls_ended: inner.total_calls_ended,
            calls,
        }
    }

    /// Removes terminal call records older than this is left to the caller;
    /// for now calls are retained for the lifetime of the process (bounded
    /// by realistic call volume) so `/status` can show recently ended calls.
    pub fn remove_call(&self, call_token: &str) {
        self.calls.remove(call_token);
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeState")
            .field("active_calls", &self.calls.len())
            .finish()
    }
}

/// Returns the current Unix timestamp in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let mut cfg = Config::default();
        cfg.speech_service_endpoint = "wss://example.invalid/voice-live".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_missing_endpoint() {
        let cfg = Config::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_mismatched_frame_geometry() {
        let mut cfg = Config::default();
        cfg.speech_service_endpoint = "wss://example.invalid".into();
        cfg.frame_bytes = 999;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn output_format_rejects_unknown_value() {
        assert!("multi".parse::<OutputFormat>().is_err());
        assert_eq!(
            "json_simple".parse::<OutputFormat>().unwrap(),
            OutputFormat::JsonSimple
        );
    }

    #[test]
    fn runtime_state_tracks_call_lifecycle() {
        let state = RuntimeState::new();
        state.call_begin("call-1");
        state.record_inbound_frame("call-1", 640);
        state.record_outbound_frame("call-1", 640);
        state.record_commit_success("call-1");
        state.call_end("call-1", "disconnect");

        let snap = state.snapshot();
        assert_eq!(snap.total_calls_started, 1);
        assert_eq!(snap.total_calls_ended, 1);
        assert_eq!(snap.active_calls, 0);
        let call = snap.calls.into_iter().find(|c| c.call_token == "call-1").unwrap();
        assert_eq!(call.inbound_frames, 1);
        assert_eq!(call.outbound_frames, 1);
        assert_eq!(call.commit_successes, 1);
    }

    #[test]
    fn dropped_frames_track_high_water_mark() {
        let state = RuntimeState::new();
        state.call_begin("call-2");
        for i in 1..=70 {
            state.record_dropped_frame("call-2", i.min(64));
        }
        let snap = state.snapshot();
        let call = snap.calls.into_iter().find(|c| c.call_token == "call-2").unwrap();
        assert_eq!(call.ring_high_water_mark, 64);
        assert_eq!(call.dropped_frames, 70);
    }
}
