//! Fixed protocol and tuning constants that should NOT be changed lightly.
//!
//! Values here are either defined by the wire protocols the bridge speaks
//! (telephony frame geometry) or are the tuned defaults for the adaptive
//! VAD/commit/barge-in state machines. They are the starting point for
//! `Config`'s `Default` impl; operators override them via YAML/env/CLI.

// ─────────────────────────────────────────────────────────────────────────────
// Telephony Frame Geometry
// ─────────────────────────────────────────────────────────────────────────────

/// Default telephony sample rate (Hz): 16 kHz mono, the provider's default.
pub const DEFAULT_TELEPHONY_SAMPLE_RATE: u32 = 16_000;

/// Default frame duration in milliseconds. Every wire frame is this long.
pub const DEFAULT_FRAME_INTERVAL_MS: u32 = 20;

/// Default frame size in bytes at 16 kHz mono PCM16: 16000 * 0.020 * 2 = 640.
pub const DEFAULT_FRAME_BYTES: usize = 640;

/// Assumed speech-service sample rate when the service never declares one.
pub const ASSUMED_SPEECH_SERVICE_RATE: u32 = 24_000;

// ─────────────────────────────────────────────────────────────────────────────
// Ring Queue / Pacing
// ─────────────────────────────────────────────────────────────────────────────

/// Default capacity of the outbound audio ring (frames).
pub const DEFAULT_OUTBOUND_RING_CAPACITY: usize = 64;

/// Timeout for a single `get_next_outbound_frame` poll when the ring is empty.
pub const OUTBOUND_POLL_TIMEOUT_MS: u64 = 1_000;

// ─────────────────────────────────────────────────────────────────────────────
// Call Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Default overall call wall-clock timeout (seconds).
pub const DEFAULT_CALL_TIMEOUT_SEC: u64 = 90;

/// Default idle-since-last-event timeout (seconds).
pub const DEFAULT_CALL_IDLE_TIMEOUT_SEC: u64 = 90;

/// How long to wait for a `committed`/`error` ack before tearing the call down.
pub const COMMIT_ACK_TIMEOUT_MS: u64 = 400;

// ─────────────────────────────────────────────────────────────────────────────
// VAD / Commit Controller Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Initial adaptive commit threshold (ms of buffered audio before a commit is considered).
pub const DEFAULT_ADAPTIVE_MIN_MS: u64 = 160;

/// Safety margin added to `adaptive_min_ms` for the commit floor.
pub const DEFAULT_SAFETY_MS: u64 = 40;

/// Absolute floor for `adaptive_min_ms + safety_ms`.
pub const MIN_COMMIT_TOTAL_FLOOR_MS: u64 = 180;

/// Cap on `adaptive_min_ms` after repeated `commit_empty` adaptation.
pub const ADAPTIVE_MIN_MS_CAP: u64 = 300;

/// Cooldown (in frames) applied after a `commit_empty` error.
pub const COMMIT_EMPTY_COOLDOWN_FRAMES: u32 = 8;

/// Steady-state additive RMS offset over the noise floor.
pub const DEFAULT_DYNAMIC_RMS_OFFSET: f64 = 300.0;

/// Minimum allowed dynamic threshold (RMS units).
pub const DEFAULT_DYNAMIC_RMS_MIN: f64 = 40.0;

/// Maximum allowed dynamic threshold (RMS units).
pub const DEFAULT_DYNAMIC_RMS_MAX: f64 = 1_600.0;

/// Steady-state minimum speech frames required to permit a commit.
pub const DEFAULT_MIN_SPEECH_FRAMES_FOR_COMMIT: u32 = 5;

/// Bootstrap-window minimum speech frames required to permit a commit.
pub const DEFAULT_BOOTSTRAP_MIN_SPEECH_FRAMES: u32 = 3;

/// Max-buffer safety commit trigger (ms of accumulated audio since last commit).
pub const DEFAULT_MAX_BUFFER_MS: u64 = 2_000;

/// Duration of the VAD bootstrap window after the first frame (ms).
pub const DEFAULT_BOOTSTRAP_DURATION_MS: u64 = 2_000;

/// Bootstrap-window additive RMS offset (lower than steady-state to catch speech fast).
pub const DEFAULT_BOOTSTRAP_OFFSET: f64 = 80.0;

/// Trailing silence duration (ms) after detected speech before committing.
pub const DEFAULT_SILENCE_COMMIT_MS: u64 = 140;

/// No-speech timeout (ms) before a buffer is committed even without speech.
pub const DEFAULT_NO_SPEECH_COMMIT_MS: u64 = 600;

/// Bootstrap offset decay step applied every `offset_decay_interval_ms`.
pub const DEFAULT_OFFSET_DECAY_STEP: f64 = 10.0;

/// Interval (ms) between bootstrap offset decay steps.
pub const DEFAULT_OFFSET_DECAY_INTERVAL_MS: u64 = 200;

/// Floor the bootstrap offset decays to.
pub const DEFAULT_OFFSET_DECAY_MIN: f64 = 40.0;

/// Minimum sustained user speech duration (ms) required for a silence-boundary commit.
pub const DEFAULT_COMMIT_MIN_USER_MS: u64 = 600;

/// Size of the rolling noise-floor RMS sample window.
pub const NOISE_FLOOR_WINDOW: usize = 50;

/// A candidate low-energy frame is admitted to the noise window only if its
/// RMS is below this fraction of the current dynamic threshold.
pub const NOISE_FLOOR_ADMIT_FACTOR: f64 = 0.6;

/// When the noise floor sits at or below this RMS, the effective offset is
/// additionally clamped to `NOISE_FLOOR_QUIET_OFFSET_CAP`.
pub const NOISE_FLOOR_QUIET_THRESHOLD: f64 = 5.0;

/// Offset cap applied in near-silent environments.
pub const NOISE_FLOOR_QUIET_OFFSET_CAP: f64 = 80.0;

/// Consecutive low-speech commit blocks that force an escalated commit.
pub const LOW_SPEECH_ESCALATION_BLOCKS: u32 = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Barge-in Detector Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Additive RMS offset over the noise floor for barge-in candidacy.
pub const DEFAULT_BARGE_IN_OFFSET: f64 = 40.0;

/// Relative multiplier of the noise floor for barge-in candidacy.
pub const DEFAULT_BARGE_IN_RELATIVE_FACTOR: f64 = 1.3;

/// Absolute minimum RMS required for barge-in candidacy.
pub const DEFAULT_BARGE_IN_ABS_MIN_RMS: f64 = 100.0;

/// Minimum signal-to-noise ratio (dB) required for barge-in candidacy.
pub const DEFAULT_BARGE_IN_MIN_SNR_DB: f64 = 10.0;

/// Grace period (ms) after an agent burst starts before barge-in is eligible.
pub const DEFAULT_BARGE_IN_MIN_AGENT_MS: u64 = 800;

/// Candidate duration (ms) required to actually trigger a barge-in.
pub const DEFAULT_BARGE_IN_MIN_USER_MS: u64 = 160;

/// Minimum time between two barge-in triggers (ms).
pub const DEFAULT_BARGE_IN_COOLDOWN_MS: u64 = 1_200;

/// Consecutive below-release-threshold frames required to clear a candidate.
pub const DEFAULT_BARGE_IN_RELEASE_FRAMES: u32 = 6;

/// Hard lock window (ms) after an agent burst starts; no candidate accrues.
pub const DEFAULT_BARGE_IN_LOCK_MS: u64 = 1_200;

/// Release hysteresis fraction of the effective threshold.
pub const BARGE_IN_RELEASE_FACTOR: f64 = 0.65;

/// Legacy consecutive-frame candidate count; superseded by duration-based
/// triggering but retained as a configuration knob for compatibility.
pub const DEFAULT_BARGE_IN_CONSECUTIVE_FRAMES: u32 = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Application name used in logs and the `/status` identity field.
pub const APP_NAME: &str = "telephony speech bridge";

/// Service identifier returned by `/health`.
pub const SERVICE_ID: &str = "media-bridge";
