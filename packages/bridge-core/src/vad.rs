//! Adaptive RMS-based voice-activity detector and the commit-trigger state
//! machine that decides when accumulated audio is sent to the speech
//! service.
//!
//! A single [`CommitController`] is owned per call. It is fed one inbound
//! frame at a time (already resampled to the service's input rate) and
//! returns a [`CommitDecision`] describing what the caller (the Speech
//! Session) should do next: nothing, block with a reason, or send a commit
//! with a named trigger.

use crate::protocol_constants::*;
use crate::state::Config;

/// Why a commit fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitTrigger {
    MaxBufferSafety,
    NoSpeechTimeout,
    SilenceAfterSpeech,
    LowSpeechEscalation,
    BargeIn,
}

impl CommitTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxBufferSafety => "max_buffer_safety",
            Self::NoSpeechTimeout => "no_speech_timeout",
            Self::SilenceAfterSpeech => "silence_after_speech",
            Self::LowSpeechEscalation => "low_speech_escalation",
            Self::BargeIn => "barge_in",
        }
    }
}

/// Outcome of feeding one frame to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitDecision {
    /// Keep accumulating; no action required.
    Continue,
    /// A commit gate blocked the attempt; `reason` is recorded for metrics.
    Blocked { reason: &'static str },
    /// Send a commit now with the given trigger.
    Commit { trigger: CommitTrigger },
}

/// Commit-controller lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Accumulating,
    CommitSent,
    ErrorBackoff,
}

struct NoiseFloorEstimator {
    window: Vec<f64>,
    capacity: usize,
}

impl NoiseFloorEstimator {
    fn new(capacity: usize) -> Self {
        Self {
            window: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Admits `rms` into the rolling window if it's below `admit_factor *
    /// current_threshold`, then returns the median of the window (or 0.0 if
    /// empty).
    fn observe(&mut self, rms: f64, current_threshold: f64) -> f64 {
        if rms < current_threshold * NOISE_FLOOR_ADMIT_FACTOR {
            if self.window.len() >= self.capacity {
                self.window.remove(0);
            }
            self.window.push(rms);
        }
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted = self.window.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        sorted[sorted.len() / 2]
    }
}

struct CommitAccumulator {
    bytes: usize,
    speech_frames: u32,
    rms_sum: f64,
    rms_count: u32,
    rms_peak: f64,
    start_ms: u64,
}

impl CommitAccumulator {
    fn new(now_ms: u64) -> Self {
        Self {
            bytes: 0,
            speech_frames: 0,
            rms_sum: 0.0,
            rms_count: 0,
            rms_peak: 0.0,
            start_ms: now_ms,
        }
    }

    fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.start_ms)
    }
}

/// Owns the adaptive VAD + commit trigger state machine for one call.
pub struct CommitController {
    phase: Phase,
    noise_floor: NoiseFloorEstimator,
    accumulator: CommitAccumulator,

    call_start_ms: u64,
    bootstrap_offset: f64,
    last_decay_ms: u64,

    speech_previously_detected: bool,
    trailing_silence_ms: u64,
    last_frame_ms: u64,

    low_speech_block_count: u32,
    commit_cooldown_frames: u32,
    adaptive_min_ms: u64,

    first_append_ms: Option<u64>,
    first_commit_latency_ms: Option<u64>,
}

impl CommitController {
    pub fn new(now_ms: u64, cfg: &Config) -> Self {
        Self {
            phase: Phase::Idle,
            noise_floor: NoiseFloorEstimator::new(NOISE_FLOOR_WINDOW),
            accumulator: CommitAccumulator::new(now_ms),
            call_start_ms: now_ms,
            bootstrap_offset: cfg.bootstrap_offset,
            last_decay_ms: now_ms,
            speech_previously_detected: false,
            trailing_silence_ms: 0,
            last_frame_ms: now_ms,
            low_speech_block_count: 0,
            commit_cooldown_frames: 0,
            adaptive_min_ms: cfg.adaptive_min_ms,
            first_append_ms: None,
            first_commit_latency_ms: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn first_commit_latency_ms(&self) -> Option<u64> {
        self.first_commit_latency_ms
    }

    fn in_bootstrap(&self, now_ms: u64, cfg: &Config) -> bool {
        now_ms.saturating_sub(self.call_start_ms) < cfg.bootstrap_duration_ms
    }

    fn min_speech_frames(&self, now_ms: u64, cfg: &Config) -> u32 {
        if self.in_bootstrap(now_ms, cfg) {
            cfg.bootstrap_min_speech_frames
        } else {
            cfg.min_speech_frames_for_commit
        }
    }

    /// Minimum total frame count (not just speech frames) that must have
    /// accumulated before any non-forced trigger may commit, derived from
    /// `adaptive_min_ms + safety_ms`. Recomputed on every call since
    /// `adaptive_min_ms` is raised by [`Self::on_commit_empty`].
    fn threshold_frames(&self, cfg: &Config) -> u32 {
        let total_ms = self.adaptive_min_ms + cfg.safety_ms;
        let frame_ms = cfg.frame_interval_ms.max(1) as u64;
        (total_ms.div_ceil(frame_ms)) as u32
    }

    /// Computes RMS over a little-endian PCM16 frame.
    pub fn compute_rms(frame: &[u8]) -> f64 {
        if frame.len() < 2 {
            return 0.0;
        }
        let samples: Vec<i32> = frame
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as i32)
            .collect();
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum_sq / samples.len() as f64).sqrt()
    }

    fn effective_offset(&mut self, now_ms: u64, noise_floor: f64, cfg: &Config) -> f64 {
        if self.in_bootstrap(now_ms, cfg) {
            while now_ms.saturating_sub(self.last_decay_ms) >= cfg.offset_decay_interval_ms
                && self.bootstrap_offset > cfg.offset_decay_min
            {
                self.bootstrap_offset =
                    (self.bootstrap_offset - cfg.offset_decay_step).max(cfg.offset_decay_min);
                self.last_decay_ms += cfg.offset_decay_interval_ms;
            }
            self.bootstrap_offset
        } else if noise_floor <= NOISE_FLOOR_QUIET_THRESHOLD {
            cfg.dynamic_rms_offset.min(NOISE_FLOOR_QUIET_OFFSET_CAP)
        } else {
            cfg.dynamic_rms_offset
        }
    }

    /// Processes one inbound frame, returning the decision for this tick.
    ///
    /// `frame_bytes` is the post-resample frame byte count (used for
    /// accumulator bookkeeping only, not to validate `frame`'s length).
    pub fn process_frame(&mut self, frame: &[u8], now_ms: u64, cfg: &Config) -> (bool, f64, f64, CommitDecision) {
        self.last_frame_ms = now_ms;
        if self.phase == Phase::Idle {
            self.phase = Phase::Accumulating;
        }

        if self.commit_cooldown_frames > 0 {
            self.commit_cooldown_frames -= 1;
        }

        let rms = Self::compute_rms(frame);

        // The admit decision for the noise window is made against the
        // threshold derived from the *prior* floor, before this sample
        // could shift it.
        let provisional_threshold = self.dynamic_threshold(now_ms, self.last_noise_floor(), cfg);
        let noise_floor = self.noise_floor.observe(rms, provisional_threshold);
        let threshold = self.dynamic_threshold(now_ms, noise_floor, cfg);
        let is_speech = rms >= threshold;

        if self.first_append_ms.is_none() {
            self.first_append_ms = Some(now_ms);
        }

        self.accumulator.bytes += frame.len();
        self.accumulator.rms_sum += rms;
        self.accumulator.rms_count += 1;
        if rms > self.accumulator.rms_peak {
            self.accumulator.rms_peak = rms;
        }
        if is_speech {
            self.accumulator.speech_frames += 1;
            self.speech_previously_detected = true;
            self.trailing_silence_ms = 0;
        } else if self.speech_previously_detected {
            self.trailing_silence_ms += cfg.frame_interval_ms as u64;
        }

        let decision = self.evaluate_triggers(now_ms, cfg);
        (is_speech, rms, threshold, decision)
    }

    /// Current noise-floor estimate (median of the rolling low-energy window).
    pub fn noise_floor(&self) -> f64 {
        self.last_noise_floor()
    }

    fn last_noise_floor(&self) -> f64 {
        if self.noise_floor.window.is_empty() {
            0.0
        } else {
            let mut sorted = self.noise_floor.window.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            sorted[sorted.len() / 2]
        }
    }

    fn dynamic_threshold(&mut self, now_ms: u64, noise_floor: f64, cfg: &Config) -> f64 {
        let offset = self.effective_offset(now_ms, noise_floor, cfg);
        (noise_floor + offset).clamp(cfg.dynamic_rms_min, cfg.dynamic_rms_max)
    }

    fn evaluate_triggers(&mut self, now_ms: u64, cfg: &Config) -> CommitDecision {
        if self.phase != Phase::Accumulating || self.commit_cooldown_frames > 0 {
            return CommitDecision::Continue;
        }

        let elapsed = self.accumulator.elapsed_ms(now_ms);
        let has_speech = self.accumulator.speech_frames > 0;

        if elapsed >= cfg.max_buffer_ms {
            if has_speech {
                return self.try_commit(CommitTrigger::MaxBufferSafety, now_ms, cfg);
            }
            self.reset_accumulator(now_ms);
            return CommitDecision::Continue;
        }

        if elapsed >= cfg.no_speech_commit_ms
            && (!has_speech || self.low_speech_block_count >= LOW_SPEECH_ESCALATION_BLOCKS)
        {
            return self.try_commit(CommitTrigger::NoSpeechTimeout, now_ms, cfg);
        }

        if self.speech_previously_detected && self.trailing_silence_ms >= cfg.silence_commit_ms {
            if self.accumulator.elapsed_ms(now_ms) < cfg.commit_min_user_ms {
                self.trailing_silence_ms = 0;
                return CommitDecision::Continue;
            }
            return self.try_commit(CommitTrigger::SilenceAfterSpeech, now_ms, cfg);
        }

        CommitDecision::Continue
    }

    fn try_commit(&mut self, trigger: CommitTrigger, now_ms: u64, cfg: &Config) -> CommitDecision {
        // Minimum commit-duration floor (adaptive_min_ms + safety_ms), as
        // total elapsed frames rather than speech frames. Exempt the two
        // triggers that already force a commit through their own elapsed
        // threshold (max_buffer_ms, low_speech_ms's own escalation path).
        if !matches!(
            trigger,
            CommitTrigger::MaxBufferSafety | CommitTrigger::LowSpeechEscalation
        ) {
            let min_duration_frames = self.threshold_frames(cfg);
            if self.accumulator.rms_count < min_duration_frames {
                return CommitDecision::Blocked {
                    reason: "min_commit_duration",
                };
            }
        }

        let min_frames = if matches!(
            trigger,
            CommitTrigger::MaxBufferSafety | CommitTrigger::NoSpeechTimeout
        ) {
            0
        } else {
            self.min_speech_frames(now_ms, cfg)
        };

        if self.accumulator.speech_frames < min_frames {
            self.low_speech_block_count += 1;
            if self.low_speech_block_count >= LOW_SPEECH_ESCALATION_BLOCKS
                && self.accumulator.elapsed_ms(now_ms) >= cfg.max_buffer_ms
            {
                return self.commit_now(CommitTrigger::LowSpeechEscalation, now_ms);
            }
            return CommitDecision::Blocked {
                reason: "min_speech_frames",
            };
        }

        let no_speech_guard_ok = self.accumulator.speech_frames > 0
            || matches!(
                trigger,
                CommitTrigger::MaxBufferSafety
                    | CommitTrigger::NoSpeechTimeout
                    | CommitTrigger::LowSpeechEscalation
            );
        if !no_speech_guard_ok {
            return CommitDecision::Blocked {
                reason: "no_speech_guard",
            };
        }

        self.commit_now(trigger, now_ms)
    }

    /// Forces a commit regardless of gates — used by the barge-in detector,
    /// which has already verified the speech-frame floor itself.
    pub fn commit_now(&mut self, trigger: CommitTrigger, now_ms: u64) -> CommitDecision {
        self.phase = Phase::CommitSent;
        if let Some(first) = self.first_append_ms {
            if self.first_commit_latency_ms.is_none() {
                self.first_commit_latency_ms = Some(now_ms.saturating_sub(first));
            }
        }
        self.reset_accumulator(now_ms);
        self.low_speech_block_count = 0;
        CommitDecision::Commit { trigger }
    }

    fn reset_accumulator(&mut self, now_ms: u64) {
        self.accumulator = CommitAccumulator::new(now_ms);
        self.speech_previously_detected = false;
        self.trailing_silence_ms = 0;
    }

    /// Call on a successful `committed` ack.
    pub fn on_committed(&mut self) {
        self.phase = Phase::Accumulating;
    }

    /// Call on a `commit_empty` error ack.
    pub fn on_commit_empty(&mut self) {
        self.adaptive_min_ms = (self.adaptive_min_ms + DEFAULT_FRAME_INTERVAL_MS as u64)
            .min(ADAPTIVE_MIN_MS_CAP);
        self.commit_cooldown_frames = COMMIT_EMPTY_COOLDOWN_FRAMES;
        self.phase = Phase::Accumulating;
    }

    /// Current speech-frame count in the open accumulator (used by the
    /// barge-in detector to decide whether an immediate commit is eligible).
    pub fn accumulated_speech_frames(&self) -> u32 {
        self.accumulator.speech_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent_frame() -> Vec<u8> {
        vec![0u8; 640]
    }

    fn loud_frame(amplitude: i16) -> Vec<u8> {
        (0..320).flat_map(|_| amplitude.to_le_bytes()).collect()
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(CommitController::compute_rms(&silent_frame()), 0.0);
    }

    #[test]
    fn rms_of_constant_signal_equals_amplitude() {
        let rms = CommitController::compute_rms(&loud_frame(1000));
        assert!((rms - 1000.0).abs() < 0.01);
    }

    #[test]
    fn no_speech_timeout_commits_with_empty_buffer() {
        let cfg = Config::default();
        let mut ctrl = CommitController::new(0, &cfg);
        let mut last = CommitDecision::Continue;
        let mut t = 0u64;
        while t <= cfg.no_speech_commit_ms + 40 {
            let (_, _, _, decision) = ctrl.process_frame(&silent_frame(), t, &cfg);
            last = decision;
            t += cfg.frame_interval_ms as u64;
        }
        assert_eq!(
            last,
            CommitDecision::Commit {
                trigger: CommitTrigger::NoSpeechTimeout
            }
        );
    }

    #[test]
    fn max_buffer_safety_discards_when_no_speech() {
        let cfg = Config::default();
        let mut ctrl = CommitController::new(0, &cfg);
        let mut t = 0u64;
        let mut committed = false;
        while t <= cfg.max_buffer_ms + 40 {
            let (_, _, _, decision) = ctrl.process_frame(&silent_frame(), t, &cfg);
            if matches!(decision, CommitDecision::Commit { .. }) {
                committed = true;
            }
            t += cfg.frame_interval_ms as u64;
        }
        // no_speech_commit_ms triggers well before max_buffer_ms here, so a
        // commit is expected — but never one carrying an empty accumulator.
        assert!(committed);
    }

    #[test]
    fn commit_empty_raises_adaptive_min_and_sets_cooldown() {
        let cfg = Config::default();
        let mut ctrl = CommitController::new(0, &cfg);
        let before = ctrl.adaptive_min_ms;
        ctrl.on_commit_empty();
        assert_eq!(ctrl.adaptive_min_ms, before + DEFAULT_FRAME_INTERVAL_MS as u64);
        assert_eq!(ctrl.commit_cooldown_frames, COMMIT_EMPTY_COOLDOWN_FRAMES);
        assert_eq!(ctrl.phase(), Phase::Accumulating);
    }

    #[test]
    fn commit_trigger_names_match_wire_vocabulary() {
        assert_eq!(CommitTrigger::MaxBufferSafety.as_str(), "max_buffer_safety");
        assert_eq!(CommitTrigger::BargeIn.as_str(), "barge_in");
    }

    #[test]
    fn silence_commit_waits_for_adaptive_min_duration_floor() {
        // adaptive_min_ms (160) + safety_ms (40) = 200ms = 10 frames at the
        // default 20ms cadence. Relax commit_min_user_ms/silence_commit_ms so
        // the silence-boundary trigger would otherwise fire after a single
        // silent frame, isolating the duration gate itself.
        let mut cfg = Config::default();
        cfg.commit_min_user_ms = 0;
        cfg.silence_commit_ms = 20;
        // (adaptive_min_ms + safety_ms) / frame_interval_ms, with the
        // defaults' exact numbers: (160 + 40) / 20 = 10 frames.
        let min_duration_frames =
            (cfg.adaptive_min_ms + cfg.safety_ms) / cfg.frame_interval_ms as u64;
        let mut ctrl = CommitController::new(0, &cfg);

        let mut t = 0u64;
        ctrl.process_frame(&loud_frame(1000), t, &cfg);
        t += cfg.frame_interval_ms as u64;

        let mut frames_sent = 1u32;
        let mut committed_at_frame = None;
        for _ in 0..50 {
            let (_, _, _, decision) = ctrl.process_frame(&silent_frame(), t, &cfg);
            frames_sent += 1;
            if matches!(decision, CommitDecision::Commit { .. }) {
                committed_at_frame = Some(frames_sent);
                break;
            }
            t += cfg.frame_interval_ms as u64;
        }

        let committed_at_frame = committed_at_frame.expect("expected a commit within 50 frames");
        assert!(
            committed_at_frame as u64 >= min_duration_frames,
            "commit fired after only {committed_at_frame} frames, before the duration floor"
        );
    }
}
