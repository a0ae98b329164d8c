//! Multi-factor barge-in detector: interrupts synthesized agent audio when
//! the caller speaks over it.
//!
//! Active only while an agent response is in progress. Evaluates a
//! candidate window per frame against absolute, relative, and SNR
//! thresholds, with a hard lock window immediately after a burst starts (to
//! reject self-echo) and hysteresis release once the signal drops back
//! below threshold for several consecutive frames.

use crate::protocol_constants::*;
use crate::state::Config;

/// Outcome of feeding one frame to the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeInEvent {
    /// No action this tick.
    None,
    /// The caller has interrupted the agent; drain outbound audio and,
    /// if the accumulator already holds enough speech, commit immediately.
    Triggered,
}

/// Tracks the agent response burst and the current interruption candidate.
pub struct BargeInDetector {
    response_active: bool,
    burst_start_ms: u64,
    triggered_for_burst: bool,
    last_trigger_ms: Option<u64>,

    candidate_start_ms: Option<u64>,
    release_counter: u32,
}

impl BargeInDetector {
    pub fn new() -> Self {
        Self {
            response_active: false,
            burst_start_ms: 0,
            triggered_for_burst: false,
            last_trigger_ms: None,
            candidate_start_ms: None,
            release_counter: 0,
        }
    }

    pub fn response_active(&self) -> bool {
        self.response_active
    }

    /// Called when the speech service begins streaming a new agent response.
    ///
    /// Deltas stream continuously while the agent talks, so this fires once
    /// per delta. Only the false→true transition starts a new burst; while
    /// already active, this is a no-op so `burst_start_ms` keeps accumulating
    /// `agent_elapsed` instead of being re-zeroed on every delta.
    pub fn on_response_start(&mut self, now_ms: u64) {
        if self.response_active {
            return;
        }
        self.response_active = true;
        self.burst_start_ms = now_ms;
        self.triggered_for_burst = false;
        self.candidate_start_ms = None;
        self.release_counter = 0;
    }

    /// Called when the agent response finishes or is cleared.
    pub fn on_response_end(&mut self) {
        self.response_active = false;
        self.candidate_start_ms = None;
        self.release_counter = 0;
    }

    /// Evaluates one inbound frame's RMS against the noise floor.
    pub fn process_frame(
        &mut self,
        rms: f64,
        noise_floor: f64,
        now_ms: u64,
        cfg: &Config,
    ) -> BargeInEvent {
        if !cfg.barge_in_enabled || !self.response_active || self.triggered_for_burst {
            return BargeInEvent::None;
        }

        let agent_elapsed = now_ms.saturating_sub(self.burst_start_ms);
        if agent_elapsed < cfg.barge_in_lock_ms {
            self.candidate_start_ms = None;
            self.release_counter = 0;
            return BargeInEvent::None;
        }

        let effective_threshold =
            (noise_floor + cfg.barge_in_offset).max(noise_floor * cfg.barge_in_relative_factor);
        let snr_db = if noise_floor > 0.0 {
            20.0 * (rms / noise_floor).log10()
        } else if rms > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let is_candidate = rms >= effective_threshold
            && rms >= cfg.barge_in_abs_min_rms
            && snr_db >= cfg.barge_in_min_snr_db
            && agent_elapsed >= cfg.barge_in_min_agent_ms
            && self
                .last_trigger_ms
                .map(|t| now_ms.saturating_sub(t) >= cfg.barge_in_cooldown_ms)
                .unwrap_or(true);

        if is_candidate {
            self.release_counter = 0;
            if self.candidate_start_ms.is_none() {
                self.candidate_start_ms = Some(now_ms);
            }
        } else if self.candidate_start_ms.is_some() {
            if rms < BARGE_IN_RELEASE_FACTOR * effective_threshold {
                self.release_counter += 1;
                if self.release_counter >= cfg.barge_in_release_frames {
                    self.candidate_start_ms = None;
                    self.release_counter = 0;
                }
            } else {
                self.release_counter = 0;
            }
        }

        if let Some(start) = self.candidate_start_ms {
            if now_ms.saturating_sub(start) >= cfg.barge_in_min_user_ms {
                self.triggered_for_burst = true;
                self.last_trigger_ms = Some(now_ms);
                self.response_active = false;
                self.candidate_start_ms = None;
                self.release_counter = 0;
                return BargeInEvent::Triggered;
            }
        }

        BargeInEvent::None
    }
}

impl Default for BargeInDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_lock_window_suppresses_candidate() {
        let mut det = BargeInDetector::new();
        let cfg = Config::default();
        det.on_response_start(0);
        let event = det.process_frame(2000.0, 50.0, cfg.barge_in_lock_ms - 20, &cfg);
        assert_eq!(event, BargeInEvent::None);
    }

    #[test]
    fn sustained_loud_speech_triggers_after_lock_and_min_user_ms() {
        let mut det = BargeInDetector::new();
        let cfg = Config::default();
        det.on_response_start(0);

        let mut t = cfg.barge_in_lock_ms + cfg.barge_in_min_agent_ms;
        let mut triggered = false;
        for _ in 0..50 {
            let event = det.process_frame(2000.0, 50.0, t, &cfg);
            if event == BargeInEvent::Triggered {
                triggered = true;
                break;
            }
            t += cfg.frame_interval_ms as u64;
        }
        assert!(triggered);
        assert!(!det.response_active());
    }

    #[test]
    fn quiet_signal_never_triggers() {
        let mut det = BargeInDetector::new();
        let cfg = Config::default();
        det.on_response_start(0);

        let mut t = cfg.barge_in_lock_ms + cfg.barge_in_min_agent_ms;
        for _ in 0..50 {
            let event = det.process_frame(20.0, 50.0, t, &cfg);
            assert_eq!(event, BargeInEvent::None);
            t += cfg.frame_interval_ms as u64;
        }
    }

    #[test]
    fn candidate_releases_after_hysteresis_window() {
        let mut det = BargeInDetector::new();
        let cfg = Config::default();
        det.on_response_start(0);

        let base = cfg.barge_in_lock_ms + cfg.barge_in_min_agent_ms;
        det.process_frame(2000.0, 50.0, base, &cfg);
        assert!(det.candidate_start_ms.is_some());

        let mut t = base + cfg.frame_interval_ms as u64;
        for _ in 0..cfg.barge_in_release_frames {
            det.process_frame(10.0, 50.0, t, &cfg);
            t += cfg.frame_interval_ms as u64;
        }
        assert!(det.candidate_start_ms.is_none());
    }

    #[test]
    fn cooldown_blocks_rapid_retrigger() {
        let mut det = BargeInDetector::new();
        let cfg = Config::default();
        det.on_response_start(0);
        let mut t = cfg.barge_in_lock_ms + cfg.barge_in_min_agent_ms;
        loop {
            let event = det.process_frame(2000.0, 50.0, t, &cfg);
            t += cfg.frame_interval_ms as u64;
            if event == BargeInEvent::Triggered {
                break;
            }
        }
        det.on_response_start(t);
        let event = det.process_frame(2000.0, 50.0, t + cfg.barge_in_lock_ms + cfg.barge_in_min_agent_ms, &cfg);
        assert_eq!(event, BargeInEvent::None);
    }
}
