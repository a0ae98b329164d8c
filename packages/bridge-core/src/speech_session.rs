//! Speech Session: owns the websocket to the speech service, negotiates
//! audio formats, drives the commit/response lifecycle, and paces decoded
//! audio deltas back out as fixed-size telephony frames.
//!
//! Connection handling follows the reference codebase's client-connection
//! idiom rather than treating the socket as a given: a connect timeout
//! bounds the initial handshake, and any transport-level failure is
//! classified as [`BridgeError::Transport`] and torn the call down rather
//! than retried from inside the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::bargein::{BargeInDetector, BargeInEvent};
use crate::error::BridgeError;
use crate::protocol_constants::{ASSUMED_SPEECH_SERVICE_RATE, COMMIT_ACK_TIMEOUT_MS, DEFAULT_FRAME_BYTES};
use crate::ring::{AssemblyBuffer, AudioRing, StagingBuffer};
use crate::resample::Resampler;
use crate::state::{Config, RuntimeState};
use crate::vad::{CommitController, CommitDecision, CommitTrigger};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound events recognized from the speech service's event stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionPayload },
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },
    #[serde(rename = "response.audio.done")]
    ResponseAudioDone {},
    #[serde(rename = "response.done")]
    ResponseDone {},
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {},
    #[serde(rename = "input_audio_buffer.committed")]
    Committed {},
    #[serde(rename = "error")]
    Error { error: ServerErrorPayload },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, Default)]
struct SessionPayload {
    #[serde(default)]
    input_audio_format: Option<AudioFormatPayload>,
    #[serde(default)]
    output_audio_format: Option<AudioFormatPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct AudioFormatPayload {
    #[serde(default)]
    sample_rate_hz: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ServerErrorPayload {
    code: Option<String>,
    message: Option<String>,
}

/// The session's readiness/lifecycle state, observable without locking the
/// whole struct.
struct SharedFlags {
    ready: AtomicBool,
    active: AtomicBool,
}

/// Owns a single call's websocket connection to the speech service.
pub struct SpeechSession {
    call_token: String,
    cfg: Config,
    runtime: Arc<RuntimeState>,

    flags: Arc<SharedFlags>,
    writer: Mutex<Option<futures::stream::SplitSink<WsStream, WsMessage>>>,

    input_resampler: Mutex<Resampler>,
    output_resampler: Mutex<Resampler>,
    input_rate: std::sync::atomic::AtomicU32,
    output_rate: std::sync::atomic::AtomicU32,

    commit: Mutex<CommitController>,
    bargein: Mutex<BargeInDetector>,
    staging: Mutex<StagingBuffer>,
    outbound_ring: Mutex<AudioRing>,
    outbound_assembly: Mutex<AssemblyBuffer>,

    /// Timestamp of the most recently sent `input_audio_buffer.commit`, if
    /// still awaiting a `committed`/`error` ack. Polled by
    /// [`Self::check_commit_ack_timeout`] to tear the call down when the
    /// speech service never responds (§5/§7: no retry).
    commit_sent_at: Mutex<Option<u64>>,
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

impl SpeechSession {
    /// Connects to the speech service and negotiates a session for `call_token`.
    ///
    /// On success, returns the session plus a background task handle that
    /// must be polled to completion (spawned by the caller so the Media
    /// Bridge can select over it alongside its own socket loops).
    pub async fn connect(
        call_token: String,
        cfg: Config,
        runtime: Arc<RuntimeState>,
    ) -> Result<(Arc<Self>, impl std::future::Future<Output = ()>), BridgeError> {
        let mut request = cfg
            .speech_service_endpoint
            .clone()
            .into_client_request()
            .map_err(|e| BridgeError::Configuration(format!("invalid speech_service_endpoint: {e}")))?;

        if !cfg.speech_service_api_key.trim().is_empty() {
            let value = format!("Bearer {}", cfg.speech_service_api_key)
                .parse()
                .map_err(|e| {
                    BridgeError::Configuration(format!("invalid speech_service_api_key header value: {e}"))
                })?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws, _response) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| BridgeError::Timeout("speech service connect timed out".into()))?
        .map_err(|e| BridgeError::Transport(format!("speech service connect failed: {e}")))?;

        let (writer, reader) = ws.split();

        let now = crate::utils::now_millis();
        let session = Arc::new(Self {
            call_token: call_token.clone(),
            flags: Arc::new(SharedFlags {
                ready: AtomicBool::new(false),
                active: AtomicBool::new(true),
            }),
            writer: Mutex::new(Some(writer)),
            input_resampler: Mutex::new(Resampler::new(
                cfg.telephony_sample_rate,
                ASSUMED_SPEECH_SERVICE_RATE,
            )),
            output_resampler: Mutex::new(Resampler::new(
                ASSUMED_SPEECH_SERVICE_RATE,
                cfg.telephony_sample_rate,
            )),
            input_rate: std::sync::atomic::AtomicU32::new(ASSUMED_SPEECH_SERVICE_RATE),
            output_rate: std::sync::atomic::AtomicU32::new(ASSUMED_SPEECH_SERVICE_RATE),
            commit: Mutex::new(CommitController::new(now, &cfg)),
            bargein: Mutex::new(BargeInDetector::new()),
            staging: Mutex::new(StagingBuffer::new()),
            outbound_ring: Mutex::new(AudioRing::new(cfg.outbound_ring_capacity)),
            outbound_assembly: Mutex::new(AssemblyBuffer::new()),
            commit_sent_at: Mutex::new(None),
            cfg: cfg.clone(),
            runtime: Arc::clone(&runtime),
        });

        session.send_session_update().await?;
        runtime.speech_session_begin(&call_token);

        let consumer = {
            let session = Arc::clone(&session);
            async move {
                session.event_consumer_loop(reader).await;
            }
        };

        Ok((session, consumer))
    }

    async fn send_session_update(&self) -> Result<(), BridgeError> {
        let event = json!({
            "type": "session.update",
            "session": {
                "modalities": ["text", "audio"],
                "voice": self.cfg.speech_service_voice,
                "input_audio_format": {"type": "pcm16"},
                "output_audio_format": {"type": "pcm16"},
                "turn_detection": {
                    "type": "server_vad",
                    "threshold": 0.35,
                    "prefix_padding_ms": 100,
                    "silence_duration_ms": 250,
                },
            },
        });
        self.send_json(&event).await
    }

    async fn send_json(&self, value: &serde_json::Value) -> Result<(), BridgeError> {
        let text = serde_json::to_string(value)
            .map_err(|e| BridgeError::Internal(format!("failed to serialize outbound event: {e}")))?;
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            writer
                .send(WsMessage::Text(text))
                .await
                .map_err(|e| BridgeError::Transport(format!("speech service send failed: {e}")))?;
        }
        Ok(())
    }

    /// Whether the session is usable (connected and not yet closed).
    pub fn active(&self) -> bool {
        self.flags.active.load(Ordering::Acquire)
    }

    fn ready(&self) -> bool {
        self.flags.ready.load(Ordering::Acquire)
    }

    /// Accepts one telephony-rate PCM16 frame of exactly `frame_bytes`
    /// bytes. Fails silently (logged at debug) if the session is not ready.
    pub async fn send_input_frame(&self, pcm_frame: &[u8]) {
        if !self.active() || !self.cfg.media_enable_vl_in {
            return;
        }
        if !self.ready() {
            log::debug!(
                "[Session] call={} dropping input frame: session not ready",
                self.call_token
            );
            return;
        }

        let resampled = {
            let mut resampler = self.input_resampler.lock().await;
            resampler.process(pcm_frame)
        };

        {
            let commit_state = self.commit.lock().await.phase();
            if commit_state == crate::vad::Phase::CommitSent {
                self.staging.lock().await.push(resampled.clone());
            }
        }

        self.intake_frame(&resampled).await;
    }

    async fn intake_frame(&self, frame: &[u8]) {
        let now = crate::utils::now_millis();
        let b64 = BASE64.encode(frame);
        if let Err(e) = self
            .send_json(&json!({
                "type": "input_audio_buffer.append",
                "audio": b64,
            }))
            .await
        {
            self.runtime.record_last_error(&self.call_token, &e.to_string());
            return;
        }

        let (is_speech, rms, _threshold, decision, noise_floor) = {
            let mut commit = self.commit.lock().await;
            let (is_speech, rms, threshold, decision) = commit.process_frame(frame, now, &self.cfg);
            (is_speech, rms, threshold, decision, commit.noise_floor())
        };
        self.runtime.record_rms(&self.call_token, rms, is_speech);

        let bargein_event = {
            let mut bargein = self.bargein.lock().await;
            bargein.process_frame(rms, noise_floor, now, &self.cfg)
        };

        if bargein_event == BargeInEvent::Triggered {
            self.runtime.record_barge_in(&self.call_token);
            self.outbound_ring.lock().await.clear();
            let speech_frames = self.commit.lock().await.accumulated_speech_frames();
            if speech_frames >= self.cfg.min_speech_frames_for_commit {
                let mut commit = self.commit.lock().await;
                let decision = commit.commit_now(CommitTrigger::BargeIn, now);
                drop(commit);
                self.act_on_decision(now, decision).await;
            }
        }

        self.act_on_decision(now, decision).await;
    }

    async fn act_on_decision(&self, now_ms: u64, decision: CommitDecision) {
        match decision {
            CommitDecision::Continue => {}
            CommitDecision::Blocked { reason } => {
                self.runtime.record_commit_block(&self.call_token, reason);
            }
            CommitDecision::Commit { trigger } => {
                self.runtime.record_commit_sent(&self.call_token);
                if let Some(latency) = self.commit.lock().await.first_commit_latency_ms() {
                    self.runtime.record_first_commit_latency(&self.call_token, latency);
                }
                log::info!(
                    "[Session] call={} committing trigger={}",
                    self.call_token,
                    trigger.as_str()
                );
                // Armed regardless of send outcome: a failed send also never
                // gets an ack, so the watchdog covers both cases uniformly.
                *self.commit_sent_at.lock().await = Some(now_ms);
                if let Err(e) = self
                    .send_json(&json!({"type": "input_audio_buffer.commit"}))
                    .await
                {
                    self.runtime.record_commit_error(&self.call_token);
                    self.runtime.record_last_error(&self.call_token, &e.to_string());
                }
            }
        }
    }

    /// Tears the call down if a commit sent more than
    /// [`COMMIT_ACK_TIMEOUT_MS`] ago still has no `committed`/`error` ack.
    /// Returns true if the session was torn down.
    async fn check_commit_ack_timeout(&self) -> bool {
        let now = crate::utils::now_millis();
        let sent_at = *self.commit_sent_at.lock().await;
        let Some(sent_at) = sent_at else {
            return false;
        };
        if now.saturating_sub(sent_at) < COMMIT_ACK_TIMEOUT_MS {
            return false;
        }
        log::warn!(
            "[Session] call={} commit ack timed out after {}ms, tearing down call",
            self.call_token,
            COMMIT_ACK_TIMEOUT_MS
        );
        self.runtime
            .record_last_error(&self.call_token, "commit ack timeout");
        *self.commit_sent_at.lock().await = None;
        self.flags.active.store(false, Ordering::Release);
        true
    }

    /// Returns the next paced outbound telephony-rate PCM16 frame, waiting
    /// up to a short timeout. Returns `None` on timeout or when inactive.
    pub async fn get_next_outbound_frame(&self) -> Option<Vec<u8>> {
        if !self.active() {
            return None;
        }
        tokio::time::timeout(
            Duration::from_millis(crate::protocol_constants::OUTBOUND_POLL_TIMEOUT_MS),
            async {
                loop {
                    {
                        let mut ring = self.outbound_ring.lock().await;
                        if let Some(frame) = ring.pop() {
                            return frame;
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            },
        )
        .await
        .ok()
    }

    async fn event_consumer_loop(
        self: Arc<Self>,
        mut reader: futures::stream::SplitStream<WsStream>,
    ) {
        let mut watchdog = tokio::time::interval(Duration::from_millis(50));
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = watchdog.tick() => {
                    if self.check_commit_ack_timeout().await {
                        break;
                    }
                }
                msg = reader.next() => {
                    let Some(msg) = msg else { break };
                    let msg = match msg {
                        Ok(m) => m,
                        Err(e) => {
                            self.runtime.record_last_error(
                                &self.call_token,
                                &format!("speech service read error: {e}"),
                            );
                            break;
                        }
                    };

                    let text = match msg {
                        WsMessage::Text(t) => t,
                        WsMessage::Close(_) => break,
                        _ => continue,
                    };

                    let event: ServerEvent = match serde_json::from_str(&text) {
                        Ok(e) => e,
                        Err(e) => {
                            log::debug!(
                                "[Session] call={} unparseable server event: {e}",
                                self.call_token
                            );
                            continue;
                        }
                    };

                    self.handle_event(event).await;
                }
            }
        }
        self.flags.active.store(false, Ordering::Release);
    }

    async fn handle_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::SessionUpdated { session } => {
                let input_rate = session
                    .input_audio_format
                    .and_then(|f| f.sample_rate_hz)
                    .unwrap_or(ASSUMED_SPEECH_SERVICE_RATE);
                let output_rate = session
                    .output_audio_format
                    .and_then(|f| f.sample_rate_hz)
                    .unwrap_or(ASSUMED_SPEECH_SERVICE_RATE);

                self.input_rate.store(input_rate, Ordering::Release);
                self.output_rate.store(output_rate, Ordering::Release);
                self.input_resampler
                    .lock()
                    .await
                    .reconfigure(self.cfg.telephony_sample_rate, input_rate);
                self.output_resampler
                    .lock()
                    .await
                    .reconfigure(output_rate, self.cfg.telephony_sample_rate);

                self.runtime.record_negotiated_formats(
                    &self.call_token,
                    input_rate,
                    output_rate,
                    &self.cfg.speech_service_voice,
                    &self.call_token,
                );
                self.flags.ready.store(true, Ordering::Release);
                log::info!(
                    "[Session] call={} session.updated input_rate={} output_rate={}",
                    self.call_token,
                    input_rate,
                    output_rate
                );
            }
            ServerEvent::ResponseAudioDelta { delta } => {
                self.bargein.lock().await.on_response_start(crate::utils::now_millis());
                match BASE64.decode(delta.as_bytes()) {
                    Ok(pcm) => self.enqueue_outbound_pcm(&pcm).await,
                    Err(e) => {
                        log::debug!("[Session] call={} bad audio delta base64: {e}", self.call_token);
                    }
                }
            }
            ServerEvent::ResponseAudioDone {} | ServerEvent::ResponseDone {} => {
                self.bargein.lock().await.on_response_end();
            }
            ServerEvent::SpeechStarted {} | ServerEvent::SpeechStopped {} => {}
            ServerEvent::Committed {} => {
                *self.commit_sent_at.lock().await = None;
                self.commit.lock().await.on_committed();
                self.runtime.record_commit_success(&self.call_token);
                if self.cfg.auto_response && !self.bargein.lock().await.response_active() {
                    let _ = self
                        .send_json(&json!({
                            "type": "response.create",
                            "response": {"modalities": ["text", "audio"]},
                        }))
                        .await;
                }
                let staged = self.staging.lock().await.drain();
                for frame in staged {
                    self.intake_frame(&frame).await;
                }
            }
            ServerEvent::Error { error } => {
                let code = error.code.unwrap_or_default();
                if code == "input_audio_buffer_commit_empty" {
                    *self.commit_sent_at.lock().await = None;
                    self.commit.lock().await.on_commit_empty();
                    self.runtime.record_commit_error(&self.call_token);
                } else if code == "conversation_already_has_active_response" {
                    self.bargein.lock().await.on_response_start(crate::utils::now_millis());
                } else {
                    log::warn!(
                        "[Session] call={} speech service error code={} message={:?}",
                        self.call_token,
                        code,
                        error.message
                    );
                }
            }
            ServerEvent::Unknown => {}
        }
    }

    async fn enqueue_outbound_pcm(&self, pcm: &[u8]) {
        let resampled = {
            let mut resampler = self.output_resampler.lock().await;
            if resampler.is_noop() {
                pcm.to_vec()
            } else {
                resampler.process(pcm)
            }
        };

        let frames = {
            let mut assembly = self.outbound_assembly.lock().await;
            assembly.push_and_slice(&resampled, DEFAULT_FRAME_BYTES)
        };

        let mut ring = self.outbound_ring.lock().await;
        for frame in frames {
            let dropped = ring.push(frame);
            if dropped {
                self.runtime
                    .record_dropped_frame(&self.call_token, ring.high_water_mark());
            }
        }
        self.runtime
            .record_ring_high_water(&self.call_token, ring.high_water_mark());
    }

    /// Idempotently closes the session and releases all resources.
    pub async fn close(&self) {
        if !self.flags.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.send(WsMessage::Close(None)).await;
            let _ = writer.close().await;
        }
        self.runtime.speech_session_end(&self.call_token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_event_parses_session_updated() {
        let json = r#"{"type":"session.updated","session":{"input_audio_format":{"sample_rate_hz":24000}}}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, ServerEvent::SessionUpdated { .. }));
    }

    #[test]
    fn server_event_parses_error_with_code() {
        let json = r#"{"type":"error","error":{"code":"input_audio_buffer_commit_empty","message":"empty"}}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        match event {
            ServerEvent::Error { error } => {
                assert_eq!(error.code.as_deref(), Some("input_audio_buffer_commit_empty"));
            }
            _ => panic!("expected Error variant"),
        }
    }

    #[test]
    fn server_event_unknown_type_does_not_error() {
        let json = r#"{"type":"something.new"}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, ServerEvent::Unknown));
    }
}
