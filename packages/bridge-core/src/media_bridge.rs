//! Media Bridge: owns the telephony websocket, decodes inbound frames into
//! the speech session, and paces outbound frames back at a fixed cadence.
//!
//! The dual-loop structure — an inbound task reading the client socket and
//! an outbound task ticking a [`tokio::time::interval`] metronome — mirrors
//! the reference codebase's websocket handler, generalized from a
//! single-direction push to the bidirectional exchange this domain needs.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::time::MissedTickBehavior;

use crate::api::call_manager::CallGuard;
use crate::codec::{decode_inbound, encode_outbound, InboundEvent};
use crate::ring::AssemblyBuffer;
use crate::speech_session::SpeechSession;
use crate::state::{Config, RuntimeState};

/// Runs one call's full lifecycle: negotiates the speech session, then
/// drives the inbound/outbound loops until disconnect, error, or timeout.
pub async fn run(
    socket: WebSocket,
    guard: CallGuard,
    cfg: Config,
    runtime: Arc<RuntimeState>,
) {
    let call_token = guard.call_token().to_string();
    tracing::info!(call_token = %call_token, "media websocket accepted");
    runtime.media_ws_open(&call_token);

    let (session, consumer) = match SpeechSession::connect(call_token.clone(), cfg.clone(), Arc::clone(&runtime)).await {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("[Bridge] call={call_token} failed to open speech session: {e}");
            runtime.record_last_error(&call_token, &e.to_string());
            guard.set_end_reason("speech_session_connect_failed");
            return;
        }
    };

    let mut consumer_handle = tokio::spawn(consumer);

    let (mut sender, mut receiver) = socket.split();
    if sender.send(Message::Text(r#"{"type":"ack"}"#.to_string().into())).await.is_err() {
        guard.set_end_reason("telephony_send_failed");
        session.close().await;
        consumer_handle.abort();
        return;
    }

    let cancel = guard.cancel_token().clone();
    let call_timeout = tokio::time::sleep(Duration::from_secs(cfg.call_timeout_sec));
    tokio::pin!(call_timeout);
    let idle_timeout_duration = Duration::from_secs(cfg.call_idle_timeout_sec);
    let idle_timeout = tokio::time::sleep(idle_timeout_duration);
    tokio::pin!(idle_timeout);

    let outbound_session = Arc::clone(&session);
    let outbound_token = cancel.clone();
    let outbound_runtime = Arc::clone(&runtime);
    let outbound_token_for_call = call_token.clone();
    let outbound_cfg = cfg.clone();
    let outbound_task = tokio::spawn(async move {
        run_outbound_loop(
            outbound_session,
            outbound_token,
            outbound_runtime,
            outbound_token_for_call,
            outbound_cfg,
            sender,
        )
        .await;
    });

    let mut assembly = AssemblyBuffer::new();
    let mut end_reason = "disconnect";

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                end_reason = "force_closed";
                break;
            }
            () = &mut call_timeout => {
                end_reason = "call_timeout";
                break;
            }
            () = &mut idle_timeout => {
                end_reason = "idle_timeout";
                break;
            }
            _ = &mut consumer_handle => {
                // The speech session's event loop ended on its own — most
                // often the commit-ack watchdog tearing down an unresponsive
                // session (§5/§7). No retry; end the whole call.
                end_reason = "speech_session_ended";
                break;
            }
            msg = receiver.next() => {
                idle_timeout.as_mut().reset(tokio::time::Instant::now() + idle_timeout_duration);
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_payload(text.as_bytes(), true, &mut assembly, &cfg, &session, &runtime, &call_token).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        handle_inbound_payload(&bytes, false, &mut assembly, &cfg, &session, &runtime, &call_token).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        end_reason = "disconnect";
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("[Bridge] call={call_token} telephony socket error: {e}");
                        end_reason = "transport_error";
                        break;
                    }
                }
            }
        }
    }

    guard.set_end_reason(end_reason);
    cancel.cancel();
    outbound_task.abort();
    session.close().await;
    consumer_handle.abort();
    runtime.media_ws_closed(&call_token);
    tracing::info!(call_token = %call_token, reason = end_reason, "media websocket closed");
}

async fn handle_inbound_payload(
    payload: &[u8],
    is_text: bool,
    assembly: &mut AssemblyBuffer,
    cfg: &Config,
    session: &Arc<SpeechSession>,
    runtime: &Arc<RuntimeState>,
    call_token: &str,
) {
    let event = match decode_inbound(payload, is_text) {
        Ok(e) => e,
        Err(e) => {
            log::debug!("[Bridge] call={call_token} dropping malformed frame: {e}");
            runtime.record_decode_error(call_token);
            return;
        }
    };

    let audio = match event {
        InboundEvent::Audio(bytes) => bytes,
        InboundEvent::Control(_) => return,
    };

    let frames = assembly.push_and_slice(&audio, cfg.frame_bytes);
    for frame in frames {
        runtime.record_inbound_frame(call_token, frame.len());
        if cfg.media_enable_vl_in {
            session.send_input_frame(&frame).await;
        }
    }
}

async fn run_outbound_loop(
    session: Arc<SpeechSession>,
    cancel: tokio_util::sync::CancellationToken,
    runtime: Arc<RuntimeState>,
    call_token: String,
    cfg: Config,
    mut sender: futures::stream::SplitSink<WebSocket, Message>,
) {
    let mut metronome = tokio::time::interval(Duration::from_millis(cfg.frame_interval_ms as u64));
    metronome.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = metronome.tick() => {
                if !cfg.media_bidirectional {
                    continue;
                }
                let Some(frame) = session.get_next_outbound_frame().await else {
                    continue;
                };
                let encoded = encode_outbound(&frame, cfg.media_out_format);
                let msg = if encoded.is_text {
                    Message::Text(String::from_utf8_lossy(&encoded.payload).into_owned().into())
                } else {
                    Message::Binary(encoded.payload.into())
                };
                runtime.record_outbound_frame(&call_token, frame.len());
                if sender.send(msg).await.is_err() {
                    log::debug!("[Bridge] call={call_token} outbound send failed, stopping outbound loop");
                    break;
                }
            }
        }
    }
}
