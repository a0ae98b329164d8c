//! Frame Codec: decodes inbound telephony frames and encodes outbound frames.
//!
//! Two wire shapes are understood on the inbound (telephony → bridge) side:
//! a JSON envelope carrying base64-encoded PCM16, and a raw binary frame.
//! The JSON envelope itself comes in three recognized shapes: `AudioMetadata`
//! (stream-start metadata, ignored - the telephony rate is fixed by prior
//! negotiation), the canonical `AudioData` with a nested `audioData.data`
//! payload, and an alternate `AudioChunk`/`AudioData` shape with a flat
//! `data` field. The outbound shape is selected once per call via
//! [`crate::state::OutputFormat`] and held fixed for the call's lifetime -
//! it is not renegotiated mid-call.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::Value;

use crate::error::BridgeError;
use crate::state::OutputFormat;

/// A decoded inbound telephony event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// PCM16 audio payload, little-endian samples.
    Audio(Vec<u8>),
    /// A provider-side control event (e.g. `AudioMetadata`, call start/stop)
    /// carrying no audio.
    Control(String),
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "PascalCase")]
enum WireOutbound<'a> {
    AudioData { audio_data: WireAudioDataRef<'a> },
}

#[derive(Debug, Serialize)]
struct WireAudioDataRef<'a> {
    data: &'a str,
}

/// Decodes a single inbound message from the telephony websocket.
///
/// `is_text` distinguishes a `Message::Text` frame (JSON envelope) from a
/// `Message::Binary` frame (raw PCM16). A malformed JSON frame or invalid
/// base64 payload yields [`BridgeError::Protocol`] - the caller drops the
/// frame and continues, it never tears down the call.
pub fn decode_inbound(payload: &[u8], is_text: bool) -> Result<InboundEvent, BridgeError> {
    if !is_text {
        return Ok(InboundEvent::Audio(payload.to_vec()));
    }

    let text = std::str::from_utf8(payload)
        .map_err(|e| BridgeError::Protocol(format!("inbound frame is not valid utf-8: {e}")))?;

    let value: Value = serde_json::from_str(text)
        .map_err(|e| BridgeError::Protocol(format!("inbound frame is not valid JSON: {e}")))?;

    let kind = value.get("kind").and_then(Value::as_str).unwrap_or("");

    match kind {
        "AudioMetadata" => Ok(InboundEvent::Control(text.to_string())),
        "AudioData" | "AudioChunk" => {
            let encoded = value
                .get("audioData")
                .and_then(|v| v.get("data"))
                .and_then(Value::as_str)
                .or_else(|| value.get("data").and_then(Value::as_str))
                .ok_or_else(|| {
                    BridgeError::Protocol(format!("{kind} frame carries no recognizable audio data field"))
                })?;
            let bytes = BASE64.decode(encoded.as_bytes()).map_err(|e| {
                BridgeError::Protocol(format!("inbound audio data is not valid base64: {e}"))
            })?;
            Ok(InboundEvent::Audio(bytes))
        }
        _ => Ok(InboundEvent::Control(text.to_string())),
    }
}

/// The wire-ready payload for a single outbound frame, plus whether it
/// should be sent as a text or binary websocket message.
pub struct EncodedOutbound {
    pub payload: Vec<u8>,
    pub is_text: bool,
}

/// Encodes a single outbound PCM16 frame per the call's negotiated format.
pub fn encode_outbound(pcm: &[u8], format: OutputFormat) -> EncodedOutbound {
    match format {
        OutputFormat::Binary => EncodedOutbound {
            payload: pcm.to_vec(),
            is_text: false,
        },
        OutputFormat::JsonSimple => {
            let encoded = BASE64.encode(pcm);
            let wire = WireOutbound::AudioData {
                audio_data: WireAudioDataRef { data: &encoded },
            };
            let json =
                serde_json::to_vec(&wire).expect("WireOutbound serialization cannot fail");
            EncodedOutbound {
                payload: json,
                is_text: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_binary_frame_verbatim() {
        let pcm = vec![1u8, 2, 3, 4];
        let decoded = decode_inbound(&pcm, false).unwrap();
        assert_eq!(decoded, InboundEvent::Audio(pcm));
    }

    #[test]
    fn decodes_json_simple_frame() {
        let pcm = vec![10u8, 20, 30, 40];
        let encoded = BASE64.encode(&pcm);
        let json = format!(r#"{{"kind":"AudioData","audioData":{{"data":"{encoded}"}}}}"#);
        let decoded = decode_inbound(json.as_bytes(), true).unwrap();
        assert_eq!(decoded, InboundEvent::Audio(pcm));
    }

    #[test]
    fn rejects_invalid_base64() {
        let json = r#"{"kind":"AudioData","audioData":{"data":"not-valid-base64!!"}}"#;
        let err = decode_inbound(json.as_bytes(), true).unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = decode_inbound(b"{not json", true).unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
    }

    #[test]
    fn unknown_kind_is_control_event() {
        let json = r#"{"kind":"Heartbeat"}"#;
        let decoded = decode_inbound(json.as_bytes(), true).unwrap();
        assert!(matches!(decoded, InboundEvent::Control(_)));
    }

    #[test]
    fn audio_metadata_is_ignored_as_control_event() {
        let json = r#"{"kind":"AudioMetadata","sampleRate":16000}"#;
        let decoded = decode_inbound(json.as_bytes(), true).unwrap();
        assert!(matches!(decoded, InboundEvent::Control(_)));
    }

    #[test]
    fn decodes_alternate_flat_data_shape() {
        let pcm = vec![11u8, 22, 33, 44];
        let encoded = BASE64.encode(&pcm);
        let json = format!(r#"{{"kind":"AudioChunk","data":"{encoded}"}}"#);
        let decoded = decode_inbound(json.as_bytes(), true).unwrap();
        assert_eq!(decoded, InboundEvent::Audio(pcm));
    }

    #[test]
    fn decodes_audio_data_with_flat_data_field() {
        let pcm = vec![99u8, 98, 97];
        let encoded = BASE64.encode(&pcm);
        let json = format!(r#"{{"kind":"AudioData","data":"{encoded}"}}"#);
        let decoded = decode_inbound(json.as_bytes(), true).unwrap();
        assert_eq!(decoded, InboundEvent::Audio(pcm));
    }

    #[test]
    fn round_trips_through_json_simple_encoding() {
        let pcm = vec![5u8, 6, 7, 8, 9, 10];
        let encoded = encode_outbound(&pcm, OutputFormat::JsonSimple);
        assert!(encoded.is_text);
        let decoded = decode_inbound(&encoded.payload, true).unwrap();
        assert_eq!(decoded, InboundEvent::Audio(pcm));
    }

    #[test]
    fn binary_encoding_is_passthrough() {
        let pcm = vec![5u8, 6, 7, 8];
        let encoded = encode_outbound(&pcm, OutputFormat::Binary);
        assert!(!encoded.is_text);
        assert_eq!(encoded.payload, pcm);
    }
}
