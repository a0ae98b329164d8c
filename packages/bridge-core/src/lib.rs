//! bridge-core - shared library for the telephony-to-speech-service
//! real-time media bridge.
//!
//! This crate implements the concurrent state machine that accepts an
//! inbound audio websocket from the telephony side, maintains a sibling
//! websocket to the speech service, paces audio frames between them with
//! backpressure, performs adaptive voice-activity detection to segment
//! caller speech into committable turns, resamples between mismatched
//! sample rates, and implements barge-in.
//!
//! # Architecture
//!
//! - [`protocol_constants`]: fixed wire-protocol and tuning constants
//! - [`state`]: typed, validated configuration and the runtime metrics aggregator
//! - [`error`]: centralized error types
//! - [`codec`]: inbound/outbound telephony frame encoding
//! - [`resample`]: stateful PCM16 rate conversion
//! - [`ring`]: bounded audio ring plus staging/assembly buffers
//! - [`vad`]: adaptive RMS voice-activity detector and commit-trigger state machine
//! - [`bargein`]: multi-factor barge-in detector
//! - [`speech_session`]: owns the speech-service websocket and commit/response lifecycle
//! - [`media_bridge`]: owns the telephony websocket and the inbound/outbound pacing loops
//! - [`api`]: HTTP/WebSocket composition root
//! - [`bootstrap`]: application bootstrap and dependency wiring

#![warn(clippy::all)]

pub mod api;
pub mod bargein;
pub mod bootstrap;
pub mod codec;
pub mod error;
pub mod media_bridge;
pub mod protocol_constants;
pub mod resample;
pub mod ring;
pub mod speech_session;
pub mod state;
pub mod utils;
pub mod vad;

// Re-export commonly used types at the crate root.
pub use api::{start_server, AppState, AppStateBuilder, CallGuard, CallManager, ServerError};
pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use error::{BridgeError, BridgeResult, ErrorCode};
pub use state::{AudioChannelType, CallMetrics, Config, OutputFormat, RuntimeSnapshot, RuntimeState, TokenMode};
