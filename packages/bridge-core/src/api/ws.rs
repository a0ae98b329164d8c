//! Telephony media websocket handler: `/media/{token}`.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;

use crate::api::AppState;
use crate::media_bridge;

/// Upgrades `/media/{token}` to a websocket and hands it off to the Media
/// Bridge for the call's lifetime.
///
/// Echoes the first comma-delimited subprotocol the client offers, if any,
/// per the telephony websocket contract.
pub async fn media_handler(
    Path(token): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let ws = if let Some(offered) = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = offered.split(',').next().map(|s| s.trim().to_string()) {
            ws.protocols([first])
        } else {
            ws
        }
    } else {
        ws
    };

    let call_token = token;
    ws.on_upgrade(move |socket| async move {
        let guard = state.calls.register(call_token.clone());
        let cfg = state.config.read().clone();
        media_bridge::run(socket, guard, cfg, std::sync::Arc::clone(&state.runtime)).await;
    })
}
