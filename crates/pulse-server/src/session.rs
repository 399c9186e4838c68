//! WebSocket session lifecycle — one accepted client from upgrade through
//! disconnect.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use pulse_core::{codec, now_ms, MessageType, Priority, ServerEvent, ServerFrame};
use pulse_hub::registry::{Outbound, CLOSE_POLICY};

use crate::server::AppState;

/// Run a WebSocket session for a connected client.
///
/// 1. Admits the session against the registry caps (policy close 1008 on
///    rejection, after the upgrade, so the client sees a reason)
/// 2. Sends the `connected` greeting
/// 3. Forwards mailbox traffic to the socket and inbound frames to the
///    router
/// 4. Unregisters and emits a presence note on disconnect
#[instrument(skip_all, fields(identity = %identity))]
pub async fn run_session(ws: WebSocket, identity: String, state: AppState) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (mailbox_tx, mut mailbox_rx) = mpsc::channel::<Outbound>(256);
    let conn = match state.registry.register(&identity, mailbox_tx) {
        Ok(conn) => conn,
        Err(e) => {
            info!(error = %e, "admission rejected");
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_POLICY,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    info!(conn_id = %conn.id, "client connected");

    // Greeting with the session's identity and the hub's capabilities.
    let hub = &state.config.hub;
    let greeting = ServerFrame::event(
        MessageType::System,
        ServerEvent::Connected,
        serde_json::json!({
            "connectionId": conn.id,
            "serverTime": now_ms(),
            "supportedTypes": hub.supported_types,
            "heartbeatInterval": hub.heartbeat_interval_ms,
            "maxReconnectAttempts": hub.max_reconnect_attempts,
        }),
    );
    if let Ok(text) = codec::encode(&greeting) {
        let _ = ws_tx.send(Message::Text(text.into())).await;
    }

    // Outbound forwarder: mailbox → socket. A close request drains the
    // forwarder so the close frame is the last thing the peer sees.
    let outbound = tokio::spawn(async move {
        while let Some(item) = mailbox_rx.recv().await {
            match item {
                Outbound::Frame(text) => {
                    if ws_tx
                        .send(Message::Text(text.as_str().to_owned().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Inbound loop.
    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(ref t) => Some(t.to_string()),
            Message::Binary(ref data) => match std::str::from_utf8(data) {
                Ok(s) => Some(s.to_owned()),
                Err(_) => {
                    debug!(conn_id = %conn.id, len = data.len(), "non-UTF8 binary frame ignored");
                    None
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                // Transport-level liveness counts as a heartbeat too.
                conn.touch();
                None
            }
            Message::Close(_) => {
                debug!(conn_id = %conn.id, "client sent close frame");
                break;
            }
        };

        let Some(text) = text else { continue };
        state.sampler.record_request();
        state.router.handle(&conn.id, &text).await;
    }

    info!(conn_id = %conn.id, "client disconnected");
    outbound.abort();
    let _ = state.registry.unregister(&conn.id);

    // Presence note for anyone watching the system channel.
    let _ = state.scheduler.broadcast(
        MessageType::System,
        ServerEvent::Disconnected,
        serde_json::json!({ "connectionId": conn.id, "identity": conn.identity }),
        Priority::Low,
    );
}
