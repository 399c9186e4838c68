//! Message router: parses and validates inbound frames, mutates the
//! registry, and answers with typed server frames.
//!
//! The router holds no long-lived state of its own. Every failure short of
//! a vanished connection is answered with an `error` frame on the still-open
//! connection; the process never drops a session over a bad frame.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use pulse_core::{
    codec, now_ms, ClientAction, ConnectionId, ErrorCode, MessageType, ServerEvent, ServerFrame,
    SubscriptionRequest,
};

use crate::history::HistoryProvider;
use crate::registry::{Connection, ConnectionRegistry};

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    history: Arc<dyn HistoryProvider>,
    default_history_limit: usize,
    max_message_size: usize,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        history: Arc<dyn HistoryProvider>,
        default_history_limit: usize,
        max_message_size: usize,
    ) -> Self {
        Self {
            registry,
            history,
            default_history_limit,
            max_message_size,
        }
    }

    /// Handle one inbound text frame from `conn_id`.
    pub async fn handle(&self, conn_id: &ConnectionId, text: &str) {
        let raw = match codec::decode(text) {
            Ok(raw) => raw,
            Err(e) => {
                self.reply_error(conn_id, ErrorCode::ParseError, e.to_string());
                return;
            }
        };
        let frame = match codec::validate_client(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.reply_error(conn_id, e.code(), e.to_string());
                return;
            }
        };

        // The session may have raced with a close; drop silently then.
        let Some(conn) = self.registry.lookup(conn_id) else {
            debug!(%conn_id, "frame from unregistered connection dropped");
            return;
        };

        match frame.action {
            ClientAction::Subscribe => self.handle_subscribe(&conn, frame.payload),
            ClientAction::Unsubscribe => self.handle_unsubscribe(&conn, frame.payload),
            ClientAction::Ping => {
                conn.touch();
                self.reply(
                    &conn,
                    &ServerFrame::event(
                        MessageType::System,
                        ServerEvent::Pong,
                        json!({ "serverTime": now_ms() }),
                    ),
                );
            }
            ClientAction::GetHistory => self.handle_history(&conn, frame.payload).await,
            ClientAction::Ack => {}
        }
    }

    /// Replace the subscription set. The reserved `error` type is filtered
    /// here, at the boundary, so everything downstream may assume the set
    /// never contains it. Empty-after-filter rejects the frame.
    fn handle_subscribe(&self, conn: &Arc<Connection>, payload: Option<Value>) {
        let request = SubscriptionRequest::from_payload(payload);
        let accepted = request.sanitized_types();
        if accepted.is_empty() {
            self.reply(
                conn,
                &ServerFrame::error(
                    ErrorCode::SubscriptionInvalid,
                    "no subscribable types in request",
                ),
            );
            return;
        }

        let mut names: Vec<MessageType> = accepted.iter().copied().collect();
        names.sort_unstable();
        let ack = ServerFrame::event(
            MessageType::System,
            ServerEvent::Subscribed,
            json!({ "types": names }),
        );
        // The ack is queued under the subscription lock so it precedes any
        // broadcast that matches the new set.
        conn.commit_subscriptions(accepted, self.encode_checked(&ack));
    }

    /// Remove the named types. Always acks, even when nothing was
    /// subscribed: unsubscribe is idempotent.
    fn handle_unsubscribe(&self, conn: &Arc<Connection>, payload: Option<Value>) {
        let request = SubscriptionRequest::from_payload(payload);
        let requested = request.sanitized_types();

        let mut names: Vec<MessageType> = requested.iter().copied().collect();
        names.sort_unstable();
        let ack = ServerFrame::event(
            MessageType::System,
            ServerEvent::Unsubscribed,
            json!({ "types": names }),
        );
        conn.retract_subscriptions(&requested, self.encode_checked(&ack));
    }

    async fn handle_history(&self, conn: &Arc<Connection>, payload: Option<Value>) {
        let payload = payload.unwrap_or_else(|| json!({}));

        let kind = match payload.get("type") {
            Some(v) => match serde_json::from_value::<MessageType>(v.clone()) {
                Ok(kind) if !kind.is_reserved() && kind != MessageType::All => kind,
                Ok(kind) => {
                    self.reply(
                        conn,
                        &ServerFrame::error(
                            ErrorCode::InvalidType,
                            format!("history is not available for `{kind}`"),
                        ),
                    );
                    return;
                }
                Err(_) => {
                    self.reply(
                        conn,
                        &ServerFrame::error(ErrorCode::InvalidType, "unknown history type"),
                    );
                    return;
                }
            },
            None => {
                self.reply(
                    conn,
                    &ServerFrame::error(ErrorCode::InvalidType, "missing history type"),
                );
                return;
            }
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let limit = payload
            .get("limit")
            .and_then(Value::as_i64)
            .unwrap_or(self.default_history_limit as i64)
            .clamp(1, 100) as usize;

        // The provider is externally supplied and may block or fail; its
        // effect is bounded to this one reply.
        match self.history.recent(kind, limit).await {
            Ok(slice) => {
                self.reply(
                    conn,
                    &ServerFrame::event(
                        kind,
                        ServerEvent::HistoryData,
                        json!({
                            "type": kind,
                            "limit": limit,
                            "items": slice.items,
                            "total": slice.total,
                        }),
                    ),
                );
            }
            Err(e) => {
                warn!(error = %e, %kind, "history provider failed");
                self.reply(
                    conn,
                    &ServerFrame::error(ErrorCode::InternalError, "history lookup failed"),
                );
            }
        }
    }

    /// Serialize a reply, enforcing the outbound size cap.
    fn encode_checked(&self, frame: &ServerFrame) -> Option<Arc<String>> {
        match codec::encode(frame) {
            Ok(text) if text.len() <= self.max_message_size => Some(Arc::new(text)),
            Ok(text) => {
                warn!(
                    size = text.len(),
                    cap = self.max_message_size,
                    event = ?frame.event,
                    "dropping oversized outbound frame"
                );
                None
            }
            Err(e) => {
                warn!(error = %e, "failed to encode reply frame");
                None
            }
        }
    }

    fn reply(&self, conn: &Connection, frame: &ServerFrame) {
        if let Some(text) = self.encode_checked(frame) {
            if !conn.send(text) {
                debug!(conn_id = %conn.id, "failed to queue reply (mailbox full or closed)");
            }
        }
    }

    fn reply_error(&self, conn_id: &ConnectionId, code: ErrorCode, message: String) {
        if let Some(conn) = self.registry.lookup(conn_id) {
            self.reply(&conn, &ServerFrame::error(code, message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{HistoryError, HistorySlice, MemoryHistory};
    use crate::registry::Outbound;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    fn make_router() -> (Arc<ConnectionRegistry>, MessageRouter) {
        let registry = Arc::new(ConnectionRegistry::new(100, 10));
        let history = Arc::new(MemoryHistory::new(100));
        let router = MessageRouter::new(Arc::clone(&registry), history, 50, 64 * 1024);
        (registry, router)
    }

    fn connect(
        registry: &ConnectionRegistry,
    ) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = registry.register("tester", tx).unwrap();
        (conn.id.clone(), rx)
    }

    fn recv_json(rx: &mut mpsc::Receiver<Outbound>) -> Option<Value> {
        match rx.try_recv() {
            Ok(Outbound::Frame(text)) => serde_json::from_str(&text).ok(),
            _ => None,
        }
    }

    fn client_text(kind: &str, action: &str, payload: Value) -> String {
        json!({
            "id": "m1",
            "type": kind,
            "timestamp": now_ms(),
            "direction": "client-to-server",
            "action": action,
            "payload": payload,
        })
        .to_string()
    }

    #[tokio::test]
    async fn malformed_json_answers_parse_error() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);

        router.handle(&id, "{{{ not json").await;

        let v = recv_json(&mut rx).unwrap();
        assert_eq!(v["event"], "error");
        assert_eq!(v["data"]["code"], "PARSE_ERROR");
        // The connection is still registered.
        assert!(registry.lookup(&id).is_some());
    }

    #[tokio::test]
    async fn unknown_action_answers_invalid_action() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);

        router.handle(&id, &client_text("status", "yodel", json!({}))).await;

        let v = recv_json(&mut rx).unwrap();
        assert_eq!(v["data"]["code"], "INVALID_ACTION");
    }

    #[tokio::test]
    async fn frame_for_stale_connection_dropped_silently() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);
        let _ = registry.unregister(&id);

        router.handle(&id, &client_text("system", "ping", json!({}))).await;
        assert!(recv_json(&mut rx).is_none());
    }

    #[tokio::test]
    async fn subscribe_sets_and_acks() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);

        router
            .handle(
                &id,
                &client_text("system", "subscribe", json!({ "types": ["status", "stats"] })),
            )
            .await;

        let v = recv_json(&mut rx).unwrap();
        assert_eq!(v["event"], "subscribed");
        let types = v["data"]["types"].as_array().unwrap();
        assert_eq!(types.len(), 2);

        let conn = registry.lookup(&id).unwrap();
        assert!(conn.is_subscribed(MessageType::Status));
        assert!(conn.is_subscribed(MessageType::Stats));
        assert!(!conn.is_subscribed(MessageType::Health));
    }

    #[tokio::test]
    async fn subscribe_is_last_write_wins() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);

        router
            .handle(&id, &client_text("system", "subscribe", json!({ "types": ["status"] })))
            .await;
        router
            .handle(&id, &client_text("system", "subscribe", json!({ "types": ["health"] })))
            .await;

        let _ = recv_json(&mut rx);
        let _ = recv_json(&mut rx);
        let conn = registry.lookup(&id).unwrap();
        assert!(!conn.is_subscribed(MessageType::Status));
        assert!(conn.is_subscribed(MessageType::Health));
    }

    #[tokio::test]
    async fn subscribe_to_reserved_only_is_rejected() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);

        router
            .handle(&id, &client_text("system", "subscribe", json!({ "types": ["error"] })))
            .await;

        let v = recv_json(&mut rx).unwrap();
        assert_eq!(v["event"], "error");
        assert_eq!(v["data"]["code"], "SUBSCRIPTION_INVALID");
        // The subscription set stays empty.
        assert!(registry.lookup(&id).unwrap().subscriptions().is_empty());
    }

    #[tokio::test]
    async fn subscribe_filters_reserved_but_keeps_rest() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);

        router
            .handle(
                &id,
                &client_text("system", "subscribe", json!({ "types": ["error", "status"] })),
            )
            .await;

        let v = recv_json(&mut rx).unwrap();
        assert_eq!(v["event"], "subscribed");
        assert_eq!(v["data"]["types"], json!(["status"]));
        let conn = registry.lookup(&id).unwrap();
        assert!(conn.is_subscribed(MessageType::Status));
        assert!(!conn.subscriptions().contains(&MessageType::Error));
    }

    #[tokio::test]
    async fn subscribe_empty_payload_is_rejected() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);

        router.handle(&id, &client_text("system", "subscribe", json!({}))).await;
        let v = recv_json(&mut rx).unwrap();
        assert_eq!(v["data"]["code"], "SUBSCRIPTION_INVALID");
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);

        // Never subscribed; unsubscribing still acks.
        router
            .handle(&id, &client_text("system", "unsubscribe", json!({ "types": ["stats"] })))
            .await;
        let v = recv_json(&mut rx).unwrap();
        assert_eq!(v["event"], "unsubscribed");
        assert_eq!(v["data"]["types"], json!(["stats"]));
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_clears_type() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);

        router
            .handle(
                &id,
                &client_text("system", "subscribe", json!({ "types": ["status", "stats"] })),
            )
            .await;
        router
            .handle(&id, &client_text("system", "unsubscribe", json!({ "types": ["status"] })))
            .await;

        let _ = recv_json(&mut rx);
        let _ = recv_json(&mut rx);
        let conn = registry.lookup(&id).unwrap();
        assert!(!conn.is_subscribed(MessageType::Status));
        assert!(conn.is_subscribed(MessageType::Stats));
    }

    #[tokio::test]
    async fn ping_touches_and_answers_pong() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);
        let conn = registry.lookup(&id).unwrap();
        conn.backdate_heartbeat(std::time::Duration::from_secs(50));

        router.handle(&id, &client_text("system", "ping", json!({}))).await;

        let v = recv_json(&mut rx).unwrap();
        assert_eq!(v["event"], "pong");
        assert!(v["data"]["serverTime"].is_number());
        assert!(conn.heartbeat_elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn ack_is_a_noop() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);
        router.handle(&id, &client_text("system", "ack", json!({}))).await;
        assert!(recv_json(&mut rx).is_none());
    }

    #[tokio::test]
    async fn get_history_returns_recorded_entries() {
        let registry = Arc::new(ConnectionRegistry::new(100, 10));
        let history = Arc::new(MemoryHistory::new(100));
        for i in 0..5 {
            history.record(
                MessageType::Status,
                ServerEvent::StatusUpdate,
                json!({ "seq": i }),
                i,
            );
        }
        let router = MessageRouter::new(Arc::clone(&registry), history, 50, 64 * 1024);
        let (id, mut rx) = connect(&registry);

        router
            .handle(
                &id,
                &client_text("status", "get_history", json!({ "type": "status", "limit": 3 })),
            )
            .await;

        let v = recv_json(&mut rx).unwrap();
        assert_eq!(v["event"], "history_data");
        assert_eq!(v["data"]["type"], "status");
        assert_eq!(v["data"]["limit"], 3);
        assert_eq!(v["data"]["total"], 5);
        assert_eq!(v["data"]["items"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn get_history_clamps_limit() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);

        router
            .handle(
                &id,
                &client_text("status", "get_history", json!({ "type": "status", "limit": 5000 })),
            )
            .await;
        let v = recv_json(&mut rx).unwrap();
        assert_eq!(v["data"]["limit"], 100);

        router
            .handle(
                &id,
                &client_text("status", "get_history", json!({ "type": "status", "limit": 0 })),
            )
            .await;
        let v = recv_json(&mut rx).unwrap();
        assert_eq!(v["data"]["limit"], 1);
    }

    #[tokio::test]
    async fn get_history_defaults_limit_when_absent() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);

        router
            .handle(&id, &client_text("status", "get_history", json!({ "type": "status" })))
            .await;
        let v = recv_json(&mut rx).unwrap();
        assert_eq!(v["data"]["limit"], 50);
    }

    #[tokio::test]
    async fn get_history_rejects_reserved_type() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);

        router
            .handle(&id, &client_text("status", "get_history", json!({ "type": "error" })))
            .await;
        let v = recv_json(&mut rx).unwrap();
        assert_eq!(v["data"]["code"], "INVALID_TYPE");
    }

    struct FailingHistory;

    #[async_trait]
    impl HistoryProvider for FailingHistory {
        async fn recent(
            &self,
            _kind: MessageType,
            _limit: usize,
        ) -> Result<HistorySlice, HistoryError> {
            Err(HistoryError::Unavailable("backend down".into()))
        }
    }

    #[tokio::test]
    async fn provider_failure_answers_internal_error() {
        let registry = Arc::new(ConnectionRegistry::new(100, 10));
        let router =
            MessageRouter::new(Arc::clone(&registry), Arc::new(FailingHistory), 50, 64 * 1024);
        let (id, mut rx) = connect(&registry);

        router
            .handle(&id, &client_text("status", "get_history", json!({ "type": "status" })))
            .await;

        let v = recv_json(&mut rx).unwrap();
        assert_eq!(v["event"], "error");
        assert_eq!(v["data"]["code"], "INTERNAL_ERROR");
        // Connection survives the provider failure.
        assert!(registry.lookup(&id).is_some());
    }

    #[tokio::test]
    async fn oversized_reply_is_dropped() {
        let registry = Arc::new(ConnectionRegistry::new(100, 10));
        let history = Arc::new(MemoryHistory::new(100));
        history.record(
            MessageType::Status,
            ServerEvent::StatusUpdate,
            json!({ "blob": "x".repeat(4096) }),
            1,
        );
        // Cap far below the reply size.
        let router = MessageRouter::new(Arc::clone(&registry), history, 50, 256);
        let (id, mut rx) = connect(&registry);

        router
            .handle(&id, &client_text("status", "get_history", json!({ "type": "status" })))
            .await;
        assert!(recv_json(&mut rx).is_none());
    }

    #[tokio::test]
    async fn every_reply_is_server_directed_with_fresh_id() {
        let (registry, router) = make_router();
        let (id, mut rx) = connect(&registry);

        router.handle(&id, &client_text("system", "ping", json!({}))).await;
        router.handle(&id, &client_text("system", "ping", json!({}))).await;

        let a = recv_json(&mut rx).unwrap();
        let b = recv_json(&mut rx).unwrap();
        assert_eq!(a["direction"], "server-to-client");
        assert_ne!(a["id"], b["id"]);
        assert!(a["timestamp"].as_i64().unwrap() <= b["timestamp"].as_i64().unwrap());
    }
}
