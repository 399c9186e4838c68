//! Typed wire vocabulary: message types, client actions, server events,
//! error codes, and the envelope structs they travel in.
//!
//! Every frame on the wire is a JSON object with `id`, `type`, `timestamp`
//! (wall-clock milliseconds) and `direction`. Client frames additionally
//! carry `action` and an optional `payload`; server frames carry `event`
//! and `data`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::MessageId;

/// Current wall-clock time in milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─────────────────────────────────────────────────────────────────────────────
// Closed vocabularies
// ─────────────────────────────────────────────────────────────────────────────

/// The closed set of message categories a frame can belong to.
///
/// `Error` is reserved: clients may never subscribe to it. `All` is a
/// subscription-only wildcard that matches every non-reserved type at
/// fan-out time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Status,
    Stats,
    Health,
    Config,
    System,
    Error,
    All,
}

impl MessageType {
    /// Whether clients are forbidden from subscribing to this type.
    #[must_use]
    pub fn is_reserved(self) -> bool {
        matches!(self, MessageType::Error)
    }

    /// Wire spelling of this type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Status => "status",
            MessageType::Stats => "stats",
            MessageType::Health => "health",
            MessageType::Config => "config",
            MessageType::System => "system",
            MessageType::Error => "error",
            MessageType::All => "all",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intents a client may express.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAction {
    Subscribe,
    Unsubscribe,
    Ping,
    GetHistory,
    Ack,
}

/// Events the server can emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerEvent {
    Connected,
    Disconnected,
    Subscribed,
    Unsubscribed,
    StatusUpdate,
    StatsUpdate,
    HealthAlert,
    HealthRecovery,
    Pong,
    HistoryData,
    BatchUpdate,
    Error,
}

/// Machine-readable codes carried in `error` frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    InvalidType,
    InvalidAction,
    MaxConnectionsExceeded,
    Unauthorized,
    InternalError,
    HeartbeatTimeout,
    QueueOverflow,
    SubscriptionInvalid,
}

/// Delivery priority of a queued broadcast.
///
/// Ordering is `Low < Normal < High`, which the scheduler relies on for
/// admission under pressure and drain ordering.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Which way a frame travels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "client-to-server")]
    ClientToServer,
    #[serde(rename = "server-to-client")]
    ServerToClient,
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelopes
// ─────────────────────────────────────────────────────────────────────────────

/// A leniently-decoded inbound frame.
///
/// Fields are kept as raw JSON values so validation can distinguish
/// "missing", "wrong scalar kind", and "unknown member of a closed set" —
/// each maps to a different error code on the reply.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEnvelope {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(rename = "type", default)]
    pub kind: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub direction: Option<Value>,
    #[serde(default)]
    pub action: Option<Value>,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// A validated client frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub timestamp: i64,
    pub direction: Direction,
    pub action: ClientAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ClientFrame {
    /// Build a fresh client frame with a new ID and the current timestamp.
    #[must_use]
    pub fn action(kind: MessageType, action: ClientAction, payload: Option<Value>) -> Self {
        Self {
            id: MessageId::new(),
            kind,
            timestamp: now_ms(),
            direction: Direction::ClientToServer,
            action,
            payload,
        }
    }
}

/// A server-originated frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub timestamp: i64,
    pub direction: Direction,
    pub event: ServerEvent,
    pub data: Value,
}

impl ServerFrame {
    /// Build a fresh server frame with a new ID and the current timestamp.
    #[must_use]
    pub fn event(kind: MessageType, event: ServerEvent, data: Value) -> Self {
        Self {
            id: MessageId::new(),
            kind,
            timestamp: now_ms(),
            direction: Direction::ServerToClient,
            event,
            data,
        }
    }

    /// Build an `error` frame carrying a code and a human-readable message.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::event(
            MessageType::Error,
            ServerEvent::Error,
            serde_json::json!({ "code": code, "message": message.into() }),
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of `subscribe` and `unsubscribe` frames: `{ "types": [...] }`.
///
/// Entries are kept raw so unknown strings and the reserved `error` type
/// can be filtered rather than failing the whole frame.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(default)]
    pub types: Vec<Value>,
}

impl SubscriptionRequest {
    /// Parse from an optional payload, tolerating a missing or malformed one.
    #[must_use]
    pub fn from_payload(payload: Option<Value>) -> Self {
        payload
            .and_then(|p| serde_json::from_value(p).ok())
            .unwrap_or_default()
    }

    /// The requested types with unknown entries and the reserved `error`
    /// type silently dropped.
    #[must_use]
    pub fn sanitized_types(&self) -> HashSet<MessageType> {
        self.types
            .iter()
            .filter_map(|v| serde_json::from_value::<MessageType>(v.clone()).ok())
            .filter(|t| !t.is_reserved())
            .collect()
    }
}
