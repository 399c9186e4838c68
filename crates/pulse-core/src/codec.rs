//! Wire (de)serialization and client-frame validation.
//!
//! Decoding is deliberately lenient: any JSON object parses into a
//! [`RawEnvelope`]. Validation then checks the closed sets and required
//! fields, producing a [`ValidateError`] that maps onto the wire
//! [`ErrorCode`] for the reply. Both steps fail closed without giving the
//! caller a reason to terminate the connection.

use serde::Serialize;
use serde_json::Value;

use crate::ids::MessageId;
use crate::message::{
    ClientAction, ClientFrame, Direction, ErrorCode, MessageType, RawEnvelope,
};

/// Failure to turn bytes into an envelope (or back).
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A structurally-parsed frame that fails the client-frame contract.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidateError {
    #[error("missing or invalid field `{0}`")]
    MissingField(&'static str),
    #[error("`timestamp` must be a number of milliseconds")]
    InvalidTimestamp,
    #[error("unknown message type `{0}`")]
    InvalidType(String),
    #[error("unknown action `{0}`")]
    InvalidAction(String),
}

impl ValidateError {
    /// The wire error code carried in the reply frame.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            ValidateError::MissingField(_) | ValidateError::InvalidTimestamp => {
                ErrorCode::ParseError
            }
            ValidateError::InvalidType(_) => ErrorCode::InvalidType,
            ValidateError::InvalidAction(_) => ErrorCode::InvalidAction,
        }
    }
}

/// Decode one inbound text frame.
pub fn decode(text: &str) -> Result<RawEnvelope, ParseError> {
    Ok(serde_json::from_str(text)?)
}

#[allow(clippy::cast_possible_truncation)]
fn number_as_ms(n: &serde_json::Number) -> Option<i64> {
    n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))
}

/// Serialize an outbound frame.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, ParseError> {
    Ok(serde_json::to_string(frame)?)
}

/// Check a decoded envelope against the client-frame contract.
///
/// `id`, `type`, `timestamp` and `action` are required; `timestamp` must be
/// numeric. A missing or unrecognized `direction` is treated as
/// client-to-server — inbound frames are client frames by construction.
pub fn validate_client(raw: RawEnvelope) -> Result<ClientFrame, ValidateError> {
    let id = match raw.id {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => return Err(ValidateError::MissingField("id")),
    };

    let kind_str = raw
        .kind
        .as_ref()
        .and_then(Value::as_str)
        .ok_or(ValidateError::MissingField("type"))?;
    let kind: MessageType = serde_json::from_value(Value::String(kind_str.to_owned()))
        .map_err(|_| ValidateError::InvalidType(kind_str.to_owned()))?;

    let timestamp = match raw.timestamp {
        None => return Err(ValidateError::MissingField("timestamp")),
        Some(Value::Number(n)) => number_as_ms(&n).ok_or(ValidateError::InvalidTimestamp)?,
        Some(_) => return Err(ValidateError::InvalidTimestamp),
    };

    let action_str = raw
        .action
        .as_ref()
        .and_then(Value::as_str)
        .ok_or(ValidateError::MissingField("action"))?;
    let action: ClientAction = serde_json::from_value(Value::String(action_str.to_owned()))
        .map_err(|_| ValidateError::InvalidAction(action_str.to_owned()))?;

    let direction = raw
        .direction
        .and_then(|v| serde_json::from_value::<Direction>(v).ok())
        .unwrap_or(Direction::ClientToServer);

    Ok(ClientFrame {
        id: MessageId::from(id),
        kind,
        timestamp,
        direction,
        action,
        payload: raw.payload,
    })
}
