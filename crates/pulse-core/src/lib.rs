//! # pulse-core
//!
//! Wire envelope model and codec shared by the hub, the gateway, and the
//! client mirror.
//!
//! - Closed message/action/event vocabularies with their wire spellings
//! - Lenient decode ([`codec::decode`]) followed by strict validation
//!   ([`codec::validate_client`]), so a malformed frame yields a typed
//!   error reply instead of a dropped connection
//! - Branded IDs (UUID v7, time-ordered)

#![deny(unsafe_code)]

pub mod codec;
pub mod ids;
pub mod message;

pub use codec::{decode, encode, validate_client, ParseError, ValidateError};
pub use ids::{ConnectionId, MessageId};
pub use message::{
    now_ms, ClientAction, ClientFrame, Direction, ErrorCode, MessageType, Priority, RawEnvelope,
    ServerEvent, ServerFrame, SubscriptionRequest,
};
