//! # pulse-client
//!
//! Client mirror of the hub session: one logical session over a physical
//! transport that may churn. Maintains reconnect with exponential backoff,
//! heartbeat supervision, a bounded offline queue, and deterministic
//! resubscription after reconnect.

#![deny(unsafe_code)]

pub mod backoff;
pub mod client;

pub use backoff::{reconnect_delay_ms, reconnect_delay_with_random};
pub use client::{ClientConfig, ConnectionState, HubClient};
