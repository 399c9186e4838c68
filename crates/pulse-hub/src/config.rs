//! Hub configuration.

use serde::{Deserialize, Serialize};

use pulse_core::MessageType;

/// Tunables for the hub: admission caps, heartbeat windows, scheduler
/// bounds, and the advertised capabilities of the `connected` greeting.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubConfig {
    /// Client ping cadence, advertised in the `connected` frame (ms).
    pub heartbeat_interval_ms: u64,
    /// Sweep threshold: connections silent longer than this are closed (ms).
    pub heartbeat_timeout_ms: u64,
    /// Per-identity admission cap.
    pub max_connections_per_user: usize,
    /// Global admission cap.
    pub max_total_connections: usize,
    /// Maximum tasks drained per flush.
    pub broadcast_batch_size: usize,
    /// Drain tick (ms).
    pub broadcast_flush_interval_ms: u64,
    /// `get_history` limit used when the client omits one.
    pub default_history_limit: usize,
    /// Types advertised in the `connected` frame.
    pub supported_types: Vec<MessageType>,
    /// Outbound frames serialized larger than this are dropped (bytes).
    pub max_message_size: usize,
    /// Broadcast queue cap.
    pub max_queue_size: usize,
    /// Reconnect attempt ceiling, advertised in the `connected` frame.
    pub max_reconnect_attempts: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 60_000,
            max_connections_per_user: 3,
            max_total_connections: 10_000,
            broadcast_batch_size: 100,
            broadcast_flush_interval_ms: 50,
            default_history_limit: 50,
            supported_types: vec![
                MessageType::Status,
                MessageType::Stats,
                MessageType::Health,
                MessageType::Config,
                MessageType::System,
            ],
            max_message_size: 64 * 1024,
            max_queue_size: 1_000,
            max_reconnect_attempts: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.heartbeat_timeout_ms, 60_000);
        assert_eq!(cfg.max_connections_per_user, 3);
        assert_eq!(cfg.max_total_connections, 10_000);
        assert_eq!(cfg.broadcast_batch_size, 100);
        assert_eq!(cfg.broadcast_flush_interval_ms, 50);
        assert_eq!(cfg.default_history_limit, 50);
        assert_eq!(cfg.max_message_size, 64 * 1024);
        assert_eq!(cfg.max_queue_size, 1_000);
        assert_eq!(cfg.max_reconnect_attempts, 5);
    }

    #[test]
    fn reserved_type_not_advertised() {
        let cfg = HubConfig::default();
        assert!(!cfg.supported_types.contains(&MessageType::Error));
        assert!(!cfg.supported_types.contains(&MessageType::All));
        assert_eq!(cfg.supported_types.len(), 5);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: HubConfig =
            serde_json::from_str(r#"{ "maxConnectionsPerUser": 1, "maxQueueSize": 3 }"#).unwrap();
        assert_eq!(cfg.max_connections_per_user, 1);
        assert_eq!(cfg.max_queue_size, 3);
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = HubConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: HubConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_total_connections, cfg.max_total_connections);
        assert_eq!(back.supported_types, cfg.supported_types);
    }
}
