//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at server startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

// Metric name constants to avoid typos across crates.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Frames dropped on full or closed mailboxes (counter).
pub const WS_SEND_DROPS_TOTAL: &str = "ws_send_drops_total";
/// Heartbeat sweep evictions (counter).
pub const WS_SWEEP_EVICTIONS_TOTAL: &str = "ws_sweep_evictions_total";
/// Broadcast tasks admitted to the queue (counter).
pub const BROADCAST_ENQUEUED_TOTAL: &str = "broadcast_enqueued_total";
/// Broadcast tasks rejected by the full queue (counter).
pub const BROADCAST_REJECTED_TOTAL: &str = "broadcast_rejected_total";
/// Broadcast frames delivered to recipient mailboxes (counter).
pub const BROADCAST_FRAMES_SENT_TOTAL: &str = "broadcast_frames_sent_total";
/// Current broadcast queue depth (gauge).
pub const BROADCAST_QUEUE_DEPTH: &str = "broadcast_queue_depth";
