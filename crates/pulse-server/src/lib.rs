//! # pulse-server
//!
//! Axum HTTP + `WebSocket` gateway around the hub.
//!
//! - `GET /ws`: transport upgrade, identity derivation, per-connection
//!   session loop
//! - `GET /health`, `GET /metrics`: liveness and Prometheus text
//! - `GET /api/stats`, `GET /api/queue`: registry and scheduler counters
//! - `POST /api/broadcast`: shared-secret bearer write path into the
//!   scheduler
//! - Heartbeat sweep, drain loop, and change detector on their own timers
//! - Graceful shutdown via `tokio::signal` + `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod sweep;
pub mod telemetry;
