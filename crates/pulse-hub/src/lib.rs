//! # pulse-hub
//!
//! The fan-out hub: connection registry with admission caps and
//! heartbeat-driven eviction, the message router for typed client intents,
//! the priority-aware broadcast scheduler, and the change detector that
//! samples system state and emits updates on meaningful transitions.
//!
//! The transport acceptor lives in `pulse-server`; the hub itself only
//! talks to per-connection write mailboxes.

#![deny(unsafe_code)]

pub mod config;
pub mod detector;
pub mod history;
pub mod registry;
pub mod router;
pub mod sampler;
pub mod scheduler;

pub use config::HubConfig;
pub use detector::{ChangeDetector, DetectorConfig, HealthLevel, SystemStats, SystemStatus};
pub use history::{HistoryError, HistoryProvider, HistorySlice, MemoryHistory};
pub use registry::{Connection, ConnectionRegistry, Outbound, RegistryError, RegistryStats};
pub use router::MessageRouter;
pub use sampler::{Sampler, SystemSampler};
pub use scheduler::{BroadcastScheduler, BroadcastTask, QueueStats, SchedulerConfig};
