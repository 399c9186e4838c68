//! Change detector: periodic sampling, diffing, threshold evaluation,
//! and broadcast emission.
//!
//! The detector owns the last emitted samples and the per-component health
//! levels. It only ever *enqueues* on the scheduler; it never touches
//! connections directly. A missing sample is treated as "no change" so a
//! stalled source can never stall the detector.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pulse_core::{MessageType, Priority, ServerEvent};

use crate::sampler::Sampler;
use crate::scheduler::BroadcastScheduler;

/// Snapshot of monitored system state.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    /// CPU load, percent.
    pub cpu: f64,
    /// Memory use, percent.
    pub memory: f64,
    /// Disk use, percent.
    pub disk: f64,
    /// Live hub connections.
    pub connections: usize,
    pub online: bool,
}

/// Request-rate counters.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRates {
    pub total: u64,
    pub per_second: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SystemStats {
    pub requests: RequestRates,
}

/// Per-component health level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Info,
    Warning,
    Critical,
}

/// Detector tunables. Components go `warning` above their threshold and
/// `critical` fifteen points above it.
#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub sample_interval: Duration,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub disk_threshold: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(1000),
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            disk_threshold: 90.0,
        }
    }
}

const CRITICAL_MARGIN: f64 = 15.0;

fn level_for(value: f64, threshold: f64) -> HealthLevel {
    if value > threshold + CRITICAL_MARGIN {
        HealthLevel::Critical
    } else if value > threshold {
        HealthLevel::Warning
    } else {
        HealthLevel::Info
    }
}

pub struct ChangeDetector {
    sampler: Arc<dyn Sampler>,
    scheduler: Arc<BroadcastScheduler>,
    config: DetectorConfig,
    last_status: Mutex<Option<SystemStatus>>,
    last_stats: Mutex<Option<SystemStats>>,
    health: Mutex<HashMap<&'static str, HealthLevel>>,
    cancel: CancellationToken,
}

impl ChangeDetector {
    pub fn new(
        sampler: Arc<dyn Sampler>,
        scheduler: Arc<BroadcastScheduler>,
        config: DetectorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sampler,
            scheduler,
            config,
            last_status: Mutex::new(None),
            last_stats: Mutex::new(None),
            health: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the sampling loop on its own timer.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(detector.config.sample_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = detector.cancel.cancelled() => break,
                    _ = tick.tick() => detector.tick(),
                }
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// One detection pass. A sampler returning `None` contributes nothing.
    pub fn tick(&self) {
        if let Some(status) = self.sampler.status() {
            self.detect_health(&status);
            self.detect_status(status);
        }
        if let Some(stats) = self.sampler.stats() {
            self.detect_stats(stats);
        }
    }

    /// Clear the last status sample so the next tick re-emits unconditionally.
    pub fn force_status_broadcast(&self) {
        *self.last_status.lock() = None;
    }

    /// Clear the last stats sample so the next tick re-emits unconditionally.
    pub fn force_stats_broadcast(&self) {
        *self.last_stats.lock() = None;
    }

    fn detect_status(&self, current: SystemStatus) {
        let previous = {
            let mut last = self.last_status.lock();
            let previous = last.clone();
            if previous.as_ref() != Some(&current) || previous.is_none() {
                *last = Some(current.clone());
            }
            previous
        };

        let Some(previous) = previous else {
            // First sample after startup goes out unconditionally.
            let _ = self.scheduler.broadcast(
                MessageType::Status,
                ServerEvent::StatusUpdate,
                json!({
                    "changes": [{ "field": "all", "oldValue": Value::Null, "newValue": current }],
                    "status": current,
                }),
                Priority::Normal,
            );
            return;
        };

        let mut changes: Vec<Value> = Vec::new();
        let mut numeric = |field: &'static str, old: f64, new: f64| {
            if (old - new).abs() > f64::EPSILON {
                changes.push(json!({
                    "field": field,
                    "oldValue": old,
                    "newValue": new,
                    "delta": new - old,
                }));
            }
        };
        numeric("cpu", previous.cpu, current.cpu);
        numeric("memory", previous.memory, current.memory);
        numeric("disk", previous.disk, current.disk);
        if previous.connections != current.connections {
            changes.push(json!({
                "field": "connections",
                "oldValue": previous.connections,
                "newValue": current.connections,
            }));
        }
        if previous.online != current.online {
            changes.push(json!({
                "field": "online",
                "oldValue": previous.online,
                "newValue": current.online,
            }));
        }
        if changes.is_empty() {
            return;
        }

        // A critical field crossing above its threshold makes the update
        // urgent-ish; many fields moving at once is merely notable.
        let crossed_critical = (current.cpu > self.config.cpu_threshold
            && previous.cpu <= self.config.cpu_threshold)
            || (current.memory > self.config.memory_threshold
                && previous.memory <= self.config.memory_threshold);
        let priority = if crossed_critical {
            Priority::High
        } else if changes.len() > 3 {
            Priority::Normal
        } else {
            Priority::Low
        };

        debug!(fields = changes.len(), ?priority, "status change detected");
        let _ = self.scheduler.broadcast(
            MessageType::Status,
            ServerEvent::StatusUpdate,
            json!({ "changes": changes, "status": current }),
            priority,
        );
    }

    fn detect_health(&self, status: &SystemStatus) {
        let components: [(&'static str, f64, f64); 3] = [
            ("cpu", status.cpu, self.config.cpu_threshold),
            ("memory", status.memory, self.config.memory_threshold),
            ("disk", status.disk, self.config.disk_threshold),
        ];

        for (component, value, threshold) in components {
            let next = level_for(value, threshold);
            let previous = {
                let mut levels = self.health.lock();
                let previous = levels.get(component).copied().unwrap_or(HealthLevel::Info);
                if next != previous {
                    let _ = levels.insert(component, next);
                }
                previous
            };
            if next == previous {
                continue;
            }

            let data = json!({
                "component": component,
                "level": next,
                "value": value,
                "threshold": threshold,
            });
            match next {
                // Back to info from any degraded level.
                HealthLevel::Info => {
                    let _ = self.scheduler.broadcast(
                        MessageType::Health,
                        ServerEvent::HealthRecovery,
                        data,
                        Priority::Normal,
                    );
                }
                HealthLevel::Warning => {
                    let _ = self.scheduler.broadcast(
                        MessageType::Health,
                        ServerEvent::HealthAlert,
                        data,
                        Priority::Normal,
                    );
                }
                // Threshold crossings classified high bypass the queue.
                HealthLevel::Critical => {
                    let _ = self.scheduler.broadcast_urgent(
                        MessageType::Health,
                        ServerEvent::HealthAlert,
                        data,
                    );
                }
            }
        }
    }

    fn detect_stats(&self, current: SystemStats) {
        let changed = {
            let mut last = self.last_stats.lock();
            let changed = match last.as_ref() {
                None => true,
                Some(previous) => {
                    (current.requests.per_second - previous.requests.per_second).abs() > 5.0
                        || current.requests.total != previous.requests.total
                }
            };
            if changed {
                *last = Some(current.clone());
            }
            changed
        };
        if changed {
            let _ = self.scheduler.broadcast(
                MessageType::Stats,
                ServerEvent::StatsUpdate,
                json!({ "stats": current }),
                Priority::Normal,
            );
        }
    }
}
