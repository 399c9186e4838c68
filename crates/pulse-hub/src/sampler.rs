//! System state sampling.
//!
//! The detector reads through the [`Sampler`] trait so tests can script
//! samples. [`SystemSampler`] is the production implementation: host CPU,
//! memory and disk via `sysinfo`, the live connection count from the
//! registry, and request-rate counters fed by the gateway.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use sysinfo::{Disks, System};

use crate::detector::{RequestRates, SystemStats, SystemStatus};
use crate::registry::ConnectionRegistry;

/// Source of system snapshots. Returning `None` means "no sample this
/// tick" and is treated as no change.
pub trait Sampler: Send + Sync {
    fn status(&self) -> Option<SystemStatus>;
    fn stats(&self) -> Option<SystemStats>;
}

struct RateWindow {
    last_total: u64,
    last_at: Instant,
}

/// Samples the host the hub runs on.
pub struct SystemSampler {
    system: Mutex<System>,
    registry: Arc<ConnectionRegistry>,
    requests_total: AtomicU64,
    window: Mutex<RateWindow>,
}

impl SystemSampler {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            registry,
            requests_total: AtomicU64::new(0),
            window: Mutex::new(RateWindow {
                last_total: 0,
                last_at: Instant::now(),
            }),
        }
    }

    /// Count one handled request toward the rate stats.
    pub fn record_request(&self) {
        let _ = self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    fn disk_usage_percent() -> f64 {
        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks
            .list()
            .iter()
            .fold((0_u64, 0_u64), |(total, available), disk| {
                (
                    total.saturating_add(disk.total_space()),
                    available.saturating_add(disk.available_space()),
                )
            });
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let used = (total - available.min(total)) as f64 / total as f64;
        used * 100.0
    }
}

impl Sampler for SystemSampler {
    fn status(&self) -> Option<SystemStatus> {
        let (cpu, memory) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();
            let cpu = f64::from(system.global_cpu_usage());
            #[allow(clippy::cast_precision_loss)]
            let memory = if system.total_memory() == 0 {
                0.0
            } else {
                system.used_memory() as f64 / system.total_memory() as f64 * 100.0
            };
            (cpu, memory)
        };

        Some(SystemStatus {
            cpu,
            memory,
            disk: Self::disk_usage_percent(),
            connections: self.registry.total(),
            online: true,
        })
    }

    fn stats(&self) -> Option<SystemStats> {
        let total = self.requests_total.load(Ordering::Relaxed);
        let mut window = self.window.lock();
        let elapsed = window.last_at.elapsed().as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let per_second = if elapsed > 0.0 {
            total.saturating_sub(window.last_total) as f64 / elapsed
        } else {
            0.0
        };
        window.last_total = total;
        window.last_at = Instant::now();

        Some(SystemStats {
            requests: RequestRates { total, per_second },
        })
    }
}
