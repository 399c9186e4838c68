//! Graceful shutdown: quiesce the hub, close every remaining session with
//! a going-away reason, then wait for background tasks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pulse_hub::{BroadcastScheduler, ChangeDetector, ConnectionRegistry};

/// Grace period before remaining tasks are aborted.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Close reason sent to every client still connected at shutdown.
const SHUTDOWN_REASON: &str = "Server shutting down";

/// Coordinates shutdown across the gateway and the hub.
///
/// Quiesce order matters: the detector stops sampling first so nothing new
/// is queued, the scheduler delivers what it already accepted and stops,
/// every live session is closed with a going-away reason, and only then
/// are the background tasks awaited.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    registry: Arc<ConnectionRegistry>,
    scheduler: Arc<BroadcastScheduler>,
    detector: Arc<ChangeDetector>,
    /// Background task handles (drain loop, sweeper, detector, server).
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        scheduler: Arc<BroadcastScheduler>,
        detector: Arc<ChangeDetector>,
    ) -> Self {
        Self {
            token: CancellationToken::new(),
            registry,
            scheduler,
            detector,
            task_handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a background task handle for graceful shutdown.
    pub fn register_task(&self, handle: JoinHandle<()>) {
        self.task_handles.lock().push(handle);
    }

    /// Take all registered task handles (drains the list).
    pub fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.task_handles.lock())
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal shutdown to everything watching the token (accept loop,
    /// sweeper, session loops) without waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wind the hub down and wait for all tracked tasks.
    ///
    /// 1. Stop the detector, flush the scheduler once, then stop it —
    ///    broadcasts accepted before shutdown still reach subscribers
    /// 2. Close every remaining session with 1001 and a shutdown reason
    /// 3. Cancel the token and wait up to `timeout` for all handles
    /// 4. Abort whatever is still running after the timeout
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.detector.stop();
        self.scheduler.flush();
        self.scheduler.stop();

        let closed = self.registry.drain(SHUTDOWN_REASON);
        if closed > 0 {
            info!(closed, "closed remaining connections");
        }

        self.shutdown();

        let mut all_handles = handles;
        all_handles.extend(self.take_tasks());

        info!(
            task_count = all_handles.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for tasks to complete"
        );

        // Collect abort handles before consuming into join_all
        let abort_handles: Vec<_> = all_handles.iter().map(JoinHandle::abort_handle).collect();

        match tokio::time::timeout(timeout, futures::future::join_all(all_handles)).await {
            Ok(_) => {
                info!("all shutdown tasks completed");
            }
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "shutdown timed out, aborting remaining tasks"
                );
                for handle in &abort_handles {
                    handle.abort();
                }
            }
        }
    }
}
