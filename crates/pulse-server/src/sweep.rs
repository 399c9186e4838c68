//! Heartbeat sweep task.
//!
//! Runs on its own fixed cadence, independent of the per-connection
//! heartbeat period, and closes sessions whose last heartbeat is older
//! than the timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pulse_hub::ConnectionRegistry;

pub fn spawn_sweeper(
    registry: Arc<ConnectionRegistry>,
    timeout: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick; a fresh registry has nothing to sweep.
        tick.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let evicted = registry.sweep_timed_out(timeout);
                    if !evicted.is_empty() {
                        info!(count = evicted.len(), "heartbeat sweep evicted connections");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_stale_connections() {
        let registry = Arc::new(ConnectionRegistry::new(10, 10));
        let (tx, _rx) = mpsc::channel(8);
        let conn = registry.register("a", tx).unwrap();
        conn.backdate_heartbeat(Duration::from_secs(120));

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(
            Arc::clone(&registry),
            Duration::from_secs(60),
            Duration::from_secs(60),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(registry.total(), 0);

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_leaves_fresh_connections() {
        let registry = Arc::new(ConnectionRegistry::new(10, 10));
        let (tx, _rx) = mpsc::channel(8);
        let _conn = registry.register("a", tx).unwrap();

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(
            Arc::clone(&registry),
            Duration::from_secs(600),
            Duration::from_secs(60),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(registry.total(), 1);

        cancel.cancel();
        let _ = handle.await;
    }
}
