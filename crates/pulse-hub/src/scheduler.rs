//! Priority-aware broadcast scheduler.
//!
//! Server-originated notifications are queued as [`BroadcastTask`]s in a
//! bounded queue and drained in batches on a fixed tick. Under pressure
//! the queue displaces lower-priority work rather than growing; a full
//! queue only ever rejects silently (clients never learn about overflow,
//! operators see it in logs and the queue stats).
//!
//! Fan-out serializes each outgoing envelope once per group and writes the
//! shared bytes to every recipient mailbox; a slow consumer is skipped,
//! never awaited.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pulse_core::{codec, now_ms, ConnectionId, MessageType, Priority, ServerEvent, ServerFrame};

use crate::history::MemoryHistory;
use crate::registry::{Connection, ConnectionRegistry};

/// One queued fan-out job. Consumed exactly once; never persisted.
#[derive(Clone, Debug)]
pub struct BroadcastTask {
    pub kind: MessageType,
    pub event: ServerEvent,
    pub data: Value,
    pub priority: Priority,
    pub enqueued_at: i64,
}

impl BroadcastTask {
    pub fn new(kind: MessageType, event: ServerEvent, data: Value, priority: Priority) -> Self {
        Self {
            kind,
            event,
            data,
            priority,
            enqueued_at: now_ms(),
        }
    }
}

/// Queue counters for the stats endpoint.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub length: usize,
    pub is_processing: bool,
}

/// Scheduler tunables.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub max_queue_size: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            batch_size: 100,
            flush_interval: Duration::from_millis(50),
        }
    }
}

pub struct BroadcastScheduler {
    registry: Arc<ConnectionRegistry>,
    config: SchedulerConfig,
    queue: Mutex<Vec<BroadcastTask>>,
    processing: AtomicBool,
    nudge: Notify,
    cancel: CancellationToken,
    history: Option<Arc<MemoryHistory>>,
}

impl BroadcastScheduler {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        config: SchedulerConfig,
        history: Option<Arc<MemoryHistory>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            config,
            queue: Mutex::new(Vec::new()),
            processing: AtomicBool::new(false),
            nudge: Notify::new(),
            cancel: CancellationToken::new(),
            history,
        })
    }

    /// Spawn the drain loop. Runs until [`BroadcastScheduler::stop`].
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(scheduler.config.flush_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = scheduler.cancel.cancelled() => break,
                    _ = tick.tick() => scheduler.flush(),
                    () = scheduler.nudge.notified() => scheduler.flush(),
                }
            }
            // Undrained tasks are dropped on stop; there is no delivery
            // promise across the scheduler lifetime.
            scheduler.queue.lock().clear();
        })
    }

    /// Cancel the drain loop and drop anything still queued.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Queue one fan-out job; returns whether it was admitted.
    pub fn broadcast(
        &self,
        kind: MessageType,
        event: ServerEvent,
        data: Value,
        priority: Priority,
    ) -> bool {
        self.enqueue(BroadcastTask::new(kind, event, data, priority))
    }

    /// Admit a task, displacing lower-priority work when full.
    pub fn enqueue(&self, task: BroadcastTask) -> bool {
        let priority = task.priority;
        let accepted = {
            let mut queue = self.queue.lock();
            let accepted = if queue.len() < self.config.max_queue_size {
                queue.push(task);
                true
            } else {
                Self::displace(&mut queue, task)
            };
            #[allow(clippy::cast_precision_loss)]
            gauge!("broadcast_queue_depth").set(queue.len() as f64);
            accepted
        };

        if accepted {
            counter!("broadcast_enqueued_total").increment(1);
            // High-priority work should not wait for the flush tick.
            if priority == Priority::High {
                self.nudge.notify_one();
            }
        } else {
            counter!("broadcast_rejected_total").increment(1);
            warn!(?priority, "broadcast queue full, task rejected");
        }
        accepted
    }

    /// Displacement when the queue is full: evict the first `low` task for
    /// any higher-priority incomer; a `low` incomer is rejected outright;
    /// failing that, a `high` incomer may evict a `normal` task. The
    /// evicted priority is never above the inserted one.
    fn displace(queue: &mut Vec<BroadcastTask>, task: BroadcastTask) -> bool {
        if task.priority == Priority::Low {
            return false;
        }
        if let Some(pos) = queue.iter().position(|t| t.priority == Priority::Low) {
            let evicted = queue.remove(pos);
            debug!(evicted = ?evicted.priority, inserted = ?task.priority, "displaced queued task");
            Self::insert_in_order(queue, task);
            return true;
        }
        if task.priority == Priority::High {
            if let Some(pos) = queue.iter().position(|t| t.priority == Priority::Normal) {
                let evicted = queue.remove(pos);
                debug!(evicted = ?evicted.priority, inserted = ?task.priority, "displaced queued task");
                Self::insert_in_order(queue, task);
                return true;
            }
        }
        false
    }

    /// Insert keeping (priority desc, enqueued_at asc) order.
    fn insert_in_order(queue: &mut Vec<BroadcastTask>, task: BroadcastTask) {
        let pos = queue
            .iter()
            .position(|t| {
                t.priority < task.priority
                    || (t.priority == task.priority && t.enqueued_at > task.enqueued_at)
            })
            .unwrap_or(queue.len());
        queue.insert(pos, task);
    }

    /// Drain one batch: sort the queue by (priority, enqueued_at), take a
    /// prefix, group by type, emit one envelope per group.
    pub fn flush(&self) {
        if self.processing.swap(true, Ordering::SeqCst) {
            return;
        }

        let batch: Vec<BroadcastTask> = {
            let mut queue = self.queue.lock();
            if queue.is_empty() {
                self.processing.store(false, Ordering::SeqCst);
                return;
            }
            queue.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.enqueued_at.cmp(&b.enqueued_at))
            });
            let take = queue.len().min(self.config.batch_size);
            let batch = queue.drain(..take).collect();
            #[allow(clippy::cast_precision_loss)]
            gauge!("broadcast_queue_depth").set(queue.len() as f64);
            batch
        };

        let mut order: Vec<MessageType> = Vec::new();
        let mut groups: HashMap<MessageType, Vec<BroadcastTask>> = HashMap::new();
        for task in batch {
            if !groups.contains_key(&task.kind) {
                order.push(task.kind);
            }
            groups.entry(task.kind).or_default().push(task);
        }
        for kind in order {
            if let Some(tasks) = groups.remove(&kind) {
                self.deliver_group(kind, tasks);
            }
        }

        self.processing.store(false, Ordering::SeqCst);
        // Leftover work re-arms the drain rather than waiting a full tick.
        if !self.queue.lock().is_empty() {
            self.nudge.notify_one();
        }
    }

    fn deliver_group(&self, kind: MessageType, mut tasks: Vec<BroadcastTask>) {
        if let Some(history) = &self.history {
            for task in &tasks {
                history.record(kind, task.event, task.data.clone(), task.enqueued_at);
            }
        }

        let recipients = self.registry.by_subscription(kind);
        if recipients.is_empty() {
            return;
        }

        let frame = if tasks.len() == 1 {
            let task = tasks.remove(0);
            ServerFrame::event(kind, task.event, task.data)
        } else {
            tasks.sort_by_key(|t| t.enqueued_at);
            let events: Vec<Value> = tasks
                .into_iter()
                .map(|t| json!({ "event": t.event, "data": t.data, "timestamp": t.enqueued_at }))
                .collect();
            ServerFrame::event(kind, ServerEvent::BatchUpdate, json!({ "events": events }))
        };

        let _ = self.send_frame_to(&recipients, &frame);
    }

    /// Bypass the queue and fan out immediately. Reserved for
    /// safety-critical notifications (threshold crossings classified high).
    pub fn broadcast_urgent(&self, kind: MessageType, event: ServerEvent, data: Value) -> usize {
        if let Some(history) = &self.history {
            history.record(kind, event, data.clone(), now_ms());
        }
        let recipients = self.registry.by_subscription(kind);
        if recipients.is_empty() {
            return 0;
        }
        let frame = ServerFrame::event(kind, event, data);
        self.send_frame_to(&recipients, &frame)
    }

    /// Deliver one frame to an explicit recipient list.
    pub fn broadcast_to_connections(&self, ids: &[ConnectionId], frame: &ServerFrame) -> usize {
        let recipients: Vec<Arc<Connection>> =
            ids.iter().filter_map(|id| self.registry.lookup(id)).collect();
        self.send_frame_to(&recipients, frame)
    }

    /// Serialize once, write everywhere. Per-recipient failures are
    /// isolated: one full mailbox never aborts the batch.
    fn send_frame_to(&self, recipients: &[Arc<Connection>], frame: &ServerFrame) -> usize {
        let text = match codec::encode(frame) {
            Ok(text) => Arc::new(text),
            Err(e) => {
                warn!(error = %e, event = ?frame.event, "failed to serialize broadcast frame");
                return 0;
            }
        };
        let mut delivered = 0;
        for conn in recipients {
            if conn.send(Arc::clone(&text)) {
                delivered += 1;
            } else {
                warn!(
                    conn_id = %conn.id,
                    total_drops = conn.drop_count(),
                    "failed to deliver broadcast frame (mailbox full or closed)"
                );
            }
        }
        counter!("broadcast_frames_sent_total").increment(delivered as u64);
        delivered
    }

    pub fn queue_stats(&self) -> QueueStats {
        QueueStats {
            length: self.queue.lock().len(),
            is_processing: self.processing.load(Ordering::SeqCst),
        }
    }

    #[cfg(test)]
    fn queue_snapshot(&self) -> Vec<(Priority, i64)> {
        self.queue
            .lock()
            .iter()
            .map(|t| (t.priority, t.enqueued_at))
            .collect()
    }
}
