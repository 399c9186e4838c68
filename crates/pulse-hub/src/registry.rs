//! Connection registry: live sessions, subscriptions, heartbeats, and
//! admission caps.
//!
//! The registry exclusively owns every [`Connection`] and both lookup
//! indices (by ID and by identity). All mutations go through the inner
//! write lock, giving single-writer semantics across transport accept,
//! close, frame handling, and the heartbeat sweep.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};

use pulse_core::{ConnectionId, MessageType};

/// Close code for policy rejections (admission caps).
pub const CLOSE_POLICY: u16 = 1008;
/// Close code for heartbeat timeouts.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// One item in a connection's write mailbox.
///
/// The socket itself is owned by the session task; everything else writes
/// through this mailbox, so ownership of the transport never splits.
#[derive(Clone, Debug)]
pub enum Outbound {
    /// A serialized frame, shared so fan-out serializes once per group.
    Frame(Arc<String>),
    /// Close the transport with the given code and reason.
    Close { code: u16, reason: String },
}

/// Admission failure.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("server connection limit reached")]
    ServerFull,
    #[error("connection limit reached for this user")]
    IdentityFull,
}

/// Aggregate registry counters for the stats endpoint.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub unique_identities: usize,
    pub average_subscriptions: f64,
}

/// One accepted session.
#[derive(Debug)]
pub struct Connection {
    /// Server-assigned, unique for the process lifetime.
    pub id: ConnectionId,
    /// Opaque identity string, stable per logical user.
    pub identity: String,
    tx: mpsc::Sender<Outbound>,
    subscriptions: Mutex<HashSet<MessageType>>,
    pub connected_at: Instant,
    last_heartbeat: Mutex<Instant>,
    pub alive: AtomicBool,
    dropped_frames: AtomicU64,
}

impl Connection {
    fn new(identity: String, tx: mpsc::Sender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            identity,
            tx,
            subscriptions: Mutex::new(HashSet::new()),
            connected_at: now,
            last_heartbeat: Mutex::new(now),
            alive: AtomicBool::new(true),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Queue a serialized frame for this connection.
    ///
    /// Returns `false` if the mailbox is full or closed, and increments
    /// the dropped-frame counter. A slow consumer never blocks the caller.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(Outbound::Frame(frame)).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            counter!("ws_send_drops_total").increment(1);
            false
        }
    }

    /// Queue a close for this connection (best-effort).
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.tx
            .try_send(Outbound::Close {
                code,
                reason: reason.into(),
            })
            .is_ok()
    }

    /// Total frames dropped on this connection's mailbox.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Record heartbeat activity.
    pub fn touch(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Time since the last heartbeat (or connection establishment).
    pub fn heartbeat_elapsed(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// Force the last-heartbeat timestamp; used to exercise the sweep.
    pub fn backdate_heartbeat(&self, age: Duration) {
        let mut last = self.last_heartbeat.lock();
        if let Some(past) = Instant::now().checked_sub(age) {
            *last = past;
        }
    }

    /// Snapshot of the subscription set.
    pub fn subscriptions(&self) -> HashSet<MessageType> {
        self.subscriptions.lock().clone()
    }

    /// Whether this connection should receive frames of `kind`.
    ///
    /// The `all` wildcard matches every non-reserved type.
    pub fn is_subscribed(&self, kind: MessageType) -> bool {
        let subs = self.subscriptions.lock();
        subs.contains(&kind) || (!kind.is_reserved() && subs.contains(&MessageType::All))
    }

    /// Replace the subscription set (last-write-wins) and, while still
    /// holding the subscription lock, queue the acknowledgement frame.
    ///
    /// Holding the lock across the ack send means no fan-out pass can
    /// observe the new set before the ack sits in the mailbox, so the
    /// `subscribed` confirmation always precedes matching broadcasts.
    pub fn commit_subscriptions(&self, set: HashSet<MessageType>, ack: Option<Arc<String>>) {
        debug_assert!(!set.contains(&MessageType::Error));
        let mut subs = self.subscriptions.lock();
        *subs = set;
        if let Some(frame) = ack {
            let _ = self.send(frame);
        }
    }

    /// Remove the given types and queue the acknowledgement, mirroring
    /// [`Connection::commit_subscriptions`]. Removal is idempotent.
    pub fn retract_subscriptions(&self, set: &HashSet<MessageType>, ack: Option<Arc<String>>) {
        let mut subs = self.subscriptions.lock();
        for kind in set {
            let _ = subs.remove(kind);
        }
        if let Some(frame) = ack {
            let _ = self.send(frame);
        }
    }

    fn add_subscription(&self, kind: MessageType) {
        if !kind.is_reserved() {
            let _ = self.subscriptions.lock().insert(kind);
        }
    }

    fn remove_subscription(&self, kind: MessageType) {
        let _ = self.subscriptions.lock().remove(&kind);
    }
}

struct Inner {
    by_id: HashMap<ConnectionId, Arc<Connection>>,
    by_identity: HashMap<String, HashSet<ConnectionId>>,
}

/// Tracks every live session and enforces the admission caps.
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    max_total: usize,
    max_per_identity: usize,
}

impl ConnectionRegistry {
    pub fn new(max_total: usize, max_per_identity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                by_identity: HashMap::new(),
            }),
            max_total,
            max_per_identity,
        }
    }

    /// Admit a session.
    ///
    /// Checks the global cap first, then the per-identity cap, then inserts
    /// the fresh connection into both indices.
    pub fn register(
        &self,
        identity: &str,
        tx: mpsc::Sender<Outbound>,
    ) -> Result<Arc<Connection>, RegistryError> {
        let mut inner = self.inner.write();
        if inner.by_id.len() >= self.max_total {
            return Err(RegistryError::ServerFull);
        }
        let current = inner.by_identity.get(identity).map_or(0, HashSet::len);
        if current >= self.max_per_identity {
            return Err(RegistryError::IdentityFull);
        }

        let conn = Arc::new(Connection::new(identity.to_owned(), tx));
        let _ = inner.by_id.insert(conn.id.clone(), Arc::clone(&conn));
        let _ = inner
            .by_identity
            .entry(identity.to_owned())
            .or_default()
            .insert(conn.id.clone());

        counter!("ws_connections_total").increment(1);
        gauge!("ws_connections_active").increment(1.0);
        debug!(conn_id = %conn.id, identity, "connection registered");
        Ok(conn)
    }

    /// Remove a session from both indices.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write();
        let conn = inner.by_id.remove(id)?;
        let identity_empty = match inner.by_identity.get_mut(&conn.identity) {
            Some(set) => {
                let _ = set.remove(id);
                set.is_empty()
            }
            None => false,
        };
        if identity_empty {
            let _ = inner.by_identity.remove(&conn.identity);
        }
        counter!("ws_disconnections_total").increment(1);
        gauge!("ws_connections_active").decrement(1.0);
        debug!(conn_id = %conn.id, identity = %conn.identity, "connection unregistered");
        Some(conn)
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn by_identity(&self, identity: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.read();
        inner
            .by_identity
            .get(identity)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every connection interested in `kind`, either directly or via the
    /// `all` wildcard. Order is unspecified but stable within one call.
    pub fn by_subscription(&self, kind: MessageType) -> Vec<Arc<Connection>> {
        if kind.is_reserved() {
            return Vec::new();
        }
        self.inner
            .read()
            .by_id
            .values()
            .filter(|c| c.is_subscribed(kind))
            .cloned()
            .collect()
    }

    pub fn set_subscriptions(&self, id: &ConnectionId, set: HashSet<MessageType>) -> bool {
        match self.lookup(id) {
            Some(conn) => {
                conn.commit_subscriptions(set, None);
                true
            }
            None => false,
        }
    }

    pub fn add_subscription(&self, id: &ConnectionId, kind: MessageType) -> bool {
        match self.lookup(id) {
            Some(conn) => {
                conn.add_subscription(kind);
                true
            }
            None => false,
        }
    }

    pub fn remove_subscription(&self, id: &ConnectionId, kind: MessageType) -> bool {
        match self.lookup(id) {
            Some(conn) => {
                conn.remove_subscription(kind);
                true
            }
            None => false,
        }
    }

    /// Record heartbeat activity for a session.
    pub fn touch(&self, id: &ConnectionId) {
        if let Some(conn) = self.lookup(id) {
            conn.touch();
        }
    }

    /// Close and unregister every session whose last heartbeat is older
    /// than `timeout`. The close is best-effort; send failures are
    /// swallowed because the peer is presumed unreachable.
    pub fn sweep_timed_out(&self, timeout: Duration) -> Vec<Arc<Connection>> {
        let expired: Vec<Arc<Connection>> = self
            .inner
            .read()
            .by_id
            .values()
            .filter(|c| c.heartbeat_elapsed() > timeout)
            .cloned()
            .collect();

        for conn in &expired {
            conn.alive.store(false, Ordering::Relaxed);
            let _ = conn.close(CLOSE_GOING_AWAY, "Heartbeat timeout");
            let _ = self.unregister(&conn.id);
            info!(conn_id = %conn.id, identity = %conn.identity, "closed timed-out connection");
        }
        if !expired.is_empty() {
            counter!("ws_sweep_evictions_total").increment(expired.len() as u64);
        }
        expired
    }

    /// Close every live session with a going-away reason and clear both
    /// indices. Used at shutdown; send failures are swallowed.
    pub fn drain(&self, reason: &str) -> usize {
        let all: Vec<Arc<Connection>> = self.inner.read().by_id.values().cloned().collect();
        for conn in &all {
            conn.alive.store(false, Ordering::Relaxed);
            let _ = conn.close(CLOSE_GOING_AWAY, reason);
            let _ = self.unregister(&conn.id);
        }
        all.len()
    }

    pub fn total(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        let total = inner.by_id.len();
        let subscription_sum: usize = inner
            .by_id
            .values()
            .map(|c| c.subscriptions.lock().len())
            .sum();
        #[allow(clippy::cast_precision_loss)]
        let average_subscriptions = if total == 0 {
            0.0
        } else {
            subscription_sum as f64 / total as f64
        };
        RegistryStats {
            total,
            unique_identities: inner.by_identity.len(),
            average_subscriptions,
        }
    }
}
