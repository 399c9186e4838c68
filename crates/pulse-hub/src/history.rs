//! Recent-event history.
//!
//! The router resolves `get_history` through [`HistoryProvider`], an
//! externally-supplied (and potentially blocking) contract whose failures
//! must be contained. [`MemoryHistory`] is the in-process implementation:
//! a bounded per-type ring fed by the scheduler as tasks are delivered.
//! Nothing survives a restart.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use pulse_core::{MessageType, ServerEvent};

/// One delivered broadcast, as remembered for history queries.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub event: ServerEvent,
    pub data: Value,
    pub timestamp: i64,
}

/// A bounded view over the history of one message type.
#[derive(Clone, Debug)]
pub struct HistorySlice {
    /// The most recent entries, oldest first.
    pub items: Vec<HistoryEntry>,
    /// Total entries currently retained for the type.
    pub total: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history backend unavailable: {0}")]
    Unavailable(String),
}

/// Resolves recent events for a message type.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    async fn recent(&self, kind: MessageType, limit: usize) -> Result<HistorySlice, HistoryError>;
}

/// In-memory history: one drop-oldest ring per message type.
pub struct MemoryHistory {
    rings: Mutex<HashMap<MessageType, VecDeque<HistoryEntry>>>,
    capacity: usize,
}

impl MemoryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Remember one delivered broadcast.
    pub fn record(&self, kind: MessageType, event: ServerEvent, data: Value, timestamp: i64) {
        let mut rings = self.rings.lock();
        let ring = rings.entry(kind).or_default();
        if ring.len() >= self.capacity {
            let _ = ring.pop_front();
        }
        ring.push_back(HistoryEntry {
            event,
            data,
            timestamp,
        });
    }

    /// Entries retained for a type.
    pub fn len(&self, kind: MessageType) -> usize {
        self.rings.lock().get(&kind).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, kind: MessageType) -> bool {
        self.len(kind) == 0
    }
}

#[async_trait]
impl HistoryProvider for MemoryHistory {
    async fn recent(&self, kind: MessageType, limit: usize) -> Result<HistorySlice, HistoryError> {
        let rings = self.rings.lock();
        let Some(ring) = rings.get(&kind) else {
            return Ok(HistorySlice {
                items: Vec::new(),
                total: 0,
            });
        };
        let total = ring.len();
        let skip = total.saturating_sub(limit);
        Ok(HistorySlice {
            items: ring.iter().skip(skip).cloned().collect(),
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn empty_history_yields_empty_slice() {
        let history = MemoryHistory::new(10);
        let slice = history.recent(MessageType::Status, 5).await.unwrap();
        assert!(slice.items.is_empty());
        assert_eq!(slice.total, 0);
    }

    #[tokio::test]
    async fn recent_returns_newest_entries_oldest_first() {
        let history = MemoryHistory::new(10);
        for i in 0..5 {
            history.record(
                MessageType::Status,
                ServerEvent::StatusUpdate,
                json!({ "seq": i }),
                i,
            );
        }
        let slice = history.recent(MessageType::Status, 3).await.unwrap();
        assert_eq!(slice.total, 5);
        assert_eq!(slice.items.len(), 3);
        assert_eq!(slice.items[0].data["seq"], 2);
        assert_eq!(slice.items[2].data["seq"], 4);
    }

    #[tokio::test]
    async fn ring_drops_oldest_at_capacity() {
        let history = MemoryHistory::new(3);
        for i in 0..5 {
            history.record(
                MessageType::Stats,
                ServerEvent::StatsUpdate,
                json!({ "seq": i }),
                i,
            );
        }
        assert_eq!(history.len(MessageType::Stats), 3);
        let slice = history.recent(MessageType::Stats, 10).await.unwrap();
        assert_eq!(slice.items[0].data["seq"], 2);
        assert_eq!(slice.items[2].data["seq"], 4);
    }

    #[tokio::test]
    async fn rings_are_per_type() {
        let history = MemoryHistory::new(10);
        history.record(MessageType::Status, ServerEvent::StatusUpdate, json!({}), 1);
        assert_eq!(history.len(MessageType::Status), 1);
        assert!(history.is_empty(MessageType::Stats));
    }
}
