//! Core domain types for beacon
//!
//! An [`Event`] is what producers hand to the queue. Once appended it lives in
//! the store as a [`QueueEntry`]; the flush engine reads entries back in
//! [`Batch`]es and acknowledges them by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collector::SkipReason;

// ============================================
// Events
// ============================================

/// A structured event supplied by a producer.
///
/// The payload is opaque to the pipeline. `event_id` and `emitted_at` are
/// assigned at construction so the collector can recognise a batch that was
/// re-sent after a crash between upload and acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event kind (e.g. "track", "track_signup", "profile_set")
    #[serde(rename = "type")]
    pub kind: String,

    /// Random identifier for collector-side de-duplication
    pub event_id: Uuid,

    /// When the producer created the event
    pub emitted_at: DateTime<Utc>,

    /// Producer payload
    pub data: serde_json::Value,
}

impl Event {
    /// Create a new event with a fresh id and the current timestamp
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            event_id: Uuid::new_v4(),
            emitted_at: Utc::now(),
            data,
        }
    }

    /// Serialize the event into the record stored in the queue
    pub fn to_record(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ============================================
// Queue entries and batches
// ============================================

/// A durable queue record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Monotonically increasing id; defines delivery order
    pub id: i64,
    /// Serialized event record
    pub payload: String,
}

/// A non-empty, contiguous prefix of the queue.
///
/// A batch is acknowledged as a whole by deleting every entry with
/// `id <= last_id`, which makes acknowledgment idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    last_id: i64,
    entries: Vec<QueueEntry>,
}

impl Batch {
    /// Build a batch from entries in id order. Returns `None` for an empty read.
    pub fn from_entries(entries: Vec<QueueEntry>) -> Option<Self> {
        let last_id = entries.last()?.id;
        Some(Self { last_id, entries })
    }

    /// Id of the final member
    pub fn last_id(&self) -> i64 {
        self.last_id
    }

    /// Entries in delivery order
    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The event was stored; `backlog` is the queue length afterwards
    Stored { backlog: usize },
    /// The store was at capacity. The oldest `evicted` entries were dropped
    /// to make room before the event was stored.
    Overflow { backlog: usize, evicted: usize },
}

impl AppendOutcome {
    /// Queue length after the append
    pub fn backlog(&self) -> usize {
        match self {
            AppendOutcome::Stored { backlog } | AppendOutcome::Overflow { backlog, .. } => *backlog,
        }
    }

    pub fn is_overflow(&self) -> bool {
        matches!(self, AppendOutcome::Overflow { .. })
    }
}

// ============================================
// Delivery statistics
// ============================================

/// Cumulative delivery statistics for one queue
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Flush invocations that passed their preconditions
    pub flushes: usize,
    /// Upload attempts
    pub uploads: usize,
    /// Events acknowledged by the collector
    pub events_delivered: usize,
    /// Events dropped after a destructive failure
    pub events_discarded: usize,
    /// Failed batches (destructive or not)
    pub failures: usize,
    /// Why the most recent flush was skipped, `None` if it ran
    pub last_skip: Option<SkipReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64) -> QueueEntry {
        QueueEntry {
            id,
            payload: "{}".to_string(),
        }
    }

    #[test]
    fn test_event_record_shape() {
        let event = Event::new("track", serde_json::json!({"page": "home"}));
        let record: serde_json::Value =
            serde_json::from_str(&event.to_record().unwrap()).unwrap();

        assert_eq!(record["type"], "track");
        assert_eq!(record["data"]["page"], "home");
        assert_eq!(record["event_id"], event.event_id.to_string());
        assert!(record["emitted_at"].is_string());
    }

    #[test]
    fn test_events_get_distinct_ids() {
        let a = Event::new("track", serde_json::json!({}));
        let b = Event::new("track", serde_json::json!({}));
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_batch_last_id() {
        let batch = Batch::from_entries(vec![entry(3), entry(4), entry(7)]).unwrap();
        assert_eq!(batch.last_id(), 7);
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_empty_batch_is_none() {
        assert!(Batch::from_entries(Vec::new()).is_none());
    }

    #[test]
    fn test_append_outcome_backlog() {
        assert_eq!(AppendOutcome::Stored { backlog: 4 }.backlog(), 4);
        let overflow = AppendOutcome::Overflow {
            backlog: 9,
            evicted: 100,
        };
        assert_eq!(overflow.backlog(), 9);
        assert!(overflow.is_overflow());
    }
}
