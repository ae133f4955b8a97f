//! Storage layer for beacon
//!
//! The queue is an append-only table keyed by a monotonically increasing id.
//! Producers append from any thread; the flush worker reads prefixes and
//! truncates them once a batch is acknowledged. [`EventStore`] is the seam the
//! rest of the pipeline depends on; [`Database`] is the SQLite implementation.

pub mod repo;
pub mod schema;

pub use repo::Database;

use crate::error::Result;
use crate::types::{AppendOutcome, Batch, Event};

/// Durable event queue.
///
/// Implementations must make every operation mutually exclusive with every
/// other, so a truncation can never remove entries a concurrent read has not
/// captured yet.
pub trait EventStore: Send + Sync {
    /// Append an event to the tail of the queue
    fn append(&self, event: &Event) -> Result<AppendOutcome>;

    /// Read the oldest `max_count` entries. `None` when the queue is empty.
    fn read_batch(&self, max_count: usize) -> Result<Option<Batch>>;

    /// Delete every entry with `id <= last_id` and return the remaining backlog
    fn delete_prefix(&self, last_id: i64) -> Result<usize>;

    /// Number of entries currently queued
    fn backlog(&self) -> Result<usize>;
}
