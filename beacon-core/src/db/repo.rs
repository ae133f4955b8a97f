//! SQLite-backed event queue

use crate::error::{Error, Result};
use crate::types::{AppendOutcome, Batch, Event, QueueEntry};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::EventStore;

/// Default maximum number of queued entries
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Upper bound on how many entries one overflow evicts
const EVICTION_CHUNK: usize = 100;

/// Database handle for the event queue (single connection)
pub struct Database {
    conn: Mutex<Connection>,
    max_entries: usize,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            max_entries: DEFAULT_MAX_ENTRIES,
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_entries: DEFAULT_MAX_ENTRIES,
        })
    }

    /// Cap the queue at `max_entries`; appends beyond it evict the oldest entries
    pub fn with_capacity(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection()?;
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("connection mutex poisoned".to_string()))
    }

    fn eviction_chunk(&self) -> usize {
        (self.max_entries / 10).clamp(1, EVICTION_CHUNK)
    }
}

fn count_events(conn: &Connection) -> rusqlite::Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
    Ok(count as usize)
}

impl EventStore for Database {
    fn append(&self, event: &Event) -> Result<AppendOutcome> {
        let payload = event.to_record()?;

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let mut evicted = 0;
        let backlog = count_events(&tx)?;
        if backlog >= self.max_entries {
            evicted = tx.execute(
                "DELETE FROM events WHERE id IN (SELECT id FROM events ORDER BY id ASC LIMIT ?1)",
                params![self.eviction_chunk() as i64],
            )?;
            tracing::warn!(
                backlog,
                evicted,
                max_entries = self.max_entries,
                "Event queue at capacity, evicted oldest entries"
            );
        }

        tx.execute(
            "INSERT INTO events (kind, payload, created_at) VALUES (?1, ?2, ?3)",
            params![event.kind, payload, Utc::now().to_rfc3339()],
        )?;
        let backlog = count_events(&tx)?;
        tx.commit()?;

        if evicted > 0 {
            Ok(AppendOutcome::Overflow { backlog, evicted })
        } else {
            Ok(AppendOutcome::Stored { backlog })
        }
    }

    fn read_batch(&self, max_count: usize) -> Result<Option<Batch>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT id, payload FROM events ORDER BY id ASC LIMIT ?1")?;
        let entries = stmt
            .query_map(params![max_count as i64], |row| {
                Ok(QueueEntry {
                    id: row.get(0)?,
                    payload: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Batch::from_entries(entries))
    }

    fn delete_prefix(&self, last_id: i64) -> Result<usize> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM events WHERE id <= ?1", params![last_id])?;
        Ok(count_events(&conn)?)
    }

    fn backlog(&self) -> Result<usize> {
        let conn = self.connection()?;
        Ok(count_events(&conn)?)
    }
}
