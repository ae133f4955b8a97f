//! Event queue facade
//!
//! [`EventQueue`] is what producers talk to. Each enqueue is persisted
//! synchronously, then the queue decides whether the event warrants an
//! immediate flush or can wait for the debounce window. All network work
//! happens on the queue's dispatcher thread.
//!
//! ```rust,no_run
//! use beacon_core::{Config, EventQueue};
//! use serde_json::json;
//!
//! let config = Config::load().expect("failed to load config");
//! let queue = EventQueue::open(&config.queue, &Config::database_path())
//!     .expect("failed to open queue");
//! queue.track("track", json!({"event": "app_start"})).ok();
//! queue.shutdown();
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::collector::{
    CollectorClient, ConfigHandler, FlushEngine, FlushSettings, NoticeSink, Transport,
};
use crate::config::QueueConfig;
use crate::db::{Database, EventStore};
use crate::dispatch::{Dispatcher, Task, TaskHandler};
use crate::environment::{Environment, HostEnvironment, StaticEnvironment};
use crate::error::{Error, Result};
use crate::types::{AppendOutcome, DeliveryStats, Event};

/// How soon an enqueue should be followed by a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushUrgency {
    Immediate,
    Debounced,
}

/// Decides flush urgency per enqueue
#[derive(Debug, Clone)]
pub struct UrgencyPolicy {
    pub verification_mode: bool,
    pub flush_bulk_size: usize,
    pub immediate_kinds: Vec<String>,
}

impl From<&QueueConfig> for UrgencyPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            verification_mode: config.verification_mode,
            flush_bulk_size: config.flush_bulk_size,
            immediate_kinds: config.immediate_kinds.clone(),
        }
    }
}

impl UrgencyPolicy {
    pub fn classify(&self, kind: &str, outcome: &AppendOutcome) -> FlushUrgency {
        let immediate = self.verification_mode
            || outcome.is_overflow()
            || self.immediate_kinds.iter().any(|k| k == kind)
            || outcome.backlog() > self.flush_bulk_size;

        if immediate {
            FlushUrgency::Immediate
        } else {
            FlushUrgency::Debounced
        }
    }
}

/// Runs dispatched tasks against the flush engine
struct QueueWorker {
    engine: FlushEngine,
}

impl TaskHandler for QueueWorker {
    fn handle(&mut self, task: Task) {
        match task {
            Task::Flush => {
                let report = self.engine.drain();
                if report.skipped.is_none() {
                    tracing::debug!(
                        uploads = report.uploads,
                        delivered = report.delivered,
                        discarded = report.discarded,
                        retained = report.retained,
                        "Flush finished"
                    );
                }
            }
            Task::CheckConfig(handler) => self.engine.refresh_config(handler.as_ref()),
        }
    }
}

/// Builder for [`EventQueue`]
///
/// Only the store is required. The transport defaults to a
/// [`CollectorClient`] built from the config and the environment to a
/// [`StaticEnvironment`] (primary, wired).
pub struct EventQueueBuilder {
    config: QueueConfig,
    store: Arc<dyn EventStore>,
    transport: Option<Box<dyn Transport>>,
    environment: Option<Arc<dyn Environment>>,
    notices: Option<Arc<dyn NoticeSink>>,
    name: String,
}

impl EventQueueBuilder {
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    pub fn environment(mut self, environment: Arc<dyn Environment>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn notices(mut self, sink: Arc<dyn NoticeSink>) -> Self {
        self.notices = Some(sink);
        self
    }

    /// Worker thread name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn build(self) -> Result<EventQueue> {
        self.config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Box::new(CollectorClient::new(&self.config)?),
        };
        let environment = self
            .environment
            .unwrap_or_else(|| Arc::new(StaticEnvironment::default()));

        let mut engine = FlushEngine::new(
            Arc::clone(&self.store),
            transport,
            environment,
            FlushSettings::from(&self.config),
        );
        if let Some(sink) = &self.notices {
            engine = engine.with_notices(Arc::clone(sink));
        }
        let stats = engine.stats_handle();

        let dispatcher = Dispatcher::spawn(self.name, QueueWorker { engine })?;

        Ok(EventQueue {
            store: self.store,
            dispatcher,
            stats,
            notices: self.notices,
            policy: UrgencyPolicy::from(&self.config),
            flush_interval: self.config.flush_interval(),
        })
    }
}

/// Durable, debounced event queue
pub struct EventQueue {
    store: Arc<dyn EventStore>,
    dispatcher: Dispatcher,
    stats: Arc<Mutex<DeliveryStats>>,
    notices: Option<Arc<dyn NoticeSink>>,
    policy: UrgencyPolicy,
    flush_interval: Duration,
}

impl EventQueue {
    pub fn builder(config: &QueueConfig, store: Arc<dyn EventStore>) -> EventQueueBuilder {
        EventQueueBuilder {
            config: config.clone(),
            store,
            transport: None,
            environment: None,
            notices: None,
            name: "beacon-flush".to_string(),
        }
    }

    /// Open a queue backed by the SQLite database at `db_path`, uploading
    /// over HTTP. Primary-process status comes from a lock next to the database.
    pub fn open(config: &QueueConfig, db_path: &Path) -> Result<Self> {
        let db = Database::open(db_path)?.with_capacity(config.max_entries);
        db.migrate()?;
        let environment = HostEnvironment::detect(db_path)?;

        tracing::info!(
            path = %db_path.display(),
            primary = environment.is_primary_process(),
            "Opened event queue"
        );

        Self::builder(config, Arc::new(db))
            .environment(Arc::new(environment))
            .build()
    }

    /// Persist `event` and schedule a flush.
    ///
    /// A store failure is logged and swallowed, except in verification mode
    /// where it is returned as [`Error::Verification`].
    pub fn enqueue(&self, event: Event) -> Result<()> {
        let outcome = match self.store.append(&event) {
            Ok(outcome) => outcome,
            Err(e) => {
                if self.policy.verification_mode {
                    tracing::error!(kind = %event.kind, error = %e, "Failed to store event");
                    let message = format!("failed to store {} event: {}", event.kind, e);
                    if let Some(sink) = &self.notices {
                        sink.notice(&message);
                    }
                    return Err(Error::Verification(message));
                }
                tracing::warn!(kind = %event.kind, error = %e, "Failed to store event");
                self.dispatcher.post_once(Task::Flush, self.flush_interval);
                return Ok(());
            }
        };

        match self.policy.classify(&event.kind, &outcome) {
            FlushUrgency::Immediate => {
                self.dispatcher.post(Task::Flush);
            }
            FlushUrgency::Debounced => {
                self.dispatcher.post_once(Task::Flush, self.flush_interval);
            }
        }
        Ok(())
    }

    /// Convenience for `enqueue(Event::new(kind, data))`
    pub fn track(&self, kind: impl Into<String>, data: serde_json::Value) -> Result<()> {
        self.enqueue(Event::new(kind, data))
    }

    /// Request an immediate flush
    pub fn flush(&self) {
        self.dispatcher.post(Task::Flush);
    }

    /// Fetch remote configuration on the worker and hand it to `handler`
    pub fn check_config(&self, handler: Arc<dyn ConfigHandler>) {
        self.dispatcher.post(Task::CheckConfig(handler));
    }

    /// Number of events waiting in the store
    pub fn backlog(&self) -> Result<usize> {
        self.store.backlog()
    }

    /// Snapshot of the delivery statistics
    pub fn stats(&self) -> DeliveryStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the worker still accepts tasks
    pub fn is_running(&self) -> bool {
        self.dispatcher.is_alive()
    }

    /// Finish queued immediate work and stop the worker
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

/// Explicitly owned set of queues keyed by client id
#[derive(Default)]
pub struct QueueRegistry {
    queues: Mutex<HashMap<String, Arc<EventQueue>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the queue for `client_id`, opening it with `open` on first use
    pub fn get_or_open<F>(&self, client_id: &str, open: F) -> Result<Arc<EventQueue>>
    where
        F: FnOnce() -> Result<EventQueue>,
    {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(queue) = queues.get(client_id) {
            return Ok(Arc::clone(queue));
        }

        let queue = Arc::new(open()?);
        queues.insert(client_id.to_string(), Arc::clone(&queue));
        tracing::debug!(client_id, "Registered event queue");
        Ok(queue)
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<EventQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .cloned()
    }

    /// Remove and shut down the queue for `client_id`
    pub fn remove(&self, client_id: &str) -> bool {
        let removed = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(client_id);
        match removed {
            Some(queue) => {
                queue.shutdown();
                true
            }
            None => false,
        }
    }

    /// Shut down and forget every queue
    pub fn shutdown_all(&self) {
        let drained: Vec<_> = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (client_id, queue) in drained {
            tracing::debug!(client_id = %client_id, "Shutting down event queue");
            queue.shutdown();
        }
    }

    pub fn len(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
