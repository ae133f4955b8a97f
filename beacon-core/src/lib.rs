//! # beacon-core
//!
//! Core library for beacon - a durable, debounced event-delivery pipeline.
//!
//! This library provides:
//! - A SQLite-backed event queue that survives restarts
//! - Batch encoding (JSON, gzip, base64, checksum) and HTTP upload
//! - A single-worker dispatcher with debounced, coalesced flushes
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Producers never touch the network:
//! - **Enqueue:** the event is appended to the store on the caller's thread
//! - **Schedule:** the queue posts an immediate or debounced Flush task
//! - **Drain:** the worker uploads the oldest batches and truncates the store
//!   on acknowledgment (or on a failure that would never succeed)
//!
//! ## Example
//!
//! ```rust,no_run
//! use beacon_core::{Config, EventQueue};
//! use serde_json::json;
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open the queue next to the default database path
//! let queue = EventQueue::open(&config.queue, &Config::database_path())
//!     .expect("failed to open queue");
//!
//! queue.track("track_signup", json!({"plan": "free"})).ok();
//! queue.shutdown();
//! ```

// Re-export commonly used items at the crate root
pub use collector::{ConfigHandler, FlushReport, NoticeSink, RemoteConfig, Transport};
pub use config::{Config, QueueConfig};
pub use db::{Database, EventStore};
pub use environment::{Environment, HostEnvironment, NetworkType, SendPolicy, StaticEnvironment};
pub use error::{DeliveryError, Error, Result};
pub use queue::{EventQueue, QueueRegistry};
pub use types::*;

// Public modules
pub mod collector;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod environment;
pub mod error;
pub mod logging;
pub mod queue;
pub mod types;
