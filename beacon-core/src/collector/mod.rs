//! Collector delivery
//!
//! Everything between the local event store and the remote collector:
//!
//! - [`codec`] turns a batch into the `data_list`/`crc` wire payload
//! - [`client`] speaks HTTP to the upload and config endpoints
//! - [`flush`] drains the store through a [`Transport`]
//! - [`remote`] parses remote configuration for a [`ConfigHandler`]
//!
//! ## Configuration
//!
//! Point the queue at a collector in `~/.config/beacon/config.toml`:
//!
//! ```toml
//! [queue]
//! server_url = "https://collector.example.com/sa?project=default"
//! config_url = "https://collector.example.com/config"
//! batch_size = 50
//! ```
//!
//! Without `server_url` events are still stored locally; flushes are
//! skipped until a server is configured.

pub mod client;
pub mod codec;
pub mod flush;
pub mod remote;

pub use client::{CollectorClient, Transport, UploadReceipt};
pub use codec::{CodecError, WirePayload};
pub use flush::{FlushEngine, FlushReport, FlushSettings, NoticeSink, SkipReason};
pub use remote::{ConfigHandler, RemoteConfig};
