//! Flush engine: drains the queue through the codec and transport
//!
//! A flush checks its preconditions once, then repeatedly reads the oldest
//! batch, uploads it and decides what happens to it:
//!
//! | outcome                    | batch     | loop      |
//! |----------------------------|-----------|-----------|
//! | accepted                   | deleted   | continues |
//! | invalid data / rejected    | deleted   | continues |
//! | connection / unavailable   | kept      | stops     |
//! | anything else              | kept      | stops     |
//!
//! Deleting rejected data keeps one poisoned batch from stalling the queue;
//! keeping data on transient failures means a flaky network never loses events.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::config::QueueConfig;
use crate::db::EventStore;
use crate::environment::{Environment, NetworkType, SendPolicy};
use crate::error::DeliveryError;
use crate::types::DeliveryStats;

use super::client::Transport;
use super::codec;
use super::remote::ConfigHandler;

/// Receives human-facing failure notices in verification mode
pub trait NoticeSink: Send + Sync {
    fn notice(&self, message: &str);
}

/// Flush parameters derived from [`QueueConfig`]
#[derive(Debug, Clone)]
pub struct FlushSettings {
    pub server_configured: bool,
    pub batch_size: usize,
    pub max_iterations: usize,
    pub send_policy: SendPolicy,
    pub verification_mode: bool,
}

impl From<&QueueConfig> for FlushSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            server_configured: config.is_ready(),
            batch_size: config.effective_batch_size(),
            max_iterations: config.max_flush_iterations,
            send_policy: config.send_policy.clone(),
            verification_mode: config.verification_mode,
        }
    }
}

/// Why a flush did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoServer,
    NotPrimary,
    Offline,
    PolicyBlocked(NetworkType),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoServer => f.write_str("no server_url is configured"),
            SkipReason::NotPrimary => f.write_str("another process is the primary uploader"),
            SkipReason::Offline => f.write_str("the host is offline"),
            SkipReason::PolicyBlocked(network) => {
                write!(f, "the send policy does not allow {network} networks")
            }
        }
    }
}

/// What a single flush did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub skipped: Option<SkipReason>,
    pub uploads: usize,
    pub delivered: usize,
    pub discarded: usize,
    /// Events left in place after a transient failure
    pub retained: usize,
    pub failures: usize,
    pub last_error: Option<DeliveryError>,
}

impl FlushReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }
}

/// Drains an [`EventStore`] through a [`Transport`]
pub struct FlushEngine {
    store: Arc<dyn EventStore>,
    transport: Box<dyn Transport>,
    environment: Arc<dyn Environment>,
    settings: FlushSettings,
    notices: Option<Arc<dyn NoticeSink>>,
    stats: Arc<Mutex<DeliveryStats>>,
}

impl FlushEngine {
    pub fn new(
        store: Arc<dyn EventStore>,
        transport: Box<dyn Transport>,
        environment: Arc<dyn Environment>,
        settings: FlushSettings,
    ) -> Self {
        Self {
            store,
            transport,
            environment,
            settings,
            notices: None,
            stats: Arc::new(Mutex::new(DeliveryStats::default())),
        }
    }

    /// Send failure notices to `sink` while in verification mode
    pub fn with_notices(mut self, sink: Arc<dyn NoticeSink>) -> Self {
        self.notices = Some(sink);
        self
    }

    /// Shared handle to the cumulative statistics
    pub fn stats_handle(&self) -> Arc<Mutex<DeliveryStats>> {
        Arc::clone(&self.stats)
    }

    fn precondition(&self) -> Option<SkipReason> {
        if !self.settings.server_configured {
            return Some(SkipReason::NoServer);
        }
        if !self.environment.is_primary_process() {
            return Some(SkipReason::NotPrimary);
        }
        let Some(network) = self.environment.network_type() else {
            return Some(SkipReason::Offline);
        };
        if !self.settings.send_policy.allows(network) {
            return Some(SkipReason::PolicyBlocked(network));
        }
        None
    }

    /// Run one flush: drain the queue until it is empty, a transient failure
    /// stops the loop, or the iteration ceiling is reached.
    pub fn drain(&self) -> FlushReport {
        if let Some(reason) = self.precondition() {
            tracing::debug!(%reason, "Skipping flush");
            if let Ok(mut stats) = self.stats.lock() {
                stats.last_skip = Some(reason);
            }
            return FlushReport::skipped(reason);
        }

        let mut report = FlushReport::default();
        let mut remaining = self.settings.max_iterations;
        let mut iterations = 0;

        while remaining > 0 && iterations < self.settings.max_iterations {
            iterations += 1;

            let batch = match self.store.read_batch(self.settings.batch_size) {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read batch from event store");
                    break;
                }
            };

            let outcome = codec::encode(&batch)
                .map_err(DeliveryError::from)
                .and_then(|payload| {
                    report.uploads += 1;
                    self.transport.upload(&payload)
                });

            let delete = match outcome {
                Ok(receipt) => {
                    report.delivered += batch.len();
                    tracing::debug!(
                        entries = batch.len(),
                        last_id = batch.last_id(),
                        status = receipt.status,
                        "Batch delivered"
                    );
                    true
                }
                Err(error) => {
                    let destructive = error.is_destructive();
                    report.failures += 1;
                    if destructive {
                        report.discarded += batch.len();
                        tracing::warn!(
                            error = %error,
                            entries = batch.len(),
                            last_id = batch.last_id(),
                            "Discarding batch"
                        );
                    } else {
                        report.retained += batch.len();
                        if matches!(error, DeliveryError::Unclassified(_)) {
                            tracing::error!(error = ?error, last_id = batch.last_id(), "Unexpected flush failure");
                        } else {
                            tracing::warn!(
                                error = %error,
                                entries = batch.len(),
                                "Keeping batch for the next flush"
                            );
                        }
                    }
                    self.notify(&error);
                    report.last_error = Some(error);
                    destructive
                }
            };

            if delete {
                match self.store.delete_prefix(batch.last_id()) {
                    Ok(left) => {
                        tracing::info!(left, "Events flushed");
                        remaining = left;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, last_id = batch.last_id(), "Failed to delete flushed batch");
                        remaining = 0;
                    }
                }
            } else {
                remaining = 0;
            }
        }

        self.record(&report);
        report
    }

    /// Fetch remote configuration and hand it to `handler`.
    ///
    /// Failures are logged and absorbed.
    pub fn refresh_config(&self, handler: &dyn ConfigHandler) {
        match self.transport.fetch_config() {
            Ok(config) => {
                tracing::debug!(
                    bindings = config.event_bindings.as_ref().map(Vec::len),
                    "Fetched remote configuration"
                );
                config.deliver(handler);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch remote configuration");
            }
        }
    }

    fn notify(&self, error: &DeliveryError) {
        if !self.settings.verification_mode {
            return;
        }
        if let Some(sink) = &self.notices {
            sink.notice(&error.to_string());
        }
    }

    fn record(&self, report: &FlushReport) {
        let Ok(mut stats) = self.stats.lock() else {
            return;
        };
        stats.last_skip = None;
        stats.flushes += 1;
        stats.uploads += report.uploads;
        stats.events_delivered += report.delivered;
        stats.events_discarded += report.discarded;
        stats.failures += report.failures;
    }
}
