//! Error types for beacon-core

use thiserror::Error;

/// Main error type for the beacon-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The event store refused an operation
    #[error("store error: {0}")]
    Store(String),

    /// Collector client setup error
    #[error("collector error: {0}")]
    Collector(String),

    /// A failure that verification mode escalates instead of logging
    #[error("verification failure: {0}")]
    Verification(String),

    /// Logging setup error
    #[error("logging error: {0}")]
    Logging(String),
}

/// Result type alias for beacon-core
pub type Result<T> = std::result::Result<T, Error>;

/// Why a batch could not be delivered.
///
/// The drain loop decides per variant whether the batch is discarded
/// (destructive) or kept for the next flush (transient).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The batch could not be encoded. Destructive.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Network or IO failure while talking to the collector. Transient.
    #[error("connection error: {0}")]
    Connection(String),

    /// The collector answered with a non-success status. Destructive.
    #[error("response error ({status}): {body}")]
    Response { status: u16, body: String },

    /// The collector reported a temporary condition (5xx, 408, 429). Transient.
    #[error("collector unavailable ({status}): {body}")]
    Unavailable { status: u16, body: String },

    /// Anything else. Transient.
    #[error("unexpected failure: {0}")]
    Unclassified(String),
}

impl DeliveryError {
    /// Whether the batch that produced this error should be deleted anyway.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            DeliveryError::InvalidData(_) | DeliveryError::Response { .. }
        )
    }
}
