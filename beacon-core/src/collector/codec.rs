//! Wire encoding for batches
//!
//! A batch travels as a JSON array of event records, gzip-compressed and
//! base64-encoded so it fits in a form field:
//!
//! ```text
//! [record, record, ...] --json--> bytes --gzip--> bytes --base64--> data_list
//! ```
//!
//! The collector checks completeness with a 32-bit string hash of the encoded
//! text, sent alongside as `crc`.

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::error::DeliveryError;
use crate::types::Batch;

/// Reasons a batch cannot be turned into a wire payload
#[derive(Error, Debug)]
pub enum CodecError {
    /// A stored record is not valid JSON
    #[error("entry {id} is not a valid record: {source}")]
    InvalidEntry {
        id: i64,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("gzip stream failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl From<CodecError> for DeliveryError {
    fn from(err: CodecError) -> Self {
        DeliveryError::InvalidData(err.to_string())
    }
}

/// Encoded batch, ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePayload {
    data: String,
}

impl WirePayload {
    /// Base64 text sent as `data_list`
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Integrity checksum sent as `crc`, absent for an empty payload
    pub fn checksum(&self) -> Option<i32> {
        if self.data.is_empty() {
            None
        } else {
            Some(string_hash(&self.data))
        }
    }
}

/// Encode a batch into its wire payload.
///
/// Deterministic and side-effect free. Any failure means the batch itself is
/// unusable, never a partial payload.
pub fn encode(batch: &Batch) -> Result<WirePayload, CodecError> {
    let records = batch
        .entries()
        .iter()
        .map(|entry| {
            serde_json::from_str::<serde_json::Value>(&entry.payload)
                .map_err(|source| CodecError::InvalidEntry { id: entry.id, source })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let document = serde_json::to_vec(&records)?;

    let mut encoder = GzEncoder::new(Vec::with_capacity(document.len()), Compression::default());
    encoder.write_all(&document)?;
    let compressed = encoder.finish()?;

    Ok(WirePayload {
        data: STANDARD.encode(compressed),
    })
}

/// Decode a `data_list` value back into the records it carries
pub fn decode(data: &str) -> Result<Vec<serde_json::Value>, CodecError> {
    let compressed = STANDARD.decode(data)?;
    let mut document = Vec::new();
    GzDecoder::new(compressed.as_slice()).read_to_end(&mut document)?;
    Ok(serde_json::from_slice(&document)?)
}

/// 32-bit polynomial string hash: `h = 31 * h + unit` over UTF-16 code units,
/// wrapping on overflow. Matches the checksum the collector recomputes.
pub fn string_hash(text: &str) -> i32 {
    text.encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32))
}
