//! HTTP client for the collector endpoints
//!
//! Uploads are a single form-encoded POST per batch; remote configuration is a
//! single GET. Both run to completion on the calling thread: the client owns a
//! current-thread tokio runtime and blocks on each exchange, which throttles
//! the flush worker to one request at a time.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::StatusCode;

use crate::config::QueueConfig;
use crate::error::{DeliveryError, Error, Result};

use super::codec::WirePayload;
use super::remote::RemoteConfig;

/// Collector answer to an accepted upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub status: u16,
    pub body: String,
}

/// The network side of the pipeline.
///
/// Implementations block until the exchange completes. They are owned by the
/// flush worker, so they need to be `Send` but never shared.
pub trait Transport: Send {
    /// Upload one encoded batch
    fn upload(&self, payload: &WirePayload) -> std::result::Result<UploadReceipt, DeliveryError>;

    /// Fetch remote configuration
    fn fetch_config(&self) -> std::result::Result<RemoteConfig, DeliveryError>;
}

/// HTTP transport for the collector API
pub struct CollectorClient {
    http_client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
    server_url: Option<String>,
    config_url: Option<String>,
    dry_run: bool,
    retry_server_errors: bool,
}

impl CollectorClient {
    /// Create a new collector client from configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: &QueueConfig) -> Result<Self> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent())
                .map_err(|e| Error::Config(format!("invalid user_agent: {}", e)))?,
        );

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Collector(format!("failed to create HTTP client: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Collector(format!("failed to create runtime: {}", e)))?;

        Ok(Self {
            http_client,
            runtime,
            server_url: non_blank(&config.server_url),
            config_url: non_blank(&config.config_url),
            dry_run: config.dry_run(),
            retry_server_errors: config.retry_server_errors,
        })
    }

    async fn send_batch(
        &self,
        payload: &WirePayload,
    ) -> std::result::Result<UploadReceipt, DeliveryError> {
        let url = self
            .server_url
            .as_deref()
            .ok_or_else(|| DeliveryError::Unclassified("server_url is not configured".into()))?;

        let mut form = vec![
            ("data_list", payload.data().to_string()),
            ("gzip", "1".to_string()),
        ];
        if let Some(crc) = payload.checksum() {
            form.push(("crc", crc.to_string()));
        }

        let mut request = self.http_client.post(url).form(&form);
        if self.dry_run {
            request = request.header("Dry-Run", "true");
        }

        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DeliveryError::Connection(format!("failed to read response: {}", e)))?;

        if status.is_success() {
            tracing::debug!(status = status.as_u16(), body = %body, "Collector accepted batch");
        } else {
            tracing::warn!(status = status.as_u16(), body = %body, "Collector rejected batch");
        }

        classify_status(status, body, self.retry_server_errors)
    }

    /// Every failure here is a `Connection` error; the caller absorbs them all.
    async fn get_config(&self) -> std::result::Result<RemoteConfig, DeliveryError> {
        let url = self
            .config_url
            .as_deref()
            .ok_or_else(|| DeliveryError::Connection("config_url is not configured".into()))?;

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| DeliveryError::Connection(format!("config request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DeliveryError::Connection(format!("failed to read response: {}", e)))?;

        if status != StatusCode::OK {
            return Err(DeliveryError::Connection(format!(
                "config endpoint returned {}",
                status
            )));
        }

        Ok(RemoteConfig::parse(&body))
    }
}

impl Transport for CollectorClient {
    fn upload(&self, payload: &WirePayload) -> std::result::Result<UploadReceipt, DeliveryError> {
        self.runtime.block_on(self.send_batch(payload))
    }

    fn fetch_config(&self) -> std::result::Result<RemoteConfig, DeliveryError> {
        self.runtime.block_on(self.get_config())
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Map a failed send to the taxonomy
fn request_error(error: reqwest::Error) -> DeliveryError {
    if error.is_builder() {
        DeliveryError::Unclassified(format!("invalid request: {}", error))
    } else {
        DeliveryError::Connection(format!("HTTP request failed: {}", error))
    }
}

/// Map a collector status to the taxonomy.
///
/// 5xx, 408 and 429 describe the collector's condition rather than the batch,
/// so with `retry_server_errors` they keep the batch for the next flush.
fn classify_status(
    status: StatusCode,
    body: String,
    retry_server_errors: bool,
) -> std::result::Result<UploadReceipt, DeliveryError> {
    let code = status.as_u16();
    if status.is_success() {
        return Ok(UploadReceipt { status: code, body });
    }

    let temporary = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;

    if retry_server_errors && temporary {
        Err(DeliveryError::Unavailable { status: code, body })
    } else {
        Err(DeliveryError::Response { status: code, body })
    }
}
