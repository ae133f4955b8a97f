//! Remote configuration
//!
//! The config endpoint returns a JSON object such as:
//!
//! ```json
//! {
//!   "event_bindings": { "events": [ ... ] },
//!   "vtrack_server_url": "wss://bindings.example.com/ws"
//! }
//! ```
//!
//! Applying the configuration belongs to the host application; the pipeline
//! only parses it and hands it to a [`ConfigHandler`].

use serde_json::Value;

/// Parsed remote configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteConfig {
    /// Event binding rules, when the response carried a well-typed array
    pub event_bindings: Option<Vec<Value>>,
    /// Remote server URL, empty when absent
    pub remote_server_url: String,
}

/// Receives fetched configuration on the flush worker thread
pub trait ConfigHandler: Send + Sync {
    /// Called only when bindings are present and well-typed
    fn set_event_bindings(&self, bindings: Vec<Value>);

    /// Called after every successful fetch, even with an empty URL
    fn set_remote_server_url(&self, url: &str);
}

impl RemoteConfig {
    /// Parse a config response body.
    ///
    /// Malformed JSON is logged and yields an empty configuration; a bad
    /// response must never take the worker down.
    pub fn parse(body: &str) -> Self {
        let json: Value = match serde_json::from_str(body) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, body, "Failed to parse remote configuration");
                return Self::default();
            }
        };

        let event_bindings = json
            .get("event_bindings")
            .and_then(|b| b.get("events"))
            .and_then(Value::as_array)
            .cloned();

        let remote_server_url = json
            .get("vtrack_server_url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Self {
            event_bindings,
            remote_server_url,
        }
    }

    /// Hand this configuration to `handler`.
    ///
    /// The server URL setter fires unconditionally so handlers see one
    /// notification per successful fetch.
    pub fn deliver(self, handler: &dyn ConfigHandler) {
        if let Some(bindings) = self.event_bindings {
            handler.set_event_bindings(bindings);
        }
        handler.set_remote_server_url(&self.remote_server_url);
    }
}
