// SPDX-License-Identifier: MIT OR Apache-2.0
//! Thin HTTP client for the opaque graph engine.
//!
//! The engine is treated as an HTTP peer: it accepts graph submissions,
//! reports history, serves media, and (when its manager extension is
//! present) exposes model/node catalogs. Every operation is a single
//! request with a bounded timeout. The client is stateless; callers share
//! one instance.

#![deny(unsafe_code)]

use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Default per-request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// URL prefixes probed for catalog endpoints, in order. Different engine /
/// manager versions mount them in different places; the first non-404
/// answer wins.
const CATALOG_PREFIXES: &[&str] = &["", "/api", "/manager"];

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Failure talking to the engine.
///
/// Carries the HTTP status when one was received, the raw response body,
/// and the parsed JSON body when the text parses.
#[derive(Debug)]
pub struct EngineError {
    pub message: String,
    pub status: Option<u16>,
    pub body: Option<String>,
    pub json: Option<Value>,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {status})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    fn transport(context: &str, err: reqwest::Error) -> Self {
        Self {
            message: format!("{context}: {err}"),
            status: err.status().map(|s| s.as_u16()),
            body: None,
            json: None,
        }
    }

    fn http(context: &str, status: u16, body: String) -> Self {
        let json = serde_json::from_str(&body).ok();
        Self {
            message: format!("{context}: engine returned HTTP {status}"),
            status: Some(status),
            body: Some(body),
            json,
        }
    }

    fn protocol(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            body: None,
            json: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ComfyClient
// ---------------------------------------------------------------------------

/// Stateless client for one engine base URL.
pub struct ComfyClient {
    base_url: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl fmt::Debug for ComfyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComfyClient")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl ComfyClient {
    /// Create a client for the given base URL (trailing slash tolerated).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Base URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // -- Submission & lifecycle ------------------------------------------

    /// Submit a mapped graph; returns the engine-assigned prompt id.
    pub async fn submit(&self, graph: &Value) -> Result<String, EngineError> {
        let body = self.post_json("/prompt", graph).await?;
        let prompt_id = body
            .get("prompt_id")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::protocol("engine response missing prompt_id"))?;
        debug!(prompt_id, "graph submitted");
        Ok(prompt_id.to_string())
    }

    /// Fetch the history object for one prompt id.
    pub async fn history(&self, prompt_id: &str) -> Result<Value, EngineError> {
        self.get_json(&format!("/history/{prompt_id}")).await
    }

    /// Download one media object produced by the engine.
    pub async fn view_media(
        &self,
        filename: &str,
        subfolder: &str,
        media_type: &str,
    ) -> Result<Vec<u8>, EngineError> {
        let url = format!("{}/view", self.base_url);
        let resp = self
            .http
            .get(url)
            .query(&[("filename", filename), ("subfolder", subfolder), ("type", media_type)])
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| EngineError::transport("view media", e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::http("view media", status.as_u16(), body));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| EngineError::transport("view media body", e))?;
        Ok(bytes.to_vec())
    }

    /// Interrupt whatever the engine is currently executing. Best effort.
    pub async fn interrupt(&self) -> Result<(), EngineError> {
        self.post_json("/interrupt", &Value::Object(Default::default()))
            .await
            .map(|_| ())
    }

    /// Remove a not-yet-started prompt from the engine queue. Best effort.
    pub async fn cancel_queued(&self, prompt_id: &str) -> Result<(), EngineError> {
        let body = serde_json::json!({ "delete": [prompt_id] });
        self.post_json("/queue", &body).await.map(|_| ())
    }

    /// Engine readiness/stats endpoint; a 200 means the engine is up.
    pub async fn system_stats(&self) -> Result<Value, EngineError> {
        self.get_json("/system_stats").await
    }

    // -- Catalog & installation ------------------------------------------

    /// Node class schemas known to the engine.
    pub async fn object_info(&self) -> Result<Value, EngineError> {
        self.get_json("/object_info").await
    }

    /// Downloadable model catalog (manager extension).
    pub async fn external_models(&self) -> Result<Value, EngineError> {
        self.get_catalog("/externalmodel/getlist?mode=default").await
    }

    /// Mapping from custom-node repos/packs to the node classes they provide.
    pub async fn custom_node_mappings(&self) -> Result<Value, EngineError> {
        self.get_catalog("/customnode/getmappings?mode=default").await
    }

    /// Installable custom-node packs.
    pub async fn custom_node_list(&self) -> Result<Value, EngineError> {
        self.get_catalog("/customnode/getlist?mode=default&skip_update=true")
            .await
    }

    /// Ask the manager extension to install a custom node by repo URL.
    /// Returns the raw response text.
    pub async fn install_custom_node_by_git_url(&self, url: &str) -> Result<String, EngineError> {
        let mut last: Option<EngineError> = None;
        for prefix in CATALOG_PREFIXES {
            let full = format!("{}{prefix}/customnode/install/git_url", self.base_url);
            let resp = self
                .http
                .get(&full)
                .query(&[("url", url)])
                .timeout(self.request_timeout)
                .send()
                .await
                .map_err(|e| EngineError::transport("install custom node", e))?;
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if status.as_u16() == 404 {
                last = Some(EngineError::http("install custom node", 404, text));
                continue;
            }
            if !status.is_success() {
                return Err(EngineError::http("install custom node", status.as_u16(), text));
            }
            return Ok(text);
        }
        Err(last.unwrap_or_else(|| EngineError::protocol("no catalog prefix answered")))
    }

    // -- Internals -------------------------------------------------------

    async fn get_json(&self, path: &str) -> Result<Value, EngineError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| EngineError::transport(path, e))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(EngineError::http(path, status.as_u16(), text));
        }
        serde_json::from_str(&text)
            .map_err(|e| EngineError::protocol(format!("{path}: invalid JSON from engine: {e}")))
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, EngineError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| EngineError::transport(path, e))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(EngineError::http(path, status.as_u16(), text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| EngineError::protocol(format!("{path}: invalid JSON from engine: {e}")))
    }

    /// Walk the known catalog prefixes and return the first non-404 answer.
    async fn get_catalog(&self, path_and_query: &str) -> Result<Value, EngineError> {
        let mut last: Option<EngineError> = None;
        for prefix in CATALOG_PREFIXES {
            match self.get_json(&format!("{prefix}{path_and_query}")).await {
                Ok(value) => return Ok(value),
                Err(err) if err.status == Some(404) => {
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| EngineError::protocol("no catalog prefix answered")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
