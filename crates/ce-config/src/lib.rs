// SPDX-License-Identifier: MIT OR Apache-2.0
//! Runtime configuration for the in-pod processes.
//!
//! The gateway and supervisor binaries parse their command lines with clap
//! and fold the result into a [`RuntimeConfig`]; deployments that prefer a
//! file can ship a TOML overlay instead. Environment variables win over
//! both, so a pod template can inject the per-app secret without touching
//! the image.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Errors & warnings
// ---------------------------------------------------------------------------

/// Errors raised during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found or unreadable.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory issues that do not prevent startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The output timeout is unusually large.
    LargeOutputTimeout {
        /// Configured value in seconds.
        secs: u64,
    },
    /// Cache reconciliation is configured without any watch paths.
    CacheWithoutWatchPaths,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeOutputTimeout { secs } => {
                write!(f, "output_timeout_seconds is unusually large ({secs}s)")
            }
            ConfigWarning::CacheWithoutWatchPaths => {
                write!(f, "cache_root set but watch_paths is empty")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

/// Process-level settings shared by the gateway and supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Gateway bind host.
    #[serde(default = "defaults::listen_host")]
    pub listen_host: String,
    /// Gateway bind port.
    #[serde(default = "defaults::listen_port")]
    pub listen_port: u16,
    /// Per-app secret checked against `x-api-key`.
    #[serde(default)]
    pub api_key: String,
    /// Base URL of the graph engine.
    #[serde(default = "defaults::comfy_url")]
    pub comfy_url: String,
    /// Contract JSON file.
    pub contract_path: PathBuf,
    /// Workflow JSON file.
    pub workflow_path: PathBuf,
    /// SQLite index file; blobs and artifacts live next to it.
    pub state_db_path: PathBuf,
    /// Root for per-job artifact dumps.
    pub artifacts_dir: PathBuf,
    /// Owner tag stamped on generated files.
    #[serde(default)]
    pub app_id: Option<String>,
    /// Content-addressed cache root (cache reconciliation is skipped when
    /// unset).
    #[serde(default)]
    pub cache_root: Option<PathBuf>,
    /// Directories scanned during cache reconciliation.
    #[serde(default)]
    pub watch_paths: Vec<PathBuf>,
    /// Minimum size for a file to be moved into the cache.
    #[serde(default = "defaults::min_file_size_mb")]
    pub min_file_size_mb: u64,
    /// Per-job output deadline.
    #[serde(default = "defaults::output_timeout_seconds")]
    pub output_timeout_seconds: u64,
    /// Sleep between artifact poll ticks.
    #[serde(default = "defaults::output_poll_seconds")]
    pub output_poll_seconds: f64,
    /// Window after the engine reports done during which the last artifact
    /// write may still land.
    #[serde(default = "defaults::artifact_grace_seconds")]
    pub artifact_grace_seconds: f64,
}

mod defaults {
    pub fn listen_host() -> String {
        "0.0.0.0".into()
    }
    pub fn listen_port() -> u16 {
        3000
    }
    pub fn comfy_url() -> String {
        "http://127.0.0.1:8188".into()
    }
    pub fn min_file_size_mb() -> u64 {
        100
    }
    pub fn output_timeout_seconds() -> u64 {
        180
    }
    pub fn output_poll_seconds() -> f64 {
        1.5
    }
    pub fn artifact_grace_seconds() -> f64 {
        5.0
    }
}

/// Threshold above which the output timeout generates a warning.
const LARGE_OUTPUT_TIMEOUT_SECS: u64 = 3_600;

impl RuntimeConfig {
    /// Directory holding content-addressed blobs, derived from
    /// `state_db_path` (sibling `files/` directory).
    pub fn files_dir(&self) -> PathBuf {
        sibling_dir(&self.state_db_path, "files")
    }
}

fn sibling_dir(state_db_path: &Path, name: &str) -> PathBuf {
    match state_db_path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Parse a TOML string into a [`RuntimeConfig`].
pub fn parse_toml(content: &str) -> Result<RuntimeConfig, ConfigError> {
    toml::from_str::<RuntimeConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Load a [`RuntimeConfig`] from a TOML file, then apply env overrides.
pub fn load_config(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.display().to_string(),
    })?;
    let mut config = parse_toml(&content)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `CE_API_KEY`
/// - `CE_COMFY_URL`
/// - `CE_APP_ID`
/// - `CE_LISTEN_HOST` / `CE_LISTEN_PORT`
pub fn apply_env_overrides(config: &mut RuntimeConfig) {
    if let Ok(val) = std::env::var("CE_API_KEY") {
        config.api_key = val;
    }
    if let Ok(val) = std::env::var("CE_COMFY_URL") {
        config.comfy_url = val;
    }
    if let Ok(val) = std::env::var("CE_APP_ID") {
        config.app_id = Some(val);
    }
    if let Ok(val) = std::env::var("CE_LISTEN_HOST") {
        config.listen_host = val;
    }
    if let Ok(val) = std::env::var("CE_LISTEN_PORT") {
        if let Ok(port) = val.parse() {
            config.listen_port = port;
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a configuration, returning advisory warnings.
///
/// Hard errors (empty secret, non-positive intervals) come back as a
/// [`ConfigError::ValidationError`]; soft issues as warnings.
pub fn validate_config(config: &RuntimeConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if config.api_key.trim().is_empty() {
        errors.push("api_key must not be empty".into());
    }
    if config.comfy_url.trim().is_empty() {
        errors.push("comfy_url must not be empty".into());
    }
    if config.output_timeout_seconds == 0 {
        errors.push("output_timeout_seconds must be > 0".into());
    } else if config.output_timeout_seconds > LARGE_OUTPUT_TIMEOUT_SECS {
        warnings.push(ConfigWarning::LargeOutputTimeout {
            secs: config.output_timeout_seconds,
        });
    }
    if !(config.output_poll_seconds > 0.0) {
        errors.push("output_poll_seconds must be > 0".into());
    }
    if config.artifact_grace_seconds < 0.0 {
        errors.push("artifact_grace_seconds must be >= 0".into());
    }
    if config.cache_root.is_some() && config.watch_paths.is_empty() {
        warnings.push(ConfigWarning::CacheWithoutWatchPaths);
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
