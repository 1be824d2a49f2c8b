// SPDX-License-Identifier: MIT OR Apache-2.0
//! Job and file records shared between the store, executor, and gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Job lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    /// Returns `true` for the sticky terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Valid successors of `self`. Terminal states have none.
    pub fn valid_transitions(&self) -> &'static [JobState] {
        match self {
            Self::Queued => &[Self::Running, Self::Failed, Self::Canceled],
            Self::Running => &[Self::Completed, Self::Failed, Self::Canceled],
            Self::Completed | Self::Failed | Self::Canceled => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stable lowercase tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Parse the stable tag back into a state.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal output payload of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    /// Engine-assigned prompt id for the submission.
    pub prompt_id: String,
    /// Terminal status tag (always `"completed"` on success).
    pub status: String,
    /// Contract output name → scalar value or file id.
    pub result: serde_json::Map<String, Value>,
}

/// One tracked job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub state: JobState,
    /// Verbatim request body.
    pub input_payload: Value,
    /// Present only in terminal states.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_payload: Option<Value>,
    /// Failure taxonomy string (`PREFIX:detail`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// File records
// ---------------------------------------------------------------------------

/// Provenance of a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSource {
    Uploaded,
    Generated,
}

impl FileSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Generated => "generated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "uploaded" => Some(Self::Uploaded),
            "generated" => Some(Self::Generated),
            _ => None,
        }
    }
}

impl std::fmt::Display for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for one stored blob. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub media_type: String,
    pub size_bytes: u64,
    pub sha256_hex: String,
    pub source: FileSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// Sanitized basename of the uploaded name; may be empty.
    pub original_name: String,
    pub created_at: DateTime<Utc>,
    /// Absolute blob path. Never exposed over HTTP.
    #[serde(skip)]
    pub storage_path: std::path::PathBuf,
    /// Monotonic pagination key assigned at insert.
    #[serde(skip)]
    pub cursor_id: i64,
}
