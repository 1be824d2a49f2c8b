// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stable job error taxonomy.
//!
//! The prefix of every rendered error is part of the wire contract for
//! `JobRecord.error`; clients match on it.

use std::fmt;

/// Broad family of a job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobErrorKind {
    /// Payload shape, missing/unknown input, unknown media file id.
    Validation,
    /// The engine rejected the graph submission.
    Queue,
    /// A scalar output could not be coerced to its declared type.
    OutputType,
    /// The output deadline expired before all artifacts existed.
    OutputTimeout,
    /// Engine reported done, grace expired, artifacts still absent.
    MissingArtifacts,
    /// Blob write or index insert failed for a generated artifact.
    FileStore,
    /// Anything uncaught.
    System,
}

impl JobErrorKind {
    /// Stable wire prefix (e.g. `"VALIDATION_ERROR"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Queue => "QUEUE_ERROR",
            Self::OutputType => "OUTPUT_TYPE_ERROR",
            Self::OutputTimeout => "OUTPUT_TIMEOUT",
            Self::MissingArtifacts => "MISSING_ARTIFACTS",
            Self::FileStore => "FILE_STORE_ERROR",
            Self::System => "SYSTEM_ERROR",
        }
    }
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminal job failure: a stable kind plus a detail suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub detail: String,
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire())
    }
}

impl std::error::Error for JobError {}

impl JobError {
    pub fn new(kind: JobErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Validation, detail)
    }

    pub fn queue(detail: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Queue, detail)
    }

    pub fn output_type(detail: impl Into<String>) -> Self {
        Self::new(JobErrorKind::OutputType, detail)
    }

    pub fn output_timeout(missing: &[String]) -> Self {
        Self::new(
            JobErrorKind::OutputTimeout,
            format!("missing_artifacts:{}", missing.join(",")),
        )
    }

    pub fn missing_artifacts(missing: &[String]) -> Self {
        Self::new(JobErrorKind::MissingArtifacts, missing.join(","))
    }

    pub fn file_store(detail: impl Into<String>) -> Self {
        Self::new(JobErrorKind::FileStore, detail)
    }

    pub fn system(detail: impl Into<String>) -> Self {
        Self::new(JobErrorKind::System, detail)
    }

    /// The `PREFIX:detail` form stored on the job record.
    pub fn wire(&self) -> String {
        if self.detail.is_empty() {
            self.kind.as_str().to_string()
        } else {
            format!("{}:{}", self.kind.as_str(), self.detail)
        }
    }
}
