// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only per-job artifact files.
//!
//! The engine-side output nodes write one file per contract output under
//! `<root>/<job_id>/<name>`; the executor polls [`ArtifactStore::read_artifacts`]
//! until every expected name exists.

use crate::{sanitize_name, StoreError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File-per-output artifact store rooted at the artifacts directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Create a store rooted at the given directory. The directory itself is
    /// created lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one job's artifacts.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    /// Write one artifact. Strings are written verbatim (UTF-8); any other
    /// value is written as compact JSON.
    pub fn write_artifact(&self, job_id: &str, name: &str, value: &Value) -> Result<(), StoreError> {
        let name = sanitize_name(name);
        if name.is_empty() {
            return Err(StoreError::InvalidArgument("empty artifact name".into()));
        }
        let dir = self.job_dir(job_id);
        std::fs::create_dir_all(&dir)?;
        let body = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        std::fs::write(dir.join(name), body)?;
        Ok(())
    }

    /// Read every artifact for a job: filename → parsed JSON, falling back
    /// to the raw string when the content is not valid JSON. A job with no
    /// artifacts yet yields an empty map.
    pub fn read_artifacts(&self, job_id: &str) -> Result<BTreeMap<String, Value>, StoreError> {
        let dir = self.job_dir(job_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = BTreeMap::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let raw = std::fs::read_to_string(entry.path())?;
            let value = serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
            out.insert(name, value);
        }
        Ok(out)
    }
}
