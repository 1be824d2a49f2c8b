// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable state for the in-pod runtime.
//!
//! Three stores share one SQLite index file (WAL mode) and the directories
//! next to it:
//!
//! - [`FileStore`] — content-addressed blobs plus a relational metadata
//!   index with cursor pagination.
//! - [`JobStore`] — job rows with serialized, sticky-terminal state
//!   transitions.
//! - [`ArtifactStore`] — append-only per-job artifact files written by the
//!   engine-side output nodes and polled by the executor.
//!
//! Mutations go through a per-store writer lock; reads use a separate
//! connection so they do not block writers.

#![deny(unsafe_code)]

mod artifacts;
mod files;
mod jobs;

pub use artifacts::ArtifactStore;
pub use files::{FileFilters, FileStore, ListPage};
pub use jobs::JobStore;

use std::path::Path;
use std::sync::Mutex;

/// Errors from the stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The caller handed over something unusable (empty content, bad cursor).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The SQLite index failed.
    #[error("index error: {0}")]
    Index(#[from] rusqlite::Error),

    /// Blob or artifact file I/O failed.
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A writer connection behind a mutex plus a read connection behind its own;
/// WAL mode lets the reader proceed while a write is in flight.
pub(crate) struct IndexHandle {
    pub writer: Mutex<rusqlite::Connection>,
    pub reader: Mutex<rusqlite::Connection>,
}

impl IndexHandle {
    pub(crate) fn open(index_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = index_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let writer = rusqlite::Connection::open(index_path)?;
        writer.pragma_update(None, "journal_mode", "WAL")?;
        writer.pragma_update(None, "busy_timeout", 5_000)?;
        let reader = rusqlite::Connection::open(index_path)?;
        reader.pragma_update(None, "busy_timeout", 5_000)?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }
}

/// Reduce a client-supplied name to its final path component.
///
/// Returns an empty string when nothing safe remains (e.g. `..`).
pub(crate) fn sanitize_name(raw: &str) -> String {
    Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_string()
}
