// SPDX-License-Identifier: MIT OR Apache-2.0
//! Materialize contract and workflow files from configuration-passed JSON.
//!
//! Pod templates sometimes inject the contract/workflow as environment
//! blobs instead of baking files into the image; when the file is missing
//! and a blob is available, the blob is written to the expected path.

use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::info;

/// Ensure `path` exists, writing `blob` (validated as JSON) when missing.
///
/// Fails when the file is absent and no blob was provided, or when the
/// blob is not valid JSON.
pub fn materialize_json_file(path: &Path, blob: Option<&str>, what: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let Some(blob) = blob else {
        bail!("{what} file missing and no inline JSON provided: {}", path.display());
    };
    serde_json::from_str::<serde_json::Value>(blob)
        .with_context(|| format!("inline {what} is not valid JSON"))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create parent dir for {}", path.display()))?;
    }
    std::fs::write(path, blob).with_context(|| format!("write {what} to {}", path.display()))?;
    info!(path = %path.display(), "{what} materialized from inline JSON");
    Ok(())
}
