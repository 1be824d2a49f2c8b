// SPDX-License-Identifier: MIT OR Apache-2.0
//! Range-resumable model downloads.

use futures::StreamExt;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Download errors.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned HTTP {0}")]
    Status(u16),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Download `url` to `target`, resuming a previous partial transfer when
/// the server honors range requests.
///
/// The transfer streams into `<target>.part` and is renamed into place
/// only once complete, so a crashed download never masquerades as a
/// finished model file.
pub async fn download_with_resume(url: &str, target: &Path) -> Result<(), DownloadError> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let part_path = target.with_extension(partial_extension(target));

    let existing = match std::fs::metadata(&part_path) {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    let client = reqwest::Client::new();
    let mut request = client.get(url);
    if existing > 0 {
        request = request.header("range", format!("bytes={existing}-"));
        debug!(url, offset = existing, "resuming download");
    }

    let resp = request.send().await?;
    let status = resp.status();
    let resumed = status.as_u16() == 206;
    if !status.is_success() {
        return Err(DownloadError::Status(status.as_u16()));
    }

    let mut file = if resumed {
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(&part_path)
            .await?
    } else {
        // Server ignored the range request (or there was nothing to
        // resume): start over.
        tokio::fs::File::create(&part_path).await?
    };

    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&part_path, target).await?;
    info!(url, target = %target.display(), "download complete");
    Ok(())
}

fn partial_extension(target: &Path) -> String {
    match target.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.part"),
        None => "part".to_string(),
    }
}
