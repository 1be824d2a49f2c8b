// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed cache reconciliation.
//!
//! Large files under the watched paths are moved into the cache (named
//! `<sha256>_<name>`) and replaced with symlinks, so rebuilt images and
//! restarted pods reuse one on-disk copy. A manifest records what was
//! managed.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Manifest entry for one managed file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagedFile {
    pub source: String,
    pub cache_path: String,
    pub linked_paths: Vec<String>,
    pub last_seen: f64,
}

/// Errors from cache reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("file below threshold: {0}")]
    BelowThreshold(PathBuf),

    #[error("file not found: {0}")]
    NotFound(PathBuf),
}

/// Moves large watched files into a flat cache directory and symlinks
/// them back.
pub struct CacheManager {
    cache_root: PathBuf,
    watch_paths: Vec<PathBuf>,
    min_file_size_bytes: u64,
    cache_files_dir: PathBuf,
    manifest_file: PathBuf,
}

impl CacheManager {
    pub fn new(
        cache_root: impl Into<PathBuf>,
        watch_paths: Vec<PathBuf>,
        min_file_size_mb: u64,
    ) -> Result<Self, CacheError> {
        let cache_root = cache_root.into();
        let cache_files_dir = cache_root.join("files");
        let manifest_file = cache_root.join("manifest.json");
        std::fs::create_dir_all(&cache_files_dir)?;
        if !manifest_file.exists() {
            std::fs::write(&manifest_file, "{}")?;
        }
        Ok(Self {
            cache_root,
            watch_paths,
            min_file_size_bytes: min_file_size_mb * 1024 * 1024,
            cache_files_dir,
            manifest_file,
        })
    }

    /// Root of the cache.
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    fn load_manifest(&self) -> Result<BTreeMap<String, ManagedFile>, CacheError> {
        let raw = std::fs::read_to_string(&self.manifest_file)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save_manifest(&self, manifest: &BTreeMap<String, ManagedFile>) -> Result<(), CacheError> {
        let raw = serde_json::to_string_pretty(manifest)?;
        std::fs::write(&self.manifest_file, raw)?;
        Ok(())
    }

    fn sha256_file(path: &Path) -> Result<String, CacheError> {
        let mut hasher = Sha256::new();
        let mut file = std::fs::File::open(path)?;
        let mut buf = vec![0u8; 2 * 1024 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        Ok(out)
    }

    fn cache_destination(&self, digest: &str, original_name: &str) -> PathBuf {
        self.cache_files_dir.join(format!("{digest}_{original_name}"))
    }

    /// Move one file into the cache and symlink it back. Symlinked sources
    /// are re-recorded without moving anything.
    pub fn manage_file(&self, source_path: &Path) -> Result<ManagedFile, CacheError> {
        if source_path.is_symlink() {
            let target = std::fs::canonicalize(source_path).unwrap_or_default();
            let digest = if target.is_file() {
                Self::sha256_file(&target)?
            } else {
                "symlink".to_string()
            };
            return Ok(ManagedFile {
                source: source_path.display().to_string(),
                cache_path: target.display().to_string(),
                linked_paths: vec![source_path.display().to_string()],
                last_seen: epoch_now(),
            });
        }

        if !source_path.is_file() {
            return Err(CacheError::NotFound(source_path.to_path_buf()));
        }
        if std::fs::metadata(source_path)?.len() < self.min_file_size_bytes {
            return Err(CacheError::BelowThreshold(source_path.to_path_buf()));
        }

        let digest = Self::sha256_file(source_path)?;
        let name = source_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed");
        let cache_target = self.cache_destination(&digest, name);
        if !cache_target.exists() {
            std::fs::rename(source_path, &cache_target)?;
        } else if source_path.exists() {
            std::fs::remove_file(source_path)?;
        }
        symlink_file(&cache_target, source_path)?;
        debug!(source = %source_path.display(), cache = %cache_target.display(), "file cached");

        Ok(ManagedFile {
            source: source_path.display().to_string(),
            cache_path: cache_target.display().to_string(),
            linked_paths: vec![source_path.display().to_string()],
            last_seen: epoch_now(),
        })
    }

    /// Walk every watch path and manage each qualifying file, updating the
    /// manifest.
    pub fn reconcile(&self) -> Result<BTreeMap<String, ManagedFile>, CacheError> {
        let mut manifest = self.load_manifest()?;

        for watch_path in &self.watch_paths {
            if !watch_path.exists() {
                continue;
            }
            for entry in WalkDir::new(watch_path).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(_) => continue,
                };
                let path = entry.path();
                let is_candidate = path.is_symlink()
                    || (entry.file_type().is_file()
                        && entry.metadata().map(|m| m.len()).unwrap_or(0)
                            >= self.min_file_size_bytes);
                if !is_candidate {
                    continue;
                }
                let managed = self.manage_file(path)?;
                let key = digest_key(&managed);
                manifest.insert(key, managed);
            }
        }

        self.save_manifest(&manifest)?;
        info!(entries = manifest.len(), "cache reconciled");
        Ok(manifest)
    }
}

fn digest_key(managed: &ManagedFile) -> String {
    // Cache files are named `<sha256>_<name>`; recover the digest for the
    // manifest key, falling back to the full path for symlink records.
    Path::new(&managed.cache_path)
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('_').next())
        .filter(|prefix| prefix.len() == 64)
        .map(str::to_string)
        .unwrap_or_else(|| managed.cache_path.clone())
}

fn epoch_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(unix)]
fn symlink_file(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink_file(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

/// Manifest as a JSON value, for logging or diagnostics.
pub fn manifest_to_value(manifest: &BTreeMap<String, ManagedFile>) -> Value {
    serde_json::to_value(manifest).unwrap_or(Value::Null)
}
