// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed blob store with a relational metadata index.

use crate::{sanitize_name, IndexHandle, StoreError};
use ce_core::{new_file_id, FileRecord, FileSource};
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Row};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lower/upper bounds applied to `list_files` limits.
const MIN_LIST_LIMIT: usize = 1;
const MAX_LIST_LIMIT: usize = 200;

/// Optional AND-combined filters for [`FileStore::list_files`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileFilters {
    pub media_type: Option<String>,
    pub source: Option<FileSource>,
    pub app_id: Option<String>,
}

/// One page of a cursor walk.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub records: Vec<FileRecord>,
    /// Pass back as `cursor` to fetch the next page; `None` on the last page.
    pub next_cursor: Option<i64>,
}

/// Content-addressed file store.
///
/// One blob file per record under a flat directory, named
/// `<file_id><ext>`; metadata rows carry a monotonic `cursor_id` from the
/// SQLite rowid. The blob write completes before the row becomes visible.
pub struct FileStore {
    index: IndexHandle,
    files_dir: PathBuf,
}

impl FileStore {
    /// Open (and initialize) the store around the given index file. Blobs
    /// live in a sibling `files/` directory.
    pub fn open(index_path: &Path) -> Result<Self, StoreError> {
        let index = IndexHandle::open(index_path)?;
        {
            let conn = index.writer.lock().expect("file index writer poisoned");
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS files (
                    cursor_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    file_id TEXT NOT NULL UNIQUE,
                    media_type TEXT NOT NULL,
                    size_bytes INTEGER NOT NULL,
                    sha256_hex TEXT NOT NULL,
                    source TEXT NOT NULL,
                    app_id TEXT,
                    original_name TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    storage_path TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS files_media_type ON files (media_type);
                CREATE INDEX IF NOT EXISTS files_source ON files (source);",
            )?;
        }

        let files_dir = match index_path.parent() {
            Some(parent) => parent.join("files"),
            None => PathBuf::from("files"),
        };
        std::fs::create_dir_all(&files_dir)?;

        Ok(Self { index, files_dir })
    }

    /// Directory holding the blobs.
    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    /// Store a blob and insert its metadata row.
    ///
    /// Rejects empty content. The original name is reduced to its basename;
    /// the blob extension comes from that name when present, else from the
    /// media type's canonical extension, else is empty.
    pub fn create_file(
        &self,
        content: &[u8],
        media_type: &str,
        source: FileSource,
        app_id: Option<&str>,
        original_name: &str,
    ) -> Result<FileRecord, StoreError> {
        if content.is_empty() {
            return Err(StoreError::InvalidArgument("empty_file".into()));
        }

        let original_name = sanitize_name(original_name);
        let sha256_hex = hex_digest(content);
        let file_id = new_file_id();
        let ext = blob_extension(&original_name, media_type);
        let storage_path = self.files_dir.join(format!("{file_id}{ext}"));
        let created_at = Utc::now();

        // The blob must exist before the row is visible to readers.
        std::fs::write(&storage_path, content)?;

        let record = FileRecord {
            file_id,
            media_type: media_type.to_string(),
            size_bytes: content.len() as u64,
            sha256_hex,
            source,
            app_id: app_id.map(str::to_string),
            original_name,
            created_at,
            storage_path,
            cursor_id: 0,
        };

        let cursor_id = {
            let conn = self.index.writer.lock().expect("file index writer poisoned");
            conn.execute(
                "INSERT INTO files
                   (file_id, media_type, size_bytes, sha256_hex, source, app_id,
                    original_name, created_at, storage_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.file_id,
                    record.media_type,
                    record.size_bytes as i64,
                    record.sha256_hex,
                    record.source.as_str(),
                    record.app_id,
                    record.original_name,
                    record.created_at.to_rfc3339(),
                    record.storage_path.to_string_lossy(),
                ],
            )?;
            conn.last_insert_rowid()
        };

        debug!(file_id = %record.file_id, size = record.size_bytes, "stored blob");
        Ok(FileRecord { cursor_id, ..record })
    }

    /// Fetch one record by file id.
    pub fn get_file(&self, file_id: &str) -> Result<Option<FileRecord>, StoreError> {
        let conn = self.index.reader.lock().expect("file index reader poisoned");
        let mut stmt = conn.prepare(
            "SELECT cursor_id, file_id, media_type, size_bytes, sha256_hex, source,
                    app_id, original_name, created_at, storage_path
             FROM files WHERE file_id = ?1",
        )?;
        let mut rows = stmt.query(params![file_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    /// Paginated listing, strictly descending by `cursor_id`.
    ///
    /// `cursor` is the smallest `cursor_id` of the previous page; the next
    /// page matches `cursor_id < cursor`. `limit` is clamped to [1, 200].
    /// `next_cursor` is set iff a `limit+1`th row existed.
    pub fn list_files(
        &self,
        limit: usize,
        cursor: Option<i64>,
        filters: &FileFilters,
    ) -> Result<ListPage, StoreError> {
        let limit = limit.clamp(MIN_LIST_LIMIT, MAX_LIST_LIMIT);

        let mut sql = String::from(
            "SELECT cursor_id, file_id, media_type, size_bytes, sha256_hex, source,
                    app_id, original_name, created_at, storage_path
             FROM files",
        );
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(cursor) = cursor {
            clauses.push("cursor_id < ?");
            args.push(SqlValue::Integer(cursor));
        }
        if let Some(ref media_type) = filters.media_type {
            clauses.push("media_type = ?");
            args.push(SqlValue::Text(media_type.clone()));
        }
        if let Some(source) = filters.source {
            clauses.push("source = ?");
            args.push(SqlValue::Text(source.as_str().to_string()));
        }
        if let Some(ref app_id) = filters.app_id {
            clauses.push("app_id = ?");
            args.push(SqlValue::Text(app_id.clone()));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY cursor_id DESC LIMIT ?");
        args.push(SqlValue::Integer((limit + 1) as i64));

        let conn = self.index.reader.lock().expect("file index reader poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(args))?;

        let mut records = Vec::with_capacity(limit + 1);
        while let Some(row) = rows.next()? {
            records.push(row_to_record(row)?);
        }

        let next_cursor = if records.len() > limit {
            records.truncate(limit);
            records.last().map(|r| r.cursor_id)
        } else {
            None
        };

        Ok(ListPage { records, next_cursor })
    }
}

fn hex_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Canonical extensions for media types the endpoints commonly move.
fn canonical_extension(media_type: &str) -> Option<&'static str> {
    match media_type {
        "image/png" => Some(".png"),
        "image/jpeg" => Some(".jpg"),
        "image/webp" => Some(".webp"),
        "image/gif" => Some(".gif"),
        "video/mp4" => Some(".mp4"),
        "video/webm" => Some(".webm"),
        "audio/wav" | "audio/x-wav" => Some(".wav"),
        "audio/mpeg" => Some(".mp3"),
        "audio/flac" => Some(".flac"),
        "application/json" => Some(".json"),
        "text/plain" => Some(".txt"),
        _ => None,
    }
}

fn blob_extension(original_name: &str, media_type: &str) -> String {
    if let Some(ext) = Path::new(original_name).extension().and_then(|e| e.to_str()) {
        if !ext.is_empty() {
            return format!(".{ext}");
        }
    }
    canonical_extension(media_type).unwrap_or("").to_string()
}

fn row_to_record(row: &Row<'_>) -> Result<FileRecord, StoreError> {
    let source_raw: String = row.get(5)?;
    let source = FileSource::parse(&source_raw).ok_or_else(|| {
        StoreError::InvalidArgument(format!("unknown file source in index: {source_raw}"))
    })?;
    let created_raw: String = row.get(8)?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let storage_path: String = row.get(9)?;

    Ok(FileRecord {
        cursor_id: row.get(0)?,
        file_id: row.get(1)?,
        media_type: row.get(2)?,
        size_bytes: row.get::<_, i64>(3)? as u64,
        sha256_hex: row.get(4)?,
        source,
        app_id: row.get(6)?,
        original_name: row.get(7)?,
        created_at,
        storage_path: PathBuf::from(storage_path),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
