// SPDX-License-Identifier: MIT OR Apache-2.0
//! Job rows with serialized, sticky-terminal transitions.

use crate::{IndexHandle, StoreError};
use ce_core::{new_job_id, JobRecord, JobState};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

/// Store for [`JobRecord`]s.
///
/// All state transitions run under the writer lock, which makes the
/// per-job lifecycle totally ordered. Terminal states are sticky: the
/// transition helpers check the current state and refuse to rewrite one.
pub struct JobStore {
    index: IndexHandle,
}

impl JobStore {
    /// Open (and initialize) the job table in the given index file.
    pub fn open(index_path: &Path) -> Result<Self, StoreError> {
        let index = IndexHandle::open(index_path)?;
        {
            let conn = index.writer.lock().expect("job index writer poisoned");
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS jobs (
                    job_id TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    input_payload TEXT NOT NULL,
                    output_payload TEXT,
                    error TEXT,
                    cancel_requested INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );",
            )?;
        }
        Ok(Self { index })
    }

    /// Insert a new queued job holding the verbatim request body.
    pub fn create(&self, input_payload: &Value) -> Result<JobRecord, StoreError> {
        let record = JobRecord {
            job_id: new_job_id(),
            state: JobState::Queued,
            input_payload: input_payload.clone(),
            output_payload: None,
            error: None,
            cancel_requested: false,
            created_at: Utc::now(),
        };
        let conn = self.index.writer.lock().expect("job index writer poisoned");
        conn.execute(
            "INSERT INTO jobs (job_id, state, input_payload, output_payload, error,
                               cancel_requested, created_at)
             VALUES (?1, ?2, ?3, NULL, NULL, 0, ?4)",
            params![
                record.job_id,
                record.state.as_str(),
                record.input_payload.to_string(),
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(record)
    }

    /// Fetch one job by id.
    pub fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let conn = self.index.reader.lock().expect("job index reader poisoned");
        let mut stmt = conn.prepare(
            "SELECT job_id, state, input_payload, output_payload, error,
                    cancel_requested, created_at
             FROM jobs WHERE job_id = ?1",
        )?;
        let mut rows = stmt.query(params![job_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    /// Transition `queued → running`. Returns `false` if the job is not in
    /// a state that allows it.
    pub fn mark_running(&self, job_id: &str) -> Result<bool, StoreError> {
        self.transition(job_id, JobState::Running, None, None)
    }

    /// Terminal success with the structured output payload.
    pub fn mark_completed(&self, job_id: &str, output: &Value) -> Result<bool, StoreError> {
        self.transition(job_id, JobState::Completed, Some(output), None)
    }

    /// Terminal failure with a taxonomy string.
    pub fn mark_failed(&self, job_id: &str, error: &str) -> Result<bool, StoreError> {
        self.transition(job_id, JobState::Failed, None, Some(error))
    }

    /// Terminal cancellation.
    pub fn mark_canceled(&self, job_id: &str) -> Result<bool, StoreError> {
        self.transition(job_id, JobState::Canceled, None, None)
    }

    /// Set `cancel_requested` on a non-terminal job.
    ///
    /// Idempotent; a terminal job is returned unchanged with the flag left
    /// as `false`. Returns the post-call record, or `None` for an unknown
    /// id.
    pub fn request_cancel(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        {
            let conn = self.index.writer.lock().expect("job index writer poisoned");
            conn.execute(
                "UPDATE jobs SET cancel_requested = 1
                 WHERE job_id = ?1 AND state IN ('queued', 'running')",
                params![job_id],
            )?;
        }
        self.get(job_id)
    }

    /// Read the cancel flag. Unknown jobs report `false`.
    pub fn cancel_requested(&self, job_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .get(job_id)?
            .map(|r| r.cancel_requested)
            .unwrap_or(false))
    }

    fn transition(
        &self,
        job_id: &str,
        next: JobState,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = self.index.writer.lock().expect("job index writer poisoned");

        let current: Option<String> = conn
            .query_row(
                "SELECT state FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some(current) = current else {
            return Ok(false);
        };
        let Some(current) = JobState::parse(&current) else {
            return Err(StoreError::InvalidArgument(format!(
                "unknown job state in index: {current}"
            )));
        };
        if !current.can_transition_to(next) {
            debug!(job_id, from = %current, to = %next, "transition rejected");
            return Ok(false);
        }

        conn.execute(
            "UPDATE jobs SET state = ?2, output_payload = ?3, error = ?4 WHERE job_id = ?1",
            params![
                job_id,
                next.as_str(),
                output.map(|v| v.to_string()),
                error,
            ],
        )?;
        Ok(true)
    }
}

fn row_to_record(row: &Row<'_>) -> Result<JobRecord, StoreError> {
    let state_raw: String = row.get(1)?;
    let state = JobState::parse(&state_raw).ok_or_else(|| {
        StoreError::InvalidArgument(format!("unknown job state in index: {state_raw}"))
    })?;
    let input_raw: String = row.get(2)?;
    let input_payload: Value = serde_json::from_str(&input_raw)
        .map_err(|e| StoreError::InvalidArgument(format!("corrupt input payload: {e}")))?;
    let output_raw: Option<String> = row.get(3)?;
    let output_payload = match output_raw {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| StoreError::InvalidArgument(format!("corrupt output payload: {e}")))?,
        ),
        None => None,
    };
    let created_raw: String = row.get(6)?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    Ok(JobRecord {
        job_id: row.get(0)?,
        state,
        input_payload,
        output_payload,
        error: row.get(4)?,
        cancel_requested: row.get::<_, i64>(5)? != 0,
        created_at,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
