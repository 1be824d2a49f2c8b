// SPDX-License-Identifier: MIT OR Apache-2.0
//! Job execution.
//!
//! One cooperative task per job: bridge contract inputs to graph inputs,
//! submit to the engine, poll the artifact directory until the expected
//! set is complete, coerce scalar outputs, and settle the job record in a
//! sticky terminal state.
//!
//! Completion authority is the artifact set. Engine history reaching a
//! terminal state only starts the grace window; the executor never
//! declares success without every expected artifact.

#![deny(unsafe_code)]

use ce_comfy::ComfyClient;
use ce_core::{
    coerce_scalar_output, is_file_id, JobError, JobOutput, WorkflowContract, FileSource,
};
use ce_mapper::MapperEnv;
use ce_store::{ArtifactStore, FileStore, JobStore};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for one executor instance.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-job deadline for the full artifact set.
    pub output_timeout: Duration,
    /// Sleep between poll ticks.
    pub output_poll: Duration,
    /// Window after the engine reports the prompt done during which the
    /// last artifact write may still land.
    pub artifact_grace: Duration,
    /// Owner tag stamped on generated files.
    pub app_id: Option<String>,
    /// Runtime coordinates injected into api-output nodes.
    pub mapper_env: MapperEnv,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Shared executor; `execute` runs one job to a terminal state.
pub struct JobExecutor {
    contract: Arc<WorkflowContract>,
    workflow: Arc<Value>,
    files: Arc<FileStore>,
    jobs: Arc<JobStore>,
    artifacts: ArtifactStore,
    engine: Arc<ComfyClient>,
    config: ExecutorConfig,
}

enum Outcome {
    Completed(JobOutput),
    Canceled,
}

impl JobExecutor {
    pub fn new(
        contract: Arc<WorkflowContract>,
        workflow: Arc<Value>,
        files: Arc<FileStore>,
        jobs: Arc<JobStore>,
        artifacts: ArtifactStore,
        engine: Arc<ComfyClient>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            contract,
            workflow,
            files,
            jobs,
            artifacts,
            engine,
            config,
        }
    }

    /// Drive one job to a terminal state. Every failure is caught and
    /// mapped onto the job record; this function itself never errors.
    pub async fn execute(&self, job_id: &str, payload: Value) {
        match self.jobs.mark_running(job_id) {
            Ok(true) => {}
            Ok(false) => {
                // Already terminal (e.g. canceled before pickup).
                debug!(job_id, "job not runnable, skipping");
                return;
            }
            Err(e) => {
                warn!(job_id, error = %e, "failed to mark job running");
                return;
            }
        }

        match self.run(job_id, payload).await {
            Ok(Outcome::Completed(output)) => {
                let value = match serde_json::to_value(&output) {
                    Ok(v) => v,
                    Err(e) => {
                        self.settle_failed(job_id, &JobError::system(e.to_string()));
                        return;
                    }
                };
                if let Err(e) = self.jobs.mark_completed(job_id, &value) {
                    warn!(job_id, error = %e, "failed to persist completion");
                }
                info!(job_id, "job completed");
            }
            Ok(Outcome::Canceled) => {
                if let Err(e) = self.jobs.mark_canceled(job_id) {
                    warn!(job_id, error = %e, "failed to persist cancellation");
                }
                info!(job_id, "job canceled");
            }
            Err(err) => self.settle_failed(job_id, &err),
        }
    }

    fn settle_failed(&self, job_id: &str, err: &JobError) {
        let wire = err.wire();
        if let Err(e) = self.jobs.mark_failed(job_id, &wire) {
            warn!(job_id, error = %e, "failed to persist failure");
        }
        info!(job_id, error = %wire, "job failed");
    }

    async fn run(&self, job_id: &str, payload: Value) -> Result<Outcome, JobError> {
        let mut payload = match payload {
            Value::Object(map) => map,
            _ => return Err(JobError::validation("payload_not_object")),
        };

        self.resolve_media_inputs(&mut payload)?;

        let mapped = ce_mapper::map_payload(
            &self.workflow,
            &self.contract,
            &payload,
            Some(job_id),
            &self.config.mapper_env,
        )
        .map_err(|e| JobError::validation(e.to_string()))?;

        let prompt_id = self
            .engine
            .submit(&mapped)
            .await
            .map_err(|e| JobError::queue(e.to_string()))?;
        debug!(job_id, prompt_id, "submitted to engine");

        let snapshot = match self.await_artifacts(job_id, &prompt_id).await? {
            Some(snapshot) => snapshot,
            None => return Ok(Outcome::Canceled),
        };

        let result = self.resolve_outputs(&snapshot).await?;
        Ok(Outcome::Completed(JobOutput {
            prompt_id,
            status: "completed".into(),
            result,
        }))
    }

    /// Replace `fid_…` values of media-typed inputs with local blob paths.
    fn resolve_media_inputs(&self, payload: &mut Map<String, Value>) -> Result<(), JobError> {
        for field in &self.contract.inputs {
            if !field.ty.is_media() {
                continue;
            }
            let Some(Value::String(raw)) = payload.get(&field.name) else {
                continue;
            };
            if !raw.starts_with(ce_core::FILE_ID_PREFIX) {
                continue;
            }

            let record = self
                .files
                .get_file(raw)
                .map_err(|e| JobError::system(e.to_string()))?
                .filter(|record| record.storage_path.exists())
                .ok_or_else(|| {
                    JobError::validation(format!("unknown_media_file_id:{}", field.name))
                })?;

            payload.insert(
                field.name.clone(),
                Value::String(record.storage_path.to_string_lossy().into_owned()),
            );
        }
        Ok(())
    }

    /// Poll until every expected artifact exists, the deadline passes, the
    /// grace window after engine-done expires, or a cancel is observed.
    ///
    /// Returns `None` on cancellation.
    async fn await_artifacts(
        &self,
        job_id: &str,
        prompt_id: &str,
    ) -> Result<Option<BTreeMap<String, Value>>, JobError> {
        let expected = self.contract.output_names();
        let deadline = Instant::now() + self.config.output_timeout;
        let mut grace_deadline: Option<Instant> = None;

        loop {
            // Cancellation is tick-granular: the flag is observed here,
            // between blocking calls, never mid-call.
            let cancel = self
                .jobs
                .cancel_requested(job_id)
                .map_err(|e| JobError::system(e.to_string()))?;
            if cancel {
                if let Err(e) = self.engine.interrupt().await {
                    debug!(job_id, error = %e, "interrupt failed");
                }
                if let Err(e) = self.engine.cancel_queued(prompt_id).await {
                    debug!(job_id, error = %e, "queue delete failed");
                }
                return Ok(None);
            }

            let artifacts = self
                .artifacts
                .read_artifacts(job_id)
                .map_err(|e| JobError::system(e.to_string()))?;
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !artifacts.contains_key(*name))
                .cloned()
                .collect();
            if missing.is_empty() {
                return Ok(Some(artifacts));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(JobError::output_timeout(&missing));
            }
            if let Some(grace) = grace_deadline {
                if now >= grace {
                    return Err(JobError::missing_artifacts(&missing));
                }
            } else if self.engine_reports_done(prompt_id).await {
                grace_deadline = Some(now + self.config.artifact_grace);
            }

            tokio::time::sleep(self.config.output_poll).await;
        }
    }

    /// Engine history is only a signal to start the grace window; errors
    /// here are swallowed because a mid-run engine may not answer yet.
    async fn engine_reports_done(&self, prompt_id: &str) -> bool {
        match self.engine.history(prompt_id).await {
            Ok(history) => history
                .get(prompt_id)
                .map(|entry| entry.get("outputs").is_some())
                .unwrap_or(false),
            Err(e) => {
                debug!(prompt_id, error = %e, "history poll failed");
                false
            }
        }
    }

    /// Turn the artifact snapshot into the terminal `result` map.
    async fn resolve_outputs(
        &self,
        snapshot: &BTreeMap<String, Value>,
    ) -> Result<Map<String, Value>, JobError> {
        let mut result = Map::new();
        for field in &self.contract.outputs {
            let raw = snapshot
                .get(&field.name)
                .ok_or_else(|| JobError::missing_artifacts(std::slice::from_ref(&field.name)))?;

            let value = if field.ty.is_media() {
                self.resolve_media_output(field.name.as_str(), &field.ty.to_string(), raw)
                    .await?
            } else {
                let scalar = field
                    .ty
                    .as_scalar()
                    .ok_or_else(|| JobError::system("non-scalar field without media tag"))?;
                coerce_scalar_output(scalar, raw).map_err(|e| JobError::output_type(e.detail))?
            };
            result.insert(field.name.clone(), value);
        }
        Ok(result)
    }

    /// A media artifact is normally a file id written by the output node.
    /// An engine image reference (`{filename, subfolder, type}`) is
    /// fetched and registered on the node's behalf.
    async fn resolve_media_output(
        &self,
        name: &str,
        media_type: &str,
        raw: &Value,
    ) -> Result<Value, JobError> {
        if let Value::String(s) = raw {
            if is_file_id(s) {
                let known = self
                    .files
                    .get_file(s)
                    .map_err(|e| JobError::file_store(e.to_string()))?
                    .is_some();
                if !known {
                    return Err(JobError::file_store(format!("unregistered_file_id:{name}")));
                }
                return Ok(raw.clone());
            }
        }

        if let Value::Object(reference) = raw {
            if let Some(filename) = reference.get("filename").and_then(Value::as_str) {
                let subfolder = reference
                    .get("subfolder")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let view_type = reference
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("output");
                let bytes = self
                    .engine
                    .view_media(filename, subfolder, view_type)
                    .await
                    .map_err(|e| JobError::system(format!("view_media:{e}")))?;
                let record = self
                    .files
                    .create_file(
                        &bytes,
                        media_type,
                        FileSource::Generated,
                        self.config.app_id.as_deref(),
                        filename,
                    )
                    .map_err(|e| JobError::file_store(e.to_string()))?;
                return Ok(Value::String(record.file_id));
            }
        }

        Err(JobError::output_type(format!("expected_file_id:{name}")))
    }
}
