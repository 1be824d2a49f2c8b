// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pre-start artifact resolution.
//!
//! Before the gateway is exposed, every model file and custom-node class
//! the graph needs must exist on disk. The resolver walks the preflight
//! graph for requirements, reconciles them against the app's declared
//! [`ArtifactSpec`]s, installs what is missing, and verifies the result.
//!
//! Ordering matters: symlinks first (downloads target the final cache
//! path), then custom nodes (model catalogs may live inside them), then
//! models, then a verify pass.
//!
//! A failure is a first-class terminal state, not a crash: the structured
//! [`ResolverFailure`] payload is served verbatim by the degraded endpoint
//! so deployment monitors can collect the exact diagnosis.

#![deny(unsafe_code)]

mod download;
mod nodes;
mod scan;
mod spec;
mod symlinks;

pub use download::{download_with_resume, DownloadError};
pub use nodes::{install_custom_nodes, repo_dir_name};
pub use scan::{scan_model_requirements, scan_node_classes, ModelRequirement};
pub use spec::{filename_candidates, ArtifactKind, ArtifactSpec, SpecError};
pub use symlinks::{ensure_model_roots_on_cache, MODEL_SUBDIRS};

use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Wire value of `details.unresolved_models[].reason` when a required model
/// has no declared artifact.
pub const REASON_NOT_DECLARED: &str = "required_model_not_declared_in_app_artifacts";

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Structured failure payload served by the degraded endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ResolverFailure {
    pub status: String,
    pub stage: String,
    pub message: String,
    pub details: Value,
}

impl ResolverFailure {
    fn new(stage: &str, message: impl Into<String>, details: Value) -> Self {
        Self {
            status: "artifact_resolver_failed".into(),
            stage: stage.into(),
            message: message.into(),
            details,
        }
    }
}

/// One model requirement matched to its declared artifact.
#[derive(Debug, Clone, Serialize)]
pub struct MatchedModel {
    pub class_type: String,
    pub input_name: String,
    pub requested_filename: String,
    pub target_subdir: String,
    pub target_path: String,
    pub source_url: String,
}

/// What the resolver did on success.
#[derive(Debug, Default)]
pub struct ResolverReport {
    pub installed_nodes: Vec<String>,
    pub matched_models: Vec<MatchedModel>,
    pub downloaded_models: Vec<PathBuf>,
}

/// On-disk layout the resolver works against.
#[derive(Debug, Clone)]
pub struct ResolverContext {
    /// The engine's models directory (its subdirs become symlinks).
    pub engine_models_root: PathBuf,
    /// Cache directory the symlinks point into and downloads land in.
    pub cache_models_root: PathBuf,
    /// Directory custom nodes are cloned into.
    pub custom_nodes_root: PathBuf,
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Run the full resolution pipeline against a preflight graph payload.
pub async fn resolve_artifacts(
    preflight: &Value,
    specs: &[ArtifactSpec],
    ctx: &ResolverContext,
) -> Result<ResolverReport, ResolverFailure> {
    let mut report = ResolverReport::default();

    // 1. Symlink reconciliation.
    if let Err(e) = ensure_model_roots_on_cache(&ctx.engine_models_root, &ctx.cache_models_root) {
        return Err(ResolverFailure::new(
            "symlinks",
            "failed to reconcile model directories onto the cache",
            json!({"error": e.to_string()}),
        ));
    }

    // 2. Requirements from the preflight graph.
    let requirements = scan_model_requirements(preflight);
    info!(count = requirements.len(), "model requirements scanned");

    // 3. Custom nodes before models.
    let node_specs: Vec<&ArtifactSpec> = specs
        .iter()
        .filter(|s| s.kind == ArtifactKind::CustomNode)
        .collect();
    match install_custom_nodes(&node_specs, &ctx.custom_nodes_root).await {
        Ok(installed) => report.installed_nodes = installed,
        Err(failed) => {
            return Err(ResolverFailure::new(
                "custom_nodes",
                "one or more custom nodes could not be installed",
                json!({"failed_nodes": failed}),
            ));
        }
    }

    // 4. Model pass.
    let mut unresolved: Vec<Value> = Vec::new();
    for requirement in &requirements {
        let matched = specs
            .iter()
            .filter(|s| s.kind == ArtifactKind::Model)
            .find(|s| {
                !requirement
                    .filename_candidates()
                    .is_disjoint(&s.match_candidates())
            });
        let Some(spec) = matched else {
            warn!(
                filename = %requirement.filename,
                class_type = %requirement.class_type,
                "required model not declared"
            );
            unresolved.push(json!({
                "reason": REASON_NOT_DECLARED,
                "class_type": requirement.class_type,
                "input_name": requirement.input_name,
                "filename": requirement.filename,
            }));
            continue;
        };

        let target = ctx
            .cache_models_root
            .join(&spec.target_subdir)
            .join(&spec.target_path);
        if !target.exists() {
            if let Err(e) = download_with_resume(&spec.source_url, &target).await {
                unresolved.push(json!({
                    "reason": "download_failed",
                    "filename": requirement.filename,
                    "source_url": spec.source_url,
                    "detail": e.to_string(),
                }));
                continue;
            }
            report.downloaded_models.push(target.clone());
        }
        report.matched_models.push(MatchedModel {
            class_type: requirement.class_type.clone(),
            input_name: requirement.input_name.clone(),
            requested_filename: requirement.filename.clone(),
            target_subdir: spec.target_subdir.clone(),
            target_path: spec.target_path.clone(),
            source_url: spec.source_url.clone(),
        });
    }
    if !unresolved.is_empty() {
        return Err(ResolverFailure::new(
            "models",
            "one or more required models could not be resolved",
            json!({"unresolved_models": unresolved}),
        ));
    }

    // 5. Verify every declared model artifact landed.
    let missing = verify_declared_paths(specs, &ctx.cache_models_root);
    if !missing.is_empty() {
        return Err(ResolverFailure::new(
            "verify",
            "declared artifacts missing after resolution",
            json!({"missing_paths": missing}),
        ));
    }

    Ok(report)
}

/// Expected on-disk paths for every declared model artifact that the graph
/// actually referenced, re-checked after downloads.
fn verify_declared_paths(specs: &[ArtifactSpec], cache_models_root: &Path) -> Vec<String> {
    specs
        .iter()
        .filter(|s| s.kind == ArtifactKind::Model)
        .map(|s| cache_models_root.join(&s.target_subdir).join(&s.target_path))
        .filter(|path| !path.exists())
        .map(|path| path.display().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn preflight_with_unet() -> Value {
        json!({
            "prompt": {
                "2": {"class_type": "UNETLoader", "inputs": {"unet_name": "weights.safetensors"}},
                "9": {"class_type": "ApiOutput", "inputs": {"value": ""}}
            }
        })
    }

    fn ctx(root: &Path) -> ResolverContext {
        ResolverContext {
            engine_models_root: root.join("engine_models"),
            cache_models_root: root.join("cache_models"),
            custom_nodes_root: root.join("custom_nodes"),
        }
    }

    #[tokio::test]
    async fn undeclared_model_yields_structured_failure() {
        let dir = tempfile::tempdir().unwrap();
        let failure = resolve_artifacts(&preflight_with_unet(), &[], &ctx(dir.path()))
            .await
            .unwrap_err();

        assert_eq!(failure.status, "artifact_resolver_failed");
        assert_eq!(failure.stage, "models");
        let unresolved = failure.details["unresolved_models"].as_array().unwrap();
        assert_eq!(unresolved[0]["reason"], REASON_NOT_DECLARED);
        assert_eq!(unresolved[0]["filename"], "weights.safetensors");
        assert_eq!(unresolved[0]["input_name"], "unet_name");
    }

    #[tokio::test]
    async fn declared_and_present_model_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        // Model already on disk, so no download happens.
        let target_dir = ctx.cache_models_root.join("diffusion_models");
        std::fs::create_dir_all(&target_dir).unwrap();
        std::fs::write(target_dir.join("weights.safetensors"), b"weights").unwrap();

        let specs = vec![ArtifactSpec {
            kind: ArtifactKind::Model,
            match_name: "weights.safetensors".into(),
            source_url: "https://example.invalid/weights.safetensors".into(),
            target_subdir: "diffusion_models".into(),
            target_path: "weights.safetensors".into(),
            git_ref: None,
            provides: Vec::new(),
        }];

        let report = resolve_artifacts(&preflight_with_unet(), &specs, &ctx)
            .await
            .unwrap();
        assert_eq!(report.matched_models.len(), 1);
        assert_eq!(report.matched_models[0].target_subdir, "diffusion_models");
        assert!(report.downloaded_models.is_empty());
    }

    #[tokio::test]
    async fn graph_without_requirements_resolves_trivially() {
        let dir = tempfile::tempdir().unwrap();
        let preflight = json!({
            "prompt": {"9": {"class_type": "ApiOutput", "inputs": {"value": ""}}}
        });
        let report = resolve_artifacts(&preflight, &[], &ctx(dir.path()))
            .await
            .unwrap();
        assert!(report.matched_models.is_empty());
    }

    #[tokio::test]
    async fn verify_catches_declared_but_absent_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        // Spec declared, not referenced by the graph, and its file is
        // missing: the model pass skips it but verify must flag it.
        let specs = vec![ArtifactSpec {
            kind: ArtifactKind::Model,
            match_name: "other.safetensors".into(),
            source_url: "https://example.invalid/other.safetensors".into(),
            target_subdir: "vae".into(),
            target_path: "other.safetensors".into(),
            git_ref: None,
            provides: Vec::new(),
        }];
        let preflight = json!({
            "prompt": {"9": {"class_type": "ApiOutput", "inputs": {"value": ""}}}
        });

        let failure = resolve_artifacts(&preflight, &specs, &ctx).await.unwrap_err();
        assert_eq!(failure.stage, "verify");
        let missing = failure.details["missing_paths"].as_array().unwrap();
        assert_eq!(missing.len(), 1);
    }

    #[test]
    fn failure_payload_serializes_with_stable_keys() {
        let failure = ResolverFailure::new("models", "nope", json!({"unresolved_models": []}));
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["status"], "artifact_resolver_failed");
        assert_eq!(value["stage"], "models");
        assert_eq!(value["message"], "nope");
        assert!(value["details"]["unresolved_models"].is_array());
    }
}
