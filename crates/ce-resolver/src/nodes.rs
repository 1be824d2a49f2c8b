// SPDX-License-Identifier: MIT OR Apache-2.0
//! Custom-node installation: shallow clone plus Python dependency setup.

use crate::spec::ArtifactSpec;
use serde_json::{json, Value};
use std::path::Path;
use tokio::process::Command;
use tracing::{info, warn};

/// Directory name a repo URL clones into (basename, `.git` stripped).
pub fn repo_dir_name(source_url: &str) -> Option<String> {
    let trimmed = source_url.trim_end_matches('/');
    let base = trimmed.rsplit('/').next()?;
    let base = base.strip_suffix(".git").unwrap_or(base);
    if base.is_empty() {
        return None;
    }
    Some(base.to_string())
}

/// Ensure every declared custom node exists under `custom_nodes_root`.
///
/// Absent repos are shallow-cloned at their declared ref; a
/// `requirements.txt` found after the clone is installed with pip. Any
/// repo whose directory still does not exist afterwards is reported.
///
/// Returns the directory names that are present on success, or the list of
/// failure detail objects on error.
pub async fn install_custom_nodes(
    specs: &[&ArtifactSpec],
    custom_nodes_root: &Path,
) -> Result<Vec<String>, Vec<Value>> {
    let mut installed = Vec::new();
    let mut failed: Vec<Value> = Vec::new();

    for spec in specs {
        let Some(dir_name) = repo_dir_name(&spec.source_url) else {
            failed.push(json!({
                "source_url": spec.source_url,
                "detail": "cannot derive directory name from repo URL",
            }));
            continue;
        };
        let dest = custom_nodes_root.join(&dir_name);

        if !dest.exists() {
            if let Err(detail) = clone_repo(&spec.source_url, spec.git_ref.as_deref(), &dest).await
            {
                failed.push(json!({
                    "source_url": spec.source_url,
                    "detail": detail,
                }));
                continue;
            }
            install_python_requirements(&dest).await;
        }

        if dest.is_dir() {
            installed.push(dir_name);
        } else {
            failed.push(json!({
                "source_url": spec.source_url,
                "detail": "clone directory missing after install",
            }));
        }
    }

    if failed.is_empty() {
        Ok(installed)
    } else {
        Err(failed)
    }
}

async fn clone_repo(source_url: &str, git_ref: Option<&str>, dest: &Path) -> Result<(), String> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }

    let mut cmd = Command::new("git");
    cmd.arg("clone").arg("--depth").arg("1");
    if let Some(git_ref) = git_ref {
        cmd.arg("--branch").arg(git_ref);
    }
    cmd.arg(source_url).arg(dest);

    info!(url = %source_url, dest = %dest.display(), "cloning custom node");
    let output = cmd.output().await.map_err(|e| format!("git spawn: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "git clone exited {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

/// Best-effort `pip install -r requirements.txt`; a failure here is logged
/// but does not fail resolution since many node packs vend optional deps.
async fn install_python_requirements(repo_dir: &Path) {
    let requirements = repo_dir.join("requirements.txt");
    if !requirements.is_file() {
        return;
    }

    let result = Command::new("pip")
        .arg("install")
        .arg("-r")
        .arg(&requirements)
        .output()
        .await;
    match result {
        Ok(output) if output.status.success() => {
            info!(repo = %repo_dir.display(), "python requirements installed");
        }
        Ok(output) => {
            warn!(
                repo = %repo_dir.display(),
                status = %output.status,
                "pip install failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Err(e) => warn!(repo = %repo_dir.display(), error = %e, "pip unavailable"),
    }
}
