// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deploy-time artifact declarations.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::symlinks::MODEL_SUBDIRS;

/// What an [`ArtifactSpec`] declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Model,
    CustomNode,
}

/// One declared artifact: a model file the graph references, or a custom
/// node repo providing graph node classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    #[serde(default = "default_kind")]
    pub kind: ArtifactKind,
    /// Catalog filename the graph references (models only).
    #[serde(rename = "match", default)]
    pub match_name: String,
    pub source_url: String,
    /// One of the fixed model subdirs (models only).
    #[serde(default)]
    pub target_subdir: String,
    /// Path under the subdir, preserving nested prefixes (models only).
    #[serde(default)]
    pub target_path: String,
    /// Branch or tag to clone (custom nodes only).
    #[serde(rename = "ref", default)]
    pub git_ref: Option<String>,
    /// Node classes the repo supplies (custom nodes only).
    #[serde(default)]
    pub provides: Vec<String>,
}

fn default_kind() -> ArtifactKind {
    ArtifactKind::Model
}

/// Declaration errors found while validating artifact specs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("artifacts[{index}]: source_url must be non-empty")]
    EmptySourceUrl { index: usize },

    #[error("artifacts[{index}]: match/target_path must be non-empty for models")]
    IncompleteModel { index: usize },

    #[error("artifacts[{index}]: invalid target_subdir '{subdir}'")]
    InvalidTargetSubdir { index: usize, subdir: String },
}

impl ArtifactSpec {
    /// Validate a list of declarations.
    pub fn validate_all(specs: &[ArtifactSpec]) -> Result<(), SpecError> {
        for (index, spec) in specs.iter().enumerate() {
            if spec.source_url.trim().is_empty() {
                return Err(SpecError::EmptySourceUrl { index });
            }
            if spec.kind == ArtifactKind::Model {
                if spec.match_name.trim().is_empty() || spec.target_path.trim().is_empty() {
                    return Err(SpecError::IncompleteModel { index });
                }
                if !MODEL_SUBDIRS.contains(&spec.target_subdir.as_str()) {
                    return Err(SpecError::InvalidTargetSubdir {
                        index,
                        subdir: spec.target_subdir.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// All names this spec can be matched under: full string and basename
    /// of both `match` and `target_path`.
    pub fn match_candidates(&self) -> HashSet<String> {
        let mut out = filename_candidates(&self.match_name);
        out.extend(filename_candidates(&self.target_path));
        out
    }
}

/// Candidates for one filename: the value itself plus its basename, empty
/// strings dropped. Graph references sometimes carry a subpath prefix
/// (`flux/clip_l.safetensors`) while catalogs list bare names.
pub fn filename_candidates(raw: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return out;
    }
    out.insert(trimmed.to_string());
    if let Some(base) = Path::new(trimmed).file_name().and_then(|n| n.to_str()) {
        out.insert(base.to_string());
    }
    out
}
