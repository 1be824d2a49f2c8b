// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph scanning for model references and node classes.

use crate::spec::filename_candidates;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

/// Generic model-reference slots: input name → target subdir. These hold
/// regardless of node class.
const MODEL_SLOTS: &[(&str, &str)] = &[
    ("ckpt_name", "checkpoints"),
    ("unet_name", "diffusion_models"),
    ("clip_name", "text_encoders"),
    ("clip_name1", "text_encoders"),
    ("clip_name2", "text_encoders"),
    ("vae_name", "vae"),
    ("lora_name", "loras"),
    ("control_net_name", "controlnet"),
];

/// Per-class overrides for loader nodes whose slot names fall outside the
/// generic table.
const MODEL_SLOT_OVERRIDES: &[(&str, &str, &str)] = &[
    ("TripleCLIPLoader", "clip_name3", "text_encoders"),
    ("DiffusersLoader", "model_path", "diffusion_models"),
];

/// One model file the graph needs, with the subdir it must land in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRequirement {
    pub class_type: String,
    pub input_name: String,
    pub filename: String,
    pub target_subdir: String,
}

impl ModelRequirement {
    /// Candidate names for matching against artifact declarations.
    pub fn filename_candidates(&self) -> HashSet<String> {
        filename_candidates(&self.filename)
    }
}

fn subdir_for(class_type: &str, input_name: &str) -> Option<&'static str> {
    if let Some((_, _, subdir)) = MODEL_SLOT_OVERRIDES
        .iter()
        .find(|(class, input, _)| *class == class_type && *input == input_name)
    {
        return Some(subdir);
    }
    MODEL_SLOTS
        .iter()
        .find(|(slot, _)| *slot == input_name)
        .map(|(_, subdir)| *subdir)
}

fn graph_nodes(payload: &Value) -> Option<&serde_json::Map<String, Value>> {
    payload
        .get("prompt")
        .and_then(Value::as_object)
        .or_else(|| payload.as_object())
}

/// Walk every node and collect model references from known slots. Link
/// values (`[source, idx]` tuples) are not filenames and are skipped.
pub fn scan_model_requirements(payload: &Value) -> Vec<ModelRequirement> {
    let mut out = Vec::new();
    let Some(nodes) = graph_nodes(payload) else {
        return out;
    };

    for node in nodes.values() {
        let Some(class_type) = node.get("class_type").and_then(Value::as_str) else {
            continue;
        };
        let Some(inputs) = node.get("inputs").and_then(Value::as_object) else {
            continue;
        };
        for (input_name, value) in inputs {
            let Some(filename) = value.as_str() else {
                continue;
            };
            if filename.trim().is_empty() {
                continue;
            }
            let Some(subdir) = subdir_for(class_type, input_name) else {
                continue;
            };
            out.push(ModelRequirement {
                class_type: class_type.to_string(),
                input_name: input_name.clone(),
                filename: filename.to_string(),
                target_subdir: subdir.to_string(),
            });
        }
    }
    out
}

/// Distinct node classes used by the graph.
pub fn scan_node_classes(payload: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let Some(nodes) = graph_nodes(payload) else {
        return out;
    };
    for node in nodes.values() {
        if let Some(class_type) = node.get("class_type").and_then(Value::as_str) {
            out.insert(class_type.to_string());
        }
    }
    out
}
