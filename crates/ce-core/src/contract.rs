// SPDX-License-Identifier: MIT OR Apache-2.0
//! Workflow contract records and load-time validation.

use crate::value::FieldType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One declared input of a workflow contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    pub required: bool,
    pub node_id: String,
}

/// One declared output of a workflow contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    pub node_id: String,
}

/// A typed declaration binding the HTTP surface to graph nodes.
///
/// Immutable after load; every later stage (validation, mapping, execution)
/// borrows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContract {
    pub contract_id: String,
    pub version: String,
    pub inputs: Vec<InputField>,
    pub outputs: Vec<OutputField>,
}

/// Errors raised while loading or validating a contract file.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("failed to read contract file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("contract is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid contract: {0}")]
    Invalid(String),
}

impl WorkflowContract {
    /// Parse and validate a contract from its JSON text.
    pub fn from_json_str(raw: &str) -> Result<Self, ContractError> {
        let contract: Self = serde_json::from_str(raw)?;
        contract.validate()?;
        Ok(contract)
    }

    /// Load and validate a contract from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ContractError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ContractError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Enforce the structural invariants: at least one field per side,
    /// non-empty unique names per side.
    ///
    /// Field types are validated implicitly by [`FieldType`] deserialization.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.contract_id.trim().is_empty() {
            return Err(ContractError::Invalid("contract_id must be non-empty".into()));
        }
        if self.inputs.is_empty() {
            return Err(ContractError::Invalid(
                "contract must declare at least one input".into(),
            ));
        }
        if self.outputs.is_empty() {
            return Err(ContractError::Invalid(
                "contract must declare at least one output".into(),
            ));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for field in &self.inputs {
            let name = field.name.trim();
            if name.is_empty() {
                return Err(ContractError::Invalid("input names must be non-empty".into()));
            }
            if !seen.insert(name) {
                return Err(ContractError::Invalid(format!(
                    "duplicate input name: {name}"
                )));
            }
        }

        seen.clear();
        for field in &self.outputs {
            let name = field.name.trim();
            if name.is_empty() {
                return Err(ContractError::Invalid(
                    "output names must be non-empty".into(),
                ));
            }
            if !seen.insert(name) {
                return Err(ContractError::Invalid(format!(
                    "duplicate output name: {name}"
                )));
            }
        }

        Ok(())
    }

    /// Look up an input by name.
    pub fn input(&self, name: &str) -> Option<&InputField> {
        self.inputs.iter().find(|f| f.name == name)
    }

    /// Names of all outputs, in declaration order. This is the expected
    /// artifact set for a job.
    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|f| f.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn demo_contract_json() -> serde_json::Value {
        json!({
            "contract_id": "demo-contract",
            "version": "v1",
            "inputs": [
                {"name": "prompt", "type": "string", "required": true, "node_id": "1"}
            ],
            "outputs": [
                {"name": "caption", "type": "string", "node_id": "10"}
            ]
        })
    }

    #[test]
    fn loads_valid_contract() {
        let contract = WorkflowContract::from_json_str(&demo_contract_json().to_string()).unwrap();
        assert_eq!(contract.contract_id, "demo-contract");
        assert_eq!(contract.inputs.len(), 1);
        assert_eq!(contract.outputs[0].node_id, "10");
        assert_eq!(contract.output_names(), vec!["caption".to_string()]);
    }

    #[test]
    fn contract_echo_is_stable() {
        let contract = WorkflowContract::from_json_str(&demo_contract_json().to_string()).unwrap();
        let echoed = serde_json::to_value(&contract).unwrap();
        assert_eq!(echoed, demo_contract_json());
    }

    #[test]
    fn rejects_empty_sides() {
        let mut raw = demo_contract_json();
        raw["inputs"] = json!([]);
        assert!(WorkflowContract::from_json_str(&raw.to_string()).is_err());

        let mut raw = demo_contract_json();
        raw["outputs"] = json!([]);
        assert!(WorkflowContract::from_json_str(&raw.to_string()).is_err());
    }

    #[test]
    fn rejects_duplicate_names_per_side() {
        let mut raw = demo_contract_json();
        raw["inputs"] = json!([
            {"name": "prompt", "type": "string", "required": true, "node_id": "1"},
            {"name": "prompt", "type": "string", "required": false, "node_id": "2"}
        ]);
        let err = WorkflowContract::from_json_str(&raw.to_string()).unwrap_err();
        assert!(err.to_string().contains("duplicate input name"));
    }

    #[test]
    fn same_name_on_both_sides_is_allowed() {
        let mut raw = demo_contract_json();
        raw["outputs"] = json!([{"name": "prompt", "type": "string", "node_id": "9"}]);
        assert!(WorkflowContract::from_json_str(&raw.to_string()).is_ok());
    }

    #[test]
    fn rejects_unknown_field_type() {
        let mut raw = demo_contract_json();
        raw["inputs"][0]["type"] = json!("text/plain");
        assert!(WorkflowContract::from_json_str(&raw.to_string()).is_err());
    }

    #[test]
    fn input_lookup() {
        let contract = WorkflowContract::from_json_str(&demo_contract_json().to_string()).unwrap();
        assert!(contract.input("prompt").is_some());
        assert!(contract.input("missing").is_none());
    }
}
