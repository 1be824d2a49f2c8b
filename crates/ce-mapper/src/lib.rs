// SPDX-License-Identifier: MIT OR Apache-2.0
//! Contract ↔ graph mapping.
//!
//! Three jobs: normalize whatever workflow shape was exported into a flat
//! `{node_id → {class_type, inputs}}` graph, overwrite the bound input
//! slots with request payload values, and annotate every api-output node
//! with the per-job runtime coordinates the engine-side node
//! implementations need to persist artifacts.
//!
//! The graph is otherwise opaque: links (`[source, idx]` tuples) are
//! copied through untouched and never traversed here.

#![deny(unsafe_code)]

use ce_core::WorkflowContract;
use serde_json::{Map, Value};

/// Node class names reserved for contract fields (compared
/// case-insensitively after trimming).
const API_INPUT_CLASS: &str = "apiinput";
const API_OUTPUT_CLASS: &str = "apioutput";

/// Annotation slots written into every api-output node.
const ANNOTATION_JOB_ID: &str = "ce_job_id";
const ANNOTATION_ARTIFACTS_DIR: &str = "ce_artifacts_dir";
const ANNOTATION_STATE_DB: &str = "ce_state_db";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Mapping failures. The `Display` form of the payload-level variants is
/// the wire detail carried by `VALIDATION_ERROR:<detail>`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromptMappingError {
    /// No recognized workflow shape was present.
    #[error("unrecognized_workflow_shape")]
    UnrecognizedShape,

    /// A required contract input was absent from the payload.
    #[error("missing_required_input:{0}")]
    MissingRequiredInput(String),

    /// The node a contract field binds to does not exist in the graph.
    #[error("missing_contract_node:{0}")]
    MissingContractNode(String),

    /// The bound node exists but its `inputs` is not an object.
    #[error("invalid_contract_node_inputs:{0}")]
    InvalidContractNodeInputs(String),

    /// A contract output's node is missing from the workflow.
    #[error("missing_output_node:{name}:{node_id}")]
    OutputNodeMissing { name: String, node_id: String },

    /// A contract output's node is not an api-output node.
    #[error("output_node_not_api_output:{name}:{node_id}")]
    OutputNodeWrongClass { name: String, node_id: String },
}

// ---------------------------------------------------------------------------
// Runtime coordinates for output-node annotations
// ---------------------------------------------------------------------------

/// Where the engine-side output nodes should persist artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapperEnv {
    pub artifacts_dir: String,
    pub state_db: String,
}

// ---------------------------------------------------------------------------
// Template normalization
// ---------------------------------------------------------------------------

fn is_api_class(class_type: &str, expected: &str) -> bool {
    class_type.trim().eq_ignore_ascii_case(expected)
}

/// Recover positional widget values for the reserved node classes.
///
/// UI-shaped exports store widget values as a positional list; api-input
/// nodes carry `[name, type, required, value]` and api-output nodes
/// `[name, type, value]`. Missing positions fall back to the node-class
/// defaults. Recovered entries never overwrite explicit `inputs` keys.
fn inputs_from_widgets(class_type: &str, widgets: &[Value]) -> Map<String, Value> {
    let mut out = Map::new();
    let at = |i: usize, default: Value| widgets.get(i).cloned().unwrap_or(default);

    if is_api_class(class_type, API_INPUT_CLASS) {
        out.insert("name".into(), at(0, Value::String("prompt".into())));
        out.insert("type".into(), at(1, Value::String("string".into())));
        out.insert("required".into(), at(2, Value::Bool(true)));
        out.insert("value".into(), at(3, Value::String(String::new())));
    } else if is_api_class(class_type, API_OUTPUT_CLASS) {
        out.insert("name".into(), at(0, Value::String("output".into())));
        out.insert("type".into(), at(1, Value::String("string".into())));
        out.insert("value".into(), at(2, Value::String(String::new())));
    }
    out
}

fn graph_from_nodes_list(nodes: &[Value]) -> Map<String, Value> {
    let mut graph = Map::new();
    for node in nodes {
        let Some(node) = node.as_object() else {
            continue;
        };
        let Some(node_id) = node.get("id") else {
            continue;
        };
        let node_id = match node_id {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        let class_type = node
            .get("class_type")
            .or_else(|| node.get("type"))
            .and_then(Value::as_str);
        let Some(class_type) = class_type else {
            continue;
        };

        let mut inputs = node
            .get("inputs")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        if let Some(widgets) = node.get("widgets_values").and_then(Value::as_array) {
            for (key, value) in inputs_from_widgets(class_type, widgets) {
                inputs.entry(key).or_insert(value);
            }
        }

        let mut normalized = Map::new();
        normalized.insert("class_type".into(), Value::String(class_type.to_string()));
        normalized.insert("inputs".into(), Value::Object(inputs));
        graph.insert(node_id, Value::Object(normalized));
    }
    graph
}

/// Normalize a workflow payload into a flat `{node_id → node}` graph.
///
/// Accepted shapes, in preference order: an object wrapped under `prompt`,
/// a UI-shaped `{nodes: [...]}` list, or an already-flat graph object.
pub fn parse_prompt_template(workflow: &Value) -> Result<Map<String, Value>, PromptMappingError> {
    if let Some(prompt) = workflow.get("prompt").and_then(Value::as_object) {
        return Ok(prompt.clone());
    }

    if let Some(nodes) = workflow.get("nodes").and_then(Value::as_array) {
        let graph = graph_from_nodes_list(nodes);
        if !graph.is_empty() {
            return Ok(graph);
        }
    }

    if let Some(top) = workflow.as_object() {
        if !top.is_empty()
            && top.values().all(Value::is_object)
            && top
                .values()
                .any(|node| node.get("class_type").is_some())
        {
            return Ok(top.clone());
        }
    }

    Err(PromptMappingError::UnrecognizedShape)
}

// ---------------------------------------------------------------------------
// Binding & annotation
// ---------------------------------------------------------------------------

/// Pick the slot that receives a contract input's value: the field name if
/// the node already has it, else `value`, else the node's only key, else
/// the field name as a fresh key.
fn resolve_input_key(node_inputs: &Map<String, Value>, preferred: &str) -> String {
    if node_inputs.contains_key(preferred) {
        return preferred.to_string();
    }
    if node_inputs.contains_key("value") {
        return "value".to_string();
    }
    if node_inputs.len() == 1 {
        if let Some(only) = node_inputs.keys().next() {
            return only.clone();
        }
    }
    preferred.to_string()
}

/// Build the engine submission for one job.
///
/// Produces a deep clone of the normalized graph with every contract input
/// bound and every api-output node annotated, wrapped as `{"prompt": ...}`.
pub fn map_payload(
    workflow: &Value,
    contract: &WorkflowContract,
    input_payload: &Map<String, Value>,
    job_id: Option<&str>,
    env: &MapperEnv,
) -> Result<Value, PromptMappingError> {
    let mut graph = parse_prompt_template(workflow)?;

    for field in &contract.inputs {
        if field.required && !input_payload.contains_key(&field.name) {
            return Err(PromptMappingError::MissingRequiredInput(field.name.clone()));
        }

        let node = graph
            .get_mut(&field.node_id)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| PromptMappingError::MissingContractNode(field.node_id.clone()))?;
        let inputs = node
            .get_mut("inputs")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| PromptMappingError::InvalidContractNodeInputs(field.node_id.clone()))?;

        if let Some(value) = input_payload.get(&field.name) {
            let key = resolve_input_key(inputs, &field.name);
            inputs.insert(key, value.clone());
        }
    }

    let job_id = job_id.unwrap_or("");
    for node in graph.values_mut() {
        let Some(node) = node.as_object_mut() else {
            continue;
        };
        let is_output = node
            .get("class_type")
            .and_then(Value::as_str)
            .map(|c| is_api_class(c, API_OUTPUT_CLASS))
            .unwrap_or(false);
        if !is_output {
            continue;
        }
        let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
            continue;
        };
        inputs.insert(ANNOTATION_JOB_ID.into(), Value::String(job_id.to_string()));
        inputs.insert(
            ANNOTATION_ARTIFACTS_DIR.into(),
            Value::String(env.artifacts_dir.clone()),
        );
        inputs.insert(ANNOTATION_STATE_DB.into(), Value::String(env.state_db.clone()));
    }

    let mut wrapped = Map::new();
    wrapped.insert("prompt".into(), Value::Object(graph));
    Ok(Value::Object(wrapped))
}

/// Build the startup submission: every contract input filled with its
/// type-default so the engine resolves every model reference up front.
pub fn build_preflight_payload(
    workflow: &Value,
    contract: &WorkflowContract,
    env: &MapperEnv,
) -> Result<Value, PromptMappingError> {
    let mut defaults = Map::new();
    for field in &contract.inputs {
        defaults.insert(field.name.clone(), field.ty.default_value());
    }
    map_payload(workflow, contract, &defaults, None, env)
}

// ---------------------------------------------------------------------------
// Contract-vs-graph validation
// ---------------------------------------------------------------------------

/// Check that every contract output binds to an existing api-output node.
pub fn validate_contract_nodes(
    workflow: &Value,
    contract: &WorkflowContract,
) -> Result<(), PromptMappingError> {
    let graph = parse_prompt_template(workflow)?;

    for field in &contract.outputs {
        let class_type = graph
            .get(&field.node_id)
            .and_then(|node| node.get("class_type"))
            .and_then(Value::as_str);
        match class_type {
            None => {
                return Err(PromptMappingError::OutputNodeMissing {
                    name: field.name.clone(),
                    node_id: field.node_id.clone(),
                })
            }
            Some(class_type) if !is_api_class(class_type, API_OUTPUT_CLASS) => {
                return Err(PromptMappingError::OutputNodeWrongClass {
                    name: field.name.clone(),
                    node_id: field.node_id.clone(),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> MapperEnv {
        MapperEnv {
            artifacts_dir: "/var/lib/ce/artifacts".into(),
            state_db: "/var/lib/ce/state.db".into(),
        }
    }

    fn contract(raw: Value) -> WorkflowContract {
        WorkflowContract::from_json_str(&raw.to_string()).unwrap()
    }

    fn demo_contract() -> WorkflowContract {
        contract(json!({
            "contract_id": "demo",
            "version": "v1",
            "inputs": [
                {"name": "prompt", "type": "string", "required": true, "node_id": "1"}
            ],
            "outputs": [
                {"name": "caption", "type": "string", "node_id": "9"}
            ]
        }))
    }

    fn flat_workflow() -> Value {
        json!({
            "1": {"class_type": "ApiInput", "inputs": {"value": ""}},
            "5": {"class_type": "KSampler", "inputs": {"model": ["2", 0], "steps": 20}},
            "9": {"class_type": "ApiOutput", "inputs": {"name": "caption", "value": ""}}
        })
    }

    // -- Shape normalization ---------------------------------------------

    #[test]
    fn parses_prompt_wrapped_shape() {
        let wrapped = json!({"prompt": flat_workflow()});
        let graph = parse_prompt_template(&wrapped).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph["5"]["class_type"], "KSampler");
    }

    #[test]
    fn parses_flat_graph_shape() {
        let graph = parse_prompt_template(&flat_workflow()).unwrap();
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn parses_ui_nodes_shape_with_widget_recovery() {
        let workflow = json!({
            "nodes": [
                {"id": 1, "type": "ApiInput", "widgets_values": ["prompt", "string", true, "seed text"]},
                {"id": 9, "type": "ApiOutput", "widgets_values": ["caption", "string"]},
                {"id": "skip-me"},
            ]
        });
        let graph = parse_prompt_template(&workflow).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph["1"]["inputs"]["name"], "prompt");
        assert_eq!(graph["1"]["inputs"]["required"], true);
        assert_eq!(graph["1"]["inputs"]["value"], "seed text");
        // Missing third widget falls back to the class default.
        assert_eq!(graph["9"]["inputs"]["value"], "");
    }

    #[test]
    fn widget_recovery_does_not_overwrite_explicit_inputs() {
        let workflow = json!({
            "nodes": [
                {
                    "id": 1,
                    "type": "ApiInput",
                    "inputs": {"value": "explicit"},
                    "widgets_values": ["prompt", "string", true, "from-widgets"]
                }
            ]
        });
        let graph = parse_prompt_template(&workflow).unwrap();
        assert_eq!(graph["1"]["inputs"]["value"], "explicit");
    }

    #[test]
    fn unrecognized_shape_is_an_error() {
        for bad in [json!({}), json!({"version": 1}), json!([1, 2, 3]), json!(null)] {
            assert_eq!(
                parse_prompt_template(&bad).unwrap_err(),
                PromptMappingError::UnrecognizedShape,
                "accepted {bad}"
            );
        }
    }

    // -- Binding ---------------------------------------------------------

    #[test]
    fn binds_payload_value_into_value_slot() {
        let mut payload = Map::new();
        payload.insert("prompt".into(), json!("hello"));
        let mapped = map_payload(&flat_workflow(), &demo_contract(), &payload, None, &env()).unwrap();
        assert_eq!(mapped["prompt"]["1"]["inputs"]["value"], "hello");
        // Bind-then-extract yields the bound value.
        assert_eq!(
            mapped["prompt"]["1"]["inputs"]["value"],
            payload["prompt"]
        );
    }

    #[test]
    fn prefers_slot_named_after_the_field() {
        let workflow = json!({
            "1": {"class_type": "ApiInput", "inputs": {"prompt": "", "value": "other"}},
            "9": {"class_type": "ApiOutput", "inputs": {"value": ""}}
        });
        let mut payload = Map::new();
        payload.insert("prompt".into(), json!("hello"));
        let mapped = map_payload(&workflow, &demo_contract(), &payload, None, &env()).unwrap();
        assert_eq!(mapped["prompt"]["1"]["inputs"]["prompt"], "hello");
        assert_eq!(mapped["prompt"]["1"]["inputs"]["value"], "other");
    }

    #[test]
    fn falls_back_to_unique_single_key() {
        let workflow = json!({
            "1": {"class_type": "ApiInput", "inputs": {"text": ""}},
            "9": {"class_type": "ApiOutput", "inputs": {"value": ""}}
        });
        let mut payload = Map::new();
        payload.insert("prompt".into(), json!("hello"));
        let mapped = map_payload(&workflow, &demo_contract(), &payload, None, &env()).unwrap();
        assert_eq!(mapped["prompt"]["1"]["inputs"]["text"], "hello");
    }

    #[test]
    fn multi_key_node_gains_field_named_slot() {
        let workflow = json!({
            "1": {"class_type": "ApiInput", "inputs": {"a": 1, "b": 2}},
            "9": {"class_type": "ApiOutput", "inputs": {"value": ""}}
        });
        let mut payload = Map::new();
        payload.insert("prompt".into(), json!("hello"));
        let mapped = map_payload(&workflow, &demo_contract(), &payload, None, &env()).unwrap();
        assert_eq!(mapped["prompt"]["1"]["inputs"]["prompt"], "hello");
        assert_eq!(mapped["prompt"]["1"]["inputs"]["a"], 1);
    }

    #[test]
    fn missing_required_input_is_rejected() {
        let err =
            map_payload(&flat_workflow(), &demo_contract(), &Map::new(), None, &env()).unwrap_err();
        assert_eq!(err.to_string(), "missing_required_input:prompt");
    }

    #[test]
    fn optional_input_may_be_absent() {
        let contract = contract(json!({
            "contract_id": "demo",
            "version": "v1",
            "inputs": [
                {"name": "prompt", "type": "string", "required": false, "node_id": "1"}
            ],
            "outputs": [{"name": "caption", "type": "string", "node_id": "9"}]
        }));
        let mapped = map_payload(&flat_workflow(), &contract, &Map::new(), None, &env()).unwrap();
        // Slot keeps its template value.
        assert_eq!(mapped["prompt"]["1"]["inputs"]["value"], "");
    }

    #[test]
    fn unknown_contract_node_is_rejected() {
        let contract = contract(json!({
            "contract_id": "demo",
            "version": "v1",
            "inputs": [
                {"name": "prompt", "type": "string", "required": true, "node_id": "404"}
            ],
            "outputs": [{"name": "caption", "type": "string", "node_id": "9"}]
        }));
        let mut payload = Map::new();
        payload.insert("prompt".into(), json!("hello"));
        let err = map_payload(&flat_workflow(), &contract, &payload, None, &env()).unwrap_err();
        assert_eq!(err.to_string(), "missing_contract_node:404");
    }

    #[test]
    fn node_without_inputs_object_is_rejected() {
        let workflow = json!({
            "1": {"class_type": "ApiInput", "inputs": "broken"},
            "9": {"class_type": "ApiOutput", "inputs": {"value": ""}}
        });
        let mut payload = Map::new();
        payload.insert("prompt".into(), json!("hello"));
        let err = map_payload(&workflow, &demo_contract(), &payload, None, &env()).unwrap_err();
        assert_eq!(err.to_string(), "invalid_contract_node_inputs:1");
    }

    #[test]
    fn source_workflow_is_not_mutated() {
        let workflow = flat_workflow();
        let mut payload = Map::new();
        payload.insert("prompt".into(), json!("hello"));
        let _ = map_payload(&workflow, &demo_contract(), &payload, Some("j1"), &env()).unwrap();
        assert_eq!(workflow["1"]["inputs"]["value"], "");
        assert!(workflow["9"]["inputs"].get("ce_job_id").is_none());
    }

    // -- Annotation ------------------------------------------------------

    #[test]
    fn output_nodes_receive_runtime_annotations() {
        let mut payload = Map::new();
        payload.insert("prompt".into(), json!("hello"));
        let mapped =
            map_payload(&flat_workflow(), &demo_contract(), &payload, Some("job-7"), &env())
                .unwrap();

        let inputs = &mapped["prompt"]["9"]["inputs"];
        assert_eq!(inputs["ce_job_id"], "job-7");
        assert_eq!(inputs["ce_artifacts_dir"], "/var/lib/ce/artifacts");
        assert_eq!(inputs["ce_state_db"], "/var/lib/ce/state.db");
        // Non-output nodes are untouched.
        assert!(mapped["prompt"]["5"]["inputs"].get("ce_job_id").is_none());
    }

    #[test]
    fn annotation_without_job_id_uses_empty_string() {
        let mut payload = Map::new();
        payload.insert("prompt".into(), json!("hello"));
        let mapped =
            map_payload(&flat_workflow(), &demo_contract(), &payload, None, &env()).unwrap();
        assert_eq!(mapped["prompt"]["9"]["inputs"]["ce_job_id"], "");
    }

    // -- Preflight -------------------------------------------------------

    #[test]
    fn preflight_sets_every_input_to_its_type_default() {
        let contract = contract(json!({
            "contract_id": "demo",
            "version": "v1",
            "inputs": [
                {"name": "prompt", "type": "string", "required": true, "node_id": "1"},
                {"name": "steps", "type": "integer", "required": true, "node_id": "2"},
                {"name": "strength", "type": "number", "required": false, "node_id": "3"},
                {"name": "tile", "type": "boolean", "required": false, "node_id": "4"},
                {"name": "image", "type": "image/png", "required": true, "node_id": "6"}
            ],
            "outputs": [{"name": "caption", "type": "string", "node_id": "9"}]
        }));
        let workflow = json!({
            "1": {"class_type": "ApiInput", "inputs": {"value": "x"}},
            "2": {"class_type": "ApiInput", "inputs": {"value": 20}},
            "3": {"class_type": "ApiInput", "inputs": {"value": 0.8}},
            "4": {"class_type": "ApiInput", "inputs": {"value": true}},
            "6": {"class_type": "ApiInput", "inputs": {"value": "placeholder"}},
            "5": {"class_type": "KSampler", "inputs": {"steps": 30}},
            "9": {"class_type": "ApiOutput", "inputs": {"value": ""}}
        });

        let mapped = build_preflight_payload(&workflow, &contract, &env()).unwrap();
        let graph = &mapped["prompt"];
        assert_eq!(graph["1"]["inputs"]["value"], "");
        assert_eq!(graph["2"]["inputs"]["value"], 0);
        assert_eq!(graph["3"]["inputs"]["value"], 0.0);
        assert_eq!(graph["4"]["inputs"]["value"], false);
        assert_eq!(graph["6"]["inputs"]["value"], "");
        // Unbound slots stay untouched.
        assert_eq!(graph["5"]["inputs"]["steps"], 30);
    }

    // -- Contract-vs-graph validation ------------------------------------

    #[test]
    fn validate_accepts_matching_output_nodes() {
        assert!(validate_contract_nodes(&flat_workflow(), &demo_contract()).is_ok());
    }

    #[test]
    fn validate_rejects_missing_output_node() {
        let workflow = json!({
            "1": {"class_type": "ApiInput", "inputs": {"value": ""}}
        });
        let err = validate_contract_nodes(&workflow, &demo_contract()).unwrap_err();
        assert!(matches!(err, PromptMappingError::OutputNodeMissing { .. }));
    }

    #[test]
    fn validate_rejects_wrong_output_class() {
        let workflow = json!({
            "1": {"class_type": "ApiInput", "inputs": {"value": ""}},
            "9": {"class_type": "SaveImage", "inputs": {}}
        });
        let err = validate_contract_nodes(&workflow, &demo_contract()).unwrap_err();
        assert!(matches!(err, PromptMappingError::OutputNodeWrongClass { .. }));
    }
}
