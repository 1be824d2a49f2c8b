// SPDX-License-Identifier: MIT OR Apache-2.0
//! Core model types for the comfy-endpoints in-pod runtime.
//!
//! This crate holds everything the other crates agree on: the workflow
//! contract and its load-time invariants, the runtime-defined field type
//! union (scalar tags ∪ media MIME tags) with output coercion, job and file
//! records, opaque id formats, and the stable job error taxonomy.

#![deny(unsafe_code)]

mod contract;
mod error;
mod ids;
mod job;
mod value;

pub use contract::{ContractError, InputField, OutputField, WorkflowContract};
pub use error::{JobError, JobErrorKind};
pub use ids::{is_file_id, new_file_id, new_job_id, FILE_ID_PREFIX};
pub use job::{FileRecord, FileSource, JobOutput, JobRecord, JobState};
pub use value::{coerce_scalar_output, CoercionError, FieldType, ScalarType, UnsupportedFieldType};
