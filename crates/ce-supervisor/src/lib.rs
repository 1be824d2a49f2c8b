// SPDX-License-Identifier: MIT OR Apache-2.0
//! Supervisor building blocks.
//!
//! The binary in `main.rs` wires these together: materialize the contract
//! and workflow onto disk, reconcile the content cache, resolve artifacts,
//! bring the engine up, prove the graph with a preflight submission, and
//! only then expose the gateway. When artifact resolution fails, the
//! degraded server takes the gateway's place and serves the exact
//! diagnosis.

#![deny(unsafe_code)]

pub mod cache;
pub mod degraded;
pub mod engine;
pub mod materialize;
