//! Domain types and pure logic for the imgflow workflow service.
//!
//! Everything here is free of storage concerns: status codes, service
//! entries, the workflow dependency graph, process and collection records,
//! and the container runtime abstraction used by the job queue.

pub mod collection;
pub mod error;
pub mod naming;
pub mod process;
pub mod runtime;
pub mod service;
pub mod status;
pub mod types;
pub mod workflow;
