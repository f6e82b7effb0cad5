//! Workflow execution runtime
//!
//! The engine that starts instances, walks their graphs node by node with
//! retries and branch routing, suspends them on external input and resumes
//! them, including parents waiting on nested subprocess instances.

mod engine;
mod locks;

pub use engine::{next_nodes, StepReport, WorkflowEngine};
