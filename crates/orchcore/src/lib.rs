//! Core abstractions for the orchestration engine
//!
//! Data model, storage contract, expression evaluator and the error
//! classification table shared by the node library and the runtime.

pub mod classify;
mod config;
mod error;
pub mod events;
pub mod expression;
mod instance;
mod node;
pub mod records;
pub mod storage;
mod workflow;

pub use config::EngineConfig;
pub use error::{EngineError, NodeError, StorageError, WorkflowError};
pub use events::*;
pub use expression::{Evaluation, ExpressionEvaluator};
pub use instance::{
    ChildRef, ExecutionLogEntry, InstanceId, InstanceStatus, StartRequest, SubprocessLink,
    WorkflowInstance,
};
pub use node::{ExecutionStatus, NodeContext, NodeExecutionResult, WaitDescriptor, WaitKind};
pub use storage::{MemoryStore, Storage};
pub use workflow::{
    Edge, LifecycleStatus, NodeId, NodeKind, NodeSpec, WorkflowDefinition, WorkflowId,
    WorkflowVersion,
};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
