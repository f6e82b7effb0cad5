use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),
}

#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    ExecutionFailed(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Maximum subprocess nesting level ({max}) exceeded: requested level {level}")]
    NestingLimit { level: u32, max: u32 },

    #[error("Maximum loop nesting depth ({max}) exceeded")]
    LoopDepthExceeded { max: usize },

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("{0}")]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Cannot {action} instance {instance_id} in status '{status}'")]
    InvalidTransition {
        instance_id: String,
        action: &'static str,
        status: String,
    },
}

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Version conflict on {id}: expected {expected}, found {found}")]
    Conflict { id: String, expected: u64, found: u64 },

    #[error("Storage backend error: {0}")]
    Backend(String),
}
