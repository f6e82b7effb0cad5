use crate::events::EventEmitter;
use crate::instance::InstanceId;
use crate::workflow::{NodeId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Execution context handed to the node executor for a single step.
///
/// `variables` starts as a copy of the instance's variable map; nodes may
/// write into it and the engine takes the mutated map back afterwards.
#[derive(Clone)]
pub struct NodeContext {
    pub instance_id: InstanceId,
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,
    pub variables: HashMap<String, Value>,
    pub nesting_level: u32,
    pub events: EventEmitter,
}

impl NodeContext {
    pub fn new(
        instance_id: impl Into<String>,
        workflow_id: impl Into<String>,
        node_id: impl Into<String>,
        events: EventEmitter,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            workflow_id: workflow_id.into(),
            node_id: node_id.into(),
            variables: HashMap::new(),
            nesting_level: 0,
            events,
        }
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_nesting_level(mut self, level: u32) -> Self {
        self.nesting_level = level;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Waiting,
    Failed,
    BreakLoop,
    ContinueLoop,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Waiting => "waiting",
            Self::Failed => "failed",
            Self::BreakLoop => "break_loop",
            Self::ContinueLoop => "continue_loop",
        };
        f.write_str(s)
    }
}

/// What a waiting node is suspended on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    Task,
    Approval,
    Form,
    Screen,
    Timer,
    Event,
    Subprocess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitDescriptor {
    pub kind: WaitKind,
    /// Correlation id an external collaborator resumes with
    pub id: String,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

/// Outcome of executing a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionResult {
    pub status: ExecutionStatus,
    pub output: Option<Value>,
    /// Routing handle chosen by branching nodes ("true"/"false", a case id, ...)
    pub route: Option<String>,
    pub wait: Option<WaitDescriptor>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl NodeExecutionResult {
    fn with_status(status: ExecutionStatus) -> Self {
        Self {
            status,
            output: None,
            route: None,
            wait: None,
            error: None,
            retry_count: 0,
        }
    }

    pub fn completed() -> Self {
        Self::with_status(ExecutionStatus::Completed)
    }

    pub fn waiting(wait: WaitDescriptor) -> Self {
        let mut result = Self::with_status(ExecutionStatus::Waiting);
        result.wait = Some(wait);
        result
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let mut result = Self::with_status(ExecutionStatus::Failed);
        result.error = Some(error.into());
        result
    }

    pub fn break_loop() -> Self {
        Self::with_status(ExecutionStatus::BreakLoop)
    }

    pub fn continue_loop() -> Self {
        Self::with_status(ExecutionStatus::ContinueLoop)
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == ExecutionStatus::Failed
    }
}
