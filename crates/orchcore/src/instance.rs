use crate::node::{ExecutionStatus, WaitDescriptor};
use crate::workflow::{NodeId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

pub type InstanceId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Waiting,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One running (or finished) execution of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub workflow_id: WorkflowId,
    /// Version token the definition was resolved with; `None` means the live definition
    #[serde(default)]
    pub workflow_version: Option<String>,
    pub status: InstanceStatus,
    pub current_node_id: Option<NodeId>,
    pub variables: HashMap<String, Value>,
    pub execution_log: Vec<ExecutionLogEntry>,
    pub node_statuses: HashMap<NodeId, ExecutionStatus>,
    pub waiting_for: Option<WaitDescriptor>,
    pub error: Option<String>,
    pub friendly_error: Option<String>,
    pub triggered_by: String,
    pub parent_instance_id: Option<InstanceId>,
    pub nesting_level: u32,
    pub children: Vec<ChildRef>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by storage on every update
    #[serde(default)]
    pub version: u64,
}

impl WorkflowInstance {
    pub fn new(
        workflow_id: impl Into<String>,
        triggered_by: impl Into<String>,
        variables: HashMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            workflow_version: None,
            status: InstanceStatus::Running,
            current_node_id: None,
            variables,
            execution_log: Vec::new(),
            node_statuses: HashMap::new(),
            waiting_for: None,
            error: None,
            friendly_error: None,
            triggered_by: triggered_by.into(),
            parent_instance_id: None,
            nesting_level: 0,
            children: Vec::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            version: 0,
        }
    }

    /// Move to `status`, stamping completion time on terminal states
    pub fn set_status(&mut self, status: InstanceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        if status.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        if status != InstanceStatus::Waiting {
            self.waiting_for = None;
        }
    }

    pub fn fail(&mut self, error: impl Into<String>, friendly: impl Into<String>) {
        self.error = Some(error.into());
        self.friendly_error = Some(friendly.into());
        self.set_status(InstanceStatus::Failed);
    }
}

/// Record of one node execution within an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub node_id: NodeId,
    pub node_type: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub retry_count: u32,
}

/// Reference from a parent instance to a finished child instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildRef {
    pub instance_id: InstanceId,
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,
    pub status: InstanceStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Wiring between a subprocess node and the child instance it started
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprocessLink {
    pub parent_instance_id: InstanceId,
    pub parent_node_id: NodeId,
    pub child_instance_id: InstanceId,
    /// parent variable name -> child variable name
    pub output_mapping: HashMap<String, String>,
    pub isolated: bool,
    pub nesting_level: u32,
    pub created_at: DateTime<Utc>,
}

/// Parameters for starting a new instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    pub workflow_id: WorkflowId,
    pub triggered_by: String,
    pub inputs: HashMap<String, Value>,
    pub parent_instance_id: Option<InstanceId>,
    pub nesting_level: u32,
    /// Pin a stored version snapshot instead of the live definition
    pub workflow_version: Option<String>,
}

impl StartRequest {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            triggered_by: "system".to_string(),
            ..Self::default()
        }
    }

    pub fn triggered_by(mut self, who: impl Into<String>) -> Self {
        self.triggered_by = who.into();
        self
    }

    pub fn with_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn with_parent(mut self, parent_instance_id: impl Into<String>, nesting_level: u32) -> Self {
        self.parent_instance_id = Some(parent_instance_id.into());
        self.nesting_level = nesting_level;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.workflow_version = Some(version.into());
        self
    }
}
