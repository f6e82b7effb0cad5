use crate::instance::{InstanceId, InstanceStatus};
use crate::node::WaitDescriptor;
use crate::workflow::{NodeId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while the engine drives instances
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    InstanceStarted {
        instance_id: InstanceId,
        workflow_id: WorkflowId,
        nesting_level: u32,
        timestamp: DateTime<Utc>,
    },
    InstanceStatusChanged {
        instance_id: InstanceId,
        status: InstanceStatus,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        instance_id: InstanceId,
        node_id: NodeId,
        node_type: String,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        instance_id: InstanceId,
        node_id: NodeId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeWaiting {
        instance_id: InstanceId,
        node_id: NodeId,
        wait: WaitDescriptor,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        instance_id: InstanceId,
        node_id: NodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeRetrying {
        instance_id: InstanceId,
        node_id: NodeId,
        attempt: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeEvent {
        instance_id: InstanceId,
        node_id: NodeId,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
}

/// Messages a node handler reports while it runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
}

/// Event emitter scoped to one node of one instance
#[derive(Clone)]
pub struct EventEmitter {
    instance_id: InstanceId,
    node_id: NodeId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        instance_id: InstanceId,
        node_id: NodeId,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            instance_id,
            node_id,
            sender,
        }
    }

    /// Emitter with no subscribers, for executing nodes outside the engine
    pub fn detached(node_id: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self::new(String::new(), node_id.into(), sender)
    }

    pub fn emit(&self, event: NodeEvent) {
        let _ = self.sender.send(ExecutionEvent::NodeEvent {
            instance_id: self.instance_id.clone(),
            node_id: self.node_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Warning {
            message: message.into(),
        });
    }
}

/// Broadcast bus owned by an engine; lagging subscribers drop events
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, instance_id: &str, node_id: &str) -> EventEmitter {
        EventEmitter::new(instance_id.to_string(), node_id.to_string(), self.sender.clone())
    }
}
