//! Records created by human-interaction and event nodes and handed to storage.

use crate::instance::InstanceId;
use crate::workflow::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    #[default]
    Direct,
    Role,
    RoundRobin,
    LoadBalanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub instance_id: InstanceId,
    pub node_id: NodeId,
    pub title: String,
    pub description: Option<String>,
    pub assignee: Option<String>,
    pub role: Option<String>,
    pub strategy: AssignmentStrategy,
    pub status: String,
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approver: String,
    pub decision: String,
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub instance_id: InstanceId,
    pub node_id: NodeId,
    pub title: String,
    pub approvers: Vec<String>,
    /// "any", "all" or "majority"
    pub approval_type: String,
    pub decisions: Vec<ApprovalDecision>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub name: String,
    pub instance_id: InstanceId,
    pub node_id: NodeId,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}
