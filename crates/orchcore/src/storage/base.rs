use crate::instance::{InstanceId, SubprocessLink, WorkflowInstance};
use crate::records::{Approval, EventRecord, Task};
use crate::workflow::{WorkflowDefinition, WorkflowVersion};
use crate::StorageError;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Field-equality criteria for generic collection queries
pub type Criteria = Map<String, Value>;

/// Persistence contract consumed by the engine and node library.
///
/// Implementations must make `update_instance` reject stale writes: the
/// caller's `version` has to match the stored one, and a successful write
/// bumps it on both sides.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, StorageError>;

    async fn save_workflow(&self, definition: &WorkflowDefinition) -> Result<(), StorageError>;

    /// All stored snapshots of a workflow, oldest first
    async fn list_workflow_versions(&self, workflow_id: &str) -> Result<Vec<WorkflowVersion>, StorageError>;

    async fn save_workflow_version(&self, version: &WorkflowVersion) -> Result<(), StorageError>;

    async fn insert_instance(&self, instance: &WorkflowInstance) -> Result<(), StorageError>;

    async fn get_instance(&self, id: &str) -> Result<Option<WorkflowInstance>, StorageError>;

    async fn update_instance(&self, instance: &mut WorkflowInstance) -> Result<(), StorageError>;

    async fn list_child_instances(&self, parent_id: &str) -> Result<Vec<WorkflowInstance>, StorageError>;

    async fn insert_subprocess_link(&self, link: &SubprocessLink) -> Result<(), StorageError>;

    async fn get_subprocess_link(&self, child_id: &InstanceId) -> Result<Option<SubprocessLink>, StorageError>;

    async fn insert_task(&self, task: &Task) -> Result<(), StorageError>;

    async fn count_tasks(&self) -> Result<u64, StorageError>;

    async fn role_members(&self, role: &str) -> Result<Vec<String>, StorageError>;

    async fn get_workload(&self, user: &str) -> Result<u64, StorageError>;

    /// Atomically add one to a user's workload and return the new value
    async fn increment_workload(&self, user: &str) -> Result<u64, StorageError>;

    async fn insert_approval(&self, approval: &Approval) -> Result<(), StorageError>;

    async fn insert_event(&self, event: &EventRecord) -> Result<(), StorageError>;

    async fn find_records(&self, collection: &str, criteria: &Criteria) -> Result<Vec<Value>, StorageError>;

    /// Insert a record and return its generated id
    async fn insert_record(&self, collection: &str, record: Value) -> Result<String, StorageError>;

    async fn update_records(
        &self,
        collection: &str,
        criteria: &Criteria,
        fields: &Map<String, Value>,
    ) -> Result<u64, StorageError>;

    async fn delete_records(&self, collection: &str, criteria: &Criteria) -> Result<u64, StorageError>;
}
