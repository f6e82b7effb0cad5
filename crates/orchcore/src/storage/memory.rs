use super::base::{Criteria, Storage};
use crate::instance::{InstanceId, SubprocessLink, WorkflowInstance};
use crate::records::{Approval, EventRecord, Task};
use crate::workflow::{WorkflowDefinition, WorkflowVersion};
use crate::StorageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Serializable contents of a [`MemoryStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub workflows: HashMap<String, WorkflowDefinition>,
    pub versions: HashMap<String, Vec<WorkflowVersion>>,
    pub instances: HashMap<String, WorkflowInstance>,
    /// keyed by child instance id
    pub links: HashMap<String, SubprocessLink>,
    pub tasks: Vec<Task>,
    pub approvals: Vec<Approval>,
    pub events: Vec<EventRecord>,
    pub roles: HashMap<String, Vec<String>>,
    pub workloads: HashMap<String, u64>,
    pub collections: HashMap<String, Vec<Value>>,
}

/// In-process storage backend
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreSnapshot>,
    failing: RwLock<HashMap<String, String>>,
    collection_calls: RwLock<HashMap<String, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
            ..Self::default()
        }
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.state.read().await.clone()
    }

    pub async fn set_role_members(&self, role: impl Into<String>, members: Vec<String>) {
        self.state.write().await.roles.insert(role.into(), members);
    }

    /// Make every operation on `collection` fail with `message`
    pub async fn fail_collection(&self, collection: impl Into<String>, message: impl Into<String>) {
        self.failing.write().await.insert(collection.into(), message.into());
    }

    /// Number of operations attempted against `collection`, failed ones included
    pub async fn collection_calls(&self, collection: &str) -> u64 {
        self.collection_calls.read().await.get(collection).copied().unwrap_or(0)
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.state.read().await.tasks.clone()
    }

    pub async fn approvals(&self) -> Vec<Approval> {
        self.state.read().await.approvals.clone()
    }

    pub async fn events(&self) -> Vec<EventRecord> {
        self.state.read().await.events.clone()
    }

    pub async fn records(&self, collection: &str) -> Vec<Value> {
        self.state
            .read()
            .await
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    async fn touch_collection(&self, collection: &str) -> Result<(), StorageError> {
        *self
            .collection_calls
            .write()
            .await
            .entry(collection.to_string())
            .or_insert(0) += 1;
        match self.failing.read().await.get(collection) {
            Some(message) => Err(StorageError::Backend(message.clone())),
            None => Ok(()),
        }
    }
}

fn values_match(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn matches_criteria(record: &Value, criteria: &Criteria) -> bool {
    criteria.iter().all(|(field, expected)| {
        record
            .get(field)
            .map(|actual| values_match(actual, expected))
            .unwrap_or(false)
    })
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, StorageError> {
        Ok(self.state.read().await.workflows.get(id).cloned())
    }

    async fn save_workflow(&self, definition: &WorkflowDefinition) -> Result<(), StorageError> {
        self.state
            .write()
            .await
            .workflows
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn list_workflow_versions(&self, workflow_id: &str) -> Result<Vec<WorkflowVersion>, StorageError> {
        Ok(self
            .state
            .read()
            .await
            .versions
            .get(workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_workflow_version(&self, version: &WorkflowVersion) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let versions = state.versions.entry(version.workflow_id.clone()).or_default();
        versions.retain(|v| v.version != version.version);
        versions.push(version.clone());
        versions.sort_by_key(|v| v.created_at);
        Ok(())
    }

    async fn insert_instance(&self, instance: &WorkflowInstance) -> Result<(), StorageError> {
        self.state
            .write()
            .await
            .instances
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Option<WorkflowInstance>, StorageError> {
        Ok(self.state.read().await.instances.get(id).cloned())
    }

    async fn update_instance(&self, instance: &mut WorkflowInstance) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let stored = state
            .instances
            .get_mut(&instance.id)
            .ok_or_else(|| StorageError::NotFound(instance.id.clone()))?;
        if stored.version != instance.version {
            return Err(StorageError::Conflict {
                id: instance.id.clone(),
                expected: instance.version,
                found: stored.version,
            });
        }
        instance.version += 1;
        *stored = instance.clone();
        Ok(())
    }

    async fn list_child_instances(&self, parent_id: &str) -> Result<Vec<WorkflowInstance>, StorageError> {
        let mut children: Vec<WorkflowInstance> = self
            .state
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.parent_instance_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|i| i.started_at);
        Ok(children)
    }

    async fn insert_subprocess_link(&self, link: &SubprocessLink) -> Result<(), StorageError> {
        self.state
            .write()
            .await
            .links
            .insert(link.child_instance_id.clone(), link.clone());
        Ok(())
    }

    async fn get_subprocess_link(&self, child_id: &InstanceId) -> Result<Option<SubprocessLink>, StorageError> {
        Ok(self.state.read().await.links.get(child_id).cloned())
    }

    async fn insert_task(&self, task: &Task) -> Result<(), StorageError> {
        self.state.write().await.tasks.push(task.clone());
        Ok(())
    }

    async fn count_tasks(&self) -> Result<u64, StorageError> {
        Ok(self.state.read().await.tasks.len() as u64)
    }

    async fn role_members(&self, role: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.state.read().await.roles.get(role).cloned().unwrap_or_default())
    }

    async fn get_workload(&self, user: &str) -> Result<u64, StorageError> {
        Ok(self.state.read().await.workloads.get(user).copied().unwrap_or(0))
    }

    async fn increment_workload(&self, user: &str) -> Result<u64, StorageError> {
        let mut state = self.state.write().await;
        let load = state.workloads.entry(user.to_string()).or_insert(0);
        *load += 1;
        Ok(*load)
    }

    async fn insert_approval(&self, approval: &Approval) -> Result<(), StorageError> {
        self.state.write().await.approvals.push(approval.clone());
        Ok(())
    }

    async fn insert_event(&self, event: &EventRecord) -> Result<(), StorageError> {
        self.state.write().await.events.push(event.clone());
        Ok(())
    }

    async fn find_records(&self, collection: &str, criteria: &Criteria) -> Result<Vec<Value>, StorageError> {
        self.touch_collection(collection).await?;
        Ok(self
            .state
            .read()
            .await
            .collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| matches_criteria(r, criteria))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_record(&self, collection: &str, mut record: Value) -> Result<String, StorageError> {
        self.touch_collection(collection).await?;
        let Value::Object(fields) = &mut record else {
            return Err(StorageError::Backend(format!(
                "records in '{}' must be objects",
                collection
            )));
        };
        let id = match fields.get("id") {
            Some(Value::String(id)) => id.clone(),
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                fields.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };
        self.state
            .write()
            .await
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(record);
        Ok(id)
    }

    async fn update_records(
        &self,
        collection: &str,
        criteria: &Criteria,
        fields: &Map<String, Value>,
    ) -> Result<u64, StorageError> {
        self.touch_collection(collection).await?;
        let mut state = self.state.write().await;
        let mut updated = 0;
        if let Some(records) = state.collections.get_mut(collection) {
            for record in records.iter_mut().filter(|r| matches_criteria(r, criteria)) {
                if let Value::Object(existing) = record {
                    for (k, v) in fields {
                        existing.insert(k.clone(), v.clone());
                    }
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn delete_records(&self, collection: &str, criteria: &Criteria) -> Result<u64, StorageError> {
        self.touch_collection(collection).await?;
        let mut state = self.state.write().await;
        let Some(records) = state.collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = records.len();
        records.retain(|r| !matches_criteria(r, criteria));
        Ok((before - records.len()) as u64)
    }
}
