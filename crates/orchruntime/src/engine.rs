use crate::locks::InstanceLocks;
use async_trait::async_trait;
use chrono::Utc;
use orchcore::classify;
use orchcore::{
    EngineConfig, EngineError, EventBus, ExecutionEvent, ExecutionLogEntry, ExecutionStatus,
    InstanceId, InstanceStatus, NodeContext, NodeError, NodeExecutionResult, NodeKind, NodeSpec,
    StartRequest, Storage, SubprocessLink, WorkflowDefinition, WorkflowError, WorkflowInstance,
};
use orchnodes::{ExecutionTreeNode, HttpClient, NodeExecutor, SubprocessLauncher, SubprocessManager};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

const POSITIVE_BRANCH: &[&str] = &["yes", "true", "approve", "approved", "shortlist", "accept"];
const NEGATIVE_BRANCH: &[&str] = &["no", "false", "reject", "rejected", "decline", "fail"];

/// Result of executing a single node in isolation
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub result: NodeExecutionResult,
    pub next_node_ids: Vec<String>,
    pub variables: HashMap<String, Value>,
}

/// How a waiting node is being resumed
enum ResumeInput {
    /// External collaborator supplied (optional) result data
    Data(Option<Value>),
    /// A child instance started by this node finished
    Subprocess {
        child: WorkflowInstance,
        link: SubprocessLink,
    },
}

/// Drives workflow instances: start, traversal with retries, routing,
/// suspension and resumption.
pub struct WorkflowEngine {
    storage: Arc<dyn Storage>,
    http: Arc<dyn HttpClient>,
    subprocesses: SubprocessManager,
    config: EngineConfig,
    event_bus: Arc<EventBus>,
    locks: InstanceLocks,
}

impl WorkflowEngine {
    pub fn new(storage: Arc<dyn Storage>, http: Arc<dyn HttpClient>, config: EngineConfig) -> Self {
        Self {
            subprocesses: SubprocessManager::new(storage.clone(), &config),
            event_bus: Arc::new(EventBus::new(config.event_buffer_size)),
            storage,
            http,
            config,
            locks: InstanceLocks::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subprocesses(&self) -> &SubprocessManager {
        &self.subprocesses
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<WorkflowInstance, EngineError> {
        self.storage
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.to_string()).into())
    }

    /// Create an instance and run it until it waits, completes or fails.
    ///
    /// Node failures are reported through the instance's status; `Err` means
    /// the workflow could not be found, the nesting limit was exceeded or
    /// storage failed.
    pub async fn start(&self, request: StartRequest) -> Result<InstanceId, EngineError> {
        if request.nesting_level > self.config.max_nesting_level {
            return Err(NodeError::NestingLimit {
                level: request.nesting_level,
                max: self.config.max_nesting_level,
            }
            .into());
        }

        let (definition, pinned) = match &request.workflow_version {
            Some(version) => self
                .subprocesses
                .resolve_pinned(&request.workflow_id, version)
                .await?,
            None => self
                .storage
                .get_workflow(&request.workflow_id)
                .await?
                .map(|definition| (definition, None)),
        }
        .ok_or_else(|| WorkflowError::NotFound(request.workflow_id.clone()))?;

        let mut instance = WorkflowInstance::new(&definition.id, request.triggered_by, request.inputs);
        instance.workflow_version = pinned;
        instance.parent_instance_id = request.parent_instance_id;
        instance.nesting_level = request.nesting_level;

        let guard = self.locks.acquire(&instance.id).await;
        self.storage.insert_instance(&instance).await?;
        tracing::info!(
            "Starting workflow instance {} of {} (nesting level {})",
            instance.id,
            definition.id,
            instance.nesting_level
        );
        self.event_bus.emit(ExecutionEvent::InstanceStarted {
            instance_id: instance.id.clone(),
            workflow_id: definition.id.clone(),
            nesting_level: instance.nesting_level,
            timestamp: Utc::now(),
        });

        match definition.start_node() {
            Some(start) => {
                let start_id = start.id.clone();
                self.traverse(&mut instance, &definition, vec![start_id]).await?;
            }
            None => {
                let error = format!("Workflow {} has no start node", definition.id);
                self.fail_instance(&mut instance, error).await?;
            }
        }
        drop(guard);

        self.finish(&instance).await?;
        Ok(instance.id)
    }

    /// Continue a waiting or paused instance past `node_id`. The node is not
    /// re-executed; `result_data` is stored as `variables[node_id]`.
    pub async fn resume(&self, instance_id: &str, node_id: &str, result_data: Option<Value>) -> Result<(), EngineError> {
        let guard = self.locks.acquire(instance_id).await;
        let mut instance = self.get_instance(instance_id).await?;
        if !matches!(instance.status, InstanceStatus::Waiting | InstanceStatus::Paused) {
            return Err(invalid_transition(&instance, "resume"));
        }

        let definition = self.definition_for(&instance).await?;
        self.resume_locked(&mut instance, &definition, node_id, ResumeInput::Data(result_data))
            .await?;
        drop(guard);

        self.finish(&instance).await
    }

    pub async fn pause(&self, instance_id: &str) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(instance_id).await;
        let mut instance = self.get_instance(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(invalid_transition(&instance, "pause"));
        }
        if instance.status == InstanceStatus::Paused {
            return Ok(());
        }

        // keep what the instance was waiting on so a resume can still be correlated
        let waiting_for = instance.waiting_for.take();
        instance.set_status(InstanceStatus::Paused);
        instance.waiting_for = waiting_for;
        self.persist_status(&mut instance).await
    }

    pub async fn cancel(&self, instance_id: &str) -> Result<(), EngineError> {
        let guard = self.locks.acquire(instance_id).await;
        let mut instance = self.get_instance(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(invalid_transition(&instance, "cancel"));
        }

        instance.set_status(InstanceStatus::Cancelled);
        self.persist_status(&mut instance).await?;
        drop(guard);

        self.finish(&instance).await
    }

    /// Execute exactly one node without retries or further traversal. The
    /// instance's status is left unchanged.
    pub async fn step_node(&self, instance_id: &str, node_id: &str) -> Result<StepReport, EngineError> {
        let _guard = self.locks.acquire(instance_id).await;
        let mut instance = self.get_instance(instance_id).await?;
        let definition = self.definition_for(&instance).await?;
        let node = definition
            .find_node(node_id)
            .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))?;

        let started_at = Utc::now();
        instance.current_node_id = Some(node.id.clone());
        let mut ctx = self.context_for(&instance, node);
        let result = NodeExecutor::new(self.storage.clone(), self.http.clone(), self.config.clone())
            .with_launcher(self)
            .execute_node(node, &mut ctx)
            .await;
        instance.variables = ctx.variables;
        record(&mut instance, node, &result, started_at);
        self.persist(&mut instance).await?;

        let next_node_ids = match result.status {
            ExecutionStatus::Waiting | ExecutionStatus::Failed => Vec::new(),
            _ => next_nodes(&definition, node, result.route.as_deref()),
        };
        Ok(StepReport {
            result,
            next_node_ids,
            variables: instance.variables,
        })
    }

    /// Parent/child tree rooted at `instance_id`, at most `max_depth` levels deep
    pub async fn execution_tree(&self, instance_id: &str, max_depth: u32) -> Result<ExecutionTreeNode, EngineError> {
        self.subprocesses
            .build_execution_tree(instance_id, max_depth)
            .await?
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.to_string()).into())
    }

    async fn definition_for(&self, instance: &WorkflowInstance) -> Result<WorkflowDefinition, EngineError> {
        let definition = match &instance.workflow_version {
            Some(version) => self.subprocesses.resolve(&instance.workflow_id, version).await?,
            None => self.storage.get_workflow(&instance.workflow_id).await?,
        };
        definition.ok_or_else(|| WorkflowError::NotFound(instance.workflow_id.clone()).into())
    }

    fn context_for(&self, instance: &WorkflowInstance, node: &NodeSpec) -> NodeContext {
        NodeContext::new(
            instance.id.clone(),
            instance.workflow_id.clone(),
            node.id.clone(),
            self.event_bus.create_emitter(&instance.id, &node.id),
        )
        .with_variables(instance.variables.clone())
        .with_nesting_level(instance.nesting_level)
    }

    /// Depth-first walk from `next`. Stops the whole walk on the first
    /// waiting or failed node, or when an end node completes.
    async fn traverse(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        next: Vec<String>,
    ) -> Result<(), EngineError> {
        let mut pending: Vec<String> = next.into_iter().rev().collect();
        let budget = self.config.max_steps_per_traversal;
        let mut steps = 0usize;
        let mut reached_end = false;

        while let Some(node_id) = pending.pop() {
            let Some(node) = definition.find_node(&node_id) else {
                let error = WorkflowError::NodeNotFound(node_id).to_string();
                return self.fail_instance(instance, error).await;
            };

            steps += 1;
            if steps > budget {
                let error = format!(
                    "Traversal exceeded {} node executions without waiting or reaching an end node (last node: {})",
                    budget, node.id
                );
                return self.fail_instance(instance, error).await;
            }

            let result = self.run_node(instance, node).await?;
            match result.status {
                ExecutionStatus::Completed | ExecutionStatus::BreakLoop | ExecutionStatus::ContinueLoop => {
                    if node.kind == NodeKind::End {
                        reached_end = true;
                        continue;
                    }
                    let targets = next_nodes(definition, node, result.route.as_deref());
                    pending.extend(targets.into_iter().rev());
                }
                ExecutionStatus::Waiting => {
                    if node.kind == NodeKind::Subprocess {
                        if let Some(proceed) = self.reconcile_finished_child(instance, node, &result).await? {
                            if !proceed {
                                return Ok(());
                            }
                            let targets = next_nodes(definition, node, None);
                            pending.extend(targets.into_iter().rev());
                            continue;
                        }
                    }
                    instance.set_status(InstanceStatus::Waiting);
                    instance.waiting_for = result.wait.clone();
                    tracing::info!("Instance {} waiting at node {}", instance.id, node.id);
                    return self.persist_status(instance).await;
                }
                ExecutionStatus::Failed => {
                    let error = result
                        .error
                        .unwrap_or_else(|| format!("Node {} failed", node.id));
                    return self.fail_instance(instance, error).await;
                }
            }
        }

        if !reached_end {
            tracing::warn!(
                "Instance {} ran out of nodes at {} without reaching an end node",
                instance.id,
                instance.current_node_id.as_deref().unwrap_or("<none>")
            );
        }
        instance.set_status(InstanceStatus::Completed);
        tracing::info!("Instance {} completed", instance.id);
        self.persist_status(instance).await
    }

    /// Execute one node with the retry policy, record it and persist
    async fn run_node(&self, instance: &mut WorkflowInstance, node: &NodeSpec) -> Result<NodeExecutionResult, EngineError> {
        instance.current_node_id = Some(node.id.clone());
        self.event_bus.emit(ExecutionEvent::NodeStarted {
            instance_id: instance.id.clone(),
            node_id: node.id.clone(),
            node_type: node.kind.to_string(),
            timestamp: Utc::now(),
        });

        let started_at = Utc::now();
        let clock = Instant::now();
        let mut ctx = self.context_for(instance, node);
        let result = self.execute_with_retry(node, &mut ctx).await;
        instance.variables = ctx.variables;
        record(instance, node, &result, started_at);

        let event = match (result.status, &result.wait) {
            (ExecutionStatus::Waiting, Some(wait)) => ExecutionEvent::NodeWaiting {
                instance_id: instance.id.clone(),
                node_id: node.id.clone(),
                wait: wait.clone(),
                timestamp: Utc::now(),
            },
            (ExecutionStatus::Failed, _) => {
                tracing::error!(
                    "Node {} failed: {}",
                    node.id,
                    result.error.as_deref().unwrap_or("unknown error")
                );
                ExecutionEvent::NodeFailed {
                    instance_id: instance.id.clone(),
                    node_id: node.id.clone(),
                    error: result.error.clone().unwrap_or_default(),
                    timestamp: Utc::now(),
                }
            }
            _ => {
                let duration_ms = clock.elapsed().as_millis() as u64;
                tracing::debug!("Node {} completed in {}ms", node.id, duration_ms);
                ExecutionEvent::NodeCompleted {
                    instance_id: instance.id.clone(),
                    node_id: node.id.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                }
            }
        };
        self.event_bus.emit(event);

        self.persist(instance).await?;
        Ok(result)
    }

    /// Retryable kinds get up to `max_attempts` tries when the failure text
    /// classifies as transient; everything else runs once.
    async fn execute_with_retry(&self, node: &NodeSpec, ctx: &mut NodeContext) -> NodeExecutionResult {
        let max_attempts = if node.kind.is_retryable() {
            self.config.max_attempts.max(1)
        } else {
            1
        };
        let delay = Duration::from_millis(self.config.retry_delay_ms);

        let mut attempt = 1;
        loop {
            let mut result = NodeExecutor::new(self.storage.clone(), self.http.clone(), self.config.clone())
                .with_launcher(self)
                .execute_node(node, ctx)
                .await;

            let retry = result.is_failed()
                && attempt < max_attempts
                && result.error.as_deref().is_some_and(classify::is_retryable);
            if !retry {
                result.retry_count = attempt - 1;
                return result;
            }

            let error = result.error.unwrap_or_default();
            tracing::warn!(
                "Node {} failed on attempt {}/{}, retrying in {:?}: {}",
                node.id,
                attempt,
                max_attempts,
                delay,
                error
            );
            self.event_bus.emit(ExecutionEvent::NodeRetrying {
                instance_id: ctx.instance_id.clone(),
                node_id: node.id.clone(),
                attempt,
                error,
                timestamp: Utc::now(),
            });
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// A subprocess node that returned `waiting` may already have a finished
    /// child. `None` when the child is still running; otherwise whether the
    /// parent carries on.
    async fn reconcile_finished_child(
        &self,
        instance: &mut WorkflowInstance,
        node: &NodeSpec,
        result: &NodeExecutionResult,
    ) -> Result<Option<bool>, EngineError> {
        let Some(child_id) = result.wait.as_ref().map(|w| w.id.clone()) else {
            return Ok(None);
        };
        let Some(child) = self.storage.get_instance(&child_id).await? else {
            return Ok(None);
        };
        if !child.status.is_terminal() {
            return Ok(None);
        }
        let Some(link) = self.storage.get_subprocess_link(&child_id).await? else {
            return Ok(None);
        };

        let proceed = self.apply_child_outcome(instance, node, &child, &link).await?;
        if proceed {
            self.persist(instance).await?;
        }
        Ok(Some(proceed))
    }

    /// Merge a finished child's mapped outputs into the parent, or fail the
    /// parent when the child did not complete.
    async fn apply_child_outcome(
        &self,
        parent: &mut WorkflowInstance,
        node: &NodeSpec,
        child: &WorkflowInstance,
        link: &SubprocessLink,
    ) -> Result<bool, EngineError> {
        let outputs = self.subprocesses.handle_completion(parent, child, link);
        if child.status != InstanceStatus::Completed {
            let reason = child
                .error
                .clone()
                .unwrap_or_else(|| child.status.to_string());
            self.fail_instance(parent, format!("Subprocess {} failed: {}", child.id, reason))
                .await?;
            return Ok(false);
        }

        tracing::info!("Subprocess {} completed for node {}", child.id, node.id);
        parent.variables.insert(
            node.id.clone(),
            json!({
                "child_instance_id": child.id,
                "status": child.status,
                "outputs": outputs,
            }),
        );
        parent.variables.extend(outputs);
        parent.node_statuses.insert(node.id.clone(), ExecutionStatus::Completed);
        Ok(true)
    }

    async fn resume_locked(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        node_id: &str,
        input: ResumeInput,
    ) -> Result<(), EngineError> {
        let node = definition
            .find_node(node_id)
            .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))?;

        let mut route = None;
        match input {
            ResumeInput::Data(Some(data)) => {
                route = data
                    .get("route")
                    .or_else(|| data.get("decision"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                instance.variables.insert(node_id.to_string(), data);
            }
            ResumeInput::Data(None) => {}
            ResumeInput::Subprocess { child, link } => {
                if !self.apply_child_outcome(instance, node, &child, &link).await? {
                    return Ok(());
                }
            }
        }

        tracing::info!("Resuming instance {} after node {}", instance.id, node_id);
        instance.set_status(InstanceStatus::Running);
        instance.node_statuses.insert(node_id.to_string(), ExecutionStatus::Completed);
        self.persist_status(instance).await?;

        let next = next_nodes(definition, node, route.as_deref());
        self.traverse(instance, definition, next).await
    }

    /// Post-traversal bookkeeping once the instance lock is released: wake a
    /// parent waiting on this instance.
    async fn finish(&self, instance: &WorkflowInstance) -> Result<(), EngineError> {
        if !instance.status.is_terminal() {
            return Ok(());
        }
        if instance.parent_instance_id.is_none() {
            return Ok(());
        }
        match self.storage.get_subprocess_link(&instance.id).await? {
            Some(link) => self.resume_parent(link, instance.clone()).await,
            None => Ok(()),
        }
    }

    fn resume_parent<'a>(
        &'a self,
        link: SubprocessLink,
        child: WorkflowInstance,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + 'a>> {
        Box::pin(async move {
            let parent_id = link.parent_instance_id.clone();
            // A parent still traversing holds its own lock and reconciles
            // the child itself; only a parent parked on this child is resumed.
            if !self.is_waiting_on(&parent_id, &child.id).await? {
                return Ok(());
            }

            let guard = self.locks.acquire(&parent_id).await;
            if !self.is_waiting_on(&parent_id, &child.id).await? {
                return Ok(());
            }
            let mut parent = self.get_instance(&parent_id).await?;
            let definition = self.definition_for(&parent).await?;
            let node_id = link.parent_node_id.clone();
            if parent.status == InstanceStatus::Paused {
                // record the outcome now; traversal continues on the next resume
                let node = definition
                    .find_node(&node_id)
                    .ok_or_else(|| WorkflowError::NodeNotFound(node_id.clone()))?;
                if self.apply_child_outcome(&mut parent, node, &child, &link).await? {
                    parent.waiting_for = None;
                    tracing::info!("Paused instance {} received subprocess {} outcome", parent.id, child.id);
                    self.persist(&mut parent).await?;
                }
            } else {
                self.resume_locked(&mut parent, &definition, &node_id, ResumeInput::Subprocess { child, link })
                    .await?;
            }
            drop(guard);

            self.finish(&parent).await
        })
    }

    async fn is_waiting_on(&self, parent_id: &str, child_id: &str) -> Result<bool, EngineError> {
        Ok(self
            .storage
            .get_instance(parent_id)
            .await?
            .is_some_and(|parent| {
                matches!(parent.status, InstanceStatus::Waiting | InstanceStatus::Paused)
                    && parent.waiting_for.as_ref().is_some_and(|w| w.id == child_id)
            }))
    }

    async fn fail_instance(&self, instance: &mut WorkflowInstance, error: String) -> Result<(), EngineError> {
        let friendly = classify::friendly_message(&error);
        tracing::error!("Instance {} failed: {}", instance.id, error);
        instance.fail(error, friendly);
        self.persist_status(instance).await
    }

    async fn persist(&self, instance: &mut WorkflowInstance) -> Result<(), EngineError> {
        instance.updated_at = Utc::now();
        self.storage.update_instance(instance).await?;
        Ok(())
    }

    async fn persist_status(&self, instance: &mut WorkflowInstance) -> Result<(), EngineError> {
        self.persist(instance).await?;
        self.event_bus.emit(ExecutionEvent::InstanceStatusChanged {
            instance_id: instance.id.clone(),
            status: instance.status,
            error: instance.error.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl SubprocessLauncher for WorkflowEngine {
    async fn launch(&self, request: StartRequest) -> Result<InstanceId, EngineError> {
        self.start(request).await
    }
}

fn invalid_transition(instance: &WorkflowInstance, action: &'static str) -> EngineError {
    WorkflowError::InvalidTransition {
        instance_id: instance.id.clone(),
        action,
        status: instance.status.to_string(),
    }
    .into()
}

/// Append the log entry and per-node status; completed output is merged
/// into the variables under the node id.
fn record(instance: &mut WorkflowInstance, node: &NodeSpec, result: &NodeExecutionResult, started_at: chrono::DateTime<Utc>) {
    instance.execution_log.push(ExecutionLogEntry {
        node_id: node.id.clone(),
        node_type: node.kind.to_string(),
        status: result.status,
        started_at,
        completed_at: Utc::now(),
        error: result.error.clone(),
        output: result.output.clone(),
        retry_count: result.retry_count,
    });
    instance.node_statuses.insert(node.id.clone(), result.status);

    let completed = matches!(
        result.status,
        ExecutionStatus::Completed | ExecutionStatus::BreakLoop | ExecutionStatus::ContinueLoop
    );
    if completed {
        if let Some(output) = &result.output {
            instance.variables.insert(node.id.clone(), output.clone());
        }
    }
}

/// Decision nodes follow the edge matching their yes/no outcome; every
/// other kind fans out to all outgoing edges.
pub fn next_nodes(definition: &WorkflowDefinition, node: &NodeSpec, route: Option<&str>) -> Vec<String> {
    let edges = definition.outgoing(&node.id);
    if node.kind != NodeKind::Decision {
        return edges.map(|e| e.target.clone()).collect();
    }

    let wanted = route.and_then(branch_of).unwrap_or(false);
    edges
        .filter(|edge| {
            let branch = match edge.handle.as_deref() {
                Some(handle) if !handle.is_empty() => branch_of(handle),
                _ => edge.label.as_deref().and_then(branch_of),
            };
            branch == Some(wanted)
        })
        .map(|e| e.target.clone())
        .collect()
}

/// `Some(true)` for a positive branch word, `Some(false)` for a negative one
fn branch_of(text: &str) -> Option<bool> {
    let lowered = text.trim().to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    if words.iter().any(|w| NEGATIVE_BRANCH.contains(w)) {
        Some(false)
    } else if words.iter().any(|w| POSITIVE_BRANCH.contains(w)) {
        Some(true)
    } else {
        None
    }
}
