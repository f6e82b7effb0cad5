//! Nested workflow invocation: version resolution, validation, context
//! preparation, completion mapping and execution-tree reconstruction.

use crate::executor::{node_config, NodeExecutor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchcore::expression::lookup;
use orchcore::{
    ChildRef, EngineConfig, EngineError, ExpressionEvaluator, InstanceId, InstanceStatus,
    LifecycleStatus, NodeContext, NodeError, NodeExecutionResult, NodeKind, NodeSpec,
    StartRequest, Storage, StorageError, SubprocessLink, WaitDescriptor, WaitKind,
    WorkflowDefinition, WorkflowInstance,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Starts child instances on behalf of subprocess nodes.
///
/// Implemented by the execution engine; the node library only sees this seam.
#[async_trait]
pub trait SubprocessLauncher: Send + Sync {
    async fn launch(&self, request: StartRequest) -> Result<InstanceId, EngineError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// One instance in a parent/child execution tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTreeNode {
    pub instance_id: InstanceId,
    pub workflow_id: String,
    pub status: InstanceStatus,
    pub nesting_level: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub has_error: bool,
    pub error: Option<String>,
    pub children: Vec<ExecutionTreeNode>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SubprocessConfig {
    #[serde(alias = "workflowId")]
    workflow_id: Option<String>,
    version: Option<String>,
    /// child variable -> parent variable name or `${...}` expression
    #[serde(alias = "inputMapping")]
    input_mapping: HashMap<String, String>,
    /// parent variable -> child variable
    #[serde(alias = "outputMapping")]
    output_mapping: HashMap<String, String>,
    #[serde(alias = "isolate_context", alias = "isolateContext")]
    isolated: bool,
}

pub const LATEST: &str = "latest";
pub const PUBLISHED: &str = "published";

#[derive(Clone)]
pub struct SubprocessManager {
    storage: Arc<dyn Storage>,
    evaluator: ExpressionEvaluator,
    max_nesting_level: u32,
}

impl SubprocessManager {
    pub fn new(storage: Arc<dyn Storage>, config: &EngineConfig) -> Self {
        Self {
            storage,
            evaluator: ExpressionEvaluator::new(),
            max_nesting_level: config.max_nesting_level,
        }
    }

    pub fn max_nesting_level(&self) -> u32 {
        self.max_nesting_level
    }

    /// Resolve a definition by version token: `latest` is the live
    /// definition, `published` the newest published snapshot, anything else an
    /// exact snapshot version.
    pub async fn resolve(&self, workflow_id: &str, version: &str) -> Result<Option<WorkflowDefinition>, StorageError> {
        Ok(self
            .resolve_pinned(workflow_id, version)
            .await?
            .map(|(definition, _)| definition))
    }

    /// Like `resolve`, also returning the concrete snapshot version to pin.
    /// The live definition pins nothing.
    pub async fn resolve_pinned(
        &self,
        workflow_id: &str,
        version: &str,
    ) -> Result<Option<(WorkflowDefinition, Option<String>)>, StorageError> {
        if version.is_empty() || version == LATEST {
            return Ok(self.storage.get_workflow(workflow_id).await?.map(|d| (d, None)));
        }

        let versions = self.storage.list_workflow_versions(workflow_id).await?;
        let found = if version == PUBLISHED {
            versions
                .into_iter()
                .filter(|v| v.status == LifecycleStatus::Published)
                .max_by_key(|v| v.created_at)
        } else {
            versions.into_iter().find(|v| v.version == version)
        };
        Ok(found.map(|v| (v.definition, Some(v.version))))
    }

    pub async fn validate(&self, workflow_id: &str, version: &str) -> Result<ValidationReport, StorageError> {
        let mut report = ValidationReport::default();
        let Some(definition) = self.resolve(workflow_id, version).await? else {
            report
                .errors
                .push(format!("Workflow {} (version {}) not found", workflow_id, version));
            return Ok(report);
        };

        if !matches!(definition.status, LifecycleStatus::Published | LifecycleStatus::Draft) {
            report.errors.push(format!(
                "Workflow {} is {} and cannot be used as a subprocess",
                workflow_id, definition.status
            ));
        }
        if calls_itself(&definition) {
            report
                .errors
                .push(format!("Workflow {} invokes itself as a subprocess", workflow_id));
        }
        if definition.start_node().is_none() {
            report
                .errors
                .push(format!("Workflow {} has no start node", workflow_id));
        }

        if !definition.subprocess_compatible {
            report
                .warnings
                .push(format!("Workflow {} is not marked subprocess compatible", workflow_id));
        }
        if !definition.has_end_node() {
            report
                .warnings
                .push(format!("Workflow {} has no end node", workflow_id));
        }
        let unreachable = definition.unreachable_nodes();
        if !unreachable.is_empty() && definition.start_node().is_some() {
            report
                .warnings
                .push(format!("Unreachable nodes: {}", unreachable.join(", ")));
        }

        report.valid = report.errors.is_empty();
        Ok(report)
    }

    /// Level the child would run at; fails past the configured maximum
    pub fn child_level(&self, parent_level: u32) -> Result<u32, NodeError> {
        let level = parent_level + 1;
        if level > self.max_nesting_level {
            return Err(NodeError::NestingLimit {
                level,
                max: self.max_nesting_level,
            });
        }
        Ok(level)
    }

    /// Build the child's initial variables. Isolated children only see the
    /// mapped inputs; otherwise the parent map is copied and mappings overlay it.
    pub fn prepare_context(
        &self,
        parent_variables: &HashMap<String, Value>,
        input_mapping: &HashMap<String, String>,
        isolated: bool,
    ) -> HashMap<String, Value> {
        let mut child = if isolated {
            HashMap::new()
        } else {
            parent_variables.clone()
        };

        for (child_var, source) in input_mapping {
            let value = if source.contains("${") {
                Some(self.evaluator.evaluate(source, parent_variables))
            } else {
                lookup(parent_variables, source).cloned()
            };
            match value {
                Some(value) => {
                    child.insert(child_var.clone(), value);
                }
                None => tracing::warn!("Input mapping source '{}' not found for '{}'", source, child_var),
            }
        }
        child
    }

    /// Map a finished child's variables back into parent scope and record the
    /// child on the parent. A mapped name missing from the child's variables
    /// is looked up in the outputs of its execution log, newest first.
    pub fn handle_completion(
        &self,
        parent: &mut WorkflowInstance,
        child: &WorkflowInstance,
        link: &SubprocessLink,
    ) -> HashMap<String, Value> {
        let mut outputs = HashMap::new();
        for (parent_var, child_var) in &link.output_mapping {
            let value = lookup(&child.variables, child_var).cloned().or_else(|| {
                child.execution_log.iter().rev().find_map(|entry| {
                    entry
                        .output
                        .as_ref()
                        .and_then(|out| out.get(child_var))
                        .cloned()
                })
            });
            match value {
                Some(value) => {
                    outputs.insert(parent_var.clone(), value);
                }
                None => tracing::warn!(
                    "Output '{}' not produced by child instance {}",
                    child_var,
                    child.id
                ),
            }
        }

        if !parent.children.iter().any(|c| c.instance_id == child.id) {
            parent.children.push(ChildRef {
                instance_id: child.id.clone(),
                workflow_id: child.workflow_id.clone(),
                node_id: link.parent_node_id.clone(),
                status: child.status,
                completed_at: child.completed_at,
            });
        }
        outputs
    }

    /// Validate, prepare and launch a child instance for a subprocess node,
    /// then record the link back to the parent.
    pub async fn start_subprocess(
        &self,
        launcher: &dyn SubprocessLauncher,
        ctx: &NodeContext,
        node: &NodeSpec,
    ) -> Result<SubprocessLink, NodeError> {
        let config: SubprocessConfig = node_config(node)?;
        let workflow_id = config
            .workflow_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| NodeError::Configuration(format!("No workflow configured for subprocess {}", node.id)))?;
        let version = config.version.unwrap_or_else(|| LATEST.to_string());
        let level = self.child_level(ctx.nesting_level)?;

        let report = self.validate(&workflow_id, &version).await?;
        for warning in &report.warnings {
            tracing::warn!("Subprocess {}: {}", node.id, warning);
            ctx.events.warn(warning.clone());
        }
        if !report.valid {
            return Err(NodeError::ExecutionFailed(format!(
                "Subprocess validation failed: {}",
                report.errors.join("; ")
            )));
        }

        let inputs = self.prepare_context(&ctx.variables, &config.input_mapping, config.isolated);
        let request = StartRequest::new(workflow_id.clone())
            .triggered_by(format!("subprocess:{}", ctx.instance_id))
            .with_inputs(inputs)
            .with_parent(ctx.instance_id.clone(), level)
            .with_version(version);
        let child_id = launcher
            .launch(request)
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to start subprocess {}: {}", workflow_id, e)))?;

        let link = SubprocessLink {
            parent_instance_id: ctx.instance_id.clone(),
            parent_node_id: node.id.clone(),
            child_instance_id: child_id,
            output_mapping: config.output_mapping,
            isolated: config.isolated,
            nesting_level: level,
            created_at: Utc::now(),
        };
        self.storage.insert_subprocess_link(&link).await?;
        Ok(link)
    }

    /// Read-only walk of parent/child instances, `max_depth` levels below the root
    pub async fn build_execution_tree(
        &self,
        root_instance_id: &str,
        max_depth: u32,
    ) -> Result<Option<ExecutionTreeNode>, StorageError> {
        match self.storage.get_instance(root_instance_id).await? {
            Some(root) => Ok(Some(self.tree_node(root, max_depth).await?)),
            None => Ok(None),
        }
    }

    fn tree_node<'a>(
        &'a self,
        instance: WorkflowInstance,
        remaining: u32,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionTreeNode, StorageError>> + Send + 'a>> {
        Box::pin(async move {
            let mut children = Vec::new();
            if remaining > 0 {
                for child in self.storage.list_child_instances(&instance.id).await? {
                    children.push(self.tree_node(child, remaining - 1).await?);
                }
            }

            let end = instance.completed_at.unwrap_or_else(Utc::now);
            let duration_seconds = (end - instance.started_at).num_milliseconds() as f64 / 1000.0;
            Ok(ExecutionTreeNode {
                has_error: instance.status == InstanceStatus::Failed,
                instance_id: instance.id,
                workflow_id: instance.workflow_id,
                status: instance.status,
                nesting_level: instance.nesting_level,
                started_at: instance.started_at,
                completed_at: instance.completed_at,
                duration_seconds,
                error: instance.error,
                children,
            })
        })
    }
}

/// One-level self-reference: a subprocess node naming its own workflow
fn calls_itself(definition: &WorkflowDefinition) -> bool {
    definition
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::Subprocess)
        .any(|n| {
            ["workflow_id", "workflowId"]
                .iter()
                .any(|key| n.data.get(*key).and_then(Value::as_str) == Some(definition.id.as_str()))
        })
}

impl NodeExecutor<'_> {
    pub(crate) async fn subprocess(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let launcher = self.launcher.ok_or_else(|| {
            NodeError::ExecutionFailed(format!("Subprocess {} cannot start outside an engine", node.id))
        })?;
        let link = self.subprocesses.start_subprocess(launcher, ctx, node).await?;
        ctx.events.info(format!("Started child instance {}", link.child_instance_id));

        Ok(NodeExecutionResult::waiting(WaitDescriptor {
            kind: WaitKind::Subprocess,
            id: link.child_instance_id.clone(),
            deadline: None,
        })
        .with_output(json!({
            "child_instance_id": link.child_instance_id,
            "nesting_level": link.nesting_level,
            "isolated": link.isolated,
        })))
    }
}
