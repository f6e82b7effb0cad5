//! Nodes that suspend the instance until a person acts: task, approval,
//! form and screen.

use crate::executor::{node_config, offset_by_seconds, NodeExecutor};
use chrono::Utc;
use orchcore::records::{Approval, AssignmentStrategy, Task};
use orchcore::{NodeContext, NodeError, NodeExecutionResult, NodeSpec, WaitDescriptor, WaitKind};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TaskConfig {
    title: Option<String>,
    description: Option<String>,
    #[serde(alias = "assignment_strategy", alias = "assignmentStrategy")]
    strategy: AssignmentStrategy,
    assignee: Option<String>,
    role: Option<String>,
    #[serde(alias = "dueInHours", alias = "due_in_hours", alias = "slaHours")]
    sla_hours: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApprovalConfig {
    title: Option<String>,
    approvers: Vec<String>,
    approval_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FormConfig {
    #[serde(alias = "formId", alias = "form")]
    form_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScreenConfig {
    #[serde(alias = "screenId", alias = "screen")]
    screen_id: Option<String>,
}

impl NodeExecutor<'_> {
    pub(crate) async fn task(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: TaskConfig = node_config(node)?;
        let now = Utc::now();
        let due_date = config
            .sla_hours
            .map(|hours| offset_by_seconds(node, now, hours * 3600.0))
            .transpose()?;
        let assignee = self.resolve_assignee(&config).await?;

        let title = config
            .title
            .or_else(|| node.name.clone())
            .unwrap_or_else(|| node.id.clone());
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: ctx.instance_id.clone(),
            node_id: node.id.clone(),
            title: self.evaluator.substitute(&title, &ctx.variables),
            description: config
                .description
                .map(|d| self.evaluator.substitute(&d, &ctx.variables)),
            assignee: assignee.clone(),
            role: config.role,
            strategy: config.strategy,
            status: "pending".to_string(),
            due_date,
            created_at: now,
        };
        self.storage.insert_task(&task).await?;
        ctx.events.info(format!(
            "Created task {} for {}",
            task.id,
            assignee.as_deref().unwrap_or("unassigned")
        ));

        Ok(NodeExecutionResult::waiting(WaitDescriptor {
            kind: WaitKind::Task,
            id: task.id.clone(),
            deadline: due_date,
        })
        .with_output(json!({
            "task_id": task.id,
            "assignee": assignee,
            "due_date": due_date,
        })))
    }

    async fn resolve_assignee(&self, config: &TaskConfig) -> Result<Option<String>, NodeError> {
        if config.strategy == AssignmentStrategy::Direct {
            return Ok(config.assignee.clone());
        }
        let Some(role) = config.role.as_deref() else {
            return Ok(config.assignee.clone());
        };
        let members = self.storage.role_members(role).await?;
        if members.is_empty() {
            tracing::warn!("Role {} has no members, task left unassigned", role);
            return Ok(config.assignee.clone());
        }

        let chosen = match config.strategy {
            AssignmentStrategy::Direct | AssignmentStrategy::Role => members[0].clone(),
            AssignmentStrategy::RoundRobin => {
                let count = self.storage.count_tasks().await?;
                members[(count % members.len() as u64) as usize].clone()
            }
            AssignmentStrategy::LoadBalanced => {
                let mut best: Option<(u64, &String)> = None;
                for member in &members {
                    let load = self.storage.get_workload(member).await?;
                    if best.map_or(true, |(min, _)| load < min) {
                        best = Some((load, member));
                    }
                }
                let (_, member) = best.ok_or_else(|| {
                    NodeError::ExecutionFailed(format!("no assignable member in role {}", role))
                })?;
                self.storage.increment_workload(member).await?;
                member.clone()
            }
        };
        Ok(Some(chosen))
    }

    pub(crate) async fn approval(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: ApprovalConfig = node_config(node)?;
        let title = config
            .title
            .or_else(|| node.name.clone())
            .unwrap_or_else(|| node.id.clone());
        let approval = Approval {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: ctx.instance_id.clone(),
            node_id: node.id.clone(),
            title: self.evaluator.substitute(&title, &ctx.variables),
            approvers: config.approvers,
            approval_type: config.approval_type.unwrap_or_else(|| "any".to_string()),
            decisions: Vec::new(),
            status: "pending".to_string(),
            created_at: Utc::now(),
        };
        self.storage.insert_approval(&approval).await?;

        Ok(NodeExecutionResult::waiting(WaitDescriptor {
            kind: WaitKind::Approval,
            id: approval.id.clone(),
            deadline: None,
        })
        .with_output(json!({
            "approval_id": approval.id,
            "approvers": approval.approvers,
            "approval_type": approval.approval_type,
        })))
    }

    pub(crate) fn form(&mut self, node: &NodeSpec, _ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: FormConfig = node_config(node)?;
        let form_id = config
            .form_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| NodeError::Configuration(format!("No form configured for form node {}", node.id)))?;

        Ok(NodeExecutionResult::waiting(WaitDescriptor {
            kind: WaitKind::Form,
            id: form_id.clone(),
            deadline: None,
        })
        .with_output(json!({ "form_id": form_id })))
    }

    pub(crate) fn screen(&mut self, node: &NodeSpec, _ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: ScreenConfig = node_config(node)?;
        let screen_id = config.screen_id.unwrap_or_else(|| node.id.clone());

        Ok(NodeExecutionResult::waiting(WaitDescriptor {
            kind: WaitKind::Screen,
            id: screen_id.clone(),
            deadline: None,
        })
        .with_output(json!({ "screen_id": screen_id })))
    }
}
