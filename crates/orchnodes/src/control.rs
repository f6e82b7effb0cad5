//! Branching, timing, event and assignment nodes.

use crate::executor::{node_config, offset_by_seconds, NodeExecutor};
use chrono::{DateTime, Utc};
use orchcore::expression::value_to_string;
use orchcore::records::EventRecord;
use orchcore::{NodeContext, NodeError, NodeExecutionResult, NodeSpec, WaitDescriptor, WaitKind};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DecisionConfig {
    condition: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SwitchConfig {
    #[serde(alias = "expression")]
    variable: Option<String>,
    cases: Vec<SwitchCase>,
}

#[derive(Debug, Deserialize)]
struct SwitchCase {
    id: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TimerConfig {
    #[serde(alias = "type")]
    timer_type: Option<String>,
    seconds: f64,
    minutes: f64,
    hours: f64,
    scheduled_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EventConfig {
    event_type: Option<String>,
    #[serde(alias = "name")]
    event_name: Option<String>,
    payload: Value,
    timeout_seconds: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AssignmentConfig {
    assignments: Vec<Assignment>,
}

#[derive(Debug, Deserialize)]
struct Assignment {
    variable: String,
    #[serde(default)]
    value: Value,
}

impl NodeExecutor<'_> {
    /// Evaluate the condition and route `"true"` or `"false"`. A condition
    /// that does not evaluate to a boolean routes `"false"`.
    pub(crate) fn decision(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: DecisionConfig = node_config(node)?;
        let condition = config
            .condition
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| NodeError::Configuration(format!("No condition configured for decision {}", node.id)))?;

        let outcome = match self.evaluator.evaluate_condition(&condition, &ctx.variables) {
            Some(outcome) => outcome,
            None => {
                ctx.events.warn(format!(
                    "Condition '{}' could not be evaluated, taking the false branch",
                    condition
                ));
                false
            }
        };

        Ok(NodeExecutionResult::completed()
            .with_route(if outcome { "true" } else { "false" })
            .with_output(json!({ "condition": condition, "result": outcome })))
    }

    /// First case whose value matches the evaluated variable (string-compared) wins
    pub(crate) fn switch(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: SwitchConfig = node_config(node)?;
        let variable = config
            .variable
            .ok_or_else(|| NodeError::Configuration(format!("No variable configured for switch {}", node.id)))?;
        let subject = value_to_string(&self.resolve_input(&Value::String(variable), &ctx.variables));

        let route = config
            .cases
            .iter()
            .find(|case| value_to_string(&case.value) == subject)
            .map(|case| case.id.clone())
            .unwrap_or_else(|| "default".to_string());

        Ok(NodeExecutionResult::completed()
            .with_route(route.clone())
            .with_output(json!({ "value": subject, "matched_case": route })))
    }

    pub(crate) fn timer(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: TimerConfig = node_config(node)?;
        let timer_type = config.timer_type.as_deref().unwrap_or("delay");
        let span = config.seconds + config.minutes * 60.0 + config.hours * 3600.0;
        let now = Utc::now();

        match timer_type {
            "delay" => {
                let end_time = offset_by_seconds(node, now, span)?;
                Ok(NodeExecutionResult::waiting(WaitDescriptor {
                    kind: WaitKind::Timer,
                    id: uuid::Uuid::new_v4().to_string(),
                    deadline: Some(end_time),
                })
                .with_output(json!({ "timer_type": "delay", "end_time": end_time })))
            }
            "scheduled" => {
                let raw = config.scheduled_time.ok_or_else(|| {
                    NodeError::Configuration(format!("No scheduled_time configured for timer {}", node.id))
                })?;
                let raw = self.evaluator.substitute(&raw, &ctx.variables);
                let at = DateTime::parse_from_rfc3339(raw.trim())
                    .map_err(|e| {
                        NodeError::Configuration(format!("Invalid scheduled_time '{}' on {}: {}", raw, node.id, e))
                    })?
                    .with_timezone(&Utc);
                Ok(NodeExecutionResult::waiting(WaitDescriptor {
                    kind: WaitKind::Timer,
                    id: uuid::Uuid::new_v4().to_string(),
                    deadline: Some(at),
                })
                .with_output(json!({ "timer_type": "scheduled", "end_time": at })))
            }
            "timeout" => {
                let deadline = offset_by_seconds(node, now, span)?;
                Ok(NodeExecutionResult::completed()
                    .with_output(json!({ "timer_type": "timeout", "sla_deadline": deadline })))
            }
            other => Err(NodeError::Configuration(format!(
                "Unsupported timer type '{}' on {}",
                other, node.id
            ))),
        }
    }

    pub(crate) async fn event(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: EventConfig = node_config(node)?;
        let event_type = config.event_type.as_deref().unwrap_or("send");
        let name = config
            .event_name
            .ok_or_else(|| NodeError::Configuration(format!("No event name configured for event {}", node.id)))?;
        let name = self.evaluator.substitute(&name, &ctx.variables);

        match event_type {
            "send" | "throw" => {
                let record = EventRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: name.clone(),
                    instance_id: ctx.instance_id.clone(),
                    node_id: node.id.clone(),
                    payload: self.render_value(&config.payload, &ctx.variables),
                    created_at: Utc::now(),
                };
                self.storage.insert_event(&record).await?;
                ctx.events.info(format!("Emitted event {}", name));
                Ok(NodeExecutionResult::completed()
                    .with_output(json!({ "event_id": record.id, "event_name": name })))
            }
            "receive" | "catch" => {
                let timeout = config
                    .timeout_seconds
                    .unwrap_or(self.config.default_event_timeout_secs);
                let deadline = offset_by_seconds(node, Utc::now(), timeout as f64)?;
                Ok(NodeExecutionResult::waiting(WaitDescriptor {
                    kind: WaitKind::Event,
                    id: name.clone(),
                    deadline: Some(deadline),
                })
                .with_output(json!({ "event_name": name, "timeout_at": deadline })))
            }
            other => Err(NodeError::Configuration(format!(
                "Unsupported event type '{}' on {}",
                other, node.id
            ))),
        }
    }

    pub(crate) fn assignment(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: AssignmentConfig = node_config(node)?;
        let mut assigned = serde_json::Map::new();
        for Assignment { variable, value } in config.assignments {
            let value = self.evaluate_value(&value, &ctx.variables);
            ctx.variables.insert(variable.clone(), value.clone());
            assigned.insert(variable, value);
        }
        Ok(NodeExecutionResult::completed().with_output(json!({ "assigned": assigned })))
    }
}
