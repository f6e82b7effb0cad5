use crate::http::HttpClient;
use crate::loops::LoopStack;
use crate::subprocess::{SubprocessLauncher, SubprocessManager};
use chrono::{DateTime, TimeDelta, Utc};
use orchcore::expression::{lookup, ExpressionEvaluator};
use orchcore::{
    EngineConfig, NodeContext, NodeError, NodeExecutionResult, NodeKind, NodeSpec, Storage,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Executes single nodes by kind.
///
/// One executor serves one traversal step: its loop stack lives exactly as
/// long as the executor does.
pub struct NodeExecutor<'a> {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) http: Arc<dyn HttpClient>,
    pub(crate) subprocesses: SubprocessManager,
    pub(crate) launcher: Option<&'a dyn SubprocessLauncher>,
    pub(crate) evaluator: ExpressionEvaluator,
    pub(crate) config: EngineConfig,
    pub(crate) loops: LoopStack,
}

impl<'a> NodeExecutor<'a> {
    pub fn new(storage: Arc<dyn Storage>, http: Arc<dyn HttpClient>, config: EngineConfig) -> Self {
        Self {
            subprocesses: SubprocessManager::new(storage.clone(), &config),
            storage,
            http,
            launcher: None,
            evaluator: ExpressionEvaluator::new(),
            loops: LoopStack::new(config.max_loop_depth),
            config,
        }
    }

    /// Allow subprocess nodes to start child instances through `launcher`
    pub fn with_launcher(mut self, launcher: &'a dyn SubprocessLauncher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn loops(&self) -> &LoopStack {
        &self.loops
    }

    pub fn loops_mut(&mut self) -> &mut LoopStack {
        &mut self.loops
    }

    /// Run `node` against `ctx`. Handler errors become `failed` results; this
    /// never returns an error itself.
    pub async fn execute_node(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> NodeExecutionResult {
        tracing::debug!("Executing node {} ({})", node.id, node.kind);

        let outcome = match &node.kind {
            NodeKind::Start | NodeKind::End => Ok(NodeExecutionResult::completed()),
            NodeKind::Task => self.task(node, ctx).await,
            NodeKind::Decision => self.decision(node, ctx),
            NodeKind::Switch => self.switch(node, ctx),
            NodeKind::Approval => self.approval(node, ctx).await,
            NodeKind::Form => self.form(node, ctx),
            NodeKind::Screen => self.screen(node, ctx),
            NodeKind::Action => self.action(node, ctx).await,
            NodeKind::Parallel | NodeKind::Merge => Ok(NodeExecutionResult::completed()),
            NodeKind::Timer => self.timer(node, ctx),
            NodeKind::Subprocess => self.subprocess(node, ctx).await,
            NodeKind::Event => self.event(node, ctx).await,
            NodeKind::Assignment => self.assignment(node, ctx),
            NodeKind::LoopForEach => self.loop_for_each(node, ctx),
            NodeKind::LoopWhile => self.loop_while(node, ctx),
            NodeKind::LoopDoWhile => self.loop_do_while(node, ctx),
            NodeKind::LoopRepeat => self.loop_repeat(node, ctx),
            NodeKind::LoopBreak | NodeKind::LoopContinue => self.loop_control(node, ctx),
            NodeKind::LookupRecord => self.lookup_record(node, ctx).await,
            NodeKind::CreateRecord => self.create_record(node, ctx).await,
            NodeKind::UpdateRecord => self.update_record(node, ctx).await,
            NodeKind::DeleteRecord => self.delete_record(node, ctx).await,
            NodeKind::Transform => self.transform(node, ctx),
            NodeKind::Filter => self.filter(node, ctx),
            NodeKind::Sort => self.sort(node, ctx),
            NodeKind::Aggregate => self.aggregate(node, ctx),
            NodeKind::Calculate => self.calculate(node, ctx),
            NodeKind::Unknown(name) => Err(NodeError::UnknownNodeType(name.clone())),
        };

        outcome.unwrap_or_else(|e| {
            tracing::debug!("Node {} failed: {}", node.id, e);
            NodeExecutionResult::failed(e.to_string())
        })
    }

    /// Evaluate a configured value: strings go through the evaluator, arrays
    /// and objects are evaluated element-wise, other literals pass through.
    pub(crate) fn evaluate_value(&self, value: &Value, variables: &HashMap<String, Value>) -> Value {
        match value {
            Value::String(s) => self.evaluator.evaluate(s, variables),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.evaluate_value(v, variables))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.evaluate_value(v, variables)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Substitute `${...}` placeholders in every string inside `value`
    pub(crate) fn render_value(&self, value: &Value, variables: &HashMap<String, Value>) -> Value {
        match value {
            Value::String(s) => Value::String(self.evaluator.substitute(s, variables)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.render_value(v, variables))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value(v, variables)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolve a data-node input: a lone `${name}` or a variable name is
    /// looked up directly, other strings are evaluated, literals pass through.
    pub(crate) fn resolve_input(&self, input: &Value, variables: &HashMap<String, Value>) -> Value {
        match input {
            Value::String(s) => {
                let trimmed = s.trim();
                if let Some(name) = trimmed
                    .strip_prefix("${")
                    .and_then(|rest| rest.strip_suffix('}'))
                {
                    if !name.contains("${") {
                        return lookup(variables, name.trim()).cloned().unwrap_or(Value::Null);
                    }
                }
                match lookup(variables, trimmed) {
                    Some(v) => v.clone(),
                    None => self.evaluator.evaluate(trimmed, variables),
                }
            }
            other => other.clone(),
        }
    }
}

/// Decode a node's data payload into its typed configuration
pub(crate) fn node_config<T: DeserializeOwned + Default>(node: &NodeSpec) -> Result<T, NodeError> {
    if node.data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(node.data.clone()).map_err(|e| {
        NodeError::Configuration(format!(
            "invalid {} configuration on node {}: {}",
            node.kind, node.id, e
        ))
    })
}

/// `from` shifted by a user-configured number of seconds. Spans chrono
/// cannot represent are a configuration error.
pub(crate) fn offset_by_seconds(
    node: &NodeSpec,
    from: DateTime<Utc>,
    seconds: f64,
) -> Result<DateTime<Utc>, NodeError> {
    let millis = (seconds * 1000.0).round();
    let out_of_range = || {
        NodeError::Configuration(format!(
            "Time span of {} seconds on node {} is out of range",
            seconds, node.id
        ))
    };
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return Err(out_of_range());
    }
    TimeDelta::try_milliseconds(millis as i64)
        .and_then(|delta| from.checked_add_signed(delta))
        .ok_or_else(out_of_range)
}
