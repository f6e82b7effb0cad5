//! Loop nodes and the executor's loop-nesting stack.
//!
//! Loop nodes report iteration metadata (`continue_loop`, bounds, counters)
//! but traversal does not re-enter loop bodies; the stack only tracks the
//! loops entered during one executor's lifetime.

use crate::executor::{node_config, NodeExecutor};
use chrono::{DateTime, Utc};
use orchcore::{NodeContext, NodeError, NodeExecutionResult, NodeKind, NodeSpec};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub struct LoopContext {
    pub loop_id: String,
    pub loop_type: NodeKind,
    /// 0 for the outermost loop
    pub nesting_level: usize,
    pub iteration: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LoopStack {
    frames: Vec<LoopContext>,
    max_depth: usize,
}

impl LoopStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
        }
    }

    /// Push a loop frame; fails once `max_depth` loops are already open
    pub fn enter_loop(&mut self, loop_id: &str, loop_type: NodeKind) -> Result<&LoopContext, NodeError> {
        if self.frames.len() >= self.max_depth {
            return Err(NodeError::LoopDepthExceeded {
                max: self.max_depth,
            });
        }
        self.frames.push(LoopContext {
            loop_id: loop_id.to_string(),
            loop_type,
            nesting_level: self.frames.len(),
            iteration: 0,
            started_at: Utc::now(),
        });
        Ok(&self.frames[self.frames.len() - 1])
    }

    pub fn exit_loop(&mut self) -> Option<LoopContext> {
        self.frames.pop()
    }

    pub fn current(&self) -> Option<&LoopContext> {
        self.frames.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut LoopContext> {
        self.frames.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ForEachConfig {
    collection: Value,
    item_variable: Option<String>,
    index_variable: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConditionLoopConfig {
    condition: Option<String>,
    max_iterations: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RepeatConfig {
    #[serde(alias = "times")]
    count: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoopControlConfig {
    condition: Option<String>,
}

const DEFAULT_MAX_ITERATIONS: u64 = 100;

impl NodeExecutor<'_> {
    pub(crate) fn loop_for_each(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: ForEachConfig = node_config(node)?;
        let items = match self.resolve_input(&config.collection, &ctx.variables) {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(NodeError::Configuration(format!(
                    "collection for loop {} is not a list: {}",
                    node.id, other
                )))
            }
        };
        let total = items.len();
        let frame = self.loops.enter_loop(&node.id, node.kind.clone())?;

        Ok(NodeExecutionResult::completed().with_output(json!({
            "loop": true,
            "loop_type": node.kind.as_str(),
            "nesting_level": frame.nesting_level,
            "total_items": total,
            "current_index": 0,
            "item_variable": config.item_variable.unwrap_or_else(|| "item".to_string()),
            "index_variable": config.index_variable.unwrap_or_else(|| "index".to_string()),
            "continue_loop": total > 0,
            "collection": items,
        })))
    }

    pub(crate) fn loop_while(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: ConditionLoopConfig = node_config(node)?;
        let condition = config.condition.ok_or_else(|| {
            NodeError::Configuration(format!("No condition configured for loop {}", node.id))
        })?;
        let holds = self
            .evaluator
            .evaluate_condition(&condition, &ctx.variables)
            .unwrap_or(false);
        let frame = self.loops.enter_loop(&node.id, node.kind.clone())?;

        Ok(NodeExecutionResult::completed().with_output(json!({
            "loop": true,
            "loop_type": node.kind.as_str(),
            "nesting_level": frame.nesting_level,
            "condition": condition,
            "iteration": 0,
            "max_iterations": config.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
            "continue_loop": holds,
        })))
    }

    /// The body of a do-while always runs once, so `continue_loop` starts true
    pub(crate) fn loop_do_while(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: ConditionLoopConfig = node_config(node)?;
        let condition = config.condition.unwrap_or_default();
        let holds = if condition.is_empty() {
            false
        } else {
            self.evaluator
                .evaluate_condition(&condition, &ctx.variables)
                .unwrap_or(false)
        };
        let frame = self.loops.enter_loop(&node.id, node.kind.clone())?;

        Ok(NodeExecutionResult::completed().with_output(json!({
            "loop": true,
            "loop_type": node.kind.as_str(),
            "nesting_level": frame.nesting_level,
            "condition": condition,
            "condition_result": holds,
            "iteration": 0,
            "max_iterations": config.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
            "continue_loop": true,
        })))
    }

    pub(crate) fn loop_repeat(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: RepeatConfig = node_config(node)?;
        let count = match self.resolve_input(&config.count, &ctx.variables) {
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            Value::String(s) => s.trim().parse::<f64>().map_err(|_| {
                NodeError::Configuration(format!("repeat count '{}' on {} is not a number", s, node.id))
            })?,
            Value::Null => 0.0,
            other => {
                return Err(NodeError::Configuration(format!(
                    "repeat count on {} is not a number: {}",
                    node.id, other
                )))
            }
        };
        let total = count.max(0.0) as u64;
        let frame = self.loops.enter_loop(&node.id, node.kind.clone())?;

        Ok(NodeExecutionResult::completed().with_output(json!({
            "loop": true,
            "loop_type": node.kind.as_str(),
            "nesting_level": frame.nesting_level,
            "total_iterations": total,
            "current_iteration": 0,
            "continue_loop": total > 0,
        })))
    }

    /// `loop_break` / `loop_continue`: signal when the optional guard holds
    pub(crate) fn loop_control(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: LoopControlConfig = node_config(node)?;
        let triggered = match config.condition.as_deref() {
            None | Some("") => true,
            Some(condition) => self
                .evaluator
                .evaluate_condition(condition, &ctx.variables)
                .unwrap_or(false),
        };
        if !triggered {
            return Ok(NodeExecutionResult::completed().with_output(json!({ "condition_met": false })));
        }

        let is_break = node.kind == NodeKind::LoopBreak;
        let exited = if is_break {
            self.loops.exit_loop().map(|frame| frame.loop_id)
        } else {
            if let Some(frame) = self.loops.current_mut() {
                frame.iteration += 1;
            }
            None
        };
        let output = json!({
            "condition_met": true,
            "loop_control": if is_break { "break" } else { "continue" },
            "exited_loop": exited,
        });

        let result = if is_break {
            NodeExecutionResult::break_loop()
        } else {
            NodeExecutionResult::continue_loop()
        };
        Ok(result.with_output(output))
    }
}
