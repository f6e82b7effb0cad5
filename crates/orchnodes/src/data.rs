//! Record nodes against named storage collections, and the data-shaping
//! nodes (transform, filter, sort, aggregate, calculate).

use crate::executor::{node_config, NodeExecutor};
use orchcore::expression::{is_truthy, lookup, value_to_string};
use orchcore::storage::Criteria;
use orchcore::{NodeContext, NodeError, NodeExecutionResult, NodeSpec};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RecordConfig {
    collection: Option<String>,
    criteria: Map<String, Value>,
    #[serde(alias = "data", alias = "record")]
    fields: Map<String, Value>,
    output_variable: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TransformConfig {
    input: Value,
    functions: Vec<String>,
    mapping: Map<String, Value>,
    output_variable: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FilterConfig {
    input: Value,
    condition: Option<String>,
    output_variable: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SortConfig {
    input: Value,
    key: Option<String>,
    order: Option<String>,
    output_variable: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AggregateConfig {
    input: Value,
    operation: Option<String>,
    field: Option<String>,
    output_variable: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CalculateConfig {
    expression: Option<String>,
    output_variable: Option<String>,
}

impl RecordConfig {
    fn collection(&self, node: &NodeSpec) -> Result<String, NodeError> {
        self.collection
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| NodeError::Configuration(format!("No collection configured for {} node {}", node.kind, node.id)))
    }
}

impl NodeExecutor<'_> {
    fn evaluate_map(&self, map: &Map<String, Value>, variables: &HashMap<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.evaluate_value(v, variables)))
            .collect()
    }

    pub(crate) async fn lookup_record(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: RecordConfig = node_config(node)?;
        let collection = config.collection(node)?;
        let criteria: Criteria = self.evaluate_map(&config.criteria, &ctx.variables);

        let records = self.storage.find_records(&collection, &criteria).await?;
        let first = records.first().cloned().unwrap_or(Value::Null);
        if let Some(name) = config.output_variable {
            ctx.variables.insert(name, Value::Array(records.clone()));
        }
        Ok(NodeExecutionResult::completed().with_output(json!({
            "count": records.len(),
            "record": first,
            "records": records,
        })))
    }

    pub(crate) async fn create_record(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: RecordConfig = node_config(node)?;
        let collection = config.collection(node)?;
        let fields = self.evaluate_map(&config.fields, &ctx.variables);

        let record_id = self.storage.insert_record(&collection, Value::Object(fields)).await?;
        ctx.events.info(format!("Created record {} in {}", record_id, collection));
        if let Some(name) = config.output_variable {
            ctx.variables.insert(name, Value::String(record_id.clone()));
        }
        Ok(NodeExecutionResult::completed().with_output(json!({ "record_id": record_id, "collection": collection })))
    }

    pub(crate) async fn update_record(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: RecordConfig = node_config(node)?;
        let collection = config.collection(node)?;
        let criteria = self.evaluate_map(&config.criteria, &ctx.variables);
        let fields = self.evaluate_map(&config.fields, &ctx.variables);

        let updated = self.storage.update_records(&collection, &criteria, &fields).await?;
        Ok(NodeExecutionResult::completed().with_output(json!({ "updated_count": updated })))
    }

    pub(crate) async fn delete_record(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: RecordConfig = node_config(node)?;
        let collection = config.collection(node)?;
        let criteria = self.evaluate_map(&config.criteria, &ctx.variables);
        if criteria.is_empty() {
            return Err(NodeError::Configuration(format!(
                "Refusing to delete from {} without criteria on node {}",
                collection, node.id
            )));
        }

        let deleted = self.storage.delete_records(&collection, &criteria).await?;
        Ok(NodeExecutionResult::completed().with_output(json!({ "deleted_count": deleted })))
    }

    /// Apply the function pipeline in order, then the field mapping
    pub(crate) fn transform(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: TransformConfig = node_config(node)?;
        let mut value = self.resolve_input(&config.input, &ctx.variables);
        for function in &config.functions {
            value = apply_function(function, value)
                .map_err(|e| NodeError::ExecutionFailed(format!("Transform '{}' failed on {}: {}", function, node.id, e)))?;
        }

        if !config.mapping.is_empty() {
            let scope = item_scope(&ctx.variables, &value);
            let mapped: Map<String, Value> = config
                .mapping
                .iter()
                .map(|(target, source)| {
                    let resolved = match source {
                        Value::String(path) => match &value {
                            Value::Object(_) => lookup(&scope, &format!("item.{}", path))
                                .cloned()
                                .unwrap_or_else(|| self.evaluator.evaluate(path, &scope)),
                            _ => self.evaluator.evaluate(path, &scope),
                        },
                        other => other.clone(),
                    };
                    (target.clone(), resolved)
                })
                .collect();
            value = Value::Object(mapped);
        }

        store_output(ctx, config.output_variable, &value);
        Ok(NodeExecutionResult::completed().with_output(json!({ "result": value })))
    }

    /// Keep items whose condition holds; object fields and `item` are in scope
    pub(crate) fn filter(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: FilterConfig = node_config(node)?;
        let condition = config
            .condition
            .ok_or_else(|| NodeError::Configuration(format!("No condition configured for filter {}", node.id)))?;
        let items = as_list(node, self.resolve_input(&config.input, &ctx.variables))?;

        let kept: Vec<Value> = items
            .into_iter()
            .filter(|item| {
                let scope = item_scope(&ctx.variables, item);
                self.evaluator.evaluate_condition(&condition, &scope) == Some(true)
            })
            .collect();

        let result = Value::Array(kept);
        store_output(ctx, config.output_variable, &result);
        Ok(NodeExecutionResult::completed().with_output(json!({
            "count": result.as_array().map_or(0, Vec::len),
            "result": result,
        })))
    }

    pub(crate) fn sort(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: SortConfig = node_config(node)?;
        let mut items = as_list(node, self.resolve_input(&config.input, &ctx.variables))?;
        let descending = match config.order.as_deref().map(str::to_lowercase).as_deref() {
            None | Some("asc") | Some("ascending") => false,
            Some("desc") | Some("descending") => true,
            Some(other) => {
                return Err(NodeError::Configuration(format!("Unknown sort order '{}' on {}", other, node.id)))
            }
        };

        let key = config.key;
        items.sort_by(|a, b| {
            let (a, b) = match &key {
                Some(key) => (field(a, key), field(b, key)),
                None => (Some(a), Some(b)),
            };
            compare_sort_keys(a, b, descending)
        });

        let result = Value::Array(items);
        store_output(ctx, config.output_variable, &result);
        Ok(NodeExecutionResult::completed().with_output(json!({ "result": result })))
    }

    pub(crate) fn aggregate(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: AggregateConfig = node_config(node)?;
        let operation = config.operation.unwrap_or_else(|| "sum".to_string());
        let items = as_list(node, self.resolve_input(&config.input, &ctx.variables))?;

        let numbers: Vec<f64> = items
            .iter()
            .filter_map(|item| match &config.field {
                Some(f) => field(item, f),
                None => Some(item),
            })
            .filter_map(Value::as_f64)
            .collect();

        let result = match operation.as_str() {
            "sum" => number(numbers.iter().sum()),
            "count" => json!(numbers.len()),
            "average" | "avg" if numbers.is_empty() => Value::Null,
            "average" | "avg" => number(numbers.iter().sum::<f64>() / numbers.len() as f64),
            "min" => numbers.iter().copied().reduce(f64::min).map_or(Value::Null, number),
            "max" => numbers.iter().copied().reduce(f64::max).map_or(Value::Null, number),
            other => {
                return Err(NodeError::Configuration(format!(
                    "Unknown aggregate operation '{}' on {}",
                    other, node.id
                )))
            }
        };

        store_output(ctx, config.output_variable, &result);
        Ok(NodeExecutionResult::completed().with_output(json!({
            "operation": operation,
            "result": result,
        })))
    }

    pub(crate) fn calculate(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: CalculateConfig = node_config(node)?;
        let expression = config
            .expression
            .ok_or_else(|| NodeError::Configuration(format!("No expression configured for calculate {}", node.id)))?;
        let output_variable = config.output_variable.unwrap_or_else(|| "result".to_string());

        let value = self.evaluator.evaluate(&expression, &ctx.variables);
        ctx.variables.insert(output_variable.clone(), value.clone());
        Ok(NodeExecutionResult::completed().with_output(json!({
            "output_variable": output_variable,
            "result": value,
        })))
    }
}

fn store_output(ctx: &mut NodeContext, output_variable: Option<String>, value: &Value) {
    if let Some(name) = output_variable {
        ctx.variables.insert(name, value.clone());
    }
}

fn as_list(node: &NodeSpec, value: Value) -> Result<Vec<Value>, NodeError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(NodeError::Configuration(format!(
            "input for {} is not a list: {}",
            node.id, other
        ))),
    }
}

/// Instance variables overlaid with the item's own fields and `item` itself
fn item_scope(variables: &HashMap<String, Value>, item: &Value) -> HashMap<String, Value> {
    let mut scope = variables.clone();
    if let Value::Object(fields) = item {
        for (k, v) in fields {
            scope.insert(k.clone(), v.clone());
        }
    }
    scope.insert("item".to_string(), item.clone());
    scope
}

fn field<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(item, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => items.get(part.parse::<usize>().ok()?),
        _ => None,
    })
}

/// Nulls and missing keys sort last in either direction
fn compare_sort_keys(a: Option<&Value>, b: Option<&Value>, descending: bool) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let ord = match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => value_to_string(a).cmp(&value_to_string(b)),
            };
            if descending {
                ord.reverse()
            } else {
                ord
            }
        }
    }
}

/// Whole results stay integers
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

fn apply_function(function: &str, value: Value) -> Result<Value, String> {
    let result = match (function, value) {
        ("uppercase", Value::String(s)) => Value::String(s.to_uppercase()),
        ("lowercase", Value::String(s)) => Value::String(s.to_lowercase()),
        ("trim", Value::String(s)) => Value::String(s.trim().to_string()),
        ("to_number", Value::String(s)) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                json!(i)
            } else {
                let f = trimmed
                    .parse::<f64>()
                    .map_err(|_| format!("'{}' is not a number", s))?;
                json!(f)
            }
        }
        ("to_number", Value::Bool(b)) => json!(b as i64),
        ("to_number", n @ Value::Number(_)) => n,
        ("to_string", v) => Value::String(value_to_string(&v)),
        ("reverse", Value::String(s)) => Value::String(s.chars().rev().collect()),
        ("reverse", Value::Array(mut items)) => {
            items.reverse();
            Value::Array(items)
        }
        ("length", Value::String(s)) => json!(s.chars().count()),
        ("length", Value::Array(items)) => json!(items.len()),
        ("length", Value::Object(map)) => json!(map.len()),
        ("sort", Value::Array(mut items)) => {
            items.sort_by(|a, b| compare_sort_keys(Some(a), Some(b), false));
            Value::Array(items)
        }
        ("unique", Value::Array(items)) => {
            let mut seen: Vec<Value> = Vec::with_capacity(items.len());
            for item in items {
                if !seen.contains(&item) {
                    seen.push(item);
                }
            }
            Value::Array(seen)
        }
        ("flatten", Value::Array(items)) => Value::Array(
            items
                .into_iter()
                .flat_map(|item| match item {
                    Value::Array(inner) => inner,
                    other => vec![other],
                })
                .collect(),
        ),
        ("keys", Value::Object(map)) => Value::Array(map.keys().cloned().map(Value::String).collect()),
        ("values", Value::Object(map)) => Value::Array(map.into_iter().map(|(_, v)| v).collect()),
        ("first", Value::Array(items)) => items.into_iter().next().unwrap_or(Value::Null),
        ("last", Value::Array(items)) => items.into_iter().last().unwrap_or(Value::Null),
        ("json_parse", Value::String(s)) => {
            serde_json::from_str(&s).map_err(|e| format!("JSON parse error: {}", e))?
        }
        ("json_stringify", v) => Value::String(
            serde_json::to_string(&v).map_err(|e| format!("JSON stringify error: {}", e))?,
        ),
        ("truthy", v) => Value::Bool(is_truthy(&v)),
        (name, v) => {
            return Err(format!(
                "unsupported function '{}' for {}",
                name,
                type_name(&v)
            ))
        }
    };
    Ok(result)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
