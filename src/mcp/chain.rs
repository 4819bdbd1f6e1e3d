//! Execution of synthetic tool chains.

use std::collections::BTreeSet;

use async_trait::async_trait;
use rmcp::model::{CallToolResult, Content, JsonObject, Tool};
use serde_json::{json, Value};

use crate::error::{HubError, Result};
use crate::types::{ChainOutput, ToolChainSpec};

/// Chains may call chains; this bounds the nesting.
pub const MAX_CHAIN_DEPTH: usize = 8;

/// Invokes a tool by exposed name, ignoring the allow-list.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
        depth: usize,
    ) -> Result<CallToolResult>;
}

/// Protocol descriptor for a chain. Input properties come from `$input.<key>` references.
pub fn chain_descriptor(spec: &ToolChainSpec) -> Tool {
    let mut keys = BTreeSet::new();
    for step in &spec.steps {
        for value in step.args.values() {
            collect_input_keys(value, &mut keys);
        }
    }

    let properties: serde_json::Map<String, Value> = keys
        .into_iter()
        .map(|key| (key, json!({})))
        .collect();
    let mut schema = JsonObject::new();
    schema.insert("type".into(), json!("object"));
    schema.insert("properties".into(), Value::Object(properties));

    let description = spec.description.clone().unwrap_or_else(|| {
        let tools: Vec<&str> = spec.steps.iter().map(|s| s.tool.as_str()).collect();
        format!("Tool chain: {}", tools.join(" -> "))
    });
    Tool::new(spec.name.clone(), description, schema)
}

fn collect_input_keys(value: &Value, keys: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            if let Some(key) = s.strip_prefix("$input.") {
                keys.insert(key.to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_input_keys(v, keys)),
        Value::Object(map) => map.values().for_each(|v| collect_input_keys(v, keys)),
        _ => {}
    }
}

/// Run every step in order, threading results through argument templates.
pub async fn run_chain(
    spec: &ToolChainSpec,
    input: Option<JsonObject>,
    invoker: &dyn ToolInvoker,
    depth: usize,
) -> Result<CallToolResult> {
    if depth >= MAX_CHAIN_DEPTH {
        return Err(HubError::InvalidState(format!(
            "tool chain {} exceeded nesting depth {MAX_CHAIN_DEPTH}",
            spec.name
        )));
    }

    let input = Value::Object(input.unwrap_or_default());
    let mut outputs: Vec<Value> = Vec::with_capacity(spec.steps.len());
    let mut last: Option<CallToolResult> = None;

    for (index, step) in spec.steps.iter().enumerate() {
        let scope = TemplateScope {
            input: &input,
            outputs: &outputs,
        };
        let arguments: JsonObject = step
            .args
            .iter()
            .map(|(key, value)| (key.clone(), scope.resolve(value)))
            .collect();

        tracing::debug!(chain = %spec.name, step = index, tool = %step.tool, "running chain step");
        let result = match invoker.invoke(&step.tool, Some(arguments), depth + 1).await {
            Ok(result) if result.is_error != Some(true) => result,
            Ok(result) => {
                return Ok(step_failure(spec, index, &step.tool, &result_text(&result)));
            }
            Err(error) => return Ok(step_failure(spec, index, &step.tool, &error.to_string())),
        };

        outputs.push(result_value(&result));
        last = Some(result);
    }

    match spec.output {
        ChainOutput::Last => last.ok_or_else(|| {
            HubError::InvalidArgument(format!("tool chain {} has no steps", spec.name))
        }),
        ChainOutput::All => {
            let combined = json!({ "steps": outputs });
            let mut result = CallToolResult::success(vec![Content::text(combined.to_string())]);
            result.structured_content = Some(combined);
            Ok(result)
        }
    }
}

fn step_failure(spec: &ToolChainSpec, index: usize, tool: &str, reason: &str) -> CallToolResult {
    tracing::warn!(chain = %spec.name, step = index, tool, reason, "tool chain step failed");
    CallToolResult::error(vec![Content::text(format!(
        "tool chain {} failed at step {index} ({tool}): {reason}",
        spec.name
    ))])
}

struct TemplateScope<'a> {
    input: &'a Value,
    outputs: &'a [Value],
}

impl TemplateScope<'_> {
    fn resolve(&self, value: &Value) -> Value {
        match value {
            Value::String(template) => self.lookup(template).unwrap_or_else(|| value.clone()),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn lookup(&self, template: &str) -> Option<Value> {
        if template == "$input" {
            return Some(self.input.clone());
        }
        if let Some(key) = template.strip_prefix("$input.") {
            return Some(self.input.get(key).cloned().unwrap_or(Value::Null));
        }
        if template == "$prev" {
            return Some(self.outputs.last().cloned().unwrap_or(Value::Null));
        }
        if let Some(index) = template.strip_prefix("$steps.") {
            let index: usize = index.parse().ok()?;
            return Some(self.outputs.get(index).cloned().unwrap_or(Value::Null));
        }
        None
    }
}

/// The value a step contributes to later templates.
fn result_value(result: &CallToolResult) -> Value {
    if let Some(structured) = &result.structured_content {
        return structured.clone();
    }
    Value::String(result_text(result))
}

fn result_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|item| item.as_text().map(|text| text.text.clone()))
        .collect::<Vec<_>>()
        .join("\n")
}
