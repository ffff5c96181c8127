//! Tool registry and bounded runner.
//!
//! The runner never fails: every way a call can go wrong (unknown name,
//! invalid arguments, timeout, execution failure) is normalized into a
//! [`ToolOutcome`] so the orchestrator can always materialize a tool-result
//! message for the model. Outcomes are returned in input order.

use crate::llm::model::{ToolCall, ToolDefinition, ToolErrorKind, ToolOutcome};
use crate::tools::ToolProvider;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry mapping tool names to providers.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolProvider>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: ToolProvider + 'static>(mut self, tool: T) -> Self {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
        self
    }

    pub fn register_arc(&mut self, tool: Arc<dyn ToolProvider>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolProvider>> {
        self.tools.get(name)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Definitions for the tools in `allowed`, in the allow-list's order.
    /// Names without a registered provider are skipped.
    pub fn definitions_for(&self, allowed: &[String]) -> Vec<ToolDefinition> {
        allowed
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Execute `calls` sequentially, in their arrival order. The returned
    /// vector pairs one outcome per call, same order, so adapters can route
    /// results by `tool_call_id`.
    pub async fn run_calls(&self, calls: &[ToolCall]) -> Vec<ToolOutcome> {
        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            outcomes.push(self.run_one(call).await);
        }
        outcomes
    }

    async fn run_one(&self, call: &ToolCall) -> ToolOutcome {
        let Some(tool) = self.tools.get(&call.name) else {
            return ToolOutcome::failure(
                call,
                ToolErrorKind::NotFound,
                format!("tool '{}' is not registered", call.name),
            );
        };

        if let Err(reason) = validate_arguments(&tool.parameters(), &call.arguments) {
            return ToolOutcome::failure(call, ToolErrorKind::Validation, reason);
        }

        match tokio::time::timeout(tool.timeout(), tool.execute(call)).await {
            Ok(Ok(value)) => ToolOutcome::success(call, value),
            Ok(Err(message)) => ToolOutcome::failure(call, ToolErrorKind::Execution, message),
            Err(_) => ToolOutcome::failure(
                call,
                ToolErrorKind::Timeout,
                format!(
                    "tool '{}' exceeded its {}s budget",
                    call.name,
                    tool.timeout().as_secs()
                ),
            ),
        }
    }
}

/// Minimal schema check: the arguments must be an object, carry every
/// `required` member, and match declared primitive property types. Schemas
/// are plain JSON values end to end, so this walks them directly.
pub fn validate_arguments(
    schema: &serde_json::Value,
    arguments: &serde_json::Value,
) -> Result<(), String> {
    let Some(args) = arguments.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };
    if args.contains_key(crate::llm::model::PARTIAL_ARGUMENTS_KEY) {
        return Err("arguments did not finish streaming".to_string());
    }
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for name in required.iter().filter_map(|v| v.as_str()) {
            if !args.contains_key(name) {
                return Err(format!("missing required argument '{name}'"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) {
        for (name, value) in args {
            let Some(declared) = properties
                .get(name)
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
            else {
                continue;
            };
            let matches = match declared {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(format!("argument '{name}' must be of type {declared}"));
            }
        }
    }
    Ok(())
}
