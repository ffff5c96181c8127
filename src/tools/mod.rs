//! Tool execution surface offered to the models.
//!
//! A [`ToolProvider`] supplies a name, a JSON-schema parameter description
//! and an async execution body; the [`registry::ToolRegistry`] owns lookup,
//! argument validation, timeouts and error normalization.

pub mod registry;

pub use registry::ToolRegistry;

use crate::llm::model::ToolCall;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Default per-tool execution budget.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// One executable tool.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> String;

    /// JSON Schema describing the accepted arguments.
    fn parameters(&self) -> serde_json::Value;

    /// Per-tool override of the execution budget.
    fn timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    /// Run the tool. `Err` carries a message the model will see verbatim.
    async fn execute(&self, call: &ToolCall) -> Result<serde_json::Value, String>;
}

type FnToolBody = Box<
    dyn Fn(ToolCall) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send>>
        + Send
        + Sync,
>;

/// Closure-backed tool, the quickest way to register one.
pub struct FnTool {
    name: String,
    description: String,
    parameters: serde_json::Value,
    timeout: Duration,
    body: FnToolBody,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        body: F,
    ) -> Self
    where
        F: Fn(ToolCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        FnTool {
            name: name.into(),
            description: description.into(),
            parameters,
            timeout: DEFAULT_TOOL_TIMEOUT,
            body: Box::new(move |call| Box::pin(body(call))),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ToolProvider for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn parameters(&self) -> serde_json::Value {
        self.parameters.clone()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self, call: &ToolCall) -> Result<serde_json::Value, String> {
        (self.body)(call.clone()).await
    }
}
