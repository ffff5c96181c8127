//! Provider adapter contract.
//!
//! One [`ProviderAdapter`] per upstream vendor translates between the
//! canonical chat model and the vendor wire format. The rest of the gateway
//! addresses adapters only through this trait; the [`Provider`] table below
//! replaces dynamic lookup with a compile-time match.

use crate::config::ModelSpec;
use crate::llm::error::GatewayError;
use crate::llm::model::{Message, Response, ResponseChunk, ToolDefinition};
use crate::llm::throttle::Throttler;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

/// Lazy, finite, non-restartable sequence of response chunks. Dropping it
/// aborts the in-flight upstream request and releases the throttler permit.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ResponseChunk, GatewayError>> + Send>>;

// ============================================================================
// Providers
// ============================================================================

/// Supported upstream vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
    Mistral,
    VLlm,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::Mistral => "mistral",
            Provider::VLlm => "vllm",
        }
    }

    pub fn parse(raw: &str) -> Option<Provider> {
        match raw {
            "openai" => Some(Provider::OpenAi),
            "anthropic" => Some(Provider::Anthropic),
            "google" | "gemini" => Some(Provider::Google),
            "mistral" => Some(Provider::Mistral),
            "vllm" => Some(Provider::VLlm),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Request options
// ============================================================================

/// Upstream endpoint credentials and location, resolved from the model spec
/// and environment before an adapter is built.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: String,
}

impl ProviderConfig {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        ProviderConfig {
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    /// Upstream identity used by the throttler: one gate per endpoint.
    pub fn upstream_id(&self) -> &str {
        &self.base_url
    }
}

/// Structured-output request, normalized across vendors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
    JsonSchema { schema: serde_json::Value },
}

/// How the model may choose among offered tools.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    None,
    /// Force a specific tool by name.
    Tool(String),
}

/// Extended-reasoning options; passed through where the vendor supports
/// them and ignored otherwise.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingOptions {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

/// Canonical chat request handed to an adapter.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Normalized stop sequences; adapters rename the key per vendor.
    pub stop: Vec<String>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub response_format: Option<ResponseFormat>,
    pub thinking: Option<ThinkingOptions>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        ChatRequest {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }
}

/// What an adapter can do for a given model.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub tools: bool,
    pub images: bool,
    pub structured_output: bool,
    pub streaming: bool,
    pub max_output_tokens: u32,
    pub context_length: u32,
}

// ============================================================================
// Adapter trait
// ============================================================================

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Capability set for one model, merging provider defaults with the
    /// model spec's overrides.
    fn capabilities(&self, model: &ModelSpec) -> Capabilities;

    /// Fails with `Configuration` on a missing key, a key that does not
    /// match the vendor's prefix, or an absent base URL.
    fn validate_config(&self) -> Result<(), GatewayError>;

    /// Fails with `Validation` on an empty message list or a tool definition
    /// whose schema is not a JSON object.
    fn validate_request(&self, req: &ChatRequest) -> Result<(), GatewayError>;

    /// Full request/response round trip.
    async fn chat(&self, req: &ChatRequest) -> Result<Response, GatewayError>;

    /// Streaming round trip. The stream is consumed exactly once.
    async fn stream(&self, req: &ChatRequest) -> Result<ChunkStream, GatewayError>;
}

/// Compile-time provider table. Every vendor shares the gateway's HTTP
/// client and throttler.
pub fn adapter_for(
    provider: Provider,
    config: ProviderConfig,
    http: reqwest::Client,
    throttler: Arc<Throttler>,
) -> Arc<dyn ProviderAdapter> {
    match provider {
        Provider::OpenAi => Arc::new(crate::llm::openai::OpenAiCompatAdapter::openai(
            config, http, throttler,
        )),
        Provider::Mistral => Arc::new(crate::llm::openai::OpenAiCompatAdapter::mistral(
            config, http, throttler,
        )),
        Provider::VLlm => Arc::new(crate::llm::openai::OpenAiCompatAdapter::vllm(
            config, http, throttler,
        )),
        Provider::Anthropic => Arc::new(crate::llm::anthropic::AnthropicAdapter::new(
            config, http, throttler,
        )),
        Provider::Google => Arc::new(crate::llm::google::GoogleAdapter::new(
            config, http, throttler,
        )),
    }
}

// ============================================================================
// Shared helpers for vendor implementations
// ============================================================================

/// Validation shared by every vendor: non-empty conversation, object-typed
/// tool schemas.
pub(crate) fn validate_request_common(req: &ChatRequest) -> Result<(), GatewayError> {
    if req.messages.is_empty() {
        return Err(GatewayError::Validation(
            "message list must not be empty".to_string(),
        ));
    }
    for tool in &req.tools {
        if !tool.parameters.is_object() {
            return Err(GatewayError::Validation(format!(
                "tool '{}' has no object schema",
                tool.name
            )));
        }
    }
    Ok(())
}

/// Classify a non-2xx upstream reply into the taxonomy.
pub(crate) fn classify_upstream_failure(
    provider: Provider,
    status: reqwest::StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> GatewayError {
    if status.as_u16() == 429 {
        GatewayError::RateLimit {
            provider: provider.as_str().to_string(),
            retry_after,
        }
    } else {
        GatewayError::Provider {
            provider: provider.as_str().to_string(),
            status: status.as_u16(),
            body: GatewayError::body_snippet(body),
        }
    }
}

/// Pull a Retry-After value (seconds) out of upstream headers, when present.
pub(crate) fn retry_after_seconds(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::model::Message;
    use serde_json::json;

    #[test]
    fn provider_names_round_trip() {
        for provider in [
            Provider::OpenAi,
            Provider::Anthropic,
            Provider::Google,
            Provider::Mistral,
            Provider::VLlm,
        ] {
            assert_eq!(Provider::parse(provider.as_str()), Some(provider));
        }
        assert_eq!(Provider::parse("gemini"), Some(Provider::Google));
        assert_eq!(Provider::parse("bedrock"), None);
    }

    #[test]
    fn common_validation_rejects_empty_conversations() {
        let req = ChatRequest::new("gpt-4", vec![]);
        assert!(matches!(
            validate_request_common(&req),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn common_validation_rejects_schemaless_tools() {
        let mut req = ChatRequest::new("gpt-4", vec![Message::user("hi")]);
        req.tools.push(ToolDefinition {
            name: "broken".into(),
            description: "no schema".into(),
            parameters: json!("not-an-object"),
        });
        assert!(matches!(
            validate_request_common(&req),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn upstream_429_maps_to_rate_limit() {
        let err = classify_upstream_failure(
            Provider::OpenAi,
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            Some(7),
            "slow down",
        );
        assert!(matches!(
            err,
            GatewayError::RateLimit {
                retry_after: Some(7),
                ..
            }
        ));

        let err = classify_upstream_failure(
            Provider::Anthropic,
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            None,
            "boom",
        );
        assert_eq!(err.http_status(), 502);
    }
}
