// OpenAI-family adapter over the Chat Completions wire format.
//
// OpenAI, Mistral and vLLM-compatible servers all speak this dialect; the
// differences (credential prefix, token-limit field, structured-output mode,
// tool-schema sanitization) are captured by `Dialect` so one translator
// serves all three providers.

use crate::config::ModelSpec;
use crate::llm::adapter::{
    classify_upstream_failure, retry_after_seconds, validate_request_common, Capabilities,
    ChatRequest, ChunkStream, Provider, ProviderAdapter, ProviderConfig, ResponseFormat,
    ToolChoice,
};
use crate::llm::error::GatewayError;
use crate::llm::model::{
    ChunkChoice, ChunkDelta, ContentPart, FinishReason, Message, MessageContent, Response,
    ResponseChoice, ResponseChunk, Role, ToolCall, ToolCallAssembler, Usage,
};
use crate::llm::schema::{enforce_additional_properties, sanitize_for_json_object};
use crate::llm::throttle::Throttler;
use async_trait::async_trait;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

/// Wire-format siblings served by this adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    OpenAi,
    Mistral,
    VLlm,
}

pub struct OpenAiCompatAdapter {
    dialect: Dialect,
    config: ProviderConfig,
    http: reqwest::Client,
    throttler: Arc<Throttler>,
}

impl OpenAiCompatAdapter {
    pub fn openai(config: ProviderConfig, http: reqwest::Client, throttler: Arc<Throttler>) -> Self {
        Self::with_dialect(Dialect::OpenAi, config, http, throttler)
    }

    pub fn mistral(
        config: ProviderConfig,
        http: reqwest::Client,
        throttler: Arc<Throttler>,
    ) -> Self {
        Self::with_dialect(Dialect::Mistral, config, http, throttler)
    }

    pub fn vllm(config: ProviderConfig, http: reqwest::Client, throttler: Arc<Throttler>) -> Self {
        Self::with_dialect(Dialect::VLlm, config, http, throttler)
    }

    fn with_dialect(
        dialect: Dialect,
        config: ProviderConfig,
        http: reqwest::Client,
        throttler: Arc<Throttler>,
    ) -> Self {
        OpenAiCompatAdapter {
            dialect,
            config,
            http,
            throttler,
        }
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    // ------------------------------------------------------------------
    // Request formatting
    // ------------------------------------------------------------------

    fn convert_message(msg: &Message) -> WireMessage {
        match msg.role {
            Role::System => WireMessage::System {
                content: msg.text(),
            },
            Role::User => WireMessage::User {
                content: user_content(&msg.content),
            },
            Role::Assistant => {
                let tool_calls = if msg.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        msg.tool_calls
                            .iter()
                            .map(|call| WireToolCall {
                                id: call.id.clone(),
                                kind: "function".to_string(),
                                function: WireFunctionCall {
                                    name: call.name.clone(),
                                    arguments: serde_json::to_string(&call.arguments)
                                        .unwrap_or_else(|_| "{}".to_string()),
                                },
                            })
                            .collect(),
                    )
                };
                let text = msg.text();
                WireMessage::Assistant {
                    content: if text.is_empty() && tool_calls.is_some() {
                        None
                    } else {
                        Some(text)
                    },
                    tool_calls,
                }
            }
            Role::Tool => WireMessage::Tool {
                content: msg.text(),
                tool_call_id: msg.tool_call_id.clone().unwrap_or_default(),
            },
        }
    }

    fn convert_tools(&self, req: &ChatRequest) -> Option<Vec<WireTool>> {
        if req.tools.is_empty() {
            return None;
        }
        Some(
            req.tools
                .iter()
                .map(|tool| {
                    let parameters = if self.dialect == Dialect::VLlm {
                        // vLLM's guided decoding rejects several schema
                        // keywords anywhere in the document.
                        sanitize_for_json_object(&tool.parameters)
                    } else {
                        tool.parameters.clone()
                    };
                    WireTool {
                        kind: "function".to_string(),
                        function: WireFunction {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters,
                        },
                    }
                })
                .collect(),
        )
    }

    fn convert_tool_choice(choice: &ToolChoice) -> serde_json::Value {
        match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::None => json!("none"),
            ToolChoice::Tool(name) => json!({
                "type": "function",
                "function": { "name": name }
            }),
        }
    }

    /// Structured-output wiring differs across the family: OpenAI takes a
    /// strict `json_schema` (every object node closed), Mistral only
    /// `json_object`, vLLM `json_object` plus its `guided_json` extension
    /// with a sanitized schema.
    fn convert_response_format(
        &self,
        format: &ResponseFormat,
    ) -> (Option<serde_json::Value>, Option<serde_json::Value>) {
        match format {
            ResponseFormat::Text => (None, None),
            ResponseFormat::JsonObject => (Some(json!({ "type": "json_object" })), None),
            ResponseFormat::JsonSchema { schema } => match self.dialect {
                Dialect::OpenAi => (
                    Some(json!({
                        "type": "json_schema",
                        "json_schema": {
                            "name": "response",
                            "strict": true,
                            "schema": enforce_additional_properties(schema)
                        }
                    })),
                    None,
                ),
                Dialect::Mistral => (Some(json!({ "type": "json_object" })), None),
                Dialect::VLlm => (
                    Some(json!({ "type": "json_object" })),
                    Some(sanitize_for_json_object(schema)),
                ),
            },
        }
    }

    fn build_request(&self, req: &ChatRequest, stream: bool) -> WireRequest {
        let (response_format, guided_json) = match &req.response_format {
            Some(format) => self.convert_response_format(format),
            None => (None, None),
        };
        let (max_tokens, max_completion_tokens) = match self.dialect {
            Dialect::OpenAi => (None, req.max_tokens),
            Dialect::Mistral | Dialect::VLlm => (req.max_tokens, None),
        };
        WireRequest {
            model: req.model.clone(),
            messages: req.messages.iter().map(Self::convert_message).collect(),
            temperature: req.temperature,
            max_tokens,
            max_completion_tokens,
            stop: req.stop.clone(),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            tools: self.convert_tools(req),
            tool_choice: req.tool_choice.as_ref().map(Self::convert_tool_choice),
            response_format,
            guided_json,
        }
    }

    // ------------------------------------------------------------------
    // Response parsing
    // ------------------------------------------------------------------

    fn parse_response(&self, raw: serde_json::Value) -> Result<Response, GatewayError> {
        let wire: WireResponse =
            serde_json::from_value(raw.clone()).map_err(|err| GatewayError::Provider {
                provider: self.provider().to_string(),
                status: 200,
                body: format!("malformed response body: {err}"),
            })?;

        let choices = wire
            .choices
            .into_iter()
            .map(|choice| {
                let tool_calls = choice
                    .message
                    .tool_calls
                    .unwrap_or_default()
                    .into_iter()
                    .map(parse_wire_tool_call)
                    .collect::<Vec<_>>();
                let content = choice.message.content.unwrap_or_default();
                ResponseChoice {
                    index: choice.index,
                    message: Message::assistant_with_calls(content, tool_calls),
                    finish_reason: choice
                        .finish_reason
                        .as_deref()
                        .map(FinishReason::normalize),
                }
            })
            .collect();

        Ok(Response {
            id: wire.id.unwrap_or_default(),
            model: wire.model.unwrap_or_default(),
            provider: self.provider().to_string(),
            choices,
            usage: wire
                .usage
                .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens)),
            raw: Some(raw),
        })
    }

    async fn execute(&self, body: &WireRequest) -> Result<reqwest::Response, GatewayError> {
        let mut request = self
            .http
            .post(self.completions_url())
            .header("Content-Type", "application/json");
        if !self.config.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.config.api_key));
        }
        let response = request.json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_seconds(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_upstream_failure(
                self.provider(),
                status,
                retry_after,
                &body,
            ));
        }
        Ok(response)
    }
}

fn user_content(content: &MessageContent) -> serde_json::Value {
    match content {
        MessageContent::Text(text) => json!(text),
        MessageContent::Parts(parts) => json!(parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                ContentPart::Image {
                    url,
                    data,
                    media_type,
                } => {
                    // Inline payloads are stored without the data-URL prefix,
                    // so it is added back here.
                    let location = match data {
                        Some(data) => format!(
                            "data:{};base64,{}",
                            media_type.as_deref().unwrap_or("image/png"),
                            data
                        ),
                        None => url.clone().unwrap_or_default(),
                    };
                    json!({ "type": "image_url", "image_url": { "url": location } })
                }
            })
            .collect::<Vec<_>>()),
    }
}

fn parse_wire_tool_call(call: WireToolCall) -> ToolCall {
    match serde_json::from_str(&call.function.arguments) {
        Ok(arguments) => ToolCall {
            id: call.id,
            name: call.function.name,
            arguments,
        },
        Err(_) => ToolCall::partial(call.id, call.function.name, &call.function.arguments),
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn provider(&self) -> Provider {
        match self.dialect {
            Dialect::OpenAi => Provider::OpenAi,
            Dialect::Mistral => Provider::Mistral,
            Dialect::VLlm => Provider::VLlm,
        }
    }

    fn capabilities(&self, model: &ModelSpec) -> Capabilities {
        Capabilities {
            tools: model.supports_tools.unwrap_or(true),
            images: model
                .supports_images
                .unwrap_or(self.dialect == Dialect::OpenAi),
            structured_output: true,
            streaming: model.supports_streaming.unwrap_or(true),
            max_output_tokens: model.max_tokens.unwrap_or(4096),
            context_length: model.context_length,
        }
    }

    fn validate_config(&self) -> Result<(), GatewayError> {
        if self.config.base_url.trim().is_empty() {
            return Err(GatewayError::Configuration(format!(
                "{} base URL is not configured",
                self.provider()
            )));
        }
        match self.dialect {
            Dialect::OpenAi => {
                if !self.config.api_key.starts_with("sk-") {
                    return Err(GatewayError::Configuration(
                        "OpenAI API key must start with 'sk-'".to_string(),
                    ));
                }
            }
            Dialect::Mistral => {
                if self.config.api_key.trim().is_empty() {
                    return Err(GatewayError::Configuration(
                        "Mistral API key is not configured".to_string(),
                    ));
                }
            }
            // Local vLLM deployments commonly run without credentials.
            Dialect::VLlm => {}
        }
        Ok(())
    }

    fn validate_request(&self, req: &ChatRequest) -> Result<(), GatewayError> {
        validate_request_common(req)
    }

    async fn chat(&self, req: &ChatRequest) -> Result<Response, GatewayError> {
        self.validate_config()?;
        self.validate_request(req)?;

        let body = self.build_request(req, false);
        let _permit = self.throttler.acquire(self.config.upstream_id()).await?;
        let response = self.execute(&body).await?;
        let raw: serde_json::Value = response.json().await?;
        self.parse_response(raw)
    }

    async fn stream(&self, req: &ChatRequest) -> Result<ChunkStream, GatewayError> {
        self.validate_config()?;
        self.validate_request(req)?;

        let body = self.build_request(req, true);
        let permit = self.throttler.acquire(self.config.upstream_id()).await?;
        let response = self.execute(&body).await?;

        Ok(chunk_stream(
            self.provider(),
            req.model.clone(),
            Some(permit),
            response.bytes_stream().eventsource(),
        ))
    }
}

// ============================================================================
// Streaming parser
// ============================================================================

/// Translate a Chat Completions SSE event stream into canonical chunks.
///
/// Tool-call argument fragments accumulate per upstream index and are parsed
/// only once `finish_reason=tool_calls` arrives (or the stream terminates
/// with pending state). Keep-alive and index-only frames are swallowed;
/// `done=true` is emitted exactly once, on the terminal chunk.
pub(crate) fn chunk_stream<S, E>(
    provider: Provider,
    model: String,
    permit: Option<OwnedSemaphorePermit>,
    events: S,
) -> ChunkStream
where
    S: Stream<Item = Result<Event, EventStreamError<E>>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let provider_name = provider.to_string();
    let output = async_stream::stream! {
        let _permit = permit;
        futures::pin_mut!(events);

        let mut assembler = ToolCallAssembler::new();
        let mut message_id = String::new();
        let mut usage: Option<Usage> = None;
        let mut finish_seen = false;

        while let Some(event_result) = events.next().await {
            let event = match event_result {
                Ok(event) => event,
                Err(err) => {
                    yield Err(GatewayError::Streaming(format!(
                        "{provider_name} stream error: {err}"
                    )));
                    return;
                }
            };
            if event.data == "[DONE]" {
                break;
            }
            if event.data.trim().is_empty() {
                continue;
            }

            let chunk: WireChunk = match serde_json::from_str(&event.data) {
                Ok(chunk) => chunk,
                // Malformed frames are logged and skipped, not fatal.
                Err(err) => {
                    log::warn!("{provider_name}: skipping malformed stream frame: {err}");
                    continue;
                }
            };

            if message_id.is_empty() {
                if let Some(id) = chunk.id {
                    message_id = id;
                }
            }
            if let Some(wire_usage) = chunk.usage {
                usage = Some(Usage::new(
                    wire_usage.prompt_tokens,
                    wire_usage.completion_tokens,
                ));
            }

            for choice in chunk.choices {
                if let Some(content) = choice.delta.content {
                    if !content.is_empty() {
                        yield Ok(ResponseChunk {
                            id: message_id.clone(),
                            model: model.clone(),
                            provider: provider_name.clone(),
                            choices: vec![ChunkChoice {
                                index: choice.index,
                                delta: ChunkDelta {
                                    role: Some(Role::Assistant),
                                    content: Some(content),
                                    tool_calls: Vec::new(),
                                },
                                finish_reason: None,
                            }],
                            usage: None,
                            done: false,
                        });
                    }
                }

                if let Some(deltas) = choice.delta.tool_calls {
                    for delta in deltas {
                        let (name, arguments) = match delta.function {
                            Some(function) => (function.name, function.arguments),
                            None => (None, None),
                        };
                        assembler.push_delta(delta.index, delta.id, name, arguments.as_deref());
                    }
                }

                if let Some(reason) = choice.finish_reason {
                    let reason = FinishReason::normalize(&reason);
                    let tool_calls = if reason == FinishReason::ToolCalls {
                        assembler.finish()
                    } else {
                        Vec::new()
                    };
                    finish_seen = true;
                    yield Ok(ResponseChunk {
                        id: message_id.clone(),
                        model: model.clone(),
                        provider: provider_name.clone(),
                        choices: vec![ChunkChoice {
                            index: choice.index,
                            delta: ChunkDelta {
                                role: None,
                                content: None,
                                tool_calls,
                            },
                            finish_reason: Some(reason),
                        }],
                        usage: None,
                        done: false,
                    });
                }
            }
        }

        // Stream ended. Pending tool-call state (no finish frame arrived)
        // still has to reach the orchestrator.
        let leftover = assembler.finish();
        let choices = if leftover.is_empty() {
            Vec::new()
        } else {
            vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content: None,
                    tool_calls: leftover,
                },
                finish_reason: (!finish_seen).then_some(FinishReason::ToolCalls),
            }]
        };
        yield Ok(ResponseChunk {
            id: message_id,
            model,
            provider: provider_name,
            choices,
            usage,
            done: true,
        });
    };
    Box::pin(output)
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    guided_json: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum WireMessage {
    System {
        content: String,
    },
    User {
        content: serde_json::Value,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    },
    Tool {
        content: String,
        tool_call_id: String,
    },
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: String,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// Stringified JSON, as the wire format demands.
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireResponseChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireResponseChoice {
    #[serde(default)]
    index: usize,
    message: WireResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    #[serde(default)]
    index: usize,
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::model::ToolDefinition;
    use crate::llm::schema::contains_banned_keyword;
    use bytes::Bytes;
    use std::convert::Infallible;

    fn adapter(dialect: Dialect) -> OpenAiCompatAdapter {
        let key = match dialect {
            Dialect::OpenAi => "sk-test",
            Dialect::Mistral => "mi-test",
            Dialect::VLlm => "",
        };
        OpenAiCompatAdapter::with_dialect(
            dialect,
            ProviderConfig::new(key, "http://localhost:9000/v1"),
            reqwest::Client::new(),
            Arc::new(Throttler::default()),
        )
    }

    fn request_with_tool(dialect: Dialect, parameters: serde_json::Value) -> serde_json::Value {
        let adapter = adapter(dialect);
        let mut req = ChatRequest::new("m", vec![Message::user("hi")]);
        req.tools.push(ToolDefinition {
            name: "lookup".into(),
            description: "Look something up".into(),
            parameters,
        });
        serde_json::to_value(adapter.build_request(&req, false)).unwrap()
    }

    #[test]
    fn conversation_round_trips_through_the_wire_format() {
        let adapter = adapter(Dialect::OpenAi);
        let call = ToolCall {
            id: "call_1".into(),
            name: "get_weather".into(),
            arguments: json!({"city": "Paris"}),
        };
        let req = ChatRequest::new(
            "gpt-4",
            vec![
                Message::system("Be terse."),
                Message::user("Weather in Paris?"),
                Message::assistant_with_calls("", vec![call]),
                Message::tool_result("call_1", "get_weather", "sunny", false),
            ],
        );
        let body = serde_json::to_value(adapter.build_request(&req, false)).unwrap();
        let messages = body["messages"].as_array().unwrap();

        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
        // Assistant tool-call content is omitted when empty.
        assert!(messages[2].get("content").is_none());
        assert_eq!(messages[2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["arguments"],
            r#"{"city":"Paris"}"#
        );
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
    }

    #[test]
    fn image_parts_become_image_urls_with_data_prefix() {
        let adapter = adapter(Dialect::OpenAi);
        let req = ChatRequest::new(
            "gpt-4",
            vec![Message::user(MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "What is this?".into(),
                },
                ContentPart::Image {
                    url: None,
                    data: Some("AAAA".into()),
                    media_type: Some("image/jpeg".into()),
                },
            ]))],
        );
        let body = serde_json::to_value(adapter.build_request(&req, false)).unwrap();
        let parts = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/jpeg;base64,AAAA");
    }

    #[test]
    fn stop_sequences_use_the_stop_key() {
        let adapter = adapter(Dialect::OpenAi);
        let mut req = ChatRequest::new("gpt-4", vec![Message::user("hi")]);
        req.stop = vec!["END".into()];
        let body = serde_json::to_value(adapter.build_request(&req, false)).unwrap();
        assert_eq!(body["stop"], json!(["END"]));
    }

    #[test]
    fn vllm_tool_schemas_are_sanitized() {
        let body = request_with_tool(
            Dialect::VLlm,
            json!({
                "type": "object",
                "additionalProperties": false,
                "anyOf": [{ "type": "object" }],
                "properties": { "x": { "$ref": "#/defs/x" } }
            }),
        );
        assert!(!contains_banned_keyword(&body["tools"]));

        // The same schema survives untouched for OpenAI.
        let body = request_with_tool(
            Dialect::OpenAi,
            json!({ "type": "object", "additionalProperties": false }),
        );
        assert_eq!(
            body["tools"][0]["function"]["parameters"]["additionalProperties"],
            json!(false)
        );
    }

    #[test]
    fn openai_json_schema_is_strict_everywhere() {
        let adapter = adapter(Dialect::OpenAi);
        let mut req = ChatRequest::new("gpt-4", vec![Message::user("hi")]);
        req.response_format = Some(ResponseFormat::JsonSchema {
            schema: json!({
                "type": "object",
                "properties": {
                    "nested": { "type": "object", "properties": {} }
                }
            }),
        });
        let body = serde_json::to_value(adapter.build_request(&req, false)).unwrap();
        let schema = &body["response_format"]["json_schema"]["schema"];
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(schema["additionalProperties"], json!(false));
        assert_eq!(
            schema["properties"]["nested"]["additionalProperties"],
            json!(false)
        );
    }

    #[test]
    fn vllm_json_schema_downgrades_to_guided_json() {
        let adapter = adapter(Dialect::VLlm);
        let mut req = ChatRequest::new("m", vec![Message::user("hi")]);
        req.response_format = Some(ResponseFormat::JsonSchema {
            schema: json!({ "type": "object", "anyOf": [], "format": "x" }),
        });
        let body = serde_json::to_value(adapter.build_request(&req, true)).unwrap();
        assert_eq!(body["response_format"]["type"], "json_object");
        assert!(!contains_banned_keyword(&body["guided_json"]));
    }

    #[test]
    fn dialects_disagree_on_the_token_limit_field() {
        let mut req = ChatRequest::new("m", vec![Message::user("hi")]);
        req.max_tokens = Some(512);

        let body =
            serde_json::to_value(adapter(Dialect::OpenAi).build_request(&req, false)).unwrap();
        assert_eq!(body["max_completion_tokens"], json!(512));
        assert!(body.get("max_tokens").is_none());

        let body = serde_json::to_value(adapter(Dialect::VLlm).build_request(&req, false)).unwrap();
        assert_eq!(body["max_tokens"], json!(512));
        assert!(body.get("max_completion_tokens").is_none());
    }

    #[test]
    fn key_prefix_is_enforced_per_dialect() {
        let bad = OpenAiCompatAdapter::with_dialect(
            Dialect::OpenAi,
            ProviderConfig::new("not-a-key", "http://localhost:9000/v1"),
            reqwest::Client::new(),
            Arc::new(Throttler::default()),
        );
        assert!(matches!(
            bad.validate_config(),
            Err(GatewayError::Configuration(_))
        ));

        assert!(adapter(Dialect::OpenAi).validate_config().is_ok());
        // vLLM runs keyless.
        assert!(adapter(Dialect::VLlm).validate_config().is_ok());
    }

    // ------------------------------------------------------------------
    // Streaming parser, driven by recorded transcripts
    // ------------------------------------------------------------------

    fn transcript_stream(frames: &[&str]) -> ChunkStream {
        let body = frames
            .iter()
            .map(|frame| format!("data: {frame}\n\n"))
            .collect::<String>();
        let events =
            futures::stream::iter(vec![Ok::<_, Infallible>(Bytes::from(body))]).eventsource();
        chunk_stream(Provider::OpenAi, "gpt-4".to_string(), None, events)
    }

    async fn collect(stream: ChunkStream) -> Vec<ResponseChunk> {
        stream
            .map(|item| item.expect("stream should not error"))
            .collect()
            .await
    }

    #[tokio::test]
    async fn text_deltas_concatenate_to_the_full_message() {
        let chunks = collect(transcript_stream(&[
            r#"{"id":"cmpl-1","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}"#,
            r#"{"id":"cmpl-1","choices":[{"index":0,"delta":{"content":"lo"}}]}"#,
            r#"{"id":"cmpl-1","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
            r#"{"id":"cmpl-1","choices":[],"usage":{"prompt_tokens":3,"completion_tokens":2}}"#,
            "[DONE]",
        ]))
        .await;

        let text: String = chunks
            .iter()
            .filter_map(|chunk| chunk.delta_text())
            .collect();
        assert_eq!(text, "Hello");
        assert_eq!(
            chunks
                .iter()
                .filter_map(|chunk| chunk.finish_reason())
                .next(),
            Some(&FinishReason::Stop)
        );

        let done: Vec<_> = chunks.iter().filter(|chunk| chunk.done).collect();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].usage, Some(Usage::new(3, 2)));
        assert_eq!(done[0].id, "cmpl-1");
    }

    #[tokio::test]
    async fn tool_call_fragments_assemble_at_finish() {
        let chunks = collect(transcript_stream(&[
            r#"{"id":"cmpl-2","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_weather","arguments":"{\"ci"}}]}}]}"#,
            r#"{"id":"cmpl-2","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ty\": \"Paris\"}"}}]}}]}"#,
            r#"{"id":"cmpl-2","choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]))
        .await;

        // Fragment frames are swallowed; the finish frame carries the calls.
        let with_calls: Vec<_> = chunks
            .iter()
            .filter(|chunk| {
                chunk
                    .choices
                    .first()
                    .is_some_and(|choice| !choice.delta.tool_calls.is_empty())
            })
            .collect();
        assert_eq!(with_calls.len(), 1);
        let call = &with_calls[0].choices[0].delta.tool_calls[0];
        assert_eq!(call.id, "call_1");
        assert_eq!(call.arguments["city"], "Paris");
        assert_eq!(with_calls[0].finish_reason(), Some(&FinishReason::ToolCalls));
    }

    #[tokio::test]
    async fn parallel_tool_calls_keep_index_order() {
        let chunks = collect(transcript_stream(&[
            r#"{"id":"c","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"one","arguments":"{}"}},{"index":1,"id":"call_b","function":{"name":"two","arguments":"{}"}}]}}]}"#,
            r#"{"id":"c","choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]))
        .await;

        let calls = &chunks
            .iter()
            .find(|chunk| chunk.finish_reason().is_some())
            .unwrap()
            .choices[0]
            .delta
            .tool_calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[1].id, "call_b");
    }

    #[tokio::test]
    async fn truncated_stream_surfaces_partial_tool_calls() {
        let chunks = collect(transcript_stream(&[
            r#"{"id":"c","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"lookup","arguments":"{\"q\": \"unfin"}}]}}]}"#,
        ]))
        .await;

        let done = chunks.last().unwrap();
        assert!(done.done);
        let call = &done.choices[0].delta.tool_calls[0];
        assert!(call.is_partial());
        assert_eq!(done.finish_reason(), Some(&FinishReason::ToolCalls));
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped_not_fatal() {
        let chunks = collect(transcript_stream(&[
            r#"{"id":"c","choices":[{"index":0,"delta":{"content":"ok"}}]}"#,
            r#"{{{not json"#,
            r#"{"id":"c","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ]))
        .await;
        let text: String = chunks
            .iter()
            .filter_map(|chunk| chunk.delta_text())
            .collect();
        assert_eq!(text, "ok");
        assert!(chunks.iter().any(|chunk| chunk.done));
    }

    #[tokio::test]
    async fn empty_delta_frames_are_swallowed() {
        let chunks = collect(transcript_stream(&[
            r#"{"id":"c","choices":[{"index":0,"delta":{"content":""}}]}"#,
            r#"{"id":"c","choices":[{"index":0,"delta":{}}]}"#,
            r#"{"id":"c","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ]))
        .await;
        // Only the finish frame and the terminal done chunk survive.
        assert_eq!(chunks.len(), 2);
    }
}
