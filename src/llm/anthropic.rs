// Anthropic Messages adapter.
//
// The Messages API differs from the Chat Completions family in every place
// the gateway has to care about: system prompts are a top-level string, tool
// calls are `tool_use` content blocks with object arguments, tool results
// ride inside user messages, images are base64 sources without the data-URL
// prefix, and streaming is a typed event sequence instead of uniform chunks.
// Structured output does not exist natively and is emulated with a forced
// `json_response` tool.

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
use crate::llm::throttle::Throttler;
use async_trait::async_trait;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Name of the synthetic tool used to emulate structured output.
pub const JSON_RESPONSE_TOOL: &str = "json_response";

pub struct AnthropicAdapter {
    config: ProviderConfig,
    http: reqwest::Client,
    throttler: Arc<Throttler>,
}

impl AnthropicAdapter {
    pub fn new(config: ProviderConfig, http: reqwest::Client, throttler: Arc<Throttler>) -> Self {
        AnthropicAdapter {
            config,
            http,
            throttler,
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.config.base_url.trim_end_matches('/'))
    }

    // ------------------------------------------------------------------
    // Request formatting
    // ------------------------------------------------------------------

    /// Partition the canonical conversation: system messages concatenate
    /// into the top-level `system` string; consecutive tool results merge
    /// into one user message of `tool_result` blocks.
    fn build_messages(messages: &[Message]) -> (Vec<WireMessage>, Option<String>) {
        let mut system_parts: Vec<String> = Vec::new();
        let mut wire: Vec<WireMessage> = Vec::new();
        let mut pending_results: Vec<WireContentBlock> = Vec::new();

        let flush_results = |wire: &mut Vec<WireMessage>, pending: &mut Vec<WireContentBlock>| {
            if !pending.is_empty() {
                wire.push(WireMessage {
                    role: "user".to_string(),
                    content: WireContent::Blocks(std::mem::take(pending)),
                });
            }
        };

        for msg in messages {
            match msg.role {
                Role::System => system_parts.push(msg.text()),
                Role::User => {
                    flush_results(&mut wire, &mut pending_results);
                    wire.push(WireMessage {
                        role: "user".to_string(),
                        content: user_content(&msg.content),
                    });
                }
                Role::Assistant => {
                    flush_results(&mut wire, &mut pending_results);
                    let mut blocks = Vec::new();
                    let text = msg.text();
                    if !text.is_empty() {
                        blocks.push(WireContentBlock::Text { text });
                    }
                    for call in &msg.tool_calls {
                        blocks.push(WireContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.arguments.clone(),
                        });
                    }
                    if !blocks.is_empty() {
                        wire.push(WireMessage {
                            role: "assistant".to_string(),
                            content: WireContent::Blocks(blocks),
                        });
                    }
                }
                Role::Tool => {
                    if let Some(call_id) = &msg.tool_call_id {
                        pending_results.push(WireContentBlock::ToolResult {
                            tool_use_id: call_id.clone(),
                            content: msg.text(),
                            is_error: msg.is_error.then_some(true),
                        });
                    }
                }
            }
        }
        flush_results(&mut wire, &mut pending_results);

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (wire, system)
    }

    fn convert_tools(req: &ChatRequest) -> Option<Vec<WireTool>> {
        let mut tools: Vec<WireTool> = req
            .tools
            .iter()
            .map(|tool| WireTool {
                name: tool.name.clone(),
                description: Some(tool.description.clone()),
                input_schema: tool.parameters.clone(),
            })
            .collect();

        // Structured-output emulation: a synthetic tool the model is forced
        // to call; its arguments are the caller's JSON payload.
        if let Some(schema) = structured_output_schema(req) {
            tools.push(WireTool {
                name: JSON_RESPONSE_TOOL.to_string(),
                description: Some("Respond with a JSON document of the given shape.".to_string()),
                input_schema: schema,
            });
        }

        (!tools.is_empty()).then_some(tools)
    }

    fn convert_tool_choice(req: &ChatRequest) -> Option<WireToolChoice> {
        if structured_output_schema(req).is_some() {
            return Some(WireToolChoice::Tool {
                name: JSON_RESPONSE_TOOL.to_string(),
            });
        }
        match &req.tool_choice {
            Some(ToolChoice::Tool(name)) => Some(WireToolChoice::Tool { name: name.clone() }),
            Some(ToolChoice::Auto) => Some(WireToolChoice::Auto),
            Some(ToolChoice::None) | None => {
                (!req.tools.is_empty()).then_some(WireToolChoice::Auto)
            }
        }
    }

    fn build_request(&self, req: &ChatRequest, stream: bool) -> WireRequest {
        let (messages, system) = Self::build_messages(&req.messages);
        WireRequest {
            model: req.model.clone(),
            max_tokens: req.max_tokens.unwrap_or(4096),
            messages,
            system,
            temperature: req.temperature,
            stop_sequences: (!req.stop.is_empty()).then(|| req.stop.clone()),
            stream: stream.then_some(true),
            tools: Self::convert_tools(req),
            tool_choice: Self::convert_tool_choice(req),
            thinking: req.thinking.and_then(|options| {
                options.enabled.then_some(WireThinking {
                    kind: "enabled".to_string(),
                    budget_tokens: options.budget_tokens,
                })
            }),
        }
    }

    // ------------------------------------------------------------------
    // Response parsing
    // ------------------------------------------------------------------

    fn parse_response(&self, raw: serde_json::Value, structured: bool) -> Result<Response, GatewayError> {
        let wire: WireResponse =
            serde_json::from_value(raw.clone()).map_err(|err| GatewayError::Provider {
                provider: Provider::Anthropic.to_string(),
                status: 200,
                body: format!("malformed response body: {err}"),
            })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in wire.content {
            match block {
                WireContentBlock::Text { text: piece } => text.push_str(&piece),
                WireContentBlock::ToolUse { id, name, input } => {
                    // The emulated structured-output call surfaces as the
                    // assistant's JSON content, not as a tool call.
                    if structured && name == JSON_RESPONSE_TOOL {
                        text = input.to_string();
                    } else {
                        tool_calls.push(ToolCall {
                            id,
                            name,
                            arguments: input,
                        });
                    }
                }
                _ => {}
            }
        }

        let finish_reason = wire.stop_reason.as_deref().map(|reason| {
            let normalized = FinishReason::normalize(reason);
            if structured && normalized == FinishReason::ToolCalls && tool_calls.is_empty() {
                FinishReason::Stop
            } else {
                normalized
            }
        });

        Ok(Response {
            id: wire.id,
            model: wire.model,
            provider: Provider::Anthropic.to_string(),
            choices: vec![ResponseChoice {
                index: 0,
                message: Message::assistant_with_calls(text, tool_calls),
                finish_reason,
            }],
            usage: wire
                .usage
                .map(|u| Usage::new(u.input_tokens, u.output_tokens)),
            raw: Some(raw),
        })
    }

    async fn execute(&self, body: &WireRequest) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .http
            .post(self.messages_url())
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_seconds(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_upstream_failure(
                Provider::Anthropic,
                status,
                retry_after,
                &body,
            ));
        }
        Ok(response)
    }
}

fn structured_output_schema(req: &ChatRequest) -> Option<serde_json::Value> {
    match &req.response_format {
        Some(ResponseFormat::JsonSchema { schema }) => Some(schema.clone()),
        Some(ResponseFormat::JsonObject) => Some(serde_json::json!({ "type": "object" })),
        _ => None,
    }
}

fn user_content(content: &MessageContent) -> WireContent {
    match content {
        MessageContent::Text(text) => WireContent::Text(text.clone()),
        MessageContent::Parts(parts) => WireContent::Blocks(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => WireContentBlock::Text { text: text.clone() },
                    ContentPart::Image {
                        url,
                        data,
                        media_type,
                    } => {
                        let source = match data {
                            // The API wants bare base64; a data-URL prefix,
                            // if the client sent one, must be stripped.
                            Some(data) => WireImageSource {
                                source_type: "base64".to_string(),
                                media_type: Some(
                                    media_type.clone().unwrap_or_else(|| "image/png".to_string()),
                                ),
                                data: Some(strip_data_url_prefix(data)),
                                url: None,
                            },
                            None => WireImageSource {
                                source_type: "url".to_string(),
                                media_type: None,
                                data: None,
                                url: url.clone(),
                            },
                        };
                        WireContentBlock::Image { source }
                    }
                })
                .collect(),
        ),
    }
}

fn strip_data_url_prefix(data: &str) -> String {
    match data.find(";base64,") {
        Some(pos) if data.starts_with("data:") => data[pos + ";base64,".len()..].to_string(),
        _ => data.to_string(),
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn capabilities(&self, model: &ModelSpec) -> Capabilities {
        Capabilities {
            tools: model.supports_tools.unwrap_or(true),
            images: model.supports_images.unwrap_or(true),
            structured_output: true,
            streaming: model.supports_streaming.unwrap_or(true),
            max_output_tokens: model.max_tokens.unwrap_or(4096),
            context_length: model.context_length,
        }
    }

    fn validate_config(&self) -> Result<(), GatewayError> {
        if self.config.base_url.trim().is_empty() {
            return Err(GatewayError::Configuration(
                "anthropic base URL is not configured".to_string(),
            ));
        }
        if !self.config.api_key.starts_with("sk-ant-") {
            return Err(GatewayError::Configuration(
                "Anthropic API key must start with 'sk-ant-'".to_string(),
            ));
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
        let structured = structured_output_schema(req).is_some();
        let _permit = self.throttler.acquire(self.config.upstream_id()).await?;
        let response = self.execute(&body).await?;
        let raw: serde_json::Value = response.json().await?;
        self.parse_response(raw, structured)
    }

    async fn stream(&self, req: &ChatRequest) -> Result<ChunkStream, GatewayError> {
        self.validate_config()?;
        self.validate_request(req)?;

        let body = self.build_request(req, true);
        let structured = structured_output_schema(req).is_some();
        let permit = self.throttler.acquire(self.config.upstream_id()).await?;
        let response = self.execute(&body).await?;

        Ok(chunk_stream(
            req.model.clone(),
            structured,
            Some(permit),
            response.bytes_stream().eventsource(),
        ))
    }
}

// ============================================================================
// Streaming parser
// ============================================================================

/// Translate the Messages event sequence into canonical chunks.
///
/// Event map: `message_start` fixes the message id; `content_block_start`
/// with `tool_use` allocates assembly state at that block index;
/// `content_block_delta` emits text or appends `input_json_delta` fragments;
/// `content_block_stop` finalizes the block's call; `message_delta` carries
/// the stop reason and output tokens; `message_stop` terminates the round.
pub(crate) fn chunk_stream<S, E>(
    model: String,
    structured: bool,
    permit: Option<OwnedSemaphorePermit>,
    events: S,
) -> ChunkStream
where
    S: Stream<Item = Result<Event, EventStreamError<E>>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let provider_name = Provider::Anthropic.to_string();
    let output = async_stream::stream! {
        let _permit = permit;
        futures::pin_mut!(events);

        let mut assembler = ToolCallAssembler::new();
        let mut message_id = String::new();
        let mut input_tokens: u64 = 0;
        let mut output_tokens: u64 = 0;
        let mut finish: Option<FinishReason> = None;

        while let Some(event_result) = events.next().await {
            let event = match event_result {
                Ok(event) => event,
                Err(err) => {
                    yield Err(GatewayError::Streaming(format!(
                        "anthropic stream error: {err}"
                    )));
                    return;
                }
            };
            if event.event == "message_stop" {
                break;
            }
            if event.data.trim().is_empty() {
                continue;
            }

            match event.event.as_str() {
                "message_start" => {
                    if let Ok(start) = serde_json::from_str::<WireMessageStart>(&event.data) {
                        message_id = start.message.id;
                        input_tokens = start.message.usage.input_tokens;
                        output_tokens = start.message.usage.output_tokens;
                    }
                }
                "content_block_start" => {
                    if let Ok(start) = serde_json::from_str::<WireBlockStart>(&event.data) {
                        if let WireContentBlock::ToolUse { id, name, input } = start.content_block {
                            // Non-empty initial input seeds the buffer; the
                            // usual case is `{}` followed by json deltas.
                            let seed = match &input {
                                serde_json::Value::Object(map) if map.is_empty() => None,
                                serde_json::Value::Null => None,
                                other => Some(other.to_string()),
                            };
                            assembler.push_delta(start.index, Some(id), Some(name), seed.as_deref());
                        }
                    }
                }
                "content_block_delta" => {
                    let Ok(delta) = serde_json::from_str::<WireBlockDelta>(&event.data) else {
                        log::warn!("anthropic: skipping malformed stream frame");
                        continue;
                    };
                    match delta.delta {
                        WireDelta::TextDelta { text } => {
                            if !text.is_empty() {
                                yield Ok(ResponseChunk {
                                    id: message_id.clone(),
                                    model: model.clone(),
                                    provider: provider_name.clone(),
                                    choices: vec![ChunkChoice {
                                        index: 0,
                                        delta: ChunkDelta {
                                            role: Some(Role::Assistant),
                                            content: Some(text),
                                            tool_calls: Vec::new(),
                                        },
                                        finish_reason: None,
                                    }],
                                    usage: None,
                                    done: false,
                                });
                            }
                        }
                        WireDelta::InputJsonDelta { partial_json } => {
                            assembler.push_delta(delta.index, None, None, Some(&partial_json));
                        }
                        // Reasoning text is not forwarded to clients.
                        WireDelta::ThinkingDelta { .. } => {}
                    }
                }
                "content_block_stop" => {
                    if let Ok(stop) = serde_json::from_str::<WireBlockStop>(&event.data) {
                        if let Some(call) = assembler.finish_index(stop.index) {
                            if structured && call.name == JSON_RESPONSE_TOOL && !call.is_partial() {
                                // Emulated structured output: surface the
                                // arguments as assistant JSON text.
                                yield Ok(ResponseChunk {
                                    id: message_id.clone(),
                                    model: model.clone(),
                                    provider: provider_name.clone(),
                                    choices: vec![ChunkChoice {
                                        index: 0,
                                        delta: ChunkDelta {
                                            role: Some(Role::Assistant),
                                            content: Some(call.arguments.to_string()),
                                            tool_calls: Vec::new(),
                                        },
                                        finish_reason: None,
                                    }],
                                    usage: None,
                                    done: false,
                                });
                                finish = Some(FinishReason::Stop);
                            } else {
                                yield Ok(ResponseChunk {
                                    id: message_id.clone(),
                                    model: model.clone(),
                                    provider: provider_name.clone(),
                                    choices: vec![ChunkChoice {
                                        index: 0,
                                        delta: ChunkDelta {
                                            role: None,
                                            content: None,
                                            tool_calls: vec![call],
                                        },
                                        finish_reason: None,
                                    }],
                                    usage: None,
                                    done: false,
                                });
                            }
                        }
                    }
                }
                "message_delta" => {
                    if let Ok(delta) = serde_json::from_str::<WireMessageDelta>(&event.data) {
                        if let Some(reason) = delta.delta.stop_reason.as_deref() {
                            let normalized = FinishReason::normalize(reason);
                            let effective = match (&finish, normalized) {
                                // Structured-output rounds end in tool_use
                                // upstream but read as plain stops here.
                                (Some(FinishReason::Stop), FinishReason::ToolCalls) => {
                                    FinishReason::Stop
                                }
                                (_, other) => other,
                            };
                            finish = Some(effective.clone());
                            yield Ok(ResponseChunk {
                                id: message_id.clone(),
                                model: model.clone(),
                                provider: provider_name.clone(),
                                choices: vec![ChunkChoice {
                                    index: 0,
                                    delta: ChunkDelta::default(),
                                    finish_reason: Some(effective),
                                }],
                                usage: None,
                                done: false,
                            });
                        }
                        if let Some(usage) = delta.usage {
                            output_tokens = usage.output_tokens;
                        }
                    }
                }
                // ping and unknown events are keep-alive noise.
                _ => {}
            }
        }

        // Blocks that never saw content_block_stop finalize as partials.
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
                finish_reason: finish.is_none().then_some(FinishReason::ToolCalls),
            }]
        };
        yield Ok(ResponseChunk {
            id: message_id,
            model,
            provider: provider_name,
            choices,
            usage: Some(Usage::new(input_tokens, output_tokens)),
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
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<WireToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<WireThinking>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: WireContent,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Blocks(Vec<WireContentBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentBlock {
    Text {
        text: String,
    },
    Image {
        source: WireImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Thinking {
        thinking: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct WireImageSource {
    #[serde(rename = "type")]
    source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireToolChoice {
    Auto,
    Tool { name: String },
}

#[derive(Debug, Serialize)]
struct WireThinking {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    budget_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: String,
    model: String,
    content: Vec<WireContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireMessageStart {
    message: WireMessageStartBody,
}

#[derive(Debug, Deserialize)]
struct WireMessageStartBody {
    id: String,
    #[serde(default)]
    usage: WireStartUsage,
}

#[derive(Debug, Default, Deserialize)]
struct WireStartUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireBlockStart {
    index: usize,
    content_block: WireContentBlock,
}

#[derive(Debug, Deserialize)]
struct WireBlockDelta {
    index: usize,
    delta: WireDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Deserialize)]
struct WireBlockStop {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct WireMessageDelta {
    delta: WireMessageDeltaBody,
    #[serde(default)]
    usage: Option<WireDeltaUsage>,
}

#[derive(Debug, Deserialize)]
struct WireMessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDeltaUsage {
    #[serde(default)]
    output_tokens: u64,
}
