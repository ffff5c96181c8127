// Google Gemini (Generative Language) adapter.
//
// Gemini wants system prompts as a `systemInstruction` object, tool calls as
// `functionCall` parts without any stable id (the gateway synthesizes them),
// tool results as `functionResponse` parts under role `function`, images as
// `inlineData`/`fileData`, and generation options nested under
// `generationConfig`. Function-call arguments arrive complete per frame, so
// streaming needs no JSON reassembly, only id synthesis and finish mapping.

use crate::config::ModelSpec;
use crate::llm::adapter::{
    classify_upstream_failure, retry_after_seconds, validate_request_common, Capabilities,
    ChatRequest, ChunkStream, Provider, ProviderAdapter, ProviderConfig, ResponseFormat,
};
use crate::llm::error::GatewayError;
use crate::llm::model::{
    ChunkChoice, ChunkDelta, ContentPart, FinishReason, Message, MessageContent, Response,
    ResponseChoice, ResponseChunk, Role, ToolCall, Usage,
};
use crate::llm::throttle::Throttler;
use async_trait::async_trait;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

pub struct GoogleAdapter {
    config: ProviderConfig,
    http: reqwest::Client,
    throttler: Arc<Throttler>,
}

impl GoogleAdapter {
    pub fn new(config: ProviderConfig, http: reqwest::Client, throttler: Arc<Throttler>) -> Self {
        GoogleAdapter {
            config,
            http,
            throttler,
        }
    }

    fn endpoint(&self, model: &str, stream: bool) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if stream {
            format!("{base}/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("{base}/models/{model}:generateContent")
        }
    }

    // ------------------------------------------------------------------
    // Request formatting
    // ------------------------------------------------------------------

    fn build_contents(messages: &[Message]) -> (Vec<WireContent>, Option<WireContent>) {
        let mut contents = Vec::new();
        let mut system_instruction: Option<WireContent> = None;
        let mut system_parts: Vec<WirePart> = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system_parts.push(WirePart::text(msg.text())),
                Role::User => contents.push(WireContent {
                    role: Some("user".to_string()),
                    parts: user_parts(&msg.content),
                }),
                Role::Assistant => {
                    let mut parts = Vec::new();
                    let text = msg.text();
                    if !text.is_empty() {
                        parts.push(WirePart::text(text));
                    }
                    for call in &msg.tool_calls {
                        parts.push(WirePart {
                            function_call: Some(WireFunctionCall {
                                name: call.name.clone(),
                                args: call.arguments.clone(),
                            }),
                            ..Default::default()
                        });
                    }
                    if !parts.is_empty() {
                        contents.push(WireContent {
                            role: Some("model".to_string()),
                            parts,
                        });
                    }
                }
                Role::Tool => {
                    let name = msg.tool_name.clone().unwrap_or_else(|| "tool".to_string());
                    contents.push(WireContent {
                        role: Some("function".to_string()),
                        parts: vec![WirePart {
                            function_response: Some(WireFunctionResponse {
                                name,
                                response: tool_response_value(&msg.text()),
                            }),
                            ..Default::default()
                        }],
                    });
                }
            }
        }

        if !system_parts.is_empty() {
            system_instruction = Some(WireContent {
                role: None,
                parts: system_parts,
            });
        }
        (contents, system_instruction)
    }

    fn build_generation_config(req: &ChatRequest) -> Option<WireGenerationConfig> {
        let (mime_type, response_schema) = match &req.response_format {
            Some(ResponseFormat::JsonObject) => (Some("application/json".to_string()), None),
            Some(ResponseFormat::JsonSchema { schema }) => {
                (Some("application/json".to_string()), Some(schema.clone()))
            }
            _ => (None, None),
        };
        Some(WireGenerationConfig {
            temperature: req.temperature,
            max_output_tokens: req.max_tokens,
            stop_sequences: (!req.stop.is_empty()).then(|| req.stop.clone()),
            response_mime_type: mime_type,
            response_schema,
            thinking_config: req.thinking.and_then(|options| {
                options.enabled.then_some(WireThinkingConfig {
                    thinking_budget: options.budget_tokens,
                })
            }),
        })
    }

    fn build_request(&self, req: &ChatRequest) -> WireRequest {
        let (contents, system_instruction) = Self::build_contents(&req.messages);
        let tools = (!req.tools.is_empty()).then(|| {
            vec![WireTool {
                function_declarations: req
                    .tools
                    .iter()
                    .map(|tool| WireFunctionDeclaration {
                        name: tool.name.clone(),
                        description: Some(tool.description.clone()),
                        parameters: tool.parameters.clone(),
                    })
                    .collect(),
            }]
        });
        let tool_config = tools.as_ref().map(|_| WireToolConfig {
            function_calling_config: WireFunctionCallingConfig {
                mode: "AUTO".to_string(),
            },
        });
        WireRequest {
            contents,
            system_instruction,
            tools,
            tool_config,
            generation_config: Self::build_generation_config(req),
        }
    }

    // ------------------------------------------------------------------
    // Response parsing
    // ------------------------------------------------------------------

    fn parse_response(&self, raw: serde_json::Value) -> Result<Response, GatewayError> {
        let wire: WireResponse =
            serde_json::from_value(raw.clone()).map_err(|err| GatewayError::Provider {
                provider: Provider::Google.to_string(),
                status: 200,
                body: format!("malformed response body: {err}"),
            })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut finish_reason = None;
        if let Some(candidate) = wire.candidates.unwrap_or_default().into_iter().next() {
            if let Some(content) = candidate.content {
                for part in content.parts {
                    if let Some(piece) = part.text {
                        text.push_str(&piece);
                    }
                    if let Some(call) = part.function_call {
                        tool_calls.push(ToolCall {
                            id: synthesize_call_id(tool_calls.len()),
                            name: call.name,
                            arguments: call.args,
                        });
                    }
                }
            }
            finish_reason = candidate
                .finish_reason
                .as_deref()
                .map(FinishReason::normalize);
        }
        // Gemini reports STOP even when the model requested function calls.
        if !tool_calls.is_empty() {
            finish_reason = Some(FinishReason::ToolCalls);
        }

        Ok(Response {
            id: synthesize_call_id(0),
            model: wire.model_version.unwrap_or_default(),
            provider: Provider::Google.to_string(),
            choices: vec![ResponseChoice {
                index: 0,
                message: Message::assistant_with_calls(text, tool_calls),
                finish_reason,
            }],
            usage: wire.usage_metadata.map(|u| {
                Usage::new(
                    u.prompt_token_count.unwrap_or(0),
                    u.candidates_token_count.unwrap_or(0),
                )
            }),
            raw: Some(raw),
        })
    }

    async fn execute(
        &self,
        model: &str,
        stream: bool,
        body: &WireRequest,
    ) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .http
            .post(self.endpoint(model, stream))
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.config.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_seconds(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_upstream_failure(
                Provider::Google,
                status,
                retry_after,
                &body,
            ));
        }
        Ok(response)
    }
}

/// Gemini assigns no tool-call ids; synthesize stable ones so result routing
/// works downstream.
fn synthesize_call_id(index: usize) -> String {
    format!("call_{}_{}", chrono::Utc::now().timestamp_millis(), index)
}

fn tool_response_value(payload: &str) -> serde_json::Value {
    serde_json::from_str(payload)
        .unwrap_or_else(|_| serde_json::json!({ "result": payload }))
}

fn user_parts(content: &MessageContent) -> Vec<WirePart> {
    match content {
        MessageContent::Text(text) => vec![WirePart::text(text.clone())],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => WirePart::text(text.clone()),
                ContentPart::Image {
                    url,
                    data,
                    media_type,
                } => match data {
                    Some(data) => WirePart {
                        inline_data: Some(WireInlineData {
                            mime_type: media_type.clone().unwrap_or_else(|| "image/png".into()),
                            data: strip_data_url_prefix(data),
                        }),
                        ..Default::default()
                    },
                    None => WirePart {
                        file_data: Some(WireFileData {
                            mime_type: media_type.clone(),
                            file_uri: url.clone().unwrap_or_default(),
                        }),
                        ..Default::default()
                    },
                },
            })
            .collect(),
    }
}

fn strip_data_url_prefix(data: &str) -> String {
    match data.find(";base64,") {
        Some(pos) if data.starts_with("data:") => data[pos + ";base64,".len()..].to_string(),
        _ => data.to_string(),
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn capabilities(&self, model: &ModelSpec) -> Capabilities {
        Capabilities {
            tools: model.supports_tools.unwrap_or(true),
            images: model.supports_images.unwrap_or(true),
            structured_output: true,
            streaming: model.supports_streaming.unwrap_or(true),
            max_output_tokens: model.max_tokens.unwrap_or(8192),
            context_length: model.context_length,
        }
    }

    fn validate_config(&self) -> Result<(), GatewayError> {
        if self.config.base_url.trim().is_empty() {
            return Err(GatewayError::Configuration(
                "google base URL is not configured".to_string(),
            ));
        }
        if !self.config.api_key.starts_with("AIza") {
            return Err(GatewayError::Configuration(
                "Google API key must start with 'AIza'".to_string(),
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

        let body = self.build_request(req);
        let _permit = self.throttler.acquire(self.config.upstream_id()).await?;
        let response = self.execute(&req.model, false, &body).await?;
        let raw: serde_json::Value = response.json().await?;
        self.parse_response(raw)
    }

    async fn stream(&self, req: &ChatRequest) -> Result<ChunkStream, GatewayError> {
        self.validate_config()?;
        self.validate_request(req)?;

        let body = self.build_request(req);
        let permit = self.throttler.acquire(self.config.upstream_id()).await?;
        let response = self.execute(&req.model, true, &body).await?;

        Ok(chunk_stream(
            req.model.clone(),
            Some(permit),
            response.bytes_stream().eventsource(),
        ))
    }
}

// ============================================================================
// Streaming parser
// ============================================================================

/// Translate Gemini's SSE frames into canonical chunks. Function calls are
/// complete per frame; they buffer until the finish frame so the round ends
/// with one `tool_calls` chunk, mirroring the other adapters.
pub(crate) fn chunk_stream<S, E>(
    model: String,
    permit: Option<OwnedSemaphorePermit>,
    events: S,
) -> ChunkStream
where
    S: Stream<Item = Result<Event, EventStreamError<E>>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let provider_name = Provider::Google.to_string();
    let output = async_stream::stream! {
        let _permit = permit;
        futures::pin_mut!(events);

        let message_id = synthesize_call_id(0);
        let mut pending_calls: Vec<ToolCall> = Vec::new();
        let mut usage: Option<Usage> = None;
        let mut finish: Option<FinishReason> = None;

        while let Some(event_result) = events.next().await {
            let event = match event_result {
                Ok(event) => event,
                Err(err) => {
                    yield Err(GatewayError::Streaming(format!(
                        "google stream error: {err}"
                    )));
                    return;
                }
            };
            if event.data.trim().is_empty() || event.data == "[DONE]" {
                continue;
            }

            let frame: WireResponse = match serde_json::from_str(&event.data) {
                Ok(frame) => frame,
                Err(err) => {
                    log::warn!("google: skipping malformed stream frame: {err}");
                    continue;
                }
            };

            if let Some(meta) = frame.usage_metadata {
                usage = Some(Usage::new(
                    meta.prompt_token_count.unwrap_or(0),
                    meta.candidates_token_count.unwrap_or(0),
                ));
            }

            let Some(candidate) = frame.candidates.unwrap_or_default().into_iter().next() else {
                continue;
            };
            if let Some(content) = candidate.content {
                for part in content.parts {
                    if let Some(text) = part.text {
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
                    if let Some(call) = part.function_call {
                        pending_calls.push(ToolCall {
                            id: synthesize_call_id(pending_calls.len()),
                            name: call.name,
                            arguments: call.args,
                        });
                    }
                }
            }
            if let Some(reason) = candidate.finish_reason.as_deref() {
                finish = Some(FinishReason::normalize(reason));
            }
        }

        // Function calls override Gemini's unconditional STOP.
        let finish = if pending_calls.is_empty() {
            finish
        } else {
            Some(FinishReason::ToolCalls)
        };
        let mut choices = Vec::new();
        if finish.is_some() || !pending_calls.is_empty() {
            choices.push(ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content: None,
                    tool_calls: pending_calls,
                },
                finish_reason: finish,
            });
        }
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
#[serde(rename_all = "camelCase")]
struct WireRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<WireToolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<WireGenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<WireInlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_data: Option<WireFileData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<WireFunctionResponse>,
}

impl WirePart {
    fn text(text: String) -> Self {
        WirePart {
            text: Some(text),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFileData {
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<String>,
    file_uri: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTool {
    function_declarations: Vec<WireFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct WireFunctionDeclaration {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireToolConfig {
    function_calling_config: WireFunctionCallingConfig,
}

#[derive(Debug, Serialize)]
struct WireFunctionCallingConfig {
    mode: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<WireThinkingConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireThinkingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_budget: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Option<Vec<WireCandidate>>,
    #[serde(default)]
    usage_metadata: Option<WireUsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<u64>,
    #[serde(default)]
    candidates_token_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::model::ToolDefinition;
    use bytes::Bytes;
    use serde_json::json;
    use std::convert::Infallible;

    fn adapter() -> GoogleAdapter {
        GoogleAdapter::new(
            ProviderConfig::new(
                "AIzaTest",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            reqwest::Client::new(),
            Arc::new(Throttler::default()),
        )
    }

    #[test]
    fn system_messages_become_a_system_instruction() {
        let adapter = adapter();
        let req = ChatRequest::new(
            "gemini-2.5-flash",
            vec![Message::system("Be helpful."), Message::user("hi")],
        );
        let body = serde_json::to_value(adapter.build_request(&req)).unwrap();
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "Be helpful."
        );
        assert_eq!(body["contents"].as_array().unwrap().len(), 1);
        assert_eq!(body["contents"][0]["role"], "user");
    }

    #[test]
    fn tool_round_trip_uses_function_call_and_response_parts() {
        let adapter = adapter();
        let call = ToolCall {
            id: "call_123_0".into(),
            name: "get_weather".into(),
            arguments: json!({"city": "Paris"}),
        };
        let req = ChatRequest::new(
            "gemini-2.5-flash",
            vec![
                Message::user("Weather?"),
                Message::assistant_with_calls("", vec![call]),
                Message::tool_result("call_123_0", "get_weather", r#"{"temp": 21}"#, false),
            ],
        );
        let body = serde_json::to_value(adapter.build_request(&req)).unwrap();
        let contents = body["contents"].as_array().unwrap();

        assert_eq!(contents[1]["role"], "model");
        assert_eq!(
            contents[1]["parts"][0]["functionCall"]["name"],
            "get_weather"
        );
        assert_eq!(contents[2]["role"], "function");
        let response = &contents[2]["parts"][0]["functionResponse"];
        assert_eq!(response["name"], "get_weather");
        assert_eq!(response["response"]["temp"], 21);
    }

    #[test]
    fn non_json_tool_output_is_wrapped() {
        assert_eq!(tool_response_value("plain text"), json!({"result": "plain text"}));
        assert_eq!(tool_response_value(r#"{"a": 1}"#), json!({"a": 1}));
    }

    #[test]
    fn images_map_to_inline_or_file_data() {
        let adapter = adapter();
        let req = ChatRequest::new(
            "gemini-2.5-flash",
            vec![Message::user(MessageContent::Parts(vec![
                ContentPart::Image {
                    url: None,
                    data: Some("data:image/png;base64,QUJD".into()),
                    media_type: Some("image/png".into()),
                },
                ContentPart::Image {
                    url: Some("gs://bucket/cat.png".into()),
                    data: None,
                    media_type: None,
                },
            ]))],
        );
        let body = serde_json::to_value(adapter.build_request(&req)).unwrap();
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["inlineData"]["data"], "QUJD");
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[1]["fileData"]["fileUri"], "gs://bucket/cat.png");
    }

    #[test]
    fn stop_sequences_nest_under_generation_config() {
        let adapter = adapter();
        let mut req = ChatRequest::new("gemini-2.5-flash", vec![Message::user("hi")]);
        req.stop = vec!["END".into()];
        req.max_tokens = Some(256);
        let body = serde_json::to_value(adapter.build_request(&req)).unwrap();
        assert_eq!(body["generationConfig"]["stopSequences"], json!(["END"]));
        assert_eq!(body["generationConfig"]["maxOutputTokens"], json!(256));
        assert!(body.get("stop").is_none());
    }

    #[test]
    fn tools_declare_under_function_declarations() {
        let adapter = adapter();
        let mut req = ChatRequest::new("gemini-2.5-flash", vec![Message::user("hi")]);
        req.tools.push(ToolDefinition {
            name: "get_weather".into(),
            description: "Weather lookup".into(),
            parameters: json!({"type": "object"}),
        });
        let body = serde_json::to_value(adapter.build_request(&req)).unwrap();
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "get_weather"
        );
        assert_eq!(
            body["toolConfig"]["functionCallingConfig"]["mode"],
            "AUTO"
        );
    }

    #[test]
    fn synthesized_ids_carry_timestamp_and_index() {
        let id = synthesize_call_id(3);
        let rest = id.strip_prefix("call_").unwrap();
        let (timestamp, index) = rest.split_once('_').unwrap();
        assert!(timestamp.parse::<i64>().unwrap() > 0);
        assert_eq!(index, "3");
    }

    #[test]
    fn key_prefix_is_enforced() {
        let bad = GoogleAdapter::new(
            ProviderConfig::new("wrong", "https://generativelanguage.googleapis.com/v1beta"),
            reqwest::Client::new(),
            Arc::new(Throttler::default()),
        );
        assert!(matches!(
            bad.validate_config(),
            Err(GatewayError::Configuration(_))
        ));
        assert!(adapter().validate_config().is_ok());
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
        chunk_stream("gemini-2.5-flash".to_string(), None, events)
    }

    async fn collect(stream: ChunkStream) -> Vec<ResponseChunk> {
        stream
            .map(|item| item.expect("stream should not error"))
            .collect()
            .await
    }

    #[tokio::test]
    async fn text_frames_stream_and_finish_normalizes() {
        let chunks = collect(transcript_stream(&[
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}]}"#,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2}}"#,
        ]))
        .await;

        let text: String = chunks
            .iter()
            .filter_map(|chunk| chunk.delta_text())
            .collect();
        assert_eq!(text, "Hello");

        let done = chunks.last().unwrap();
        assert!(done.done);
        assert_eq!(done.finish_reason(), Some(&FinishReason::Stop));
        assert_eq!(done.usage, Some(Usage::new(4, 2)));
    }

    #[tokio::test]
    async fn function_calls_get_synthesized_ids_and_tool_calls_finish() {
        let chunks = collect(transcript_stream(&[
            r#"{"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"get_weather","args":{"city":"Paris"}}},{"functionCall":{"name":"get_time","args":{}}}]},"finishReason":"STOP"}]}"#,
        ]))
        .await;

        let done = chunks.last().unwrap();
        assert!(done.done);
        assert_eq!(done.finish_reason(), Some(&FinishReason::ToolCalls));
        let calls = &done.choices[0].delta.tool_calls;
        assert_eq!(calls.len(), 2);
        assert!(calls[0].id.starts_with("call_"));
        assert!(calls[0].id.ends_with("_0"));
        assert!(calls[1].id.ends_with("_1"));
        assert_eq!(calls[0].arguments["city"], "Paris");
    }

    #[tokio::test]
    async fn safety_stops_map_to_content_filter() {
        let chunks = collect(transcript_stream(&[
            r#"{"candidates":[{"content":{"role":"model","parts":[]},"finishReason":"SAFETY"}]}"#,
        ]))
        .await;
        let done = chunks.last().unwrap();
        assert_eq!(done.finish_reason(), Some(&FinishReason::ContentFilter));
    }
}
