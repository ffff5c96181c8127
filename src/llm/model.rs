// Canonical chat model shared by every provider adapter.
// Adapters translate in and out of these types; nothing outside the llm
// module ever sees a provider-native payload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Roles and message content
// ============================================================================

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single part of a multi-part message body.
///
/// Image parts appear only on user messages; assistants and tools speak text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        /// Remote image location. Mutually exclusive with `data` in practice;
        /// when both are present adapters prefer `data`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// Raw base64 payload, without any `data:` URL prefix.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

/// Message body: either a plain string or an ordered list of parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }

    /// Concatenated text of the body, ignoring non-text parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn image_parts(&self) -> Vec<&ContentPart> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|part| matches!(part, ContentPart::Image { .. }))
                .collect(),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

// ============================================================================
// Messages and tool calls
// ============================================================================

/// The canonical unit of conversation.
///
/// Invariants: `tool_call_id` is non-empty exactly on `Role::Tool` messages;
/// assistant messages with `tool_calls` may carry empty textual content.
/// Messages are value types: once appended to a conversation they are never
/// mutated, only cloned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    /// Tool calls requested by the assistant. Empty on every other role.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Identifies the call being answered; set only on `Role::Tool`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Set when a tool result carries an error payload.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Assistant message carrying tool calls alongside any streamed text.
    pub fn assistant_with_calls(content: impl Into<MessageContent>, calls: Vec<ToolCall>) -> Self {
        Message {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: calls,
            tool_call_id: None,
            tool_name: None,
            is_error: false,
        }
    }

    /// Tool-result message answering `call_id`.
    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<MessageContent>,
        is_error: bool,
    ) -> Self {
        Message {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            tool_name: Some(tool_name.into()),
            is_error,
        }
    }

    fn plain(role: Role, content: impl Into<MessageContent>) -> Self {
        Message {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            is_error: false,
        }
    }

    /// Concatenated text of the message body.
    pub fn text(&self) -> String {
        self.content.text()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            Role::System => write!(f, "System: {}", self.text()),
            Role::User => write!(f, "User: {}", self.text()),
            Role::Assistant => write!(f, "Assistant: {}", self.text()),
            Role::Tool => write!(f, "Tool: {}", self.text()),
        }
    }
}

/// Key under which unfinalized tool-call argument buffers are surfaced.
pub const PARTIAL_ARGUMENTS_KEY: &str = "_partial";

/// A structured request from the model to invoke a registered tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Provider-assigned, or synthesized when the vendor has no stable id.
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments after streaming reassembly. Mid-stream a
    /// provisional `{"_partial": "<raw buffer>"}` form is permitted.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Provisional call whose argument JSON never finished assembling.
    pub fn partial(id: impl Into<String>, name: impl Into<String>, buffer: &str) -> Self {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: serde_json::json!({ PARTIAL_ARGUMENTS_KEY: buffer }),
        }
    }

    pub fn is_partial(&self) -> bool {
        self.arguments
            .as_object()
            .is_some_and(|map| map.contains_key(PARTIAL_ARGUMENTS_KEY))
    }
}

/// Tool schema sent to the provider along with a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters: serde_json::Value,
}

// ============================================================================
// Tool outcomes
// ============================================================================

/// How a tool invocation failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ToolErrorKind {
    Validation,
    Timeout,
    NotFound,
    Execution,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::Validation => "VALIDATION",
            ToolErrorKind::Timeout => "TIMEOUT",
            ToolErrorKind::NotFound => "NOT_FOUND",
            ToolErrorKind::Execution => "EXECUTION",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolFailure {
    pub kind: ToolErrorKind,
    pub message: String,
}

/// Normalized result of one tool invocation, paired to its call by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutcome {
    pub tool_call_id: String,
    pub tool_name: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
}

impl ToolOutcome {
    pub fn success(call: &ToolCall, value: serde_json::Value) -> Self {
        ToolOutcome {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failure(call: &ToolCall, kind: ToolErrorKind, message: impl Into<String>) -> Self {
        ToolOutcome {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            ok: false,
            value: None,
            error: Some(ToolFailure {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Render the outcome as the message body the model will see.
    pub fn into_message(self) -> Message {
        let body = if self.ok {
            match self.value {
                Some(serde_json::Value::String(text)) => text,
                Some(value) => value.to_string(),
                None => String::new(),
            }
        } else {
            let failure = self
                .error
                .as_ref()
                .map(|f| format!("{}: {}", f.kind.as_str(), f.message))
                .unwrap_or_else(|| "EXECUTION: unknown tool failure".to_string());
            failure
        };
        Message::tool_result(self.tool_call_id, self.tool_name, body, !self.ok)
    }
}

// ============================================================================
// Finish reasons
// ============================================================================

/// Normalized termination cause of a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    /// Map a provider-native stop value onto the closed set. Unknown values
    /// pass through lowercased.
    pub fn normalize(raw: &str) -> FinishReason {
        match raw {
            "stop" | "end_turn" | "stop_sequence" | "STOP" => FinishReason::Stop,
            "length" | "max_tokens" | "MAX_TOKENS" => FinishReason::Length,
            "tool_calls" | "tool_use" | "TOOL_CALLS" => FinishReason::ToolCalls,
            "content_filter" | "SAFETY" | "RECITATION" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_lowercase()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Other(other) => other.as_str(),
        }
    }
}

impl Serialize for FinishReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FinishReason {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(FinishReason::normalize(&raw))
    }
}

// ============================================================================
// Usage and responses
// ============================================================================

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Usage {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// Complete (non-streaming) model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: String,
    pub model: String,
    pub provider: String,
    pub choices: Vec<ResponseChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Original provider payload, kept for the model-test endpoint only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl Response {
    /// The first choice's message, if any.
    pub fn message(&self) -> Option<&Message> {
        self.choices.first().map(|choice| &choice.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseChoice {
    pub index: usize,
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// Streaming delta yielded by an adapter's chunk stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseChunk {
    pub id: String,
    pub model: String,
    pub provider: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Set exactly once per upstream round, on the terminal chunk.
    pub done: bool,
}

impl ResponseChunk {
    pub fn delta_text(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.delta.content.as_deref())
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.choices
            .first()
            .and_then(|choice| choice.finish_reason.as_ref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls finalized in this chunk, in upstream index order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

// ============================================================================
// Streaming tool-call assembly
// ============================================================================

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    args_buf: String,
}

/// Accumulates tool-call argument fragments keyed by the upstream index so
/// parallel calls reassemble independently and ordering is preserved
/// end-to-end.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Record a delta for the call at `index`. `id` and `name` arrive on the
    /// first fragment for most vendors; later fragments carry only argument
    /// text.
    pub fn push_delta(
        &mut self,
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: Option<&str>,
    ) {
        let call = self.calls.entry(index).or_default();
        if let Some(id) = id {
            call.id = Some(id);
        }
        if let Some(name) = name {
            call.name = Some(name);
        }
        if let Some(delta) = arguments_delta {
            call.args_buf.push_str(delta);
        }
    }

    /// Finalize the single call at `index`, removing its state. Returns
    /// `None` when the index was never seen.
    pub fn finish_index(&mut self, index: usize) -> Option<ToolCall> {
        self.calls.remove(&index).map(Self::finalize)
    }

    /// Finalize every outstanding call in index order.
    pub fn finish(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(Self::finalize)
            .collect()
    }

    fn finalize(call: PartialCall) -> ToolCall {
        let id = call.id.unwrap_or_default();
        let name = call.name.unwrap_or_default();
        let buf = if call.args_buf.trim().is_empty() {
            "{}"
        } else {
            call.args_buf.as_str()
        };
        match serde_json::from_str(buf) {
            Ok(arguments) => ToolCall {
                id,
                name,
                arguments,
            },
            // Malformed argument JSON must not fail the stream; surface the
            // raw buffer and let the orchestrator decide.
            Err(_) => ToolCall::partial(id, name, &call.args_buf),
        }
    }
}
