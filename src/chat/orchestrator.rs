//! Per-session chat orchestrator.
//!
//! Drives one turn through the round state machine: prepare the request from
//! app + model config, dispatch to the provider adapter, forward stream
//! deltas, detect tool calls, execute them through the registry, append the
//! results and re-dispatch, bounded by [`MAX_TOOL_ROUNDS`] and a per-round
//! wall clock. All chat semantics live here; the HTTP surface only binds
//! endpoints to these entry points.

use crate::chat::events::{ActionTracker, ChatEvent};
use crate::chat::session::SessionManager;
use crate::config::{ConfigStore, ModelSpec};
use crate::llm::adapter::{
    adapter_for, ChatRequest, Provider, ProviderAdapter, ResponseFormat, ThinkingOptions,
};
use crate::llm::error::GatewayError;
use crate::llm::model::{
    FinishReason, Message, Response, ResponseChoice, ToolCall, Usage,
};
use crate::llm::throttle::Throttler;
use crate::tools::ToolRegistry;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Upper bound on tool-execution rounds within one turn.
pub const MAX_TOOL_ROUNDS: usize = 8;

/// Wall-clock budget for one upstream round, stream included.
pub const ROUND_TIMEOUT: Duration = Duration::from_secs(120);

/// One submitted turn, the canonical POST body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TurnRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub use_max_tokens: Option<bool>,
    #[serde(default)]
    pub bypass_app_prompts: Option<bool>,
    #[serde(default)]
    pub thinking_enabled: Option<bool>,
    #[serde(default)]
    pub thinking_budget: Option<u32>,
    #[serde(default)]
    pub enabled_tools: Option<Vec<String>>,
    #[serde(default)]
    pub image_aspect_ratio: Option<String>,
    #[serde(default)]
    pub image_quality: Option<String>,
    #[serde(default)]
    pub requested_skill: Option<String>,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
}

/// Builds provider adapters; swapped out in tests.
pub trait AdapterFactory: Send + Sync {
    fn adapter(&self, model: &ModelSpec) -> Arc<dyn ProviderAdapter>;
}

struct DefaultAdapterFactory {
    http: reqwest::Client,
    throttler: Arc<Throttler>,
}

impl AdapterFactory for DefaultAdapterFactory {
    fn adapter(&self, model: &ModelSpec) -> Arc<dyn ProviderAdapter> {
        adapter_for(
            model.provider,
            model.provider_config(),
            self.http.clone(),
            self.throttler.clone(),
        )
    }
}

pub struct ChatOrchestrator {
    config: Arc<ConfigStore>,
    tools: ToolRegistry,
    sessions: Arc<SessionManager>,
    tracker: ActionTracker,
    adapters: Arc<dyn AdapterFactory>,
    round_timeout: Duration,
}

impl ChatOrchestrator {
    pub fn new(
        config: Arc<ConfigStore>,
        tools: ToolRegistry,
        sessions: Arc<SessionManager>,
        http: reqwest::Client,
        throttler: Arc<Throttler>,
    ) -> Self {
        ChatOrchestrator {
            config,
            tools,
            sessions: sessions.clone(),
            tracker: ActionTracker::new(sessions),
            adapters: Arc::new(DefaultAdapterFactory { http, throttler }),
            round_timeout: ROUND_TIMEOUT,
        }
    }

    pub fn with_adapter_factory(mut self, adapters: Arc<dyn AdapterFactory>) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = timeout;
        self
    }

    pub fn default_language(&self) -> String {
        self.config.platform().default_language.clone()
    }

    /// Localized user-visible message for an error.
    pub fn user_message(&self, language: &str, err: &GatewayError) -> String {
        self.config.message_for(language, err.code())
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Run one streamed turn for an open session. Emits every outcome
    /// (success, error, cancellation, timeout) as events on the session
    /// channel; never returns an error to the caller.
    pub async fn run_streaming_turn(
        &self,
        chat_id: &str,
        app_id: &str,
        turn: TurnRequest,
        cancel: CancellationToken,
    ) {
        let language = self.resolve_language(&turn);

        let prepared = match self.prepare(app_id, &turn) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.emit_error(chat_id, &language, &err);
                self.sessions.end_round(chat_id);
                return;
            }
        };
        self.tracker.emit(
            chat_id,
            ChatEvent::Prepared {
                model: prepared.request.model.clone(),
                tools_enabled: prepared.allowed_tools.clone(),
            },
        );
        if let Some(skill) = turn.requested_skill.as_deref() {
            if let Some(tool) = self.tools.get(skill).filter(|_| {
                prepared.allowed_tools.iter().any(|name| name == skill)
            }) {
                self.tracker.emit(
                    chat_id,
                    ChatEvent::SkillActivation {
                        skill_name: skill.to_string(),
                        description: tool.description(),
                    },
                );
            }
        }

        let emitter = Some(chat_id);
        tokio::select! {
            _ = cancel.cancelled() => {
                // Dropping the round future aborts the upstream call and
                // releases the throttler permit.
                self.tracker.emit(
                    chat_id,
                    ChatEvent::Disconnected { reason: "aborted".to_string() },
                );
            }
            outcome = self.drive_rounds(emitter, prepared) => {
                match outcome {
                    Ok(turn_outcome) => {
                        self.tracker
                            .emit(chat_id, ChatEvent::UsageReport(turn_outcome.usage));
                        self.tracker.emit(
                            chat_id,
                            ChatEvent::Done {
                                finish_reason: turn_outcome.finish_reason,
                            },
                        );
                    }
                    Err(err) => self.emit_error(chat_id, &language, &err),
                }
            }
        }
        self.sessions.end_round(chat_id);
        self.sessions.touch(chat_id);
    }

    /// Run one turn without a session, returning the full response body.
    pub async fn run_turn(
        &self,
        app_id: &str,
        turn: TurnRequest,
    ) -> Result<Response, GatewayError> {
        let prepared = self.prepare(app_id, &turn)?;
        let model = prepared.request.model.clone();
        let provider = prepared.provider;
        let outcome = self.drive_rounds(None, prepared).await?;

        Ok(Response {
            id: outcome.id,
            model,
            provider: provider.to_string(),
            choices: vec![ResponseChoice {
                index: 0,
                message: Message::assistant(outcome.text),
                finish_reason: Some(outcome.finish_reason),
            }],
            usage: Some(outcome.usage),
            raw: None,
        })
    }

    /// Connectivity probe: one trivial prompt through the non-streaming
    /// path, returning the upstream body untouched.
    pub async fn model_test(&self, model_id: &str) -> Result<Response, GatewayError> {
        let model = self
            .config
            .model(model_id)
            .ok_or_else(|| GatewayError::NotFound(format!("model '{model_id}'")))?;
        let adapter = self.adapters.adapter(model);
        let request = ChatRequest::new(model_id, vec![Message::user("Say hello!")]);
        adapter.chat(&request).await
    }

    // ------------------------------------------------------------------
    // PREP
    // ------------------------------------------------------------------

    fn resolve_language(&self, turn: &TurnRequest) -> String {
        turn.language
            .clone()
            .unwrap_or_else(|| self.default_language())
    }

    fn prepare(&self, app_id: &str, turn: &TurnRequest) -> Result<Prepared, GatewayError> {
        if turn.messages.is_empty() {
            return Err(GatewayError::Validation(
                "turn carries no messages".to_string(),
            ));
        }

        let app = self
            .config
            .app(app_id)
            .ok_or_else(|| GatewayError::NotFound(format!("app '{app_id}'")))?;

        let model_id = turn
            .model_id
            .clone()
            .or_else(|| app.default_model.clone())
            .ok_or_else(|| {
                GatewayError::Validation(format!("app '{app_id}' names no model"))
            })?;
        let model = self
            .config
            .model(&model_id)
            .ok_or_else(|| GatewayError::NotFound(format!("model '{model_id}'")))?;
        if !app.accepts_model(&model_id) {
            return Err(GatewayError::Validation(format!(
                "model '{model_id}' is not compatible with app '{app_id}'"
            )));
        }

        let adapter = self.adapters.adapter(model);
        let capabilities = adapter.capabilities(model);
        let language = self.resolve_language(turn);

        // Allowed tools: the app's list, restricted to registered tools,
        // gated by the model's capability, further narrowed by the caller.
        let allowed_tools: Vec<String> = if capabilities.tools {
            app.tools
                .iter()
                .filter(|name| self.tools.has_tool(name))
                .filter(|name| match &turn.enabled_tools {
                    Some(enabled) => enabled.iter().any(|e| e == *name),
                    None => true,
                })
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let mut messages = Vec::with_capacity(turn.messages.len() + 1);
        if let Some(prompt) = self.build_system_prompt(app, turn, &language) {
            messages.push(Message::system(prompt));
        }
        messages.extend(turn.messages.iter().cloned());

        let max_tokens = if turn.use_max_tokens == Some(true) {
            Some(capabilities.max_output_tokens)
        } else {
            app.token_limit
        };

        let request = ChatRequest {
            model: model_id,
            messages,
            temperature: turn.temperature,
            max_tokens,
            stop: Vec::new(),
            tools: self.tools.definitions_for(&allowed_tools),
            tool_choice: None,
            response_format: turn.response_format.clone(),
            thinking: turn.thinking_enabled.map(|enabled| ThinkingOptions {
                enabled,
                budget_tokens: turn.thinking_budget,
            }),
        };

        Ok(Prepared {
            provider: adapter.provider(),
            adapter,
            request,
            allowed_tools,
        })
    }

    fn build_system_prompt(
        &self,
        app: &crate::config::AppSpec,
        turn: &TurnRequest,
        language: &str,
    ) -> Option<String> {
        let mut sections: Vec<String> = Vec::new();

        if turn.bypass_app_prompts != Some(true) {
            if let Some(prompt) = app.prompt_for(language) {
                sections.push(expand_variables(prompt, &app.variables));
            }
        }
        if let Some(style) = turn.style.as_deref() {
            sections.push(format!("Respond in a {style} style."));
        }
        if let Some(format) = turn.output_format.as_deref() {
            sections.push(format!("Format the response as {format}."));
        }
        if let Some(language) = turn.language.as_deref() {
            sections.push(format!("Answer in {language}."));
        }

        (!sections.is_empty()).then(|| sections.join("\n\n"))
    }

    // ------------------------------------------------------------------
    // Round loop
    // ------------------------------------------------------------------

    async fn drive_rounds(
        &self,
        chat_id: Option<&str>,
        prepared: Prepared,
    ) -> Result<TurnOutcome, GatewayError> {
        let Prepared {
            adapter, request, ..
        } = prepared;
        let mut messages = request.messages.clone();
        let mut total_usage = Usage::default();
        let mut full_text = String::new();
        let mut last_id = String::new();
        let mut tool_rounds = 0usize;

        loop {
            let round_request = ChatRequest {
                messages: messages.clone(),
                ..clone_request_options(&request)
            };

            let round = tokio::time::timeout(
                self.round_timeout,
                self.run_round(chat_id, adapter.as_ref(), &round_request),
            )
            .await
            .map_err(|_| GatewayError::Timeout)??;

            if let Some(usage) = round.usage {
                total_usage.add(&usage);
            }
            full_text.push_str(&round.text);
            if !round.id.is_empty() {
                last_id = round.id;
            }

            let complete_calls: Vec<ToolCall> = round
                .tool_calls
                .iter()
                .filter(|call| !call.is_partial())
                .cloned()
                .collect();
            let had_partials = round.tool_calls.len() != complete_calls.len();
            if had_partials {
                log::warn!(
                    "dropping {} unfinalized tool call(s)",
                    round.tool_calls.len() - complete_calls.len()
                );
            }

            let wants_tools = round.finish_reason == Some(FinishReason::ToolCalls)
                || !round.tool_calls.is_empty();
            if !wants_tools {
                return Ok(TurnOutcome {
                    id: last_id,
                    text: full_text,
                    usage: total_usage,
                    finish_reason: round.finish_reason.unwrap_or(FinishReason::Stop),
                    messages,
                });
            }

            // A round that asked for tools but produced no usable call is a
            // stream defect, not something to feed back to the model.
            if complete_calls.is_empty() {
                return Err(GatewayError::Streaming(
                    "tool-call arguments did not finish streaming".to_string(),
                ));
            }

            if tool_rounds >= MAX_TOOL_ROUNDS {
                if let Some(chat_id) = chat_id {
                    self.tracker.emit(
                        chat_id,
                        ChatEvent::ToolLimitExceeded { rounds: tool_rounds },
                    );
                }
                // Close the turn, preserving whatever has been streamed.
                return Ok(TurnOutcome {
                    id: last_id,
                    text: full_text,
                    usage: total_usage,
                    finish_reason: FinishReason::Stop,
                    messages,
                });
            }
            tool_rounds += 1;

            messages.push(Message::assistant_with_calls(
                round.text.clone(),
                complete_calls.clone(),
            ));
            for call in &complete_calls {
                if let Some(chat_id) = chat_id {
                    self.tracker.emit(
                        chat_id,
                        ChatEvent::ToolInvoked {
                            tool_call_id: call.id.clone(),
                            name: call.name.clone(),
                            args: call.arguments.clone(),
                        },
                    );
                }
                let started = Instant::now();
                let outcomes = self.tools.run_calls(std::slice::from_ref(call)).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                for outcome in outcomes {
                    if let Some(chat_id) = chat_id {
                        self.tracker.emit(
                            chat_id,
                            ChatEvent::ToolResult {
                                tool_call_id: outcome.tool_call_id.clone(),
                                ok: outcome.ok,
                                ms: elapsed_ms,
                                error_kind: outcome.error.as_ref().map(|f| f.kind),
                            },
                        );
                    }
                    // Failures are materialized as tool-result messages; the
                    // model sees the error string, nothing is rethrown.
                    messages.push(outcome.into_message());
                }
            }
        }
    }

    /// One upstream round: stream when a session is attached, otherwise the
    /// plain request/response path.
    async fn run_round(
        &self,
        chat_id: Option<&str>,
        adapter: &dyn ProviderAdapter,
        request: &ChatRequest,
    ) -> Result<RoundResult, GatewayError> {
        match chat_id {
            Some(chat_id) => {
                let mut stream = adapter.stream(request).await?;
                let mut round = RoundResult::default();
                while let Some(item) = stream.next().await {
                    let chunk = item?;
                    if round.id.is_empty() && !chunk.id.is_empty() {
                        round.id = chunk.id.clone();
                    }
                    if let Some(usage) = chunk.usage {
                        round.usage = Some(usage);
                    }
                    for choice in &chunk.choices {
                        if let Some(text) = choice.delta.content.as_deref() {
                            if !text.is_empty() {
                                round.text.push_str(text);
                                self.tracker.emit(
                                    chat_id,
                                    ChatEvent::Delta {
                                        text: text.to_string(),
                                    },
                                );
                            }
                        }
                        for call in &choice.delta.tool_calls {
                            self.tracker.emit(
                                chat_id,
                                ChatEvent::DeltaToolCall {
                                    fragment: serde_json::json!({
                                        "toolCallId": call.id,
                                        "name": call.name,
                                    }),
                                },
                            );
                            round.tool_calls.push(call.clone());
                        }
                        if let Some(reason) = &choice.finish_reason {
                            round.finish_reason = Some(reason.clone());
                        }
                    }
                    if chunk.done {
                        break;
                    }
                }
                Ok(round)
            }
            None => {
                let response = adapter.chat(request).await?;
                let mut round = RoundResult {
                    id: response.id.clone(),
                    usage: response.usage,
                    ..Default::default()
                };
                if let Some(choice) = response.choices.into_iter().next() {
                    round.text = choice.message.text();
                    round.tool_calls = choice.message.tool_calls;
                    round.finish_reason = choice.finish_reason;
                }
                Ok(round)
            }
        }
    }

    fn emit_error(&self, chat_id: &str, language: &str, err: &GatewayError) {
        log::error!("turn failed for chat {chat_id}: {err}");
        self.tracker.emit(
            chat_id,
            ChatEvent::Error {
                code: err.code().to_string(),
                message: self.user_message(language, err),
                recommendation: None,
            },
        );
    }
}

struct Prepared {
    provider: Provider,
    adapter: Arc<dyn ProviderAdapter>,
    request: ChatRequest,
    allowed_tools: Vec<String>,
}

#[derive(Default)]
struct RoundResult {
    id: String,
    text: String,
    tool_calls: Vec<ToolCall>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

/// The final shape of a finished turn.
pub struct TurnOutcome {
    pub id: String,
    pub text: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
    /// Conversation including appended assistant and tool messages.
    pub messages: Vec<Message>,
}

fn clone_request_options(request: &ChatRequest) -> ChatRequest {
    ChatRequest {
        model: request.model.clone(),
        messages: Vec::new(),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        stop: request.stop.clone(),
        tools: request.tools.clone(),
        tool_choice: request.tool_choice.clone(),
        response_format: request.response_format.clone(),
        thinking: request.thinking,
    }
}

/// Expand `{{name}}` template variables.
fn expand_variables(prompt: &str, variables: &std::collections::HashMap<String, String>) -> String {
    let mut out = prompt.to_string();
    for (name, value) in variables {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}
