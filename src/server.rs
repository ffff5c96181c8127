//! HTTP surface.
//!
//! Binds the REST endpoints to the orchestrator and session manager. This
//! layer owns request validation, status-code mapping and SSE framing; it
//! contains no provider knowledge.

use crate::chat::events::ChatEvent;
use crate::chat::orchestrator::{ChatOrchestrator, TurnRequest};
use crate::chat::session::SessionManager;
use crate::config::ConfigStore;
use crate::llm::error::GatewayError;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use regex::Regex;
use serde_json::json;
use std::convert::Infallible;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// External workflow execution, addressed with an `@name` token in the last
/// user message. The runner emits its own events on the session's channel.
pub trait WorkflowRunner: Send + Sync {
    fn run(&self, chat_id: &str, workflow: &str, turn: TurnRequest);
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub sessions: Arc<SessionManager>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub workflows: Option<Arc<dyn WorkflowRunner>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/models/{model_id}/chat/test", get(model_test))
        .route(
            "/api/apps/{app_id}/chat/{chat_id}",
            get(open_channel).post(submit_turn),
        )
        .route("/api/apps/{app_id}/chat/{chat_id}/stop", post(stop_chat))
        .route("/api/apps/{app_id}/chat/{chat_id}/status", get(chat_status))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// `GET /api/models/{model_id}/chat/test`: send a trivial prompt and return
/// the upstream body verbatim.
async fn model_test(State(state): State<AppState>, Path(model_id): Path<String>) -> Response {
    match state.orchestrator.model_test(&model_id).await {
        Ok(response) => {
            let body = response
                .raw
                .clone()
                .unwrap_or_else(|| serde_json::to_value(&response).unwrap_or_default());
            Json(body).into_response()
        }
        Err(err) => error_response(&state, &err),
    }
}

/// `GET /api/apps/{app_id}/chat/{chat_id}`: open the session's SSE channel.
async fn open_channel(
    State(state): State<AppState>,
    Path((app_id, chat_id)): Path<(String, String)>,
) -> Response {
    let rx = match state.sessions.open(&chat_id, &app_id) {
        Ok(rx) => rx,
        Err(err) => return error_response(&state, &err),
    };
    state.sessions.send(
        &chat_id,
        ChatEvent::Connected {
            chat_id: chat_id.clone(),
            ts: chrono::Utc::now().timestamp_millis(),
        },
    );

    // Closing the session when the body stream drops covers client
    // disconnects; explicit /stop closes the channel from the other side.
    let guard = SessionGuard {
        sessions: state.sessions.clone(),
        chat_id,
    };
    let body_stream = async_stream::stream! {
        let _guard = guard;
        let mut rx = rx;
        let mut ping = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping.tick().await; // immediate first tick
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        yield Ok::<Bytes, Infallible>(Bytes::from(event.to_sse_frame()));
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    yield Ok(Bytes::from_static(b": ping\n\n"));
                }
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `POST /api/apps/{app_id}/chat/{chat_id}`: submit one turn.
async fn submit_turn(
    State(state): State<AppState>,
    Path((app_id, chat_id)): Path<(String, String)>,
    body: Json<serde_json::Value>,
) -> Response {
    let turn: TurnRequest = match serde_json::from_value(body.0) {
        Ok(turn) => turn,
        Err(err) => {
            return error_response(&state, &GatewayError::Validation(err.to_string()));
        }
    };

    // `@workflow` hand-off: an external runner takes over the session's
    // event channel and this request completes immediately.
    if let Some(runner) = &state.workflows {
        if let Some(workflow) = requested_workflow(&state.config, &app_id, &turn) {
            runner.run(&chat_id, &workflow, turn);
            return Json(json!({ "status": "streaming", "chatId": chat_id })).into_response();
        }
    }

    if state.sessions.is_open(&chat_id) {
        let cancel = CancellationToken::new();
        if let Err(err) = state.sessions.begin_round(&chat_id, cancel.clone()) {
            return error_response(&state, &err);
        }
        let orchestrator = state.orchestrator.clone();
        let chat = chat_id.clone();
        tokio::spawn(async move {
            orchestrator
                .run_streaming_turn(&chat, &app_id, turn, cancel)
                .await;
        });
        Json(json!({ "status": "streaming", "chatId": chat_id })).into_response()
    } else {
        match state.orchestrator.run_turn(&app_id, turn).await {
            Ok(response) => Json(response).into_response(),
            Err(err) => error_response(&state, &err),
        }
    }
}

/// `POST /api/apps/{app_id}/chat/{chat_id}/stop`: abort and close.
async fn stop_chat(
    State(state): State<AppState>,
    Path((_app_id, chat_id)): Path<(String, String)>,
) -> Response {
    let existed = state.sessions.abort(&chat_id, "client stop");
    state.sessions.close(&chat_id);
    if existed {
        Json(json!({ "status": "stopped" })).into_response()
    } else {
        error_response(
            &state,
            &GatewayError::NotFound(format!("chat '{chat_id}'")),
        )
    }
}

/// `GET /api/apps/{app_id}/chat/{chat_id}/status`
async fn chat_status(
    State(state): State<AppState>,
    Path((_app_id, chat_id)): Path<(String, String)>,
) -> Response {
    Json(state.sessions.status(&chat_id)).into_response()
}

// ============================================================================
// Helpers
// ============================================================================

struct SessionGuard {
    sessions: Arc<SessionManager>,
    chat_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.close(&self.chat_id);
    }
}

fn workflow_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@([\w.-]+)").expect("workflow token pattern"))
}

/// Name of the enabled workflow addressed by the last user message, if any.
fn requested_workflow(config: &ConfigStore, app_id: &str, turn: &TurnRequest) -> Option<String> {
    let app = config.app(app_id)?;
    if app.workflows.is_empty() {
        return None;
    }
    let last_user = turn
        .messages
        .iter()
        .rev()
        .find(|msg| msg.role == crate::llm::model::Role::User)?;
    let text = last_user.text();
    workflow_token_pattern()
        .captures_iter(&text)
        .map(|captures| captures[1].to_string())
        .find(|token| app.workflows.iter().any(|workflow| workflow == token))
}

fn error_response(state: &AppState, err: &GatewayError) -> Response {
    let language = state.config.platform().default_language.clone();
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({
        "error": state.config.message_for(&language, err.code()),
        "code": err.code(),
    });
    if let GatewayError::RateLimit {
        retry_after: Some(seconds),
        ..
    } = err
    {
        body["retryAfter"] = json!(seconds);
    }
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppSpec, ModelSpec, PlatformSpec};
    use crate::llm::adapter::{
        Capabilities, ChatRequest, Provider, ProviderAdapter,
    };
    use crate::llm::model::{
        ChunkChoice, ChunkDelta, FinishReason, Message, Response as ModelResponse, ResponseChoice,
        ResponseChunk, Role, Usage,
    };
    use crate::llm::throttle::Throttler;
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;
    use axum::http::Request;
    use futures::StreamExt;
    use std::collections::HashMap;
    use tower::ServiceExt;

    struct EchoAdapter;

    #[async_trait]
    impl ProviderAdapter for EchoAdapter {
        fn provider(&self) -> Provider {
            Provider::OpenAi
        }

        fn capabilities(&self, model: &ModelSpec) -> Capabilities {
            Capabilities {
                tools: true,
                images: true,
                structured_output: true,
                streaming: true,
                max_output_tokens: 1024,
                context_length: model.context_length,
            }
        }

        fn validate_config(&self) -> Result<(), GatewayError> {
            Ok(())
        }

        fn validate_request(&self, _req: &ChatRequest) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn chat(&self, req: &ChatRequest) -> Result<ModelResponse, GatewayError> {
            Ok(ModelResponse {
                id: "resp_1".into(),
                model: req.model.clone(),
                provider: "openai".into(),
                choices: vec![ResponseChoice {
                    index: 0,
                    message: Message::assistant("Hello!"),
                    finish_reason: Some(FinishReason::Stop),
                }],
                usage: Some(Usage::new(2, 1)),
                raw: Some(json!({ "upstream": "verbatim" })),
            })
        }

        async fn stream(
            &self,
            _req: &ChatRequest,
        ) -> Result<crate::llm::ChunkStream, GatewayError> {
            let chunks = vec![
                ResponseChunk {
                    id: "chunk".into(),
                    model: "m".into(),
                    provider: "openai".into(),
                    choices: vec![ChunkChoice {
                        index: 0,
                        delta: ChunkDelta {
                            role: Some(Role::Assistant),
                            content: Some("Hello".into()),
                            tool_calls: Vec::new(),
                        },
                        finish_reason: Some(FinishReason::Stop),
                    }],
                    usage: None,
                    done: false,
                },
                ResponseChunk {
                    id: "chunk".into(),
                    model: "m".into(),
                    provider: "openai".into(),
                    choices: Vec::new(),
                    usage: Some(Usage::new(2, 1)),
                    done: true,
                },
            ];
            Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
        }
    }

    struct EchoFactory;

    impl crate::chat::orchestrator::AdapterFactory for EchoFactory {
        fn adapter(&self, _model: &ModelSpec) -> Arc<dyn ProviderAdapter> {
            Arc::new(EchoAdapter)
        }
    }

    fn state() -> AppState {
        let model = ModelSpec {
            id: "mock-model".into(),
            provider: Provider::OpenAi,
            url: "http://localhost:9000/v1".into(),
            api_key_env: None,
            max_tokens: None,
            supports_tools: Some(true),
            supports_streaming: Some(true),
            supports_images: None,
            context_length: 32_000,
            pricing: None,
            concurrency: None,
        };
        let app = AppSpec {
            id: "assistant".into(),
            default_model: Some("mock-model".into()),
            workflows: vec!["summarize".into()],
            system_prompt: HashMap::from([("en".into(), "Help.".into())]),
            ..Default::default()
        };
        let config = Arc::new(ConfigStore::from_parts(
            vec![model],
            vec![app],
            PlatformSpec::default(),
        ));
        let sessions = Arc::new(SessionManager::new());
        let orchestrator = Arc::new(
            ChatOrchestrator::new(
                config.clone(),
                ToolRegistry::new(),
                sessions.clone(),
                reqwest::Client::new(),
                Arc::new(Throttler::default()),
            )
            .with_adapter_factory(Arc::new(EchoFactory)),
        );
        AppState {
            config,
            sessions,
            orchestrator,
            workflows: None,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_turn(app_id: &str, chat_id: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/api/apps/{app_id}/chat/{chat_id}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn post_without_a_channel_returns_the_full_response() {
        let app = router(state());
        let response = app
            .oneshot(post_turn(
                "assistant",
                "chat-1",
                json!({ "messages": [{"role": "user", "content": "hi"}] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["provider"], "openai");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello!");
        assert_eq!(body["choices"][0]["finishReason"], "stop");
    }

    #[tokio::test]
    async fn post_with_an_open_channel_streams_instead() {
        let state = state();
        let app = router(state.clone());
        let mut rx = state.sessions.open("chat-1", "assistant").unwrap();

        let response = app
            .oneshot(post_turn(
                "assistant",
                "chat-1",
                json!({ "messages": [{"role": "user", "content": "hi"}] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "streaming");

        // The spawned turn emits on the session channel.
        let mut saw_done = false;
        for _ in 0..50 {
            match rx.try_recv() {
                Ok(event) if event.kind() == "done" => {
                    saw_done = true;
                    break;
                }
                Ok(_) => {}
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        assert!(saw_done);
    }

    #[tokio::test]
    async fn busy_sessions_reject_a_second_round_with_409() {
        let state = state();
        let app = router(state.clone());
        let _rx = state.sessions.open("chat-1", "assistant").unwrap();
        state
            .sessions
            .begin_round("chat-1", CancellationToken::new())
            .unwrap();

        let response = app
            .oneshot(post_turn(
                "assistant",
                "chat-1",
                json!({ "messages": [{"role": "user", "content": "hi"}] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["code"], "BUSY");
    }

    #[tokio::test]
    async fn unknown_body_fields_are_rejected_with_400() {
        let app = router(state());
        let response = app
            .oneshot(post_turn(
                "assistant",
                "chat-1",
                json!({ "messages": [], "bogus": 1 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn sse_channel_opens_with_a_connected_frame() {
        let app = router(state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/apps/assistant/chat/chat-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let mut stream = response.into_body().into_data_stream();
        let first = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let frame = String::from_utf8(first.to_vec()).unwrap();
        assert!(frame.starts_with("type: connected\n"));
        assert!(frame.contains("\"chatId\":\"chat-1\""));
    }

    #[tokio::test]
    async fn duplicate_sse_channels_are_rejected() {
        let state = state();
        let app = router(state.clone());
        let _rx = state.sessions.open("chat-1", "assistant").unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/apps/assistant/chat/chat-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn stop_aborts_and_reports_missing_sessions() {
        let state = state();
        let stop =
            |app: Router| async move {
                app.oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/api/apps/assistant/chat/chat-1/stop")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap()
            };

        let response = stop(router(state.clone())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let _rx = state.sessions.open("chat-1", "assistant").unwrap();
        let token = CancellationToken::new();
        state.sessions.begin_round("chat-1", token.clone()).unwrap();

        let response = stop(router(state.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(token.is_cancelled());
        assert!(!state.sessions.is_open("chat-1"));
    }

    #[tokio::test]
    async fn status_reports_session_state() {
        let state = state();
        let status = |app: Router| async move {
            app.oneshot(
                Request::builder()
                    .uri("/api/apps/assistant/chat/chat-1/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
        };

        let body = body_json(status(router(state.clone())).await).await;
        assert_eq!(body["active"], false);

        let _rx = state.sessions.open("chat-1", "assistant").unwrap();
        let body = body_json(status(router(state.clone())).await).await;
        assert_eq!(body["active"], true);
        assert_eq!(body["processing"], false);
    }

    #[tokio::test]
    async fn model_test_returns_the_upstream_body_verbatim() {
        let app = router(state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/models/mock-model/chat/test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "upstream": "verbatim" }));

        let app = router(state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/models/ghost/chat/test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn workflow_tokens_hand_off_to_the_runner() {
        struct Recorder(std::sync::Mutex<Vec<(String, String)>>);
        impl WorkflowRunner for Recorder {
            fn run(&self, chat_id: &str, workflow: &str, _turn: TurnRequest) {
                self.0
                    .lock()
                    .unwrap()
                    .push((chat_id.to_string(), workflow.to_string()));
            }
        }

        let recorder = Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        let mut state = state();
        state.workflows = Some(recorder.clone());
        let app = router(state);

        let response = app
            .oneshot(post_turn(
                "assistant",
                "chat-1",
                json!({ "messages": [
                    {"role": "user", "content": "please @summarize this thread"}
                ]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "streaming");
        assert_eq!(
            recorder.0.lock().unwrap().as_slice(),
            &[("chat-1".to_string(), "summarize".to_string())]
        );
    }

    #[test]
    fn workflow_detection_requires_an_enabled_name() {
        let state = state();
        let turn = |text: &str| TurnRequest {
            messages: vec![Message::user(text)],
            ..Default::default()
        };

        assert_eq!(
            requested_workflow(&state.config, "assistant", &turn("run @summarize now")),
            Some("summarize".to_string())
        );
        // Unknown workflow names and bare mentions do not match.
        assert_eq!(
            requested_workflow(&state.config, "assistant", &turn("run @unknown now")),
            None
        );
        assert_eq!(
            requested_workflow(&state.config, "assistant", &turn("no token here")),
            None
        );
    }
}
