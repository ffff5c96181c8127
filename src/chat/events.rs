//! Typed event emission over a session's SSE channel.
//!
//! Every event kind carries a stable `type` string and a JSON payload; the
//! wire frame is `type: <kind>` + `data: <json>` followed by a blank line.
//! Tasks never write to the client directly; they post [`ChatEvent`]s
//! through the [`ActionTracker`], which routes them to the session's channel
//! so frames leave in emission order.

use crate::chat::session::SessionManager;
use crate::llm::model::{FinishReason, ToolErrorKind, Usage};
use serde_json::json;
use std::sync::Arc;

/// Events delivered to chat clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Connected {
        chat_id: String,
        ts: i64,
    },
    Prepared {
        model: String,
        tools_enabled: Vec<String>,
    },
    /// Streamed assistant text.
    Delta {
        text: String,
    },
    /// Streamed tool-call fragment, for clients that render call progress.
    DeltaToolCall {
        fragment: serde_json::Value,
    },
    SkillActivation {
        skill_name: String,
        description: String,
    },
    ToolInvoked {
        tool_call_id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        ok: bool,
        ms: u64,
        error_kind: Option<ToolErrorKind>,
    },
    UsageReport(Usage),
    ToolLimitExceeded {
        rounds: usize,
    },
    Done {
        finish_reason: FinishReason,
    },
    Error {
        code: String,
        message: String,
        recommendation: Option<String>,
    },
    Disconnected {
        reason: String,
    },
}

impl ChatEvent {
    /// Stable event kind, the frame's `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatEvent::Connected { .. } => "connected",
            ChatEvent::Prepared { .. } => "prepared",
            ChatEvent::Delta { .. } | ChatEvent::DeltaToolCall { .. } => "delta",
            ChatEvent::SkillActivation { .. } => "skill.activation",
            ChatEvent::ToolInvoked { .. } => "tool.invoked",
            ChatEvent::ToolResult { .. } => "tool.result",
            ChatEvent::UsageReport(_) => "usage",
            ChatEvent::ToolLimitExceeded { .. } => "tool_limit_exceeded",
            ChatEvent::Done { .. } => "done",
            ChatEvent::Error { .. } => "error",
            ChatEvent::Disconnected { .. } => "disconnected",
        }
    }

    /// JSON payload, the frame's `data` field.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            ChatEvent::Connected { chat_id, ts } => json!({ "chatId": chat_id, "ts": ts }),
            ChatEvent::Prepared {
                model,
                tools_enabled,
            } => json!({ "model": model, "toolsEnabled": tools_enabled }),
            ChatEvent::Delta { text } => json!({ "text": text }),
            ChatEvent::DeltaToolCall { fragment } => json!({ "toolCallFragment": fragment }),
            ChatEvent::SkillActivation {
                skill_name,
                description,
            } => json!({ "skillName": skill_name, "description": description }),
            ChatEvent::ToolInvoked {
                tool_call_id,
                name,
                args,
            } => json!({ "toolCallId": tool_call_id, "name": name, "args": args }),
            ChatEvent::ToolResult {
                tool_call_id,
                ok,
                ms,
                error_kind,
            } => {
                let mut payload = json!({ "toolCallId": tool_call_id, "ok": ok, "ms": ms });
                if let Some(kind) = error_kind {
                    payload["errorKind"] = json!(kind.as_str());
                }
                payload
            }
            ChatEvent::UsageReport(usage) => {
                serde_json::to_value(usage).unwrap_or_else(|_| json!({}))
            }
            ChatEvent::ToolLimitExceeded { rounds } => json!({ "rounds": rounds }),
            ChatEvent::Done { finish_reason } => json!({ "finishReason": finish_reason.as_str() }),
            ChatEvent::Error {
                code,
                message,
                recommendation,
            } => {
                let mut payload = json!({ "code": code, "message": message });
                if let Some(recommendation) = recommendation {
                    payload["recommendation"] = json!(recommendation);
                }
                payload
            }
            ChatEvent::Disconnected { reason } => json!({ "reason": reason }),
        }
    }

    /// Render the SSE frame for this event.
    pub fn to_sse_frame(&self) -> String {
        format!("type: {}\ndata: {}\n\n", self.kind(), self.payload())
    }
}

/// Posts events to a session's channel by chat id.
#[derive(Clone)]
pub struct ActionTracker {
    sessions: Arc<SessionManager>,
}

impl ActionTracker {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        ActionTracker { sessions }
    }

    /// Deliver `event` to the session's SSE channel. Returns false when the
    /// session is gone or its client disconnected; callers treat that as a
    /// signal to wind down, not as an error.
    pub fn emit(&self, chat_id: &str, event: ChatEvent) -> bool {
        let delivered = self.sessions.send(chat_id, event);
        if !delivered {
            log::debug!("event for {chat_id} dropped, session closed");
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kinds_are_stable() {
        let cases: Vec<(ChatEvent, &str)> = vec![
            (
                ChatEvent::Connected {
                    chat_id: "c".into(),
                    ts: 0,
                },
                "connected",
            ),
            (
                ChatEvent::Prepared {
                    model: "m".into(),
                    tools_enabled: vec![],
                },
                "prepared",
            ),
            (ChatEvent::Delta { text: "hi".into() }, "delta"),
            (
                ChatEvent::SkillActivation {
                    skill_name: "s".into(),
                    description: String::new(),
                },
                "skill.activation",
            ),
            (
                ChatEvent::ToolInvoked {
                    tool_call_id: "t".into(),
                    name: "n".into(),
                    args: json!({}),
                },
                "tool.invoked",
            ),
            (
                ChatEvent::ToolResult {
                    tool_call_id: "t".into(),
                    ok: true,
                    ms: 3,
                    error_kind: None,
                },
                "tool.result",
            ),
            (ChatEvent::UsageReport(Usage::new(1, 2)), "usage"),
            (ChatEvent::ToolLimitExceeded { rounds: 8 }, "tool_limit_exceeded"),
            (
                ChatEvent::Done {
                    finish_reason: FinishReason::Stop,
                },
                "done",
            ),
            (
                ChatEvent::Error {
                    code: "TIMEOUT".into(),
                    message: "m".into(),
                    recommendation: None,
                },
                "error",
            ),
            (
                ChatEvent::Disconnected {
                    reason: "stop".into(),
                },
                "disconnected",
            ),
        ];
        for (event, kind) in cases {
            assert_eq!(event.kind(), kind);
        }
    }

    #[test]
    fn frames_carry_type_and_data_lines() {
        let frame = ChatEvent::Delta { text: "Hi".into() }.to_sse_frame();
        assert_eq!(frame, "type: delta\ndata: {\"text\":\"Hi\"}\n\n");
    }

    #[test]
    fn tool_result_payload_includes_error_kind_only_on_failure() {
        let ok = ChatEvent::ToolResult {
            tool_call_id: "call_1".into(),
            ok: true,
            ms: 12,
            error_kind: None,
        }
        .payload();
        assert!(ok.get("errorKind").is_none());

        let failed = ChatEvent::ToolResult {
            tool_call_id: "call_1".into(),
            ok: false,
            ms: 30000,
            error_kind: Some(ToolErrorKind::Timeout),
        }
        .payload();
        assert_eq!(failed["errorKind"], "TIMEOUT");
    }

    #[test]
    fn usage_event_payload_is_the_usage_object() {
        let payload = ChatEvent::UsageReport(Usage::new(10, 5)).payload();
        assert_eq!(payload["inputTokens"], 10);
        assert_eq!(payload["totalTokens"], 15);
    }

    #[test]
    fn done_payload_names_the_finish_reason() {
        let payload = ChatEvent::Done {
            finish_reason: FinishReason::ToolCalls,
        }
        .payload();
        assert_eq!(payload["finishReason"], "tool_calls");
    }
}
