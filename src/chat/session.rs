//! Live-session registry.
//!
//! One [`Session`] exists per open chat id, created when the SSE channel
//! opens and destroyed on disconnect or explicit stop. The session owns its
//! event channel and the current round's cancellation token; all access goes
//! through the single-lock [`SessionManager`] map, so the per-session
//! invariant (at most one active upstream round) is enforced in one place.

use crate::chat::events::ChatEvent;
use crate::llm::error::GatewayError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

struct Session {
    app_id: String,
    events: UnboundedSender<ChatEvent>,
    last_activity_ms: i64,
    cancel: Option<CancellationToken>,
    processing: bool,
}

/// Externally visible session state, for the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing: Option<bool>,
}

/// Process-wide `chat_id → Session` map.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `chat_id` and hand back the event receiver the
    /// SSE handler will drain. Rejects a chat id that is already open.
    pub fn open(
        &self,
        chat_id: &str,
        app_id: &str,
    ) -> Result<UnboundedReceiver<ChatEvent>, GatewayError> {
        let mut sessions = self.lock();
        if sessions.contains_key(chat_id) {
            return Err(GatewayError::Busy(format!(
                "chat '{chat_id}' already has an open channel"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        sessions.insert(
            chat_id.to_string(),
            Session {
                app_id: app_id.to_string(),
                events: tx,
                last_activity_ms: now_ms(),
                cancel: None,
                processing: false,
            },
        );
        Ok(rx)
    }

    pub fn is_open(&self, chat_id: &str) -> bool {
        self.lock().contains_key(chat_id)
    }

    pub fn app_id(&self, chat_id: &str) -> Option<String> {
        self.lock().get(chat_id).map(|s| s.app_id.clone())
    }

    /// Post an event onto the session's channel. False when the session is
    /// gone or its receiver was dropped.
    pub fn send(&self, chat_id: &str, event: ChatEvent) -> bool {
        self.lock()
            .get(chat_id)
            .map(|session| session.events.send(event).is_ok())
            .unwrap_or(false)
    }

    /// Mark a round as running and attach its cancellation token. Enforces
    /// the one-round-per-session invariant: a second round on a busy chat id
    /// is rejected.
    pub fn begin_round(
        &self,
        chat_id: &str,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError> {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(chat_id) else {
            return Err(GatewayError::NotFound(format!(
                "chat '{chat_id}' is not open"
            )));
        };
        if session.processing {
            return Err(GatewayError::Busy(format!(
                "chat '{chat_id}' already has a round in flight"
            )));
        }
        session.processing = true;
        session.cancel = Some(cancel);
        session.last_activity_ms = now_ms();
        Ok(())
    }

    /// Clear the round state once a turn finishes or is aborted.
    pub fn end_round(&self, chat_id: &str) {
        if let Some(session) = self.lock().get_mut(chat_id) {
            session.processing = false;
            session.cancel = None;
            session.last_activity_ms = now_ms();
        }
    }

    /// Cancel the in-flight round, if any. Idempotent; returns true when the
    /// session existed.
    pub fn abort(&self, chat_id: &str, reason: &str) -> bool {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(chat_id) else {
            return false;
        };
        if let Some(cancel) = session.cancel.take() {
            log::info!("aborting round for chat {chat_id}: {reason}");
            cancel.cancel();
        }
        session.last_activity_ms = now_ms();
        true
    }

    pub fn touch(&self, chat_id: &str) {
        if let Some(session) = self.lock().get_mut(chat_id) {
            session.last_activity_ms = now_ms();
        }
    }

    /// Drop the session, aborting any in-flight round. Closing the event
    /// channel ends the client's SSE stream.
    pub fn close(&self, chat_id: &str) -> bool {
        let removed = self.lock().remove(chat_id);
        match removed {
            Some(session) => {
                if let Some(cancel) = session.cancel {
                    cancel.cancel();
                }
                true
            }
            None => false,
        }
    }

    pub fn status(&self, chat_id: &str) -> SessionStatus {
        match self.lock().get(chat_id) {
            Some(session) => SessionStatus {
                active: true,
                last_activity: Some(session.last_activity_ms),
                processing: Some(session.processing),
            },
            None => SessionStatus {
                active: false,
                last_activity: None,
                processing: None,
            },
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_duplicate_chat_ids() {
        let manager = SessionManager::new();
        let _rx = manager.open("chat-1", "app").unwrap();
        assert!(matches!(
            manager.open("chat-1", "app"),
            Err(GatewayError::Busy(_))
        ));
        // A different chat id is fine.
        assert!(manager.open("chat-2", "app").is_ok());
    }

    #[test]
    fn events_flow_through_the_session_channel_in_order() {
        let manager = SessionManager::new();
        let mut rx = manager.open("chat-1", "app").unwrap();

        assert!(manager.send("chat-1", ChatEvent::Delta { text: "a".into() }));
        assert!(manager.send("chat-1", ChatEvent::Delta { text: "b".into() }));
        assert_eq!(
            rx.try_recv().unwrap(),
            ChatEvent::Delta { text: "a".into() }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ChatEvent::Delta { text: "b".into() }
        );

        assert!(!manager.send("missing", ChatEvent::Delta { text: "c".into() }));
    }

    #[test]
    fn second_round_on_a_busy_session_is_rejected() {
        let manager = SessionManager::new();
        let _rx = manager.open("chat-1", "app").unwrap();

        manager
            .begin_round("chat-1", CancellationToken::new())
            .unwrap();
        let err = manager
            .begin_round("chat-1", CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.http_status(), 409);

        manager.end_round("chat-1");
        assert!(manager
            .begin_round("chat-1", CancellationToken::new())
            .is_ok());
    }

    #[test]
    fn abort_cancels_the_attached_token_idempotently() {
        let manager = SessionManager::new();
        let _rx = manager.open("chat-1", "app").unwrap();
        let token = CancellationToken::new();
        manager.begin_round("chat-1", token.clone()).unwrap();

        assert!(manager.abort("chat-1", "client stop"));
        assert!(token.is_cancelled());
        // Second abort is a no-op, not an error.
        assert!(manager.abort("chat-1", "again"));
        assert!(!manager.abort("missing", "nothing there"));
    }

    #[test]
    fn close_drops_the_channel_and_cancels_the_round() {
        let manager = SessionManager::new();
        let mut rx = manager.open("chat-1", "app").unwrap();
        let token = CancellationToken::new();
        manager.begin_round("chat-1", token.clone()).unwrap();

        assert!(manager.close("chat-1"));
        assert!(token.is_cancelled());
        // Sender side is gone.
        assert!(rx.try_recv().is_err());
        assert!(!manager.close("chat-1"));
        assert!(!manager.status("chat-1").active);
    }

    #[test]
    fn status_reports_activity_and_processing() {
        let manager = SessionManager::new();
        assert!(!manager.status("chat-1").active);

        let _rx = manager.open("chat-1", "app").unwrap();
        let status = manager.status("chat-1");
        assert!(status.active);
        assert_eq!(status.processing, Some(false));
        assert!(status.last_activity.is_some());

        manager
            .begin_round("chat-1", CancellationToken::new())
            .unwrap();
        assert_eq!(manager.status("chat-1").processing, Some(true));
    }
}
