/// Events emitted to the host UI
///
/// This module defines the notification contract between the sync core and
/// whatever renders the conversation. Events flow one way, core → host, over
/// an unbounded channel; the host talks back through `ClientState` methods
/// and the `ExternalEventRouter`.
use serde::Serialize;
use tokio::sync::mpsc;

use crate::protocol::MessageState;
use crate::tool_dispatcher::{ConfirmationFamily, ConfirmationRequest, PendingIntegration};

/// Event names as constants to prevent typos
pub mod event_names {
    // === Chat stream ===

    /// Assistant text grew
    pub const CHAT_UPDATE: &str = "chat-update";

    /// Assistant message reached a terminal state
    pub const CHAT_DONE: &str = "chat-done";

    /// Transport failed; the message carries an apology
    pub const CHAT_ERROR: &str = "chat-error";

    /// Non-fatal backend error frame
    pub const TOAST: &str = "toast";

    // === Tools ===

    /// Context elevation needs the user's decision
    pub const REQUEST_CONFIRMATION: &str = "request-confirmation";

    /// Confirmed context request ready for the host to fulfil
    pub const CONTEXT_REQUESTED: &str = "context-requested";

    /// Integration call queued for preview and execution
    pub const INTEGRATION_PENDING: &str = "integration-pending";

    // === History ===

    /// Server record carries a real title
    pub const HISTORY_SETTLED: &str = "history-settled";

    /// Gave up waiting for the server record
    pub const HISTORY_EXHAUSTED: &str = "history-exhausted";
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatUpdatePayload {
    pub conversation_id: String,
    pub message_id: String,
    pub delta: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatDonePayload {
    pub conversation_id: String,
    pub message_id: String,
    pub state: MessageState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatErrorPayload {
    pub conversation_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToastPayload {
    pub conversation_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextRequestedPayload {
    pub family: ConfirmationFamily,
    pub conversation_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistorySettledPayload {
    pub conversation_id: String,
    pub title: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryExhaustedPayload {
    pub conversation_id: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    ChatUpdate(ChatUpdatePayload),
    ChatDone(ChatDonePayload),
    ChatError(ChatErrorPayload),
    Toast(ToastPayload),
    RequestConfirmation(ConfirmationRequest),
    ContextRequested(ContextRequestedPayload),
    IntegrationPending(PendingIntegration),
    HistorySettled(HistorySettledPayload),
    HistoryExhausted(HistoryExhaustedPayload),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::ChatUpdate(_) => event_names::CHAT_UPDATE,
            ClientEvent::ChatDone(_) => event_names::CHAT_DONE,
            ClientEvent::ChatError(_) => event_names::CHAT_ERROR,
            ClientEvent::Toast(_) => event_names::TOAST,
            ClientEvent::RequestConfirmation(_) => event_names::REQUEST_CONFIRMATION,
            ClientEvent::ContextRequested(_) => event_names::CONTEXT_REQUESTED,
            ClientEvent::IntegrationPending(_) => event_names::INTEGRATION_PENDING,
            ClientEvent::HistorySettled(_) => event_names::HISTORY_SETTLED,
            ClientEvent::HistoryExhausted(_) => event_names::HISTORY_EXHAUSTED,
        }
    }
}

/// Cloneable emitter handed to every component that notifies the host
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that discards everything
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ClientEvent) {
        if let Some(tx) = &self.tx {
            // Host went away: nothing left to notify
            let _ = tx.send(event);
        }
    }
}
