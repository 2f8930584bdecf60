//! Host environment events
//!
//! The surrounding host posts small JSON messages at any time, independent
//! of the chat stream. [`ExternalEventRouter`] maps each shape onto store
//! mutations, UI state, or a [`RouterCommand`] for the caller to run.
//! Re-delivering an event never duplicates conversation state: envelopes
//! with an id are deduplicated, and every mutation is idempotent on its own.

use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::conversation_store::ConversationStore;
use crate::idempotency::{Delivery, DeliveryLog};
use crate::protocol::{ChatMessage, ChatRole};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostEvent {
    OpenConversation {
        #[serde(alias = "conversationId")]
        conversation_id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        messages: Vec<ChatMessage>,
    },
    ToolResultReady {
        #[serde(alias = "conversationId")]
        conversation_id: String,
        #[serde(alias = "toolUseId")]
        tool_use_id: String,
        #[serde(default)]
        content: String,
    },
    UsePrompt {
        prompt: String,
        #[serde(default, alias = "conversationId")]
        conversation_id: Option<String>,
    },
    CreatePrompt {
        #[serde(default)]
        initial: Option<String>,
    },
    CustomizePrompt {
        #[serde(alias = "promptId")]
        prompt_id: String,
    },
    RefreshPinnedPrompts,
}

impl HostEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            HostEvent::OpenConversation { .. } => "open-conversation",
            HostEvent::ToolResultReady { .. } => "tool-result-ready",
            HostEvent::UsePrompt { .. } => "use-prompt",
            HostEvent::CreatePrompt { .. } => "create-prompt",
            HostEvent::CustomizePrompt { .. } => "customize-prompt",
            HostEvent::RefreshPinnedPrompts => "refresh-pinned-prompts",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HostEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub event: HostEvent,
}

/// Follow-up work the router cannot do itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterCommand {
    Submit {
        conversation_id: Option<String>,
        prompt: String,
        /// Envelope id to release if the submission is rejected
        delivery_id: Option<String>,
    },
    RefreshPinnedPrompts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modal {
    CreatePrompt { initial: Option<String> },
    CustomizePrompt { prompt_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiState {
    pub active_conversation: Option<String>,
    pub modal: Option<Modal>,
    pub draft: String,
}

/// Id of the message a tool result lands in; stable across re-delivery
pub fn tool_result_message_id(tool_use_id: &str) -> String {
    format!("tool-result:{tool_use_id}")
}

pub struct ExternalEventRouter {
    store: Arc<ConversationStore>,
    deliveries: DeliveryLog,
    ui: Mutex<UiState>,
    /// Tool results that arrived while their conversation was streaming
    parked: Mutex<Vec<(String, ChatMessage)>>,
}

impl ExternalEventRouter {
    pub fn new(store: Arc<ConversationStore>, dedup_ttl: Duration) -> Self {
        Self {
            store,
            deliveries: DeliveryLog::new(dedup_ttl),
            ui: Mutex::new(UiState::default()),
            parked: Mutex::new(Vec::new()),
        }
    }

    fn ui_lock(&self) -> MutexGuard<'_, UiState> {
        self.ui.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn parked_lock(&self) -> MutexGuard<'_, Vec<(String, ChatMessage)>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ui(&self) -> UiState {
        self.ui_lock().clone()
    }

    pub fn dismiss_modal(&self) {
        self.ui_lock().modal = None;
    }

    pub fn take_draft(&self) -> String {
        std::mem::take(&mut self.ui_lock().draft)
    }

    /// Routes a raw JSON message. Malformed or unknown shapes are logged
    /// and ignored.
    pub fn route_json(&self, raw: &str) -> Vec<RouterCommand> {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.route_value(&value),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring host message that is not JSON");
                Vec::new()
            }
        }
    }

    pub fn route_value(&self, value: &Value) -> Vec<RouterCommand> {
        match HostEnvelope::deserialize(value) {
            Ok(envelope) => self.route(envelope),
            Err(e) => {
                let kind = value.get("type").and_then(Value::as_str).unwrap_or("<none>");
                tracing::warn!(event_type = kind, error = %e, "ignoring unrecognized host event");
                Vec::new()
            }
        }
    }

    pub fn route(&self, envelope: HostEnvelope) -> Vec<RouterCommand> {
        if let Some(id) = &envelope.id {
            if let Delivery::Duplicate { event_type } = self.deliveries.record(id, envelope.event.kind())
            {
                tracing::debug!(%id, %event_type, "duplicate host event ignored");
                return Vec::new();
            }
        }

        tracing::debug!(event_type = envelope.event.kind(), "routing host event");
        let delivery_id = envelope.id;
        match envelope.event {
            HostEvent::OpenConversation {
                conversation_id,
                title,
                messages,
            } => {
                if messages.is_empty() && self.store.contains(&conversation_id) {
                    if let Some(title) = title {
                        self.store.set_title(&conversation_id, &title);
                    }
                } else {
                    self.store.replace(&conversation_id, title, messages);
                }
                self.ui_lock().active_conversation = Some(conversation_id);
                Vec::new()
            }
            HostEvent::ToolResultReady {
                conversation_id,
                tool_use_id,
                content,
            } => {
                let message = ChatMessage::new(ChatRole::Assistant, content)
                    .with_id(tool_result_message_id(&tool_use_id));
                if self.store.has_in_flight(&conversation_id) {
                    let mut parked = self.parked_lock();
                    if !parked.iter().any(|(_, m)| m.id == message.id) {
                        tracing::debug!(%conversation_id, %tool_use_id, "tool result parked until stream settles");
                        parked.push((conversation_id, message));
                    }
                } else {
                    self.store.append_unique(&conversation_id, message);
                }
                Vec::new()
            }
            HostEvent::UsePrompt {
                prompt,
                conversation_id,
            } => {
                let conversation_id = {
                    let mut ui = self.ui_lock();
                    ui.draft = prompt.clone();
                    conversation_id.or_else(|| ui.active_conversation.clone())
                };
                vec![RouterCommand::Submit {
                    conversation_id,
                    prompt,
                    delivery_id,
                }]
            }
            HostEvent::CreatePrompt { initial } => {
                self.ui_lock().modal = Some(Modal::CreatePrompt { initial });
                Vec::new()
            }
            HostEvent::CustomizePrompt { prompt_id } => {
                self.ui_lock().modal = Some(Modal::CustomizePrompt { prompt_id });
                Vec::new()
            }
            HostEvent::RefreshPinnedPrompts => vec![RouterCommand::RefreshPinnedPrompts],
        }
    }

    /// Forgets a delivered envelope so the host can deliver it again
    pub fn release(&self, delivery_id: &str) -> bool {
        self.deliveries.forget(delivery_id)
    }

    /// Drops tool results parked for `conversation_id`. Returns how many.
    pub fn discard_parked(&self, conversation_id: &str) -> usize {
        let mut parked = self.parked_lock();
        let before = parked.len();
        parked.retain(|(id, _)| id != conversation_id);
        before - parked.len()
    }

    /// Drops tool results parked for every conversation but `keep`
    pub fn discard_parked_except(&self, keep: &str) -> usize {
        let mut parked = self.parked_lock();
        let before = parked.len();
        parked.retain(|(id, _)| id == keep);
        before - parked.len()
    }

    /// Appends tool results parked for `conversation_id` once nothing is in
    /// flight there. Returns how many were appended.
    pub fn flush_parked(&self, conversation_id: &str) -> usize {
        if self.store.has_in_flight(conversation_id) {
            return 0;
        }
        let ready: Vec<ChatMessage> = {
            let mut parked = self.parked_lock();
            let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *parked)
                .into_iter()
                .partition(|(id, _)| id == conversation_id);
            *parked = rest;
            ready.into_iter().map(|(_, m)| m).collect()
        };
        ready
            .into_iter()
            .filter(|m| self.store.append_unique(conversation_id, m.clone()))
            .count()
    }
}
