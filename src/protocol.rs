use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::attachments::{Attachment, AttachmentRef};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// Lifecycle of a message. Only assistant messages are ever `Streaming`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Streaming,
    #[default]
    Complete,
    Failed,
    Cancelled,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, MessageState::Streaming)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub state: MessageState,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            attachments: Vec::new(),
            error: None,
            state: MessageState::Complete,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    /// Empty assistant message that will be patched while the response streams
    pub fn assistant_placeholder() -> Self {
        let mut msg = Self::new(ChatRole::Assistant, String::new());
        msg.state = MessageState::Streaming;
        msg
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<AttachmentRef>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn is_in_flight(&self) -> bool {
        self.role == ChatRole::Assistant && !self.state.is_terminal()
    }
}

/// Partial update merged into an existing message. `id` and `role` are never
/// touched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub error: Option<ErrorInfo>,
    pub state: Option<MessageState>,
}

impl MessagePatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: MessageState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(ErrorInfo {
            message: message.into(),
        });
        self
    }

    pub fn apply_to(&self, msg: &mut ChatMessage) {
        if let Some(content) = &self.content {
            msg.content.clone_from(content);
        }
        if let Some(error) = &self.error {
            msg.error = Some(error.clone());
        }
        if let Some(state) = self.state {
            msg.state = state;
        }
    }
}

/// Snapshot of one conversation as held by the store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

/// Typed protocol event decoded from one wire frame, in arrival order.
/// `Text` payloads are deltas: callers concatenate them.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Text { content: String },
    ToolUse(ToolUse),
    MessageDelta { payload: Value },
    Error { message: String },
    Done,
}

impl StreamEvent {
    pub fn text(content: impl Into<String>) -> Self {
        StreamEvent::Text {
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TranscriptTurn {
    pub role: ChatRole,
    pub content: String,
}

/// Serialized into the `context` form field of the outbound request
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RequestContext {
    pub transcript: Vec<TranscriptTurn>,
    pub environment: Map<String, Value>,
}

impl RequestContext {
    /// Prior turns only: in-flight and failed messages are not part of the
    /// transcript the backend sees.
    pub fn from_messages(messages: &[ChatMessage]) -> Self {
        let transcript = messages
            .iter()
            .filter(|m| matches!(m.state, MessageState::Complete | MessageState::Cancelled))
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| TranscriptTurn {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();

        Self {
            transcript,
            environment: Map::new(),
        }
    }

    pub fn with_environment(mut self, key: impl Into<String>, value: Value) -> Self {
        self.environment.insert(key.into(), value);
        self
    }
}

/// One submission to the chat backend
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub prompt: String,
    pub conversation_id: String,
    pub attachments: Vec<Attachment>,
    pub context: RequestContext,
}
