use thiserror::Error;

/// Failure talking to the chat backend. Only this category ever reaches the
/// user as an error message.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to send request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("stream interrupted: {0}")]
    Stream(String),
}

/// A single frame that could not be turned into a protocol event. These are
/// recorded by the parser and never abort the stream.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {reason}")]
    Syntax { reason: String },
    #[error("frame has no `type` discriminator")]
    MissingType,
    #[error("invalid `{kind}` frame: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("frame never terminated ({len} bytes buffered)")]
    Unterminated { len: usize },
    #[error("frame exceeded {limit} bytes without terminating")]
    Oversized { limit: usize },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolInputError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("tool `{tool}` input is not an object")]
    NotAnObject { tool: String },
    #[error("tool `{tool}` is missing required field `{field}`")]
    MissingField { tool: String, field: &'static str },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("conversation {conversation_id} already has an assistant message in flight")]
    AssistantInFlight { conversation_id: String },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("history endpoint returned {status}")]
    Status { status: u16 },
    #[error("failed to decode history response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config json error: {0}")]
    Json(#[from] serde_json::Error),
}
