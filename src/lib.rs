pub mod app_state;
pub mod attachments;
pub mod config;
pub mod conversation_store;
pub mod error;
pub mod events;
pub mod external_events;
pub mod history_sync;
pub mod idempotency;
pub mod protocol;
pub mod scheduler;
pub mod stream_parser;
pub mod stream_session;
pub mod tool_dispatcher;
pub mod transport;

pub use app_state::ClientState;
pub use attachments::{Attachment, AttachmentSet, MAX_ATTACHMENTS};
pub use conversation_store::ConversationStore;
pub use stream_parser::{StreamChunkParser, WireFormat};
pub use stream_session::{SessionOutcome, StreamSession, Submission};
pub use tool_dispatcher::ToolUseDispatcher;
