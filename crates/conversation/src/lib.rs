//! # toolchat Conversation
//!
//! The pure half of the chat client: how a tool call is encoded inside
//! generated text, how streamed deltas are classified as prose or envelope,
//! and how a conversation snapshot moves from one value to the next.
//!
//! Nothing here awaits. The orchestrator in `toolchat-agent` calls into these
//! functions between awaits.

pub mod buffer;
pub mod envelope;
pub mod prompt;
pub mod store;

pub use buffer::{BufferPolicy, BufferStep, DetectedToolCall, RejectReason, DEFAULT_MAX_BUFFER_CHARS};
pub use envelope::{BoundaryId, EnvelopeMatch};
pub use prompt::{PromptBuilder, DEFAULT_PREAMBLE};
pub use store::{
    Applied, ConversationSnapshot, ErrorKind, ErrorRecord, PendingToolCall, RequestStatus, Status, StoreEvent,
    ToolCallRequest, ToolOutcome,
};
