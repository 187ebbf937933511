//! # toolchat Core
//!
//! Domain types, collaborator traits, and error definitions for the toolchat
//! streaming chat client. This crate has **no runtime dependencies** beyond
//! serde/tokio primitives: it defines the vocabulary that every other crate
//! speaks.
//!
//! ## Collaborators
//!
//! The conversation core never talks to a model, a tool, or a search index
//! directly. Each of those is a narrow async trait defined here:
//! - [`EngineLoader`] / [`Engine`]: load a model and stream text deltas
//! - [`ToolExecutor`]: `invoke(name, arguments)`
//! - [`RelevanceSearch`]: pick which tools to advertise for a round

pub mod engine;
pub mod error;
pub mod event;
pub mod message;
pub mod search;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use engine::{ChatMessage, DeltaStream, Engine, EngineLoader, ProgressCallback, SamplingConfig};
pub use error::{EngineError, Error, Result, SearchError, StoreError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{ConversationId, Message, MessageToolCall, Role};
pub use search::RelevanceSearch;
pub use tool::{Tool, ToolCall, ToolDescriptor, ToolExecutor, ToolRegistry};
