//! Error types for the toolchat domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each collaborator has its own error enum; [`StoreError`] is the odd one
//! out: it signals an orchestration bug, never an external failure.

use thiserror::Error;

/// The top-level error type for all toolchat operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Engine errors ---
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Relevance search errors ---
    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    // --- Invariant violations (fatal) ---
    #[error("Store invariant violated: {0}")]
    Store(#[from] StoreError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Model failed to load: {0}")]
    LoadFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Engine has been unloaded")]
    Unloaded,
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Clone, Error)]
pub enum SearchError {
    #[error("Tool search failed: {0}")]
    Failed(String),
}

/// Raised when the orchestrator drives the store out of sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("no assistant message is open")]
    NoOpenAssistantMessage,

    #[error("no tool call is awaiting approval")]
    NoPendingToolCall,

    #[error("unknown tool call request: {0}")]
    UnknownRequest(String),

    #[error("tool call request already resolved: {0}")]
    RequestAlreadyResolved(String),

    #[error("no boundary id minted for the current round")]
    NoBoundary,
}
