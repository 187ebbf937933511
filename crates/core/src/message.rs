//! Message domain types.
//!
//! A [`Message`] is one immutable conversational turn. The only message whose
//! content ever grows is the assistant message currently receiving streamed
//! deltas, and that growth happens by building a new value inside the
//! conversation store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation (session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The model
    Assistant,
    /// System instructions
    System,
    /// Tool execution result (or a synthetic rejection notice)
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Set on `tool` messages only: which call this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<MessageToolCall>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_call: None,
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a tool message carrying the call it answers.
    pub fn tool(content: impl Into<String>, tool_call: MessageToolCall) -> Self {
        Self {
            tool_call: Some(tool_call),
            ..Self::new(Role::Tool, content)
        }
    }

    /// A copy of this message with `suffix` appended to its content.
    pub fn with_appended(&self, suffix: &str) -> Self {
        let mut next = self.clone();
        next.content.push_str(suffix);
        next
    }
}

/// The tool call a `tool` message responds to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageToolCall {
    /// The tool call request ID
    pub id: String,

    /// Name of the invoked tool
    pub name: String,

    /// Arguments the model supplied
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,

    /// Rendered tool output, when the tool ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}
