//! System prompt and engine message assembly.
//!
//! Builds the message list sent to the engine for one round:
//!
//! 1. **System**: either the generic preamble, or the preamble plus the
//!    advertised tools and the exact envelope syntax for this round's boundary
//! 2. **History**: every committed message, oldest first
//!
//! Assembly is deterministic: identical snapshots produce identical output.

use toolchat_core::engine::ChatMessage;
use toolchat_core::message::Role;
use toolchat_core::tool::{ToolCall, ToolDescriptor};

use crate::envelope::{self, BoundaryId};
use crate::store::ConversationSnapshot;

pub const DEFAULT_PREAMBLE: &str =
    "You are a helpful assistant running locally on the user's machine. Answer clearly and concisely.";

/// Renders prompts for a conversation.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    preamble: String,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self {
            preamble: DEFAULT_PREAMBLE.to_string(),
        }
    }
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = preamble.into();
        self
    }

    /// The system prompt for one round.
    pub fn system_prompt(&self, tools: &[ToolDescriptor], boundary: &BoundaryId) -> String {
        if tools.is_empty() {
            return self.preamble.clone();
        }

        let mut prompt = format!("{}\n\n## Tools\n\nYou can call the following tools:\n", self.preamble);
        for tool in tools {
            prompt.push_str(&format!(
                "\n### {}\n{}\nArguments (JSON Schema): {}\n",
                tool.name, tool.llm_description, tool.json_schema
            ));
        }

        let example = ToolCall::new(
            "tool_name",
            serde_json::Map::from_iter([("argument".to_string(), serde_json::json!("value"))]),
        );
        prompt.push_str(&format!(
            "\n## Calling a tool\n\n\
             To call a tool, write exactly one envelope and then stop:\n\n\
             {}\n\n\
             The opening tag is {} and the closing tag is {}. The body is a JSON \
             object with a string \"name\" and an \"arguments\" object. Call at most \
             one tool per reply. The user must approve the call before it runs; you \
             will receive its result in the next message. If no tool is needed, \
             answer normally.",
            envelope::encode(&example, boundary),
            boundary.open_tag(),
            boundary.close_tag(),
        ));
        prompt
    }

    /// The full message list for the round currently open in `snapshot`.
    ///
    /// The open assistant message is excluded, as are empty assistant turns.
    pub fn engine_messages(&self, snapshot: &ConversationSnapshot, boundary: &BoundaryId) -> Vec<ChatMessage> {
        let open_id = snapshot.open_assistant_id.as_deref();
        let system = self.system_prompt(&snapshot.available_tools, boundary);

        std::iter::once(ChatMessage::new(Role::System, system))
            .chain(
                snapshot
                    .messages
                    .iter()
                    .filter(|m| Some(m.id.as_str()) != open_id)
                    .filter(|m| !(m.role == Role::Assistant && m.content.is_empty()))
                    .map(|m| ChatMessage::new(m.role, m.content.clone())),
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreEvent;

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            id: format!("builtin:{name}"),
            name: name.into(),
            llm_description: format!("The {name} tool"),
            json_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[test]
    fn toolless_prompt_is_the_preamble() {
        let builder = PromptBuilder::new();
        let prompt = builder.system_prompt(&[], &BoundaryId::new("abc"));
        assert_eq!(prompt, DEFAULT_PREAMBLE);
        assert!(!prompt.contains("TOOL_CALL"));
    }

    #[test]
    fn tool_prompt_embeds_descriptions_and_boundary() {
        let builder = PromptBuilder::new().with_preamble("Be brief.");
        let prompt = builder.system_prompt(&[descriptor("echo"), descriptor("word_count")], &BoundaryId::new("f00d"));
        assert!(prompt.starts_with("Be brief."));
        assert!(prompt.contains("### echo"));
        assert!(prompt.contains("The word_count tool"));
        assert!(prompt.contains("[TOOL_CALL:f00d]"));
        assert!(prompt.contains("[/TOOL_CALL:f00d]"));
    }

    #[test]
    fn engine_messages_skip_the_open_assistant_message() {
        let snapshot = ConversationSnapshot::new()
            .apply(StoreEvent::Enqueue { content: "ping".into() })
            .unwrap()
            .snapshot
            .apply(StoreEvent::DrainQueue)
            .unwrap()
            .snapshot
            .apply(StoreEvent::OpenAssistantMessage)
            .unwrap()
            .snapshot;
        let boundary = snapshot.tool_boundary_id.clone().unwrap();

        let messages = PromptBuilder::new().engine_messages(&snapshot, &boundary);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1], ChatMessage::new(Role::User, "ping"));
    }
}
