//! Keyword relevance search over tool descriptors.
//!
//! Scores each tool by how many words of the latest user message appear in
//! its name or description. Name matches weigh double. Tools with no overlap
//! are never advertised, so small talk gets a toolless prompt.

use std::collections::HashSet;

use async_trait::async_trait;
use toolchat_core::error::SearchError;
use toolchat_core::message::{Message, Role};
use toolchat_core::search::RelevanceSearch;
use toolchat_core::tool::ToolDescriptor;
use tracing::debug;

const DEFAULT_LIMIT: usize = 5;

/// Words too common to say anything about a tool.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "you", "are", "can", "what", "how", "this", "that", "with", "please", "from",
    "into", "about", "give", "tell", "does", "have", "get",
];

pub struct KeywordToolSearch {
    tools: Vec<ToolDescriptor>,
    limit: usize,
}

impl KeywordToolSearch {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self {
            tools,
            limit: DEFAULT_LIMIT,
        }
    }

    /// Advertise at most `limit` tools per round.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn score(tool: &ToolDescriptor, query: &HashSet<String>) -> usize {
        let name_words = keywords(&tool.name);
        let description_words = keywords(&tool.llm_description);
        query
            .iter()
            .map(|word| {
                let in_name = name_words.contains(word) as usize;
                let in_description = description_words.contains(word) as usize;
                in_name * 2 + in_description
            })
            .sum()
    }
}

#[async_trait]
impl RelevanceSearch for KeywordToolSearch {
    async fn search(&self, conversation: &[Message]) -> Result<Vec<ToolDescriptor>, SearchError> {
        let Some(latest) = conversation.iter().rev().find(|m| m.role == Role::User) else {
            return Ok(Vec::new());
        };
        let query = keywords(&latest.content);

        let mut scored: Vec<(usize, &ToolDescriptor)> = self
            .tools
            .iter()
            .map(|tool| (Self::score(tool, &query), tool))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));

        let found: Vec<ToolDescriptor> = scored
            .into_iter()
            .take(self.limit)
            .map(|(_, tool)| tool.clone())
            .collect();
        debug!(count = found.len(), "Keyword tool search finished");
        Ok(found)
    }
}

/// Lowercased words of three or more characters, minus stop words.
/// Identifiers like `word_count` split on underscores.
fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}
