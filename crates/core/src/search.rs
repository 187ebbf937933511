//! Relevance search: narrows which tools are advertised to the model.

use async_trait::async_trait;
use crate::error::SearchError;
use crate::message::Message;
use crate::tool::ToolDescriptor;

/// Picks the tools worth describing in the next round's system prompt.
///
/// May return an empty list. A failure never aborts the round; the
/// orchestrator falls back to a toolless prompt.
#[async_trait]
pub trait RelevanceSearch: Send + Sync {
    async fn search(
        &self,
        conversation: &[Message],
    ) -> std::result::Result<Vec<ToolDescriptor>, SearchError>;
}
