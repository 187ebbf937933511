//! Built-in tools and tool search for toolchat.
//!
//! The built-ins are deliberately side-effect free: echo text back, tell the
//! time, count words. Every call still goes through user approval.

pub mod current_time;
pub mod echo;
pub mod search;
pub mod word_count;

use toolchat_core::tool::{Tool, ToolRegistry};
use tracing::warn;

pub use current_time::CurrentTimeTool;
pub use echo::EchoTool;
pub use search::KeywordToolSearch;
pub use word_count::WordCountTool;

fn builtins() -> Vec<Box<dyn Tool>> {
    vec![Box::new(EchoTool), Box::new(CurrentTimeTool), Box::new(WordCountTool)]
}

/// Names of every built-in tool.
pub fn builtin_names() -> Vec<String> {
    builtins().iter().map(|t| t.name().to_string()).collect()
}

/// A registry with all built-in tools.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in builtins() {
        registry.register(tool);
    }
    registry
}

/// A registry with only the named built-ins. Unknown names are skipped.
pub fn registry_with(enabled: &[String]) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in builtins() {
        if enabled.iter().any(|name| name == tool.name()) {
            registry.register(tool);
        }
    }
    for name in enabled {
        if registry.get(name).is_none() {
            warn!(tool = %name, "Unknown tool in configuration, skipping");
        }
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolchat_core::error::ToolError;
    use toolchat_core::tool::ToolExecutor;

    #[test]
    fn default_registry_has_all_builtins() {
        let registry = default_registry();
        assert_eq!(registry.names(), vec!["current_time", "echo", "word_count"]);
    }

    #[test]
    fn registry_with_filters() {
        let registry = registry_with(&["echo".into(), "teleport".into()]);
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let err = default_registry()
            .invoke("teleport", serde_json::Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Tool not found: teleport");
        assert!(matches!(err, ToolError::NotFound(_)));
    }
}
