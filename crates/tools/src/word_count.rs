//! Word count tool.

use async_trait::async_trait;
use serde_json::{Map, Value};
use toolchat_core::error::ToolError;
use toolchat_core::tool::Tool;

pub struct WordCountTool;

#[async_trait]
impl Tool for WordCountTool {
    fn name(&self) -> &str {
        "word_count"
    }

    fn description(&self) -> &str {
        "Count the words, characters and lines in a piece of text."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "The text to count"
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, arguments: Map<String, Value>) -> Result<Value, ToolError> {
        let text = arguments
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'text' argument".into()))?;

        Ok(serde_json::json!({
            "words": text.split_whitespace().count(),
            "characters": text.chars().count(),
            "lines": text.lines().count(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn counts_words_characters_and_lines() {
        let args = json!({"text": "héllo wide\nworld"}).as_object().cloned().unwrap();
        let out = WordCountTool.execute(args).await.unwrap();
        assert_eq!(out, json!({"words": 3, "characters": 16, "lines": 2}));
    }

    #[tokio::test]
    async fn empty_text() {
        let args = json!({"text": ""}).as_object().cloned().unwrap();
        let out = WordCountTool.execute(args).await.unwrap();
        assert_eq!(out, json!({"words": 0, "characters": 0, "lines": 0}));
    }
}
