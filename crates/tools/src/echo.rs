//! Echo tool: returns its `text` argument unchanged.

use async_trait::async_trait;
use serde_json::{Map, Value};
use toolchat_core::error::ToolError;
use toolchat_core::tool::Tool;

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Repeat the given text back verbatim. Useful for testing tool calls."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "The text to echo back"
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, arguments: Map<String, Value>) -> Result<Value, ToolError> {
        match arguments.get("text") {
            Some(Value::String(text)) => Ok(Value::String(text.clone())),
            Some(_) => Err(ToolError::InvalidArguments("'text' must be a string".into())),
            None => Err(ToolError::InvalidArguments("Missing 'text' argument".into())),
        }
    }
}
