//! Current time tool: the wall-clock time, in UTC or at a fixed offset.

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde_json::{Map, Value};
use toolchat_core::error::ToolError;
use toolchat_core::tool::Tool;

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time. Optionally pass a UTC offset in hours (e.g. 2 or -5.5)."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "utc_offset_hours": {
                    "type": "number",
                    "description": "Offset from UTC in hours, between -12 and 14. Defaults to 0."
                }
            }
        })
    }

    async fn execute(&self, arguments: Map<String, Value>) -> Result<Value, ToolError> {
        let offset = parse_offset(arguments.get("utc_offset_hours"))?;
        let now = Utc::now().with_timezone(&offset);
        Ok(serde_json::json!({
            "datetime": now.to_rfc3339(),
            "weekday": now.format("%A").to_string(),
            "utc_offset": offset.to_string(),
        }))
    }
}

fn parse_offset(value: Option<&Value>) -> Result<FixedOffset, ToolError> {
    let hours = match value {
        None | Some(Value::Null) => 0.0,
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| ToolError::InvalidArguments("'utc_offset_hours' is not a number".into()))?,
        Some(_) => return Err(ToolError::InvalidArguments("'utc_offset_hours' must be a number".into())),
    };
    if !(-12.0..=14.0).contains(&hours) {
        return Err(ToolError::InvalidArguments(format!(
            "UTC offset {hours} is outside -12..=14"
        )));
    }
    let seconds = (hours * 3600.0).round() as i32;
    FixedOffset::east_opt(seconds)
        .ok_or_else(|| ToolError::InvalidArguments(format!("invalid UTC offset {hours}")))
}
