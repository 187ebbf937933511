//! `toolchat tools`: list the built-in tools.

use toolchat_config::AppConfig;

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let enabled = config.tools.enabled.unwrap_or_else(toolchat_tools::builtin_names);

    for descriptor in toolchat_tools::default_registry().descriptors() {
        let marker = if enabled.contains(&descriptor.name) { "on " } else { "off" };
        println!("[{marker}] {}", descriptor.name);
        println!("      {}", descriptor.llm_description);
        let schema = serde_json::to_string_pretty(&descriptor.json_schema)?;
        for line in schema.lines() {
            println!("      {line}");
        }
        println!();
    }
    Ok(())
}
