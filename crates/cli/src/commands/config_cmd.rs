//! `toolchat config`: configuration file management.

use toolchat_config::AppConfig;

pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = AppConfig::config_path();

    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        return Ok(());
    }

    std::fs::create_dir_all(&config_dir)?;
    std::fs::write(&config_path, AppConfig::default_toml())?;
    println!("Wrote default config: {}", config_path.display());
    Ok(())
}

pub fn show() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if config.engine.api_key.is_some() {
        config.engine.api_key = Some("[REDACTED]".into());
    }

    println!("# {}", AppConfig::config_path().display());
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
