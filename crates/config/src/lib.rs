//! Configuration loading and validation for toolchat.
//!
//! Loads configuration from `~/.toolchat/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use toolchat_core::engine::SamplingConfig;

/// The root configuration structure.
///
/// Maps directly to `~/.toolchat/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where the model runs
    #[serde(default)]
    pub engine: EngineConfig,

    /// Generation settings
    #[serde(default)]
    pub sampling: SamplingSettings,

    /// Stream buffering
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Tool availability and search
    #[serde(default)]
    pub tools: ToolsConfig,

    /// System prompt overrides
    #[serde(default)]
    pub prompt: PromptConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of an OpenAI-compatible server, including `/v1`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Sent as a bearer token when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:11434/v1".into()
}
fn default_model() -> String {
    "qwen2.5:1.5b".into()
}
fn default_request_timeout_secs() -> u64 {
    120
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &redact(&self.api_key))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingSettings {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Held-back text longer than this is released as prose
    #[serde(default = "default_max_buffer_chars")]
    pub max_buffer_chars: usize,
}

fn default_max_buffer_chars() -> usize {
    500
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_buffer_chars: default_max_buffer_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Built-in tools to offer; `None` enables all of them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<Vec<String>>,

    /// Maximum tools advertised per round
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
}

fn default_search_limit() -> usize {
    5
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            search_limit: default_search_limit(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Replaces the generic assistant preamble
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preamble: Option<String>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.toolchat/config.toml).
    ///
    /// Environment variables take precedence over the file:
    /// - `TOOLCHAT_ENGINE_URL`
    /// - `TOOLCHAT_MODEL`
    /// - `TOOLCHAT_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("TOOLCHAT_ENGINE_URL") {
            self.engine.base_url = url;
        }
        if let Some(model) = lookup("TOOLCHAT_MODEL") {
            self.engine.model = model;
        }
        if let Some(key) = lookup("TOOLCHAT_API_KEY") {
            self.engine.api_key = Some(key);
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".toolchat")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.sampling.temperature) {
            return Err(ConfigError::ValidationError(
                "sampling.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if let Some(top_p) = self.sampling.top_p
            && !(0.0..=1.0).contains(&top_p)
        {
            return Err(ConfigError::ValidationError(
                "sampling.top_p must be between 0.0 and 1.0".into(),
            ));
        }

        if self.streaming.max_buffer_chars == 0 {
            return Err(ConfigError::ValidationError(
                "streaming.max_buffer_chars must be > 0".into(),
            ));
        }

        if self.tools.search_limit == 0 {
            return Err(ConfigError::ValidationError("tools.search_limit must be > 0".into()));
        }

        if self.engine.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError("engine.base_url must not be empty".into()));
        }

        Ok(())
    }

    /// Sampling settings in the form engines take.
    pub fn sampling_config(&self) -> SamplingConfig {
        SamplingConfig {
            temperature: self.sampling.temperature,
            max_tokens: Some(self.sampling.max_tokens),
            top_p: self.sampling.top_p,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.request_timeout_secs)
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for toolchat_core::Error {
    fn from(e: ConfigError) -> Self {
        toolchat_core::Error::Config { message: e.to_string() }
    }
}
