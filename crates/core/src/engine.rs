//! Engine traits: the abstraction over the token-generation backend.
//!
//! An [`EngineLoader`] turns a model identifier into a ready [`Engine`],
//! reporting fractional progress while it works. An [`Engine`] accepts a
//! message list plus sampling settings and returns a lazily-filled channel of
//! text deltas that closes when generation completes.
//!
//! Implementations: an OpenAI-compatible local server (llama.cpp, Ollama,
//! vLLM) and a scripted in-memory engine for tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use crate::error::EngineError;
use crate::message::Role;

/// One message as sent to the engine: role and text only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Sampling settings forwarded to the engine for every round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Temperature (0.0 = deterministic)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Nucleus sampling cutoff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: None,
            top_p: None,
        }
    }
}

/// Text deltas in emission order. The channel closing means the engine is done.
pub type DeltaStream = mpsc::Receiver<std::result::Result<String, EngineError>>;

/// Invoked 0..N times with a value in `0.0..=1.0` while a model loads.
pub type ProgressCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// A loaded model that can stream completions.
#[async_trait]
pub trait Engine: Send + Sync {
    /// A human-readable name for this engine (e.g., "openai_compat").
    fn name(&self) -> &str;

    /// Start generating a reply to `messages`.
    ///
    /// Dropping the returned receiver cancels generation.
    async fn stream_completion(
        &self,
        messages: Vec<ChatMessage>,
        sampling: SamplingConfig,
    ) -> std::result::Result<DeltaStream, EngineError>;

    /// Release resources. Calling it more than once is harmless.
    async fn unload(&self);
}

/// Creates engines for a model identifier.
#[async_trait]
pub trait EngineLoader: Send + Sync {
    async fn load(
        &self,
        model: &str,
        progress: ProgressCallback,
    ) -> std::result::Result<Arc<dyn Engine>, EngineError>;
}
