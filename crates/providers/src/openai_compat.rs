//! OpenAI-compatible engine adapter.
//!
//! Works with any local server exposing `/v1/models` and a streaming
//! `/v1/chat/completions` endpoint: Ollama, llama.cpp's `llama-server`,
//! vLLM, LM Studio.
//!
//! Loading only verifies that the server is reachable and knows the model;
//! the server owns the weights. Streaming reads the SSE body line by line and
//! forwards each `choices[0].delta.content` until `data: [DONE]`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use toolchat_core::engine::{ChatMessage, DeltaStream, Engine, EngineLoader, ProgressCallback, SamplingConfig};
use toolchat_core::error::EngineError;
use toolchat_core::message::Role;
use tracing::{debug, trace, warn};

const DELTA_CHANNEL_CAPACITY: usize = 64;

/// Loads engines backed by an OpenAI-compatible server.
pub struct OpenAiCompatLoader {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatLoader {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| EngineError::LoadFailed(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            client,
        })
    }

    /// Local Ollama on its default port.
    pub fn ollama() -> Result<Self, EngineError> {
        Self::new("http://localhost:11434/v1", Duration::from_secs(120))
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn list_models(&self) -> Result<Vec<String>, EngineError> {
        let url = format!("{}/models", self.base_url);
        let response = authorize(self.client.get(&url), self.api_key.as_deref())
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let message = response.text().await.unwrap_or_default();
            return Err(EngineError::ApiError { status_code: status, message });
        }

        let body: ModelList = response
            .json()
            .await
            .map_err(|e| EngineError::LoadFailed(format!("unexpected /models response: {e}")))?;
        Ok(body.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl EngineLoader for OpenAiCompatLoader {
    async fn load(&self, model: &str, progress: ProgressCallback) -> Result<Arc<dyn Engine>, EngineError> {
        progress(0.0);
        debug!(base_url = %self.base_url, model, "Checking engine server");
        let models = self.list_models().await?;
        progress(0.5);

        // Some servers (llama-server) report a single file name, or nothing
        if !models.is_empty() && !models.iter().any(|m| m == model) {
            return Err(EngineError::ModelNotFound(format!(
                "{model} (server offers: {})",
                models.join(", ")
            )));
        }

        let engine = OpenAiCompatEngine {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: model.to_string(),
            client: self.client.clone(),
            unloaded: AtomicBool::new(false),
        };
        progress(1.0);
        Ok(Arc::new(engine))
    }
}

/// One model on an OpenAI-compatible server.
pub struct OpenAiCompatEngine {
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
    unloaded: AtomicBool,
}

impl OpenAiCompatEngine {
    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, messages: &[ChatMessage], sampling: &SamplingConfig) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": to_api_messages(messages),
            "temperature": sampling.temperature,
            "stream": true,
        });
        if let Some(max_tokens) = sampling.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(top_p) = sampling.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        body
    }
}

#[async_trait]
impl Engine for OpenAiCompatEngine {
    fn name(&self) -> &str {
        "openai_compat"
    }

    async fn stream_completion(
        &self,
        messages: Vec<ChatMessage>,
        sampling: SamplingConfig,
    ) -> Result<DeltaStream, EngineError> {
        if self.unloaded.load(Ordering::SeqCst) {
            return Err(EngineError::Unloaded);
        }

        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(&messages, &sampling);
        debug!(model = %self.model, messages = messages.len(), "Sending streaming request");

        let response = authorize(self.client.post(&url), self.api_key.as_deref())
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status == 404 {
            return Err(EngineError::ModelNotFound(self.model.clone()));
        }
        if status != 200 {
            let message = response.text().await.unwrap_or_default();
            warn!(status, body = %message, "Engine streaming error");
            return Err(EngineError::ApiError { status_code: status, message });
        }

        let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut pending: Vec<u8> = Vec::new();

            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(EngineError::StreamInterrupted(e.to_string()))).await;
                        return;
                    }
                };
                pending.extend_from_slice(&bytes);

                // Split on raw bytes so multi-byte characters never straddle a decode
                while let Some(line_end) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=line_end).collect();
                    let line = String::from_utf8_lossy(&line);
                    match parse_sse_line(&line) {
                        SseLine::Done => return,
                        SseLine::Delta(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return; // receiver dropped
                            }
                        }
                        SseLine::Skip => {}
                    }
                }
            }
            trace!("Engine stream ended without [DONE]");
        });

        Ok(rx)
    }

    async fn unload(&self) {
        if !self.unloaded.swap(true, Ordering::SeqCst) {
            debug!(model = %self.model, "Engine unloaded");
        }
    }
}

fn authorize(request: reqwest::RequestBuilder, api_key: Option<&str>) -> reqwest::RequestBuilder {
    match api_key {
        Some(key) => request.header("Authorization", format!("Bearer {key}")),
        None => request,
    }
}

/// Map conversation roles onto what plain chat templates accept.
///
/// Tool results go back as user turns: without native function calling, a
/// bare `tool` role is rejected by most local servers.
fn to_api_messages(messages: &[ChatMessage]) -> Vec<ApiMessage> {
    messages
        .iter()
        .map(|m| match m.role {
            Role::Tool => ApiMessage {
                role: "user".into(),
                content: format!("Tool result:\n{}", m.content),
            },
            role => ApiMessage {
                role: role.as_str().into(),
                content: m.content.clone(),
            },
        })
        .collect()
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(data) = line.strip_prefix("data:") else {
        // Blank separators, comments, `event:` lines
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamResponse>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .map_or(SseLine::Skip, SseLine::Delta),
        Err(e) => {
            trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
            SseLine::Skip
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
