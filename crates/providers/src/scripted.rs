//! A scripted in-memory engine.
//!
//! Each call to `stream_completion` consumes the next [`Script`] and replays
//! it as deltas. Every request is recorded so tests can inspect the prompts
//! the orchestrator built.
//!
//! The round's boundary id is only known once the request arrives, so every
//! [`BOUNDARY_PLACEHOLDER`] in a scripted delta is replaced with the boundary
//! advertised in the system prompt.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use toolchat_core::engine::{ChatMessage, DeltaStream, Engine, EngineLoader, ProgressCallback, SamplingConfig};
use toolchat_core::error::EngineError;
use toolchat_core::message::Role;
use tracing::warn;

/// Stands for the round's boundary id inside scripted deltas.
pub const BOUNDARY_PLACEHOLDER: &str = "{boundary}";

const OPEN_TAG_PREFIX: &str = "[TOOL_CALL:";

/// What one generation round produces.
#[derive(Debug, Clone)]
pub enum Script {
    /// Emit these deltas, then complete
    Deltas(Vec<String>),
    /// Emit these deltas, then fail mid-stream
    FailAfter { deltas: Vec<String>, error: String },
    /// Emit these deltas, then stay open until the receiver is dropped
    Hang(Vec<String>),
    /// Refuse the request before streaming anything
    Refuse(String),
}

impl Script {
    /// A completed reply made of the given deltas.
    pub fn reply<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Deltas(deltas.into_iter().map(Into::into).collect())
    }
}

/// Engine that replays [`Script`]s in order.
#[derive(Default)]
pub struct ScriptedEngine {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    unloaded: AtomicBool,
}

impl ScriptedEngine {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Message lists received so far, one per round.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.requests).clone()
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_completion(
        &self,
        messages: Vec<ChatMessage>,
        _sampling: SamplingConfig,
    ) -> Result<DeltaStream, EngineError> {
        if self.is_unloaded() {
            return Err(EngineError::Unloaded);
        }
        let boundary = advertised_boundary(&messages);
        lock(&self.requests).push(messages);

        let script = lock(&self.scripts).pop_front().unwrap_or_else(|| {
            warn!("Scripted engine has no script left, replying with nothing");
            Script::Deltas(Vec::new())
        });

        let (deltas, ending) = match script {
            Script::Refuse(error) => return Err(EngineError::ApiError { status_code: 500, message: error }),
            Script::Deltas(deltas) => (deltas, Ending::Complete),
            Script::FailAfter { deltas, error } => (deltas, Ending::Fail(error)),
            Script::Hang(deltas) => (deltas, Ending::Hang),
        };
        let deltas: Vec<String> = match &boundary {
            Some(boundary) => deltas.iter().map(|d| d.replace(BOUNDARY_PLACEHOLDER, boundary)).collect(),
            None => deltas,
        };

        let (tx, rx) = mpsc::channel(deltas.len().max(1));
        tokio::spawn(async move {
            for delta in deltas {
                if tx.send(Ok(delta)).await.is_err() {
                    return;
                }
            }
            match ending {
                Ending::Complete => {}
                Ending::Fail(error) => {
                    let _ = tx.send(Err(EngineError::StreamInterrupted(error))).await;
                }
                Ending::Hang => tx.closed().await,
            }
        });
        Ok(rx)
    }

    async fn unload(&self) {
        self.unloaded.store(true, Ordering::SeqCst);
    }
}

/// The boundary id from the first `[TOOL_CALL:…]` tag in the system prompt.
fn advertised_boundary(messages: &[ChatMessage]) -> Option<String> {
    let system = messages.iter().find(|m| m.role == Role::System)?;
    let start = system.content.find(OPEN_TAG_PREFIX)? + OPEN_TAG_PREFIX.len();
    let len = system.content[start..].find(']')?;
    Some(system.content[start..start + len].to_string())
}

enum Ending {
    Complete,
    Fail(String),
    Hang,
}

/// Loader handing out one shared [`ScriptedEngine`].
pub struct ScriptedLoader {
    engine: Arc<ScriptedEngine>,
    failures_left: AtomicU32,
    loads: AtomicU32,
}

impl ScriptedLoader {
    pub fn new(engine: Arc<ScriptedEngine>) -> Self {
        Self {
            engine,
            failures_left: AtomicU32::new(0),
            loads: AtomicU32::new(0),
        }
    }

    /// Fail the first `count` load attempts.
    pub fn failing_first(self, count: u32) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Number of load attempts seen, successful or not.
    pub fn loads(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineLoader for ScriptedLoader {
    async fn load(&self, model: &str, progress: ProgressCallback) -> Result<Arc<dyn Engine>, EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        progress(0.0);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EngineError::LoadFailed(format!("scripted failure loading {model}")));
        }
        progress(0.5);
        progress(1.0);
        self.engine.unloaded.store(false, Ordering::SeqCst);
        Ok(self.engine.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut rx: DeltaStream) -> (Vec<String>, Option<EngineError>) {
        let mut deltas = Vec::new();
        while let Some(item) = rx.recv().await {
            match item {
                Ok(delta) => deltas.push(delta),
                Err(e) => return (deltas, Some(e)),
            }
        }
        (deltas, None)
    }

    fn ask() -> Vec<ChatMessage> {
        vec![ChatMessage::new(Role::User, "ping")]
    }

    #[tokio::test]
    async fn replays_scripts_in_order_and_records_requests() {
        let engine = ScriptedEngine::new([Script::reply(["po", "ng"]), Script::reply(["again"])]);
        let first = engine.stream_completion(ask(), SamplingConfig::default()).await.unwrap();
        assert_eq!(collect(first).await.0, ["po", "ng"]);
        let second = engine.stream_completion(ask(), SamplingConfig::default()).await.unwrap();
        assert_eq!(collect(second).await.0, ["again"]);
        assert_eq!(engine.requests().len(), 2);
    }

    #[tokio::test]
    async fn failure_script_ends_with_error() {
        let engine = ScriptedEngine::new([Script::FailAfter {
            deltas: vec!["half".into()],
            error: "boom".into(),
        }]);
        let rx = engine.stream_completion(ask(), SamplingConfig::default()).await.unwrap();
        let (deltas, error) = collect(rx).await;
        assert_eq!(deltas, ["half"]);
        assert!(matches!(error, Some(EngineError::StreamInterrupted(_))));
    }

    #[tokio::test]
    async fn exhausted_script_replies_with_nothing() {
        let engine = ScriptedEngine::new([]);
        let rx = engine.stream_completion(ask(), SamplingConfig::default()).await.unwrap();
        let (deltas, error) = collect(rx).await;
        assert!(deltas.is_empty());
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn loader_fails_then_succeeds() {
        let loader = ScriptedLoader::new(Arc::new(ScriptedEngine::new([]))).failing_first(1);
        let noop: ProgressCallback = Arc::new(|_| {});
        assert!(loader.load("tiny", noop.clone()).await.is_err());
        assert!(loader.load("tiny", noop).await.is_ok());
        assert_eq!(loader.loads(), 2);
    }

    #[tokio::test]
    async fn placeholder_takes_the_advertised_boundary() {
        let engine = ScriptedEngine::new([Script::reply(["[TOOL_CALL:{boundary}]{}", "[/TOOL_CALL:{boundary}]"])]);
        let messages = vec![
            ChatMessage::new(Role::System, "Tools.\n[TOOL_CALL:ab12cd]{\"name\":\"x\"}[/TOOL_CALL:ab12cd]"),
            ChatMessage::new(Role::User, "go"),
        ];
        let rx = engine.stream_completion(messages, SamplingConfig::default()).await.unwrap();
        assert_eq!(collect(rx).await.0, ["[TOOL_CALL:ab12cd]{}", "[/TOOL_CALL:ab12cd]"]);
    }

    #[tokio::test]
    async fn unloaded_engine_refuses() {
        let engine = ScriptedEngine::new([Script::reply(["x"])]);
        engine.unload().await;
        assert!(engine.is_unloaded());
        assert!(matches!(
            engine.stream_completion(ask(), SamplingConfig::default()).await,
            Err(EngineError::Unloaded)
        ));
    }
}
