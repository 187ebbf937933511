//! The async driver around the state machine.
//!
//! A [`ChatSession`] owns one conversation. Its task processes one event at
//! a time: user commands arrive over an mpsc channel, background work (model
//! loading, tool search, generation, tool calls) reports back over a second
//! channel, and each event is fed through [`transition`]. The resulting
//! effects are spawned as tasks; every snapshot is published on a `watch`
//! channel and notable changes on the [`EventBus`].

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use toolchat_conversation::store::{ConversationSnapshot, Status};
use toolchat_core::engine::{Engine, EngineLoader, ProgressCallback};
use toolchat_core::error::StoreError;
use toolchat_core::event::{DomainEvent, EventBus};
use toolchat_core::search::RelevanceSearch;
use toolchat_core::tool::ToolExecutor;
use tracing::{debug, error, info, warn};

use crate::machine::{transition, ChatEvent, Effect, MachineConfig};

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("chat session has shut down")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

enum Command {
    Event(ChatEvent),
    Shutdown,
}

/// Messages from background tasks back to the driver.
enum Completion {
    Event(ChatEvent),
    EngineReady { attempt: u64, engine: Arc<dyn Engine> },
}

/// Builder for a conversation driver.
pub struct ChatSession {
    loader: Arc<dyn EngineLoader>,
    executor: Arc<dyn ToolExecutor>,
    search: Arc<dyn RelevanceSearch>,
    config: MachineConfig,
    event_bus: Arc<EventBus>,
}

impl ChatSession {
    pub fn new(
        loader: Arc<dyn EngineLoader>,
        executor: Arc<dyn ToolExecutor>,
        search: Arc<dyn RelevanceSearch>,
    ) -> Self {
        Self {
            loader,
            executor,
            search,
            config: MachineConfig::default(),
            event_bus: Arc::new(EventBus::default()),
        }
    }

    pub fn with_config(mut self, config: MachineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing event bus instead of the session's own.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Start the driver task. Must be called inside a tokio runtime.
    pub fn spawn(self) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let snapshot = ConversationSnapshot::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot.clone());
        let event_bus = self.event_bus.clone();

        let driver = Driver {
            session: self,
            snapshot,
            engine: None,
            search_task: None,
            generation_task: None,
            completion_tx,
            snapshot_tx,
        };
        let task = tokio::spawn(driver.run(command_rx, completion_rx));

        SessionHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            event_bus,
            task,
        }
    }
}

/// Client side of a running session.
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<ConversationSnapshot>,
    event_bus: Arc<EventBus>,
    task: JoinHandle<Result<(), SessionError>>,
}

impl SessionHandle {
    pub async fn load_model(&self, model: impl Into<String>) -> Result<(), SessionError> {
        self.send(ChatEvent::LoadModel { model: model.into() }).await
    }

    /// Queue a user message; it joins the conversation at the next `ready`.
    pub async fn send_message(&self, content: impl Into<String>) -> Result<(), SessionError> {
        self.send(ChatEvent::Enqueue { content: content.into() }).await
    }

    pub async fn approve(&self, request_id: impl Into<String>) -> Result<(), SessionError> {
        self.send(ChatEvent::Approve { request_id: request_id.into() }).await
    }

    pub async fn reject(&self, request_id: impl Into<String>) -> Result<(), SessionError> {
        self.send(ChatEvent::Reject { request_id: request_id.into() }).await
    }

    pub async fn interrupt(&self) -> Result<(), SessionError> {
        self.send(ChatEvent::Interrupt).await
    }

    pub async fn clear_error(&self) -> Result<(), SessionError> {
        self.send(ChatEvent::ClearError).await
    }

    /// Feed any event to the machine, as if a task had reported it.
    pub async fn send(&self, event: ChatEvent) -> Result<(), SessionError> {
        self.commands
            .send(Command::Event(event))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> ConversationSnapshot {
        self.snapshots.borrow().clone()
    }

    /// A receiver that sees every published snapshot.
    pub fn watch(&self) -> watch::Receiver<ConversationSnapshot> {
        self.snapshots.clone()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Arc<DomainEvent>> {
        self.event_bus.subscribe()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&ConversationSnapshot) -> bool,
    ) -> Result<ConversationSnapshot, SessionError> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx.wait_for(predicate).await.map_err(|_| SessionError::Closed)?;
        Ok(snapshot.clone())
    }

    /// Unload the engine and stop the driver.
    pub async fn shutdown(self) -> Result<(), SessionError> {
        // The driver may already have stopped on a fatal error
        let _ = self.commands.send(Command::Shutdown).await;
        self.task.await.map_err(|_| SessionError::Closed)?
    }
}

struct Driver {
    session: ChatSession,
    snapshot: ConversationSnapshot,
    engine: Option<Arc<dyn Engine>>,
    search_task: Option<(u64, AbortHandle)>,
    generation_task: Option<(u64, AbortHandle)>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    snapshot_tx: watch::Sender<ConversationSnapshot>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) -> Result<(), SessionError> {
        info!(conversation_id = %self.snapshot.id, "Chat session started");
        let result = loop {
            let event = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Event(event)) => event,
                    Some(Command::Shutdown) | None => break Ok(()),
                },
                Some(completion) = completions.recv() => match completion {
                    Completion::Event(event) => event,
                    Completion::EngineReady { attempt, engine } => {
                        self.accept_engine(attempt, engine).await;
                        continue;
                    }
                },
            };
            if let Err(e) = self.handle(event) {
                error!(error = %e, "Conversation invariant violated, stopping session");
                break Err(e.into());
            }
        };

        self.abort_tasks();
        if let Some(engine) = self.engine.take() {
            engine.unload().await;
        }
        info!(conversation_id = %self.snapshot.id, "Chat session stopped");
        result
    }

    async fn accept_engine(&mut self, attempt: u64, engine: Arc<dyn Engine>) {
        if attempt != self.snapshot.load_attempt || self.snapshot.status != Status::LoadingModel {
            debug!(attempt, "Discarding engine from a stale load attempt");
            engine.unload().await;
            return;
        }
        if let Some(previous) = self.engine.replace(engine) {
            previous.unload().await;
        }
    }

    fn handle(&mut self, event: ChatEvent) -> Result<(), StoreError> {
        let previous = self.snapshot.clone();
        let next = transition(std::mem::take(&mut self.snapshot), event, &self.session.config)?;
        self.snapshot = next.snapshot;
        self.publish(&previous);
        for effect in next.effects {
            self.perform(effect);
        }
        Ok(())
    }

    fn publish(&self, previous: &ConversationSnapshot) {
        let bus = &self.session.event_bus;
        let now = Utc::now();
        let current = &self.snapshot;

        if previous.status != current.status {
            bus.publish(DomainEvent::StatusChanged {
                conversation_id: current.id.to_string(),
                from: previous.status.to_string(),
                to: current.status.to_string(),
                timestamp: now,
            });
            if previous.status == Status::LoadingModel && current.status.has_engine() {
                bus.publish(DomainEvent::ModelLoaded {
                    model: current.model.clone().unwrap_or_default(),
                    timestamp: now,
                });
            }
        }
        if let Some(pending) = &current.pending_tool_call
            && previous.pending_tool_call.as_ref().map(|p| &p.request_id) != Some(&pending.request_id)
        {
            bus.publish(DomainEvent::ToolCallDetected {
                request_id: pending.request_id.clone(),
                tool_name: pending.tool_call.name.clone(),
                timestamp: now,
            });
        }
        if let Some(record) = &current.last_error
            && previous.last_error.as_ref() != Some(record)
        {
            bus.publish(DomainEvent::ErrorOccurred {
                context: format!("{:?}", record.kind),
                error_message: record.message.clone(),
                timestamp: now,
            });
        }

        self.snapshot_tx.send_replace(current.clone());
    }

    fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::LoadModel { attempt, model } => self.spawn_load(attempt, model),
            Effect::SearchTools { round, conversation } => {
                let search = self.session.search.clone();
                let tx = self.completion_tx.clone();
                let task = tokio::spawn(async move {
                    let event = match search.search(&conversation).await {
                        Ok(tools) => ChatEvent::ToolsFound { round, tools },
                        Err(e) => ChatEvent::ToolSearchFailed { round, error: e.to_string() },
                    };
                    let _ = tx.send(Completion::Event(event));
                });
                self.search_task = Some((round, task.abort_handle()));
            }
            Effect::StartGeneration { round, messages, sampling } => {
                let engine = self.engine.clone();
                let tx = self.completion_tx.clone();
                let task = tokio::spawn(async move {
                    let event = match engine {
                        None => ChatEvent::StreamFailed { round, error: "no model is loaded".into() },
                        Some(engine) => stream_round(engine, round, messages, sampling, &tx).await,
                    };
                    let _ = tx.send(Completion::Event(event));
                });
                self.generation_task = Some((round, task.abort_handle()));
            }
            Effect::Cancel { round } => {
                for slot in [&mut self.search_task, &mut self.generation_task] {
                    if let Some((task_round, handle)) = slot.take() {
                        if task_round == round {
                            debug!(round, "Cancelling in-flight task");
                            handle.abort();
                        } else {
                            *slot = Some((task_round, handle));
                        }
                    }
                }
            }
            Effect::InvokeTool { round, request_id, call } => {
                let executor = self.session.executor.clone();
                let bus = self.session.event_bus.clone();
                let tx = self.completion_tx.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let outcome = executor.invoke(&call.name, call.arguments).await;
                    bus.publish(DomainEvent::ToolExecuted {
                        tool_name: call.name.clone(),
                        success: outcome.is_ok(),
                        duration_ms: started.elapsed().as_millis() as u64,
                        timestamp: Utc::now(),
                    });
                    let event = match outcome {
                        Ok(value) => ChatEvent::ToolSucceeded {
                            round,
                            request_id,
                            output: render_tool_output(value),
                        },
                        Err(e) => ChatEvent::ToolFailed {
                            round,
                            request_id,
                            error: e.to_string(),
                        },
                    };
                    let _ = tx.send(Completion::Event(event));
                });
            }
        }
    }

    fn spawn_load(&mut self, attempt: u64, model: String) {
        let loader = self.session.loader.clone();
        let tx = self.completion_tx.clone();
        let progress_tx = tx.clone();
        let progress: ProgressCallback = Arc::new(move |progress| {
            let _ = progress_tx.send(Completion::Event(ChatEvent::LoadProgress { attempt, progress }));
        });

        tokio::spawn(async move {
            match loader.load(&model, progress).await {
                Ok(engine) => {
                    info!(attempt, model = %model, engine = engine.name(), "Model loaded");
                    let _ = tx.send(Completion::EngineReady { attempt, engine });
                    let _ = tx.send(Completion::Event(ChatEvent::ModelLoaded { attempt }));
                }
                Err(e) => {
                    let _ = tx.send(Completion::Event(ChatEvent::ModelLoadFailed {
                        attempt,
                        error: e.to_string(),
                    }));
                }
            }
        });
    }

    fn abort_tasks(&mut self) {
        for (_, handle) in [self.search_task.take(), self.generation_task.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

/// Forward every delta of one generation; returns the terminal event.
async fn stream_round(
    engine: Arc<dyn Engine>,
    round: u64,
    messages: Vec<toolchat_core::engine::ChatMessage>,
    sampling: toolchat_core::engine::SamplingConfig,
    tx: &mpsc::UnboundedSender<Completion>,
) -> ChatEvent {
    let mut deltas = match engine.stream_completion(messages, sampling).await {
        Ok(deltas) => deltas,
        Err(e) => return ChatEvent::StreamFailed { round, error: e.to_string() },
    };
    while let Some(delta) = deltas.recv().await {
        match delta {
            Ok(text) if text.is_empty() => {}
            Ok(text) => {
                if tx.send(Completion::Event(ChatEvent::StreamDelta { round, text })).is_err() {
                    warn!(round, "Driver gone, dropping generation");
                    break;
                }
            }
            Err(e) => return ChatEvent::StreamFailed { round, error: e.to_string() },
        }
    }
    ChatEvent::StreamFinished { round }
}

/// Strings pass through untouched; anything else is rendered as JSON.
pub fn render_tool_output(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_output_rendering() {
        assert_eq!(render_tool_output(json!("plain")), "plain");
        assert_eq!(render_tool_output(json!({"x": 1})), r#"{"x":1}"#);
        assert_eq!(render_tool_output(json!(42)), "42");
    }
}
