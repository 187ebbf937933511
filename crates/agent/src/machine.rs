//! The lifecycle state machine.
//!
//! [`transition`] is a pure function: it takes the current snapshot and one
//! [`ChatEvent`], and returns the next snapshot plus the [`Effect`]s the
//! driver must perform. Effects that complete asynchronously report back as
//! further events tagged with the round (or load attempt) they belong to, and
//! events from a round that is no longer current are dropped here.

use serde::{Deserialize, Serialize};
use toolchat_core::engine::{ChatMessage, SamplingConfig};
use toolchat_core::error::StoreError;
use toolchat_core::message::Message;
use toolchat_core::tool::{ToolCall, ToolDescriptor};
use toolchat_conversation::buffer::BufferPolicy;
use toolchat_conversation::prompt::PromptBuilder;
use toolchat_conversation::store::{
    ConversationSnapshot, ErrorKind, ErrorRecord, Status, StoreEvent, ToolOutcome,
};
use tracing::{debug, info, warn};

/// Knobs the machine needs to build each round.
#[derive(Debug, Clone, Default)]
pub struct MachineConfig {
    pub buffer: BufferPolicy,
    pub sampling: SamplingConfig,
    pub prompt: PromptBuilder,
}

/// Everything that can happen to a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    // ── User-initiated ──
    LoadModel { model: String },
    Enqueue { content: String },
    Approve { request_id: String },
    Reject { request_id: String },
    Interrupt,
    ClearError,

    // ── Task completions ──
    LoadProgress { attempt: u64, progress: f32 },
    ModelLoaded { attempt: u64 },
    ModelLoadFailed { attempt: u64, error: String },
    ToolsFound { round: u64, tools: Vec<ToolDescriptor> },
    ToolSearchFailed { round: u64, error: String },
    StreamDelta { round: u64, text: String },
    StreamFinished { round: u64 },
    StreamFailed { round: u64, error: String },
    ToolSucceeded { round: u64, request_id: String, output: String },
    ToolFailed { round: u64, request_id: String, error: String },
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadModel { .. } => "load_model",
            Self::Enqueue { .. } => "enqueue",
            Self::Approve { .. } => "approve",
            Self::Reject { .. } => "reject",
            Self::Interrupt => "interrupt",
            Self::ClearError => "clear_error",
            Self::LoadProgress { .. } => "load_progress",
            Self::ModelLoaded { .. } => "model_loaded",
            Self::ModelLoadFailed { .. } => "model_load_failed",
            Self::ToolsFound { .. } => "tools_found",
            Self::ToolSearchFailed { .. } => "tool_search_failed",
            Self::StreamDelta { .. } => "stream_delta",
            Self::StreamFinished { .. } => "stream_finished",
            Self::StreamFailed { .. } => "stream_failed",
            Self::ToolSucceeded { .. } => "tool_succeeded",
            Self::ToolFailed { .. } => "tool_failed",
        }
    }
}

/// Work the driver performs on the machine's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    LoadModel { attempt: u64, model: String },
    SearchTools { round: u64, conversation: Vec<Message> },
    StartGeneration { round: u64, messages: Vec<ChatMessage>, sampling: SamplingConfig },
    /// Stop the search or generation task of `round`
    Cancel { round: u64 },
    InvokeTool { round: u64, request_id: String, call: ToolCall },
}

/// The machine's answer to one event.
#[derive(Debug)]
pub struct Transition {
    pub snapshot: ConversationSnapshot,
    pub effects: Vec<Effect>,
}

/// Advance `snapshot` by one event.
///
/// Returns `Err` only for store invariant violations, which mean the machine
/// itself is broken.
pub fn transition(
    snapshot: ConversationSnapshot,
    event: ChatEvent,
    config: &MachineConfig,
) -> Result<Transition, StoreError> {
    let mut step = Step {
        snapshot,
        effects: Vec::new(),
        config,
    };
    step.handle(event)?;
    Ok(Transition {
        snapshot: step.snapshot,
        effects: step.effects,
    })
}

struct Step<'a> {
    snapshot: ConversationSnapshot,
    effects: Vec<Effect>,
    config: &'a MachineConfig,
}

impl Step<'_> {
    fn handle(&mut self, event: ChatEvent) -> Result<(), StoreError> {
        let status = self.snapshot.status;
        match (status, event) {
            // ── Always accepted ─────────────────────────────────────────
            (_, ChatEvent::Enqueue { content }) => {
                self.store(StoreEvent::Enqueue { content })?;
                if status == Status::Ready {
                    self.enter_ready()?;
                }
            }
            (_, ChatEvent::ClearError) => self.store(StoreEvent::ClearError)?,

            // ── Model loading ───────────────────────────────────────────
            (Status::Idle | Status::LoadFailed, ChatEvent::LoadModel { model }) => {
                self.snapshot.load_attempt += 1;
                self.snapshot.model = Some(model.clone());
                self.snapshot.load_progress = Some(0.0);
                self.effects.push(Effect::LoadModel {
                    attempt: self.snapshot.load_attempt,
                    model,
                });
                self.set_status(Status::LoadingModel);
            }
            (Status::LoadingModel, ChatEvent::LoadProgress { attempt, progress })
                if attempt == self.snapshot.load_attempt =>
            {
                self.store(StoreEvent::SetLoadProgress(progress))?;
            }
            (Status::LoadingModel, ChatEvent::ModelLoaded { attempt })
                if attempt == self.snapshot.load_attempt =>
            {
                self.snapshot.load_progress = Some(1.0);
                self.enter_ready()?;
            }
            (Status::LoadingModel, ChatEvent::ModelLoadFailed { attempt, error })
                if attempt == self.snapshot.load_attempt =>
            {
                warn!(attempt, error = %error, "Model load failed");
                self.snapshot.load_progress = None;
                self.store(StoreEvent::RecordError(ErrorRecord::new(ErrorKind::ModelLoad, error)))?;
                self.set_status(Status::LoadFailed);
            }

            // ── Tool search ─────────────────────────────────────────────
            (Status::SearchingTools, ChatEvent::ToolsFound { round, tools })
                if round == self.snapshot.round =>
            {
                debug!(round, count = tools.len(), "Relevant tools found");
                self.store(StoreEvent::SetAvailableTools(tools))?;
                self.enter_streaming()?;
            }
            (Status::SearchingTools, ChatEvent::ToolSearchFailed { round, error })
                if round == self.snapshot.round =>
            {
                warn!(round, error = %error, "Tool search failed, continuing without tools");
                self.store(StoreEvent::SetAvailableTools(Vec::new()))?;
                self.store(StoreEvent::RecordError(ErrorRecord::new(ErrorKind::ToolSearch, error)))?;
                self.enter_streaming()?;
            }
            (Status::SearchingTools, ChatEvent::Interrupt) => {
                self.effects.push(Effect::Cancel { round: self.snapshot.round });
                self.enter_ready()?;
            }

            // ── Streaming ───────────────────────────────────────────────
            (Status::StreamingResponse, ChatEvent::StreamDelta { round, text })
                if round == self.snapshot.round =>
            {
                let applied = self.snapshot_take().apply(StoreEvent::AppendDelta {
                    delta: text,
                    policy: self.config.buffer,
                })?;
                self.snapshot = applied.snapshot;
                if let Some(detected) = applied.detected {
                    info!(round, tool = %detected.call.name, "Tool call detected");
                    self.store(StoreEvent::RecordToolCall(detected))?;
                    self.store(StoreEvent::CloseAssistantMessage)?;
                    self.effects.push(Effect::Cancel { round });
                    self.set_status(Status::WaitingForToolApproval);
                }
            }
            (Status::StreamingResponse, ChatEvent::StreamFinished { round })
                if round == self.snapshot.round =>
            {
                self.store(StoreEvent::CloseAssistantMessage)?;
                self.enter_ready()?;
            }
            (Status::StreamingResponse, ChatEvent::StreamFailed { round, error })
                if round == self.snapshot.round =>
            {
                warn!(round, error = %error, "Generation failed");
                self.store(StoreEvent::CloseAssistantMessage)?;
                self.store(StoreEvent::RecordError(ErrorRecord::new(ErrorKind::Stream, error)))?;
                self.enter_ready()?;
            }
            (Status::StreamingResponse, ChatEvent::Interrupt) => {
                self.effects.push(Effect::Cancel { round: self.snapshot.round });
                self.store(StoreEvent::CloseAssistantMessage)?;
                self.enter_ready()?;
            }

            // ── Approval ────────────────────────────────────────────────
            (Status::WaitingForToolApproval, ChatEvent::Approve { request_id })
                if self.is_pending(&request_id) =>
            {
                let call = self
                    .snapshot
                    .pending_tool_call
                    .as_ref()
                    .map(|p| p.tool_call.clone())
                    .ok_or(StoreError::NoPendingToolCall)?;
                info!(request_id = %request_id, tool = %call.name, "Tool call approved");
                self.store(StoreEvent::Approve { request_id: request_id.clone() })?;
                self.store(StoreEvent::MarkExecuting { request_id: request_id.clone() })?;
                self.effects.push(Effect::InvokeTool {
                    round: self.snapshot.round,
                    request_id,
                    call,
                });
                self.set_status(Status::CallingTool);
            }
            (Status::WaitingForToolApproval, ChatEvent::Reject { request_id })
                if self.is_pending(&request_id) =>
            {
                self.reject(request_id)?;
            }
            (Status::WaitingForToolApproval, ChatEvent::Interrupt) => {
                let request_id = self
                    .snapshot
                    .pending_tool_call
                    .as_ref()
                    .map(|p| p.request_id.clone())
                    .ok_or(StoreError::NoPendingToolCall)?;
                self.reject(request_id)?;
            }

            // ── Tool execution ──────────────────────────────────────────
            (Status::CallingTool, ChatEvent::ToolSucceeded { round, request_id, output })
                if round == self.snapshot.round && self.is_active(&request_id) =>
            {
                self.store(StoreEvent::RecordToolResult {
                    request_id,
                    outcome: ToolOutcome::Success(output),
                })?;
                self.enter_searching();
            }
            (Status::CallingTool, ChatEvent::ToolFailed { round, request_id, error })
                if round == self.snapshot.round && self.is_active(&request_id) =>
            {
                warn!(round, request_id = %request_id, error = %error, "Tool execution failed");
                self.store(StoreEvent::RecordToolResult {
                    request_id,
                    outcome: ToolOutcome::Failure(error.clone()),
                })?;
                self.store(StoreEvent::RecordError(ErrorRecord::new(ErrorKind::ToolExecution, error)))?;
                self.enter_searching();
            }
            (Status::CallingTool, ChatEvent::Reject { request_id }) if self.is_active(&request_id) => {
                self.reject(request_id)?;
            }
            (Status::CallingTool, ChatEvent::Interrupt) => {
                let request_id = self
                    .snapshot
                    .active_request_id
                    .clone()
                    .ok_or(StoreError::NoPendingToolCall)?;
                self.reject(request_id)?;
            }

            // ── Everything else ─────────────────────────────────────────
            (status, event) if is_task_completion(&event) => {
                debug!(status = %status, event = event.name(), round = self.snapshot.round, "Discarding stale event");
            }
            (status, event) => {
                warn!(status = %status, event = event.name(), "Ignoring event not valid in current state");
            }
        }
        Ok(())
    }

    /// `ready` on entry: drain the queue and start a round if anything arrived.
    fn enter_ready(&mut self) -> Result<(), StoreError> {
        self.set_status(Status::Ready);
        if self.snapshot.queued_messages.is_empty() {
            return Ok(());
        }
        debug!(count = self.snapshot.queued_messages.len(), "Draining queued messages");
        self.store(StoreEvent::DrainQueue)?;
        self.enter_searching();
        Ok(())
    }

    fn enter_searching(&mut self) {
        self.snapshot.round += 1;
        self.effects.push(Effect::SearchTools {
            round: self.snapshot.round,
            conversation: self.snapshot.messages.clone(),
        });
        self.set_status(Status::SearchingTools);
    }

    /// `streamingResponse` on entry: open the message and start generating.
    fn enter_streaming(&mut self) -> Result<(), StoreError> {
        self.store(StoreEvent::OpenAssistantMessage)?;
        let boundary = self
            .snapshot
            .tool_boundary_id
            .clone()
            .ok_or(StoreError::NoBoundary)?;
        let messages = self.config.prompt.engine_messages(&self.snapshot, &boundary);
        self.effects.push(Effect::StartGeneration {
            round: self.snapshot.round,
            messages,
            sampling: self.config.sampling.clone(),
        });
        self.set_status(Status::StreamingResponse);
        Ok(())
    }

    /// Explicit or implicit rejection; a fresh round follows.
    fn reject(&mut self, request_id: String) -> Result<(), StoreError> {
        info!(request_id = %request_id, "Tool call rejected");
        self.store(StoreEvent::Reject { request_id })?;
        self.enter_searching();
        Ok(())
    }

    fn is_pending(&self, request_id: &str) -> bool {
        self.snapshot
            .pending_tool_call
            .as_ref()
            .is_some_and(|p| p.request_id == request_id)
    }

    fn is_active(&self, request_id: &str) -> bool {
        self.snapshot.active_request_id.as_deref() == Some(request_id)
    }

    fn store(&mut self, event: StoreEvent) -> Result<(), StoreError> {
        self.snapshot = self.snapshot_take().apply(event)?.snapshot;
        Ok(())
    }

    fn snapshot_take(&mut self) -> ConversationSnapshot {
        std::mem::take(&mut self.snapshot)
    }

    fn set_status(&mut self, to: Status) {
        let from = self.snapshot.status;
        if from != to {
            info!(from = %from, to = %to, round = self.snapshot.round, "state transition");
            self.snapshot.status = to;
        }
    }
}

fn is_task_completion(event: &ChatEvent) -> bool {
    matches!(
        event,
        ChatEvent::LoadProgress { .. }
            | ChatEvent::ModelLoaded { .. }
            | ChatEvent::ModelLoadFailed { .. }
            | ChatEvent::ToolsFound { .. }
            | ChatEvent::ToolSearchFailed { .. }
            | ChatEvent::StreamDelta { .. }
            | ChatEvent::StreamFinished { .. }
            | ChatEvent::StreamFailed { .. }
            | ChatEvent::ToolSucceeded { .. }
            | ChatEvent::ToolFailed { .. }
    )
}
