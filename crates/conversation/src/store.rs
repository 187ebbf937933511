//! Conversation state store.
//!
//! [`ConversationSnapshot`] is a plain value. [`ConversationSnapshot::apply`]
//! consumes it together with a [`StoreEvent`] and returns the next snapshot,
//! so a caller only ever swaps snapshots wholesale. Lifecycle `status` is not
//! touched here; the orchestrator owns it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use toolchat_core::error::StoreError;
use toolchat_core::message::{ConversationId, Message, MessageToolCall, Role};
use toolchat_core::tool::{ToolCall, ToolDescriptor};
use tracing::debug;
use uuid::Uuid;

use crate::buffer::{BufferPolicy, DetectedToolCall};
use crate::envelope::BoundaryId;

/// Lifecycle states of a conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Idle,
    LoadingModel,
    LoadFailed,
    Ready,
    SearchingTools,
    StreamingResponse,
    WaitingForToolApproval,
    CallingTool,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::LoadingModel => "loading_model",
            Status::LoadFailed => "load_failed",
            Status::Ready => "ready",
            Status::SearchingTools => "searching_tools",
            Status::StreamingResponse => "streaming_response",
            Status::WaitingForToolApproval => "waiting_for_tool_approval",
            Status::CallingTool => "calling_tool",
        }
    }

    /// Whether a model is loaded and usable in this state.
    pub fn has_engine(&self) -> bool {
        !matches!(self, Status::Idle | Status::LoadingModel | Status::LoadFailed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Executing,
    Completed,
    Error,
}

impl RequestStatus {
    /// Completed, failed or rejected requests never change again.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Rejected | Self::Completed | Self::Error)
    }
}

/// One detected tool call and everything needed to audit or undo it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    /// The assistant message the envelope was cut from
    pub message_id: String,
    pub tool_call: ToolCall,
    /// Envelope text exactly as the model produced it
    pub source_text: String,
    /// Text after the envelope in the same delta
    pub trailing_text: String,
    pub status: RequestStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The call currently awaiting a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingToolCall {
    pub request_id: String,
    pub tool_call: ToolCall,
    pub source_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ModelLoad,
    Stream,
    ToolSearch,
    ToolExecution,
}

/// A recoverable failure, kept for display until cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// How an executed tool call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(String),
    Failure(String),
}

/// Everything the UI and the orchestrator know about one conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub id: ConversationId,
    pub status: Status,
    pub model: Option<String>,
    pub load_progress: Option<f32>,
    pub messages: Vec<Message>,
    /// User messages waiting for the next `ready` state
    pub queued_messages: Vec<Message>,
    pub open_assistant_id: Option<String>,
    pub tool_boundary_id: Option<BoundaryId>,
    /// Text held back while its classification is undecided
    pub stream_buffer: Option<String>,
    pub pending_tool_call: Option<PendingToolCall>,
    /// Request id of the call currently executing
    pub active_request_id: Option<String>,
    pub tool_call_requests: HashMap<String, ToolCallRequest>,
    /// Tools advertised to the model this round
    pub available_tools: Vec<ToolDescriptor>,
    pub last_error: Option<ErrorRecord>,
    /// Generation round counter; async results carry the round they belong to
    pub round: u64,
    /// Model load attempt counter
    pub load_attempt: u64,
}

/// Transitions understood by [`ConversationSnapshot::apply`].
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Enqueue { content: String },
    DrainQueue,
    SetLoadProgress(f32),
    SetAvailableTools(Vec<ToolDescriptor>),
    /// Open an empty assistant message and mint a fresh boundary id
    OpenAssistantMessage,
    AppendDelta { delta: String, policy: BufferPolicy },
    /// Commit any held text verbatim
    FlushStreamBuffer,
    /// Flush, then end the round's assistant message
    CloseAssistantMessage,
    RecordToolCall(DetectedToolCall),
    Approve { request_id: String },
    MarkExecuting { request_id: String },
    RecordToolResult { request_id: String, outcome: ToolOutcome },
    Reject { request_id: String },
    RecordError(ErrorRecord),
    ClearError,
}

/// The result of a transition.
#[derive(Debug)]
pub struct Applied {
    pub snapshot: ConversationSnapshot,
    /// Set when an appended delta completed a tool-call envelope
    pub detected: Option<DetectedToolCall>,
}

impl From<ConversationSnapshot> for Applied {
    fn from(snapshot: ConversationSnapshot) -> Self {
        Self {
            snapshot,
            detected: None,
        }
    }
}

impl ConversationSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one transition, producing the next snapshot.
    ///
    /// Errors are invariant violations: the caller drove the store out of
    /// sequence. They are never recoverable.
    pub fn apply(mut self, event: StoreEvent) -> Result<Applied, StoreError> {
        match event {
            StoreEvent::Enqueue { content } => {
                self.queued_messages.push(Message::user(content));
            }
            StoreEvent::DrainQueue => {
                let queued = std::mem::take(&mut self.queued_messages);
                self.messages.extend(queued);
            }
            StoreEvent::SetLoadProgress(progress) => {
                self.load_progress = Some(progress.clamp(0.0, 1.0));
            }
            StoreEvent::SetAvailableTools(tools) => {
                self.available_tools = tools;
            }
            StoreEvent::OpenAssistantMessage => {
                let message = Message::assistant("");
                self.open_assistant_id = Some(message.id.clone());
                self.tool_boundary_id = Some(BoundaryId::generate());
                self.stream_buffer = None;
                self.messages.push(message);
            }
            StoreEvent::AppendDelta { delta, policy } => return self.append_delta(&delta, policy),
            StoreEvent::FlushStreamBuffer => self.flush_stream_buffer()?,
            StoreEvent::CloseAssistantMessage => self.close_assistant_message()?,
            StoreEvent::RecordToolCall(detected) => self.record_tool_call(detected)?,
            StoreEvent::Approve { request_id } => {
                let request = self.request_mut(&request_id)?;
                if request.status != RequestStatus::Pending {
                    return Err(StoreError::RequestAlreadyResolved(request_id));
                }
                request.status = RequestStatus::Approved;
                self.clear_pending(&request_id);
            }
            StoreEvent::MarkExecuting { request_id } => {
                let request = self.request_mut(&request_id)?;
                if request.status != RequestStatus::Approved {
                    return Err(StoreError::RequestAlreadyResolved(request_id));
                }
                request.status = RequestStatus::Executing;
                self.active_request_id = Some(request_id);
            }
            StoreEvent::RecordToolResult { request_id, outcome } => {
                self.record_tool_result(request_id, outcome)?
            }
            StoreEvent::Reject { request_id } => self.reject(request_id)?,
            StoreEvent::RecordError(record) => {
                self.last_error = Some(record);
            }
            StoreEvent::ClearError => {
                self.last_error = None;
            }
        }
        Ok(self.into())
    }

    /// The assistant message currently receiving deltas.
    pub fn open_assistant_message(&self) -> Option<&Message> {
        let id = self.open_assistant_id.as_deref()?;
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn request(&self, request_id: &str) -> Option<&ToolCallRequest> {
        self.tool_call_requests.get(request_id)
    }

    fn append_delta(mut self, delta: &str, policy: BufferPolicy) -> Result<Applied, StoreError> {
        let boundary = self.tool_boundary_id.clone().ok_or(StoreError::NoBoundary)?;
        let open_id = self
            .open_assistant_id
            .clone()
            .ok_or(StoreError::NoOpenAssistantMessage)?;

        let step = policy.step(self.stream_buffer.as_deref(), delta, &boundary);
        if !step.commit.is_empty() {
            self.append_to_message(&open_id, &step.commit)?;
        } else {
            self.message_index(&open_id)?;
        }
        self.stream_buffer = step.held;

        Ok(Applied {
            snapshot: self,
            detected: step.detected,
        })
    }

    fn flush_stream_buffer(&mut self) -> Result<(), StoreError> {
        let Some(held) = self.stream_buffer.take() else {
            return Ok(());
        };
        let open_id = self
            .open_assistant_id
            .clone()
            .ok_or(StoreError::NoOpenAssistantMessage)?;
        debug!(held = held.len(), "Flushing held text at end of round");
        self.append_to_message(&open_id, &held)
    }

    fn close_assistant_message(&mut self) -> Result<(), StoreError> {
        self.flush_stream_buffer()?;
        if let Some(open_id) = self.open_assistant_id.take() {
            let index = self.message_index(&open_id)?;
            let referenced = self
                .tool_call_requests
                .values()
                .any(|r| r.message_id == open_id);
            if self.messages[index].content.is_empty() && !referenced {
                self.messages.remove(index);
            }
        }
        self.tool_boundary_id = None;
        Ok(())
    }

    fn record_tool_call(&mut self, detected: DetectedToolCall) -> Result<(), StoreError> {
        let message_id = self
            .open_assistant_id
            .clone()
            .ok_or(StoreError::NoOpenAssistantMessage)?;
        self.message_index(&message_id)?;

        let request = ToolCallRequest {
            id: Uuid::new_v4().to_string(),
            message_id,
            tool_call: detected.call,
            source_text: detected.source_text,
            trailing_text: detected.trailing_text,
            status: RequestStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
        };
        self.pending_tool_call = Some(PendingToolCall {
            request_id: request.id.clone(),
            tool_call: request.tool_call.clone(),
            source_text: request.source_text.clone(),
        });
        self.stream_buffer = None;
        self.tool_call_requests.insert(request.id.clone(), request);
        Ok(())
    }

    fn record_tool_result(&mut self, request_id: String, outcome: ToolOutcome) -> Result<(), StoreError> {
        let request = self.request_mut(&request_id)?;
        if !matches!(request.status, RequestStatus::Approved | RequestStatus::Executing) {
            return Err(StoreError::RequestAlreadyResolved(request_id));
        }

        let (status, content, result, error) = match outcome {
            ToolOutcome::Success(output) => (RequestStatus::Completed, output.clone(), Some(output), None),
            ToolOutcome::Failure(message) => (RequestStatus::Error, format!("Error: {message}"), None, Some(message)),
        };
        request.status = status;
        request.result = result.clone();
        request.error = error;
        let request = request.clone();

        if !request.trailing_text.is_empty() {
            self.append_to_message(&request.message_id, &request.trailing_text)?;
        }
        self.messages.push(Message::tool(
            content,
            MessageToolCall {
                id: request.id.clone(),
                name: request.tool_call.name.clone(),
                arguments: request.tool_call.arguments.clone(),
                result,
            },
        ));
        if self.active_request_id.as_deref() == Some(request.id.as_str()) {
            self.active_request_id = None;
        }
        Ok(())
    }

    fn reject(&mut self, request_id: String) -> Result<(), StoreError> {
        let request = self.request_mut(&request_id)?;
        match request.status {
            RequestStatus::Rejected => {
                debug!(request_id = %request_id, "Tool call already rejected");
                return Ok(());
            }
            RequestStatus::Completed | RequestStatus::Error => {
                return Err(StoreError::RequestAlreadyResolved(request_id));
            }
            RequestStatus::Pending | RequestStatus::Approved | RequestStatus::Executing => {}
        }
        request.status = RequestStatus::Rejected;
        let request = request.clone();

        let restored = format!("{}{}", request.source_text, request.trailing_text);
        self.append_to_message(&request.message_id, &restored)?;
        self.messages.push(Message::tool(
            rejection_notice(&request.tool_call.name),
            MessageToolCall {
                id: request.id.clone(),
                name: request.tool_call.name.clone(),
                arguments: request.tool_call.arguments.clone(),
                result: None,
            },
        ));

        self.clear_pending(&request.id);
        if self.active_request_id.as_deref() == Some(request.id.as_str()) {
            self.active_request_id = None;
        }
        Ok(())
    }

    fn request_mut(&mut self, request_id: &str) -> Result<&mut ToolCallRequest, StoreError> {
        self.tool_call_requests
            .get_mut(request_id)
            .ok_or_else(|| StoreError::UnknownRequest(request_id.to_string()))
    }

    fn clear_pending(&mut self, request_id: &str) {
        if self
            .pending_tool_call
            .as_ref()
            .is_some_and(|p| p.request_id == request_id)
        {
            self.pending_tool_call = None;
        }
    }

    fn message_index(&self, id: &str) -> Result<usize, StoreError> {
        self.messages
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| StoreError::MessageNotFound(id.to_string()))
    }

    fn append_to_message(&mut self, id: &str, text: &str) -> Result<(), StoreError> {
        let index = self.message_index(id)?;
        debug_assert_eq!(self.messages[index].role, Role::Assistant);
        let grown = self.messages[index].with_appended(text);
        self.messages[index] = grown;
        Ok(())
    }
}

/// Content of the synthetic tool message recorded for a rejected call.
pub fn rejection_notice(tool_name: &str) -> String {
    format!("The user declined to run the tool `{tool_name}`. Continue without it.")
}
