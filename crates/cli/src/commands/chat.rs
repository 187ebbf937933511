//! `toolchat chat`: interactive or single-message chat.
//!
//! The REPL never mutates the conversation itself. Typed lines become
//! session commands, and the terminal is redrawn incrementally from the
//! snapshots the session publishes.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use toolchat_agent::{ChatSession, MachineConfig, SessionError, SessionHandle};
use toolchat_config::AppConfig;
use toolchat_conversation::{
    BufferPolicy, ConversationSnapshot, ErrorKind, ErrorRecord, PendingToolCall, PromptBuilder, Status,
};
use toolchat_core::message::Role;
use toolchat_providers::OpenAiCompatLoader;
use toolchat_tools::KeywordToolSearch;
use tracing::info;

pub struct ChatOptions {
    pub model: Option<String>,
    pub engine_url: Option<String>,
    pub message: Option<String>,
    pub auto_approve: bool,
}

pub async fn run(options: ChatOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if let Some(model) = options.model {
        config.engine.model = model;
    }
    if let Some(url) = options.engine_url {
        config.engine.base_url = url;
    }

    let session = build_session(&config)?;
    let one_shot = options.message.is_some();

    if !one_shot {
        println!();
        println!("  toolchat");
        println!("  Engine:  {}", config.engine.base_url);
        println!("  Model:   {}", config.engine.model);
        println!();
        println!("  Type a message and press Enter. Answer tool prompts with y or n.");
        println!("  Ctrl+C interrupts a reply; /retry reloads a failed model; /quit exits.");
        println!();
    }

    session.load_model(config.engine.model.clone()).await?;
    if let Some(message) = options.message {
        // Queued until the model is ready
        session.send_message(message).await?;
    }

    let (line_tx, mut lines) = mpsc::channel::<String>(16);
    tokio::spawn(async move {
        let mut reader = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let mut snapshots = session.watch();
    let mut transcript = Transcript::default();
    let mut answered = HashSet::new();
    let mut stdin_open = true;
    let mut load_failed = false;

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                print!("{}", transcript.render(&snapshot));
                std::io::stdout().flush()?;

                if options.auto_approve
                    && snapshot.status == Status::WaitingForToolApproval
                    && let Some(pending) = &snapshot.pending_tool_call
                    && answered.insert(pending.request_id.clone())
                {
                    info!(request_id = %pending.request_id, tool = %pending.tool_call.name, "Auto-approving tool call");
                    println!("y");
                    session.approve(pending.request_id.clone()).await?;
                }
                if let Some(pending) = unanswerable_request(&snapshot, one_shot, stdin_open, options.auto_approve) {
                    reject_unanswered(&session, pending, &mut answered).await?;
                }

                if one_shot {
                    if snapshot.status == Status::LoadFailed {
                        load_failed = true;
                        break;
                    }
                    if is_settled(&snapshot) {
                        break;
                    }
                }
            }
            line = lines.recv(), if stdin_open => {
                let Some(line) = line else {
                    stdin_open = false;
                    if !one_shot {
                        break;
                    }
                    let snapshot = session.snapshot();
                    if let Some(pending) = unanswerable_request(&snapshot, one_shot, stdin_open, options.auto_approve) {
                        reject_unanswered(&session, pending, &mut answered).await?;
                    }
                    continue;
                };
                let snapshot = session.snapshot();
                if let Flow::Quit = handle_line(&session, &snapshot, line.trim(), &config.engine.model).await? {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let status = session.snapshot().status;
                if matches!(status, Status::Idle | Status::Ready | Status::LoadFailed) {
                    break;
                }
                session.interrupt().await?;
                println!("\n[interrupted]");
            }
        }
    }

    session.shutdown().await?;
    println!();
    if load_failed {
        return Err(format!("could not load model {}", config.engine.model).into());
    }
    Ok(())
}

fn build_session(config: &AppConfig) -> Result<SessionHandle, Box<dyn std::error::Error>> {
    let mut loader = OpenAiCompatLoader::new(config.engine.base_url.clone(), config.request_timeout())?;
    if let Some(key) = &config.engine.api_key {
        loader = loader.with_api_key(key.clone());
    }

    let registry = match &config.tools.enabled {
        Some(names) => toolchat_tools::registry_with(names),
        None => toolchat_tools::default_registry(),
    };
    let search = KeywordToolSearch::new(registry.descriptors()).with_limit(config.tools.search_limit);

    let prompt = match &config.prompt.preamble {
        Some(preamble) => PromptBuilder::new().with_preamble(preamble.clone()),
        None => PromptBuilder::default(),
    };
    let machine = MachineConfig {
        buffer: BufferPolicy::new(config.streaming.max_buffer_chars),
        sampling: config.sampling_config(),
        prompt,
    };

    Ok(ChatSession::new(Arc::new(loader), Arc::new(registry), Arc::new(search))
        .with_config(machine)
        .spawn())
}

enum Flow {
    Continue,
    Quit,
}

async fn handle_line(
    session: &SessionHandle,
    snapshot: &ConversationSnapshot,
    line: &str,
    model: &str,
) -> Result<Flow, SessionError> {
    match line {
        "" => {}
        "/quit" | "/exit" => return Ok(Flow::Quit),
        "/retry" => {
            if snapshot.status == Status::LoadFailed {
                session.load_model(model).await?;
            } else {
                println!("[nothing to retry]");
            }
        }
        "/clear" => session.clear_error().await?,
        answer if snapshot.status == Status::WaitingForToolApproval => match &snapshot.pending_tool_call {
            Some(pending) if is_yes(answer) => session.approve(pending.request_id.clone()).await?,
            Some(pending) => session.reject(pending.request_id.clone()).await?,
            None => session.send_message(answer).await?,
        },
        message => session.send_message(message).await?,
    }
    Ok(Flow::Continue)
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes")
}

/// The pending call nobody can answer: a one-shot run whose stdin is closed
/// and that was not started with `--yes`.
fn unanswerable_request(
    snapshot: &ConversationSnapshot,
    one_shot: bool,
    stdin_open: bool,
    auto_approve: bool,
) -> Option<&PendingToolCall> {
    if !one_shot || stdin_open || auto_approve || snapshot.status != Status::WaitingForToolApproval {
        return None;
    }
    snapshot.pending_tool_call.as_ref()
}

async fn reject_unanswered(
    session: &SessionHandle,
    pending: &PendingToolCall,
    answered: &mut HashSet<String>,
) -> Result<(), SessionError> {
    if !answered.insert(pending.request_id.clone()) {
        return Ok(());
    }
    info!(request_id = %pending.request_id, tool = %pending.tool_call.name, "No input to approve tool call, rejecting");
    println!("n (no input; pass --yes to approve tool calls)");
    session.reject(pending.request_id.clone()).await
}

/// Whether a one-shot exchange has finished: the model is idle again with
/// nothing queued and the message has been answered.
fn is_settled(snapshot: &ConversationSnapshot) -> bool {
    snapshot.status == Status::Ready
        && snapshot.queued_messages.is_empty()
        && snapshot.messages.iter().any(|m| m.role == Role::User)
}

/// Incremental terminal rendering of published snapshots.
#[derive(Default)]
struct Transcript {
    /// Bytes of each assistant message already written
    printed: HashMap<String, usize>,
    /// Assistant message the cursor is currently inside
    current: Option<String>,
    shown_tool_messages: HashSet<String>,
    prompted_requests: HashSet<String>,
    last_error: Option<ErrorRecord>,
    status: Status,
}

impl Transcript {
    fn render(&mut self, snapshot: &ConversationSnapshot) -> String {
        let mut out = String::new();

        if snapshot.status != self.status {
            match snapshot.status {
                Status::LoadingModel => {
                    let model = snapshot.model.as_deref().unwrap_or("model");
                    out.push_str(&format!("[loading {model}]\n"));
                }
                Status::Ready if self.status == Status::LoadingModel => out.push_str("[ready]\n"),
                Status::Ready if self.current.take().is_some() => out.push('\n'),
                _ => {}
            }
            self.status = snapshot.status;
        }

        for message in &snapshot.messages {
            match message.role {
                Role::Assistant => {
                    let printed = self.printed.entry(message.id.clone()).or_insert(0);
                    if let Some(fresh) = message.content.get(*printed..)
                        && !fresh.is_empty()
                    {
                        if self.current.as_deref() != Some(message.id.as_str()) {
                            out.push_str("\nassistant > ");
                            self.current = Some(message.id.clone());
                        }
                        out.push_str(fresh);
                        *printed = message.content.len();
                    }
                }
                Role::Tool => {
                    if self.shown_tool_messages.insert(message.id.clone()) {
                        out.push_str(&format!("\n[tool] {}\n", message.content));
                        self.current = None;
                    }
                }
                Role::User | Role::System => {}
            }
        }

        if snapshot.status == Status::WaitingForToolApproval
            && let Some(pending) = &snapshot.pending_tool_call
            && self.prompted_requests.insert(pending.request_id.clone())
        {
            let arguments = serde_json::Value::Object(pending.tool_call.arguments.clone());
            out.push_str(&format!(
                "\nRun tool `{}` with {arguments}? [y/N] ",
                pending.tool_call.name
            ));
            self.current = None;
        }

        if let Some(error) = &snapshot.last_error
            && self.last_error.as_ref() != Some(error)
        {
            out.push_str(&format!("\n[{} error] {}\n", error_label(error.kind), error.message));
            if snapshot.status == Status::LoadFailed {
                out.push_str("Type /retry to load the model again.\n");
            }
            self.last_error = Some(error.clone());
            self.current = None;
        }

        out
    }
}

fn error_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::ModelLoad => "model load",
        ErrorKind::Stream => "stream",
        ErrorKind::ToolSearch => "tool search",
        ErrorKind::ToolExecution => "tool",
    }
}
