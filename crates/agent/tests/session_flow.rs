//! End-to-end conversations through a spawned session, driven by the
//! scripted engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use toolchat_agent::{ChatSession, SessionHandle};
use toolchat_conversation::store::rejection_notice;
use toolchat_conversation::{ConversationSnapshot, ErrorKind, RequestStatus, Status};
use toolchat_core::error::{SearchError, ToolError};
use toolchat_core::event::{DomainEvent, EventBus};
use toolchat_core::message::{Message, Role};
use toolchat_core::search::RelevanceSearch;
use toolchat_core::tool::{Tool, ToolDescriptor, ToolRegistry};
use toolchat_providers::{Script, ScriptedEngine, ScriptedLoader};

/// Advertises every tool it was built with.
struct AllTools(Vec<ToolDescriptor>);

#[async_trait]
impl RelevanceSearch for AllTools {
    async fn search(&self, _conversation: &[Message]) -> Result<Vec<ToolDescriptor>, SearchError> {
        Ok(self.0.clone())
    }
}

/// A tool that never finishes.
struct StuckTool;

#[async_trait]
impl Tool for StuckTool {
    fn name(&self) -> &str {
        "stuck"
    }

    fn description(&self) -> &str {
        "Never returns"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _arguments: Map<String, Value>) -> Result<Value, ToolError> {
        std::future::pending().await
    }
}

fn envelope(name: &str, arguments: Value) -> String {
    let body = json!({"name": name, "arguments": arguments});
    format!("[TOOL_CALL:{{boundary}}]{body}[/TOOL_CALL:{{boundary}}]")
}

struct Fixture {
    session: SessionHandle,
    engine: Arc<ScriptedEngine>,
    loader: Arc<ScriptedLoader>,
}

fn start(scripts: Vec<Script>) -> Fixture {
    start_with(scripts, toolchat_tools::default_registry(), 0, Arc::new(EventBus::default()))
}

fn start_with(scripts: Vec<Script>, registry: ToolRegistry, failing_loads: u32, bus: Arc<EventBus>) -> Fixture {
    let engine = Arc::new(ScriptedEngine::new(scripts));
    let loader = Arc::new(ScriptedLoader::new(engine.clone()).failing_first(failing_loads));
    let search = AllTools(registry.descriptors());
    let session = ChatSession::new(loader.clone(), Arc::new(registry), Arc::new(search))
        .with_event_bus(bus)
        .spawn();
    Fixture { session, engine, loader }
}

async fn settle(
    session: &SessionHandle,
    predicate: impl FnMut(&ConversationSnapshot) -> bool,
) -> ConversationSnapshot {
    tokio::time::timeout(Duration::from_secs(5), session.wait_for(predicate))
        .await
        .expect("timed out waiting for the session")
        .expect("session closed")
}

fn answered(snapshot: &ConversationSnapshot, reply: &str) -> bool {
    snapshot.status == Status::Ready && snapshot.messages.iter().any(|m| m.role == Role::Assistant && m.content == reply)
}

fn tool_messages(snapshot: &ConversationSnapshot) -> Vec<&Message> {
    snapshot.messages.iter().filter(|m| m.role == Role::Tool).collect()
}

#[tokio::test]
async fn plain_reply_round_trip() {
    let fx = start(vec![Script::reply(["po", "ng"])]);
    fx.session.load_model("tiny").await.unwrap();
    fx.session.send_message("ping").await.unwrap();

    let snapshot = settle(&fx.session, |s| answered(s, "pong")).await;
    let roles: Vec<Role> = snapshot.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, [Role::User, Role::Assistant]);
    assert!(snapshot.open_assistant_id.is_none());
    assert!(snapshot.last_error.is_none());

    let requests = fx.engine.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0][0].role, Role::System);
    assert_eq!(requests[0].last().map(|m| m.content.as_str()), Some("ping"));

    fx.session.shutdown().await.unwrap();
}

#[tokio::test]
async fn approved_tool_call_feeds_the_next_round() {
    let fx = start(vec![
        Script::reply(["Let me check. ".to_string(), envelope("echo", json!({"text": "hi"}))]),
        Script::reply(["The tool said hi."]),
    ]);
    fx.session.load_model("tiny").await.unwrap();
    fx.session.send_message("please echo hi").await.unwrap();

    let waiting = settle(&fx.session, |s| s.status == Status::WaitingForToolApproval).await;
    let pending = waiting.pending_tool_call.clone().unwrap();
    assert_eq!(pending.tool_call.name, "echo");
    assert_eq!(waiting.messages[1].content, "Let me check. ");
    assert!(waiting.stream_buffer.is_none());

    fx.session.approve(pending.request_id.clone()).await.unwrap();
    let snapshot = settle(&fx.session, |s| answered(s, "The tool said hi.")).await;

    let tools = tool_messages(&snapshot);
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].content, "hi");
    assert_eq!(snapshot.request(&pending.request_id).map(|r| r.status), Some(RequestStatus::Completed));

    // The second round saw the tool result
    let requests = fx.engine.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].iter().any(|m| m.role == Role::Tool && m.content == "hi"));
}

#[tokio::test]
async fn envelope_split_across_many_deltas_is_detected() {
    // Delimiters arrive in fragments; each placeholder stays whole so it can be substituted
    let deltas = [
        "Sure.", "[", "TOOL_", "CALL:", "{boundary}", "]{\"na", "me\":\"echo\",", "\"arguments\":{\"text\":\"x\"}}",
        "[/TOOL", "_CALL:", "{boundary}", "]",
    ];
    let fx = start(vec![Script::reply(deltas)]);
    fx.session.load_model("tiny").await.unwrap();
    fx.session.send_message("echo x").await.unwrap();

    let waiting = settle(&fx.session, |s| s.status == Status::WaitingForToolApproval).await;
    assert_eq!(waiting.messages[1].content, "Sure.");
    let call = waiting.pending_tool_call.unwrap().tool_call;
    assert_eq!(call.name, "echo");
    assert_eq!(call.arguments.get("text"), Some(&json!("x")));
}

#[tokio::test]
async fn rejected_call_restores_text_and_adds_one_notice() {
    let fx = start(vec![
        Script::reply([envelope("echo", json!({"text": "hi"}))]),
        Script::reply(["Okay, no tools."]),
    ]);
    fx.session.load_model("tiny").await.unwrap();
    fx.session.send_message("echo hi").await.unwrap();

    let waiting = settle(&fx.session, |s| s.status == Status::WaitingForToolApproval).await;
    let request_id = waiting.pending_tool_call.unwrap().request_id;
    fx.session.reject(request_id.clone()).await.unwrap();

    let snapshot = settle(&fx.session, |s| answered(s, "Okay, no tools.")).await;
    let tools = tool_messages(&snapshot);
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].content, rejection_notice("echo"));
    assert!(snapshot.messages[1].content.contains("\"name\":\"echo\""));
    assert_eq!(snapshot.request(&request_id).map(|r| r.status), Some(RequestStatus::Rejected));
}

#[tokio::test]
async fn interrupt_while_waiting_rejects_implicitly() {
    let fx = start(vec![
        Script::reply([envelope("echo", json!({"text": "hi"}))]),
        Script::reply(["Continuing."]),
    ]);
    fx.session.load_model("tiny").await.unwrap();
    fx.session.send_message("echo hi").await.unwrap();

    settle(&fx.session, |s| s.status == Status::WaitingForToolApproval).await;
    fx.session.interrupt().await.unwrap();

    let snapshot = settle(&fx.session, |s| answered(s, "Continuing.")).await;
    let tools = tool_messages(&snapshot);
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].content, rejection_notice("echo"));
}

#[tokio::test]
async fn interrupt_while_calling_tool_adds_exactly_one_notice() {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(StuckTool));
    let fx = start_with(
        vec![
            Script::reply([envelope("stuck", json!({}))]),
            Script::reply(["Gave up on it."]),
        ],
        registry,
        0,
        Arc::new(EventBus::default()),
    );
    fx.session.load_model("tiny").await.unwrap();
    fx.session.send_message("run the stuck tool").await.unwrap();

    let waiting = settle(&fx.session, |s| s.status == Status::WaitingForToolApproval).await;
    let request_id = waiting.pending_tool_call.unwrap().request_id;
    fx.session.approve(request_id.clone()).await.unwrap();
    settle(&fx.session, |s| s.status == Status::CallingTool).await;
    fx.session.interrupt().await.unwrap();

    let snapshot = settle(&fx.session, |s| answered(s, "Gave up on it.")).await;
    let tools = tool_messages(&snapshot);
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].content, rejection_notice("stuck"));
    assert!(snapshot.active_request_id.is_none());
}

#[tokio::test]
async fn failing_tool_reports_error_and_continues() {
    let fx = start(vec![
        Script::reply([envelope("echo", json!({}))]),
        Script::reply(["The echo tool needs text."]),
    ]);
    fx.session.load_model("tiny").await.unwrap();
    fx.session.send_message("echo").await.unwrap();

    let waiting = settle(&fx.session, |s| s.status == Status::WaitingForToolApproval).await;
    fx.session.approve(waiting.pending_tool_call.unwrap().request_id).await.unwrap();

    let snapshot = settle(&fx.session, |s| answered(s, "The echo tool needs text.")).await;
    let tools = tool_messages(&snapshot);
    assert_eq!(tools.len(), 1);
    assert!(tools[0].content.starts_with("Error: "));
    assert_eq!(snapshot.last_error.map(|e| e.kind), Some(ErrorKind::ToolExecution));
}

#[tokio::test]
async fn stream_failure_keeps_partial_text() {
    let fx = start(vec![Script::FailAfter {
        deltas: vec!["Partial an".into()],
        error: "connection reset".into(),
    }]);
    fx.session.load_model("tiny").await.unwrap();
    fx.session.send_message("tell me a story").await.unwrap();

    let snapshot = settle(&fx.session, |s| s.status == Status::Ready && s.last_error.is_some()).await;
    assert_eq!(snapshot.messages[1].content, "Partial an");
    let error = snapshot.last_error.unwrap();
    assert_eq!(error.kind, ErrorKind::Stream);
    assert!(error.message.contains("connection reset"));

    fx.session.clear_error().await.unwrap();
    settle(&fx.session, |s| s.last_error.is_none()).await;
}

#[tokio::test]
async fn refused_request_reports_a_stream_error_and_stays_usable() {
    let fx = start(vec![Script::Refuse("model busy".into()), Script::reply(["Back again."])]);
    fx.session.load_model("tiny").await.unwrap();
    fx.session.send_message("hello").await.unwrap();

    let snapshot = settle(&fx.session, |s| s.status == Status::Ready && s.last_error.is_some()).await;
    let error = snapshot.last_error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::Stream);
    assert!(error.message.contains("model busy"));
    // Nothing was streamed, so only the user message remains
    let roles: Vec<Role> = snapshot.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, [Role::User]);
    assert!(snapshot.open_assistant_id.is_none());

    fx.session.send_message("still there?").await.unwrap();
    settle(&fx.session, |s| answered(s, "Back again.")).await;
    fx.session.shutdown().await.unwrap();
}

#[tokio::test]
async fn envelope_after_prose_about_the_syntax_is_detected() {
    let fx = start(vec![
        Script::reply([
            "The syntax is [TOOL_CALL: id]. ".to_string(),
            format!("Calling now: {}", envelope("echo", json!({"text": "hi"}))),
        ]),
        Script::reply(["Done."]),
    ]);
    fx.session.load_model("tiny").await.unwrap();
    fx.session.send_message("how do tools work?").await.unwrap();

    let waiting = settle(&fx.session, |s| s.status == Status::WaitingForToolApproval).await;
    let pending = waiting.pending_tool_call.clone().unwrap();
    assert_eq!(pending.tool_call.name, "echo");
    assert_eq!(waiting.messages[1].content, "The syntax is [TOOL_CALL: id]. Calling now: ");
    assert!(waiting.stream_buffer.is_none());

    fx.session.approve(pending.request_id).await.unwrap();
    let snapshot = settle(&fx.session, |s| answered(s, "Done.")).await;
    assert_eq!(tool_messages(&snapshot)[0].content, "hi");
}

#[tokio::test]
async fn interrupt_while_streaming_keeps_committed_text() {
    let fx = start(vec![Script::Hang(vec!["Once upon".into()])]);
    fx.session.load_model("tiny").await.unwrap();
    fx.session.send_message("tell me a story").await.unwrap();

    settle(&fx.session, |s| s.messages.iter().any(|m| m.content == "Once upon")).await;
    fx.session.interrupt().await.unwrap();

    let snapshot = settle(&fx.session, |s| s.status == Status::Ready).await;
    assert_eq!(snapshot.messages[1].content, "Once upon");
    assert!(snapshot.open_assistant_id.is_none());
    assert!(snapshot.last_error.is_none());
}

#[tokio::test]
async fn failed_load_can_be_retried_and_keeps_the_queue() {
    let fx = start_with(
        vec![Script::reply(["hello"])],
        toolchat_tools::default_registry(),
        1,
        Arc::new(EventBus::default()),
    );
    fx.session.load_model("tiny").await.unwrap();
    let failed = settle(&fx.session, |s| s.status == Status::LoadFailed).await;
    assert_eq!(failed.last_error.map(|e| e.kind), Some(ErrorKind::ModelLoad));

    fx.session.send_message("hi").await.unwrap();
    settle(&fx.session, |s| s.queued_messages.len() == 1).await;

    fx.session.load_model("tiny").await.unwrap();
    let snapshot = settle(&fx.session, |s| answered(s, "hello")).await;
    assert!(snapshot.queued_messages.is_empty());
    assert_eq!(fx.loader.loads(), 2);
}

#[tokio::test]
async fn messages_sent_while_busy_keep_their_order() {
    let fx = start(vec![Script::reply(["one"]), Script::reply(["two"])]);
    fx.session.load_model("tiny").await.unwrap();
    fx.session.send_message("first").await.unwrap();
    fx.session.send_message("second").await.unwrap();

    let snapshot = settle(&fx.session, |s| {
        s.status == Status::Ready
            && s.queued_messages.is_empty()
            && s.messages.iter().filter(|m| m.role == Role::User).count() == 2
            && s.messages.last().is_some_and(|m| m.role == Role::Assistant)
    })
    .await;

    let users: Vec<&str> = snapshot
        .messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(users, ["first", "second"]);
}

#[tokio::test]
async fn domain_events_follow_the_lifecycle() {
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    let fx = start_with(
        vec![Script::reply([envelope("echo", json!({"text": "hi"}))]), Script::reply(["done"])],
        toolchat_tools::default_registry(),
        0,
        bus,
    );
    fx.session.load_model("tiny").await.unwrap();
    fx.session.send_message("echo hi").await.unwrap();
    let waiting = settle(&fx.session, |s| s.status == Status::WaitingForToolApproval).await;
    fx.session.approve(waiting.pending_tool_call.unwrap().request_id).await.unwrap();
    settle(&fx.session, |s| answered(s, "done")).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(e.as_ref(), DomainEvent::ModelLoaded { model, .. } if model == "tiny")));
    assert!(seen.iter().any(|e| matches!(e.as_ref(), DomainEvent::ToolCallDetected { tool_name, .. } if tool_name == "echo")));
    assert!(seen.iter().any(|e| matches!(e.as_ref(), DomainEvent::ToolExecuted { success: true, .. })));
    assert!(seen.iter().any(|e| matches!(
        e.as_ref(),
        DomainEvent::StatusChanged { to, .. } if to == "waiting_for_tool_approval"
    )));
}

#[tokio::test]
async fn shutdown_unloads_the_engine() {
    let fx = start(vec![Script::reply(["pong"])]);
    fx.session.load_model("tiny").await.unwrap();
    fx.session.send_message("ping").await.unwrap();
    settle(&fx.session, |s| answered(s, "pong")).await;

    assert!(!fx.engine.is_unloaded());
    fx.session.shutdown().await.unwrap();
    assert!(fx.engine.is_unloaded());
}
