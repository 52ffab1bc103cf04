//! Integration tests for PicoClaw
//!
//! These tests verify that the components work together: the bus, the agent
//! tool loop, session persistence, commands, consolidation and context
//! assembly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use picoclaw::agent::{AgentLoop, ContextBuilder, MemoryConsolidator, NEW_SESSION_REPLY};
use picoclaw::bus::{handler, Bus, InboundMessage, MessageBus, OutboundMessage};
use picoclaw::config::Config;
use picoclaw::error::{PicoError, Result};
use picoclaw::memory::MemoryStore;
use picoclaw::providers::{ChatOptions, LLMProvider, LLMResponse, LLMToolCall, ToolDefinition};
use picoclaw::session::{Message, Role, SessionManager};
use picoclaw::tools::{Tool, ToolContext};

// ============================================================================
// Mocks
// ============================================================================

/// Replays a fixed list of responses, then answers "default".
struct ScriptedProvider {
    replies: Mutex<Vec<LLMResponse>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    fn new(mut replies: Vec<LLMResponse>) -> Arc<Self> {
        replies.reverse();
        Arc::new(Self {
            replies: Mutex::new(replies),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn chat(
        &self,
        messages: Vec<Message>,
        _tools: Vec<ToolDefinition>,
        _model: Option<&str>,
        _options: ChatOptions,
    ) -> Result<LLMResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages);
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| LLMResponse::text("default")))
    }
}

/// A tool that always fails.
struct BrokenTool;

#[async_trait]
impl Tool for BrokenTool {
    fn name(&self) -> &str {
        "broken"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
        Err(PicoError::ToolExecution("disk on fire".into()))
    }
}

fn config_in(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.agents.defaults.workspace = dir.path().join("workspace").to_string_lossy().to_string();
    config
}

fn sessions_in(dir: &TempDir) -> SessionManager {
    SessionManager::with_path(dir.path().join("sessions"), 16).unwrap()
}

fn agent_with(dir: &TempDir, provider: Arc<ScriptedProvider>) -> AgentLoop {
    AgentLoop::new(
        config_in(dir),
        provider,
        sessions_in(dir),
        Arc::new(MessageBus::new()),
    )
}

// ============================================================================
// Message Bus
// ============================================================================

#[tokio::test]
async fn test_message_bus_roundtrip() {
    let bus = MessageBus::new();

    let inbound = InboundMessage::new("telegram", "user123", "chat456", "Hello bot!");
    bus.publish_inbound(inbound).await.unwrap();

    let received = bus.consume_inbound().await.unwrap();
    assert_eq!(received.content, "Hello bot!");
    assert_eq!(received.session_key, "telegram:chat456");

    bus.publish_outbound(OutboundMessage::reply_to(&received, "Hello human!"))
        .await
        .unwrap();
    let response = bus.consume_outbound().await.unwrap();
    assert_eq!(response.channel, "telegram");
    assert_eq!(response.chat_id, "chat456");
    assert_eq!(response.content, "Hello human!");
}

#[tokio::test]
async fn test_outbound_subscribers_only_see_their_channel() {
    let bus = MessageBus::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    bus.subscribe_outbound(
        "cli",
        handler(move |msg: OutboundMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg.content);
                Ok(())
            }
        }),
    )
    .await;

    bus.publish_outbound(OutboundMessage::new("slack", "c1", "not for cli"))
        .await
        .unwrap();
    bus.publish_outbound(OutboundMessage::new("cli", "direct", "for cli"))
        .await
        .unwrap();

    let got = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, "for cli");
}

// ============================================================================
// Tool loop
// ============================================================================

#[tokio::test]
async fn test_tool_results_recorded_in_call_order_when_one_fails() {
    let dir = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(vec![
        LLMResponse::with_tools(
            "",
            vec![
                LLMToolCall::new("call_1", "echo", r#"{"message": "first"}"#),
                LLMToolCall::new("call_2", "broken", "{}"),
                LLMToolCall::new("call_3", "no_such_tool", "{}"),
            ],
        ),
        LLMResponse::text("Handled both."),
    ]);
    let agent = agent_with(&dir, provider.clone());
    agent.register_tool(Box::new(BrokenTool)).await;

    let reply = agent.process_direct("do things", "cli:tools").await.unwrap();
    assert_eq!(reply, "Handled both.");
    assert_eq!(provider.calls(), 2);

    let session = agent.sessions().get_or_create("cli:tools").await.unwrap();
    let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            Role::User,
            Role::Assistant,
            Role::Tool,
            Role::Tool,
            Role::Tool,
            Role::Assistant
        ]
    );
    let results: Vec<&Message> = session.messages.iter().filter(|m| m.role == Role::Tool).collect();
    assert_eq!(results[0].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(results[0].content, "first");
    assert_eq!(results[1].tool_call_id.as_deref(), Some("call_2"));
    assert!(results[1].content.starts_with("Error [tool_execution_error]"));
    assert!(results[1].content.contains("disk on fire"));
    assert_eq!(results[2].tool_call_id.as_deref(), Some("call_3"));
    assert!(results[2].content.starts_with("Error [unknown_tool]"));

    // The second call sees the whole batch.
    let seen = provider.seen.lock().unwrap();
    let second = &seen[1];
    assert_eq!(second.iter().filter(|m| m.role == Role::Tool).count(), 3);
}

// ============================================================================
// Sessions and commands
// ============================================================================

#[tokio::test]
async fn test_session_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let agent = agent_with(&dir, ScriptedProvider::new(vec![LLMResponse::text("hi there")]));
        agent.process_direct("hello", "telegram:42").await.unwrap();
        agent.shutdown().await;
    }

    let sessions = sessions_in(&dir);
    let session = sessions.get_or_create("telegram:42").await.unwrap();
    assert_eq!(session.message_count(), 2);
    assert_eq!(session.messages[0].content, "hello");
    assert_eq!(session.messages[1].content, "hi there");
    assert!(sessions.list().await.unwrap().contains(&"telegram:42".to_string()));
}

#[tokio::test]
async fn test_new_command_archives_and_clears() {
    let dir = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(vec![LLMResponse::text("first answer")]);
    let agent = agent_with(&dir, provider.clone());

    agent.process_direct("remember this", "cli:chat").await.unwrap();
    let reply = agent.process_direct("/new", "cli:chat").await.unwrap();
    assert_eq!(reply, NEW_SESSION_REPLY);

    let session = agent.sessions().get_or_create("cli:chat").await.unwrap();
    assert!(session.is_empty());
    assert_eq!(session.consolidated_count, 0);

    let archived: Vec<_> = std::fs::read_dir(dir.path().join("sessions").join("archive"))
        .unwrap()
        .collect();
    assert_eq!(archived.len(), 1);

    // One turn plus the background consolidation of the pre-clear history.
    agent.shutdown().await;
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn test_system_message_skips_commands() {
    let dir = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(vec![LLMResponse::text("model saw it")]);
    let agent = agent_with(&dir, provider.clone());

    let msg = InboundMessage::system("cli", "chat", "subagent", "/help");
    let reply = agent.process_message(&msg).await.unwrap();
    assert_eq!(reply, "model saw it");
    assert_eq!(provider.calls(), 1);
}

// ============================================================================
// Memory consolidation
// ============================================================================

#[tokio::test]
async fn test_consolidation_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(vec![LLMResponse::text(
        r#"{"history_entry": "User said hello.", "memory_update": "- Prefers short answers"}"#,
    )]);
    let sessions = sessions_in(&dir);
    let memory = MemoryStore::new(&dir.path().join("workspace"));
    let consolidator = MemoryConsolidator::new(provider.clone(), sessions.clone(), memory.clone());

    sessions
        .append_many(
            "cli:mem",
            vec![Message::user("hello"), Message::assistant("hi")],
        )
        .await
        .unwrap();

    assert!(consolidator.consolidate("cli:mem").await.unwrap());
    assert!(!consolidator.consolidate("cli:mem").await.unwrap());
    assert_eq!(provider.calls(), 1);

    let session = sessions.get_or_create("cli:mem").await.unwrap();
    assert_eq!(session.consolidated_count, 2);
    assert_eq!(session.unconsolidated_count(), 0);
    assert_eq!(
        memory.read_long_term().await.unwrap(),
        "- Prefers short answers"
    );

    // The mark survives a reload from disk.
    let reloaded = sessions_in(&dir).get_or_create("cli:mem").await.unwrap();
    assert_eq!(reloaded.consolidated_count, 2);
}

// ============================================================================
// Context assembly
// ============================================================================

#[tokio::test]
async fn test_context_includes_bootstrap_memory_and_skills() {
    let dir = TempDir::new().unwrap();
    let ws = dir.path().join("workspace");
    std::fs::create_dir_all(ws.join("skills").join("weather")).unwrap();
    std::fs::write(ws.join("AGENTS.md"), "Be concise.").unwrap();
    std::fs::write(
        ws.join("skills").join("weather").join("SKILL.md"),
        "---\nname: weather\ndescription: Look up forecasts\n---\n# Weather\nUse wttr.in",
    )
    .unwrap();
    let memory = MemoryStore::new(&ws);
    memory.write_long_term("User lives in Lisbon.").await.unwrap();

    let builder = ContextBuilder::new(&ws);
    let messages = builder.build_messages(vec![Message::user("earlier")], "what's the weather?");

    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].role, Role::System);
    let system = &messages[0].content;
    assert!(system.contains("Be concise."));
    assert!(system.contains("User lives in Lisbon."));
    assert!(system.contains("<name>weather</name>"));
    assert_eq!(messages[2].content, "what's the weather?");
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_file_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{"agents": {"defaults": {"model": "local", "max_tool_iterations": 3}},
            "subagents": {"max_concurrent": 2},
            "bus": {"port": 19000}}"#,
    )
    .unwrap();

    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.agents.defaults.model, "local");
    assert_eq!(config.agents.defaults.max_tool_iterations, 3);
    assert_eq!(config.subagents.max_concurrent, 2);
    assert_eq!(config.bus.port, 19000);

    let missing = Config::load_from_path(&dir.path().join("absent.json")).unwrap();
    assert_eq!(missing.bus.buffer_size, 100);
}
