//! Agent loop implementation
//!
//! This module provides the core agent loop that processes messages,
//! calls LLM providers, executes tools and keeps the context bounded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::bus::{Bus, InboundMessage, OutboundMessage};
use crate::config::Config;
use crate::error::{PicoError, Result};
use crate::memory::MemoryStore;
use crate::providers::{chat_with_timeout, ChatOptions, LLMProvider, LLMResponse};
use crate::session::{Message, SessionManager};
use crate::tools::{
    base_tools, render_tool_result, MessageTool, SpawnTool, Tool, ToolContext, ToolRegistry,
};

use super::compaction::{build_summary_request, plan_compaction, should_compact};
use super::consolidation::{should_consolidate, MemoryConsolidator};
use super::context::{ContextBuilder, RuntimeContext};
use super::subagent::{AgentSubagentRunner, SubagentManager};

/// Reply to `/new`.
pub const NEW_SESSION_REPLY: &str = "New session started.";

/// Reply to `/help`.
pub const HELP_REPLY: &str = "picoclaw commands:\n/new - Start a new conversation\n/help - Show available commands";

/// Reply when the tool loop hits `max_tool_iterations` without an answer.
pub const ITERATION_LIMIT_REPLY: &str =
    "I could not complete this request within the allowed number of steps.";

/// Reply when the provider fails or times out.
pub const PROVIDER_ERROR_REPLY: &str =
    "Sorry, I ran into a problem talking to the language model. Please try again in a moment.";

const EMPTY_REPLY: &str = "I've completed processing but have no response to give.";

type Lane = mpsc::UnboundedSender<(InboundMessage, OwnedSemaphorePermit)>;

/// Working state of one turn. Never persisted.
#[derive(Debug, Default)]
struct AgentTurn {
    /// Session history including messages added by this turn
    history: Vec<Message>,
    iteration: usize,
    tools_used: Vec<String>,
    /// Last non-empty text the model sent alongside tool calls
    partial: Option<String>,
}

/// The main agent loop that processes messages and coordinates with LLM providers.
///
/// The `AgentLoop` is responsible for:
/// - Receiving messages from the bus, one FIFO lane per session
/// - Handling `/new` and `/help` without calling the model
/// - Driving the bounded tool-calling loop with compaction before each call
/// - Scheduling memory consolidation in the background
/// - Publishing exactly one reply per inbound message
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use picoclaw::agent::AgentLoop;
/// use picoclaw::bus::MessageBus;
/// use picoclaw::config::Config;
/// use picoclaw::session::SessionManager;
///
/// let bus = Arc::new(MessageBus::new());
/// let agent = Arc::new(AgentLoop::new(Config::default(), provider, SessionManager::new_memory(), bus));
///
/// tokio::spawn(agent.clone().start());
/// // ...
/// agent.shutdown().await;
/// ```
pub struct AgentLoop {
    config: Config,
    provider: Arc<dyn LLMProvider>,
    sessions: SessionManager,
    bus: Arc<dyn Bus>,
    tools: Arc<RwLock<ToolRegistry>>,
    context: ContextBuilder,
    memory: MemoryStore,
    consolidator: MemoryConsolidator,
    subagents: Arc<SubagentManager>,
    /// Per-session locks: at most one turn per key
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Per-session FIFO queues feeding the turn workers
    lanes: Mutex<HashMap<String, Lane>>,
    /// Bounds messages taken off the bus but not yet answered
    in_flight: Arc<Semaphore>,
    turns: TaskTracker,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl AgentLoop {
    /// Create an agent loop with the default tool set.
    ///
    /// Registers `echo`, `read_file`, `list_dir`, `message` and `spawn`. The
    /// subagent manager uses the same provider with the base tools only.
    pub fn new(
        config: Config,
        provider: Arc<dyn LLMProvider>,
        sessions: SessionManager,
        bus: Arc<dyn Bus>,
    ) -> Self {
        let workspace = config.workspace_path();
        let defaults = &config.agents.defaults;

        let runner = AgentSubagentRunner::new(Arc::clone(&provider), &workspace.to_string_lossy())
            .with_model(&defaults.model)
            .with_max_iterations(config.subagents.max_tool_iterations as usize)
            .with_options(chat_options(&config))
            .with_timeout(provider_timeout(&config));
        let subagents = Arc::new(SubagentManager::new(
            Arc::new(runner),
            Arc::clone(&bus),
            config.subagents.max_concurrent,
        ));

        let mut tools = base_tools();
        tools.register(Box::new(MessageTool::new(Arc::clone(&bus))));
        tools.register(Box::new(SpawnTool::new(Arc::clone(&subagents))));

        let context = ContextBuilder::new(&workspace)
            .with_memory_days(defaults.memory_days)
            .with_always_skills(config.skills.always_load.clone());
        let memory = MemoryStore::new(&workspace);
        let consolidator =
            MemoryConsolidator::new(Arc::clone(&provider), sessions.clone(), memory.clone())
                .with_model(&defaults.model)
                .with_timeout(provider_timeout(&config));
        let in_flight = Arc::new(Semaphore::new(config.bus.buffer_size.max(1)));

        Self {
            config,
            provider,
            sessions,
            bus,
            tools: Arc::new(RwLock::new(tools)),
            context,
            memory,
            consolidator,
            subagents,
            session_locks: Mutex::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
            in_flight,
            turns: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Replace the context builder.
    pub fn with_context_builder(mut self, context: ContextBuilder) -> Self {
        self.context = context;
        self
    }

    /// Replace the subagent manager and re-register `spawn` against it.
    pub fn with_subagents(mut self, subagents: Arc<SubagentManager>) -> Self {
        self.tools
            .try_write()
            .map(|mut tools| tools.register(Box::new(SpawnTool::new(Arc::clone(&subagents)))))
            .ok();
        self.subagents = subagents;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register (or replace) a tool.
    pub async fn register_tool(&self, tool: Box<dyn Tool>) {
        self.tools.write().await.register(tool);
    }

    pub async fn tool_count(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn has_tool(&self, name: &str) -> bool {
        self.tools.read().await.has(name)
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subagents(&self) -> &Arc<SubagentManager> {
        &self.subagents
    }

    pub fn consolidator(&self) -> &MemoryConsolidator {
        &self.consolidator
    }

    /// Process one inbound message and return the reply text.
    ///
    /// Provider failures end the turn with an apologetic reply rather than an
    /// error; `Err` is returned only when the session cannot be loaded.
    pub async fn process_message(&self, msg: &InboundMessage) -> Result<String> {
        let session_lock = {
            let mut locks = self.session_locks.lock().await;
            locks
                .entry(msg.session_key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _session_guard = session_lock.lock().await;

        if !msg.is_system() {
            match msg.content.trim() {
                "/new" => return self.start_new_session(&msg.session_key).await,
                "/help" => return Ok(HELP_REPLY.to_string()),
                _ => {}
            }
        }

        let reply = self.run_turn(msg).await?;
        self.maybe_consolidate(&msg.session_key).await;
        Ok(reply)
    }

    /// Run a turn without the bus and return the reply.
    ///
    /// `session_key` is used verbatim. Its channel and chat parts are taken
    /// from `channel:chat_id`; a key without a colon is treated as a `cli` chat.
    pub async fn process_direct(&self, content: &str, session_key: &str) -> Result<String> {
        let (channel, chat_id) = session_key.split_once(':').unwrap_or(("cli", session_key));
        let mut msg = InboundMessage::new(channel, "user", chat_id, content);
        msg.session_key = session_key.to_string();
        self.process_message(&msg).await
    }

    /// Consume the bus until [`stop`](Self::stop) is called or the bus closes.
    ///
    /// Messages of one session are handled in order; different sessions run
    /// concurrently.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PicoError::Config("Agent loop already running".into()));
        }
        info!(transport = self.bus.transport(), "Starting agent loop");

        let reaper = self.subagents.start_reaper(
            Duration::from_millis(self.config.subagents.reap_interval_ms.max(1)),
            self.shutdown.child_token(),
        );

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.in_flight).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = self.bus.consume_inbound() => msg,
            };
            let Some(msg) = msg else {
                info!("Inbound channel closed");
                break;
            };
            self.dispatch(msg, permit).await;
        }

        reaper.abort();
        self.running.store(false, Ordering::SeqCst);
        info!("Agent loop stopped");
        Ok(())
    }

    /// Signal [`start`](Self::start) to return. Turns in progress keep running.
    pub fn stop(&self) {
        info!("Stopping agent loop");
        self.shutdown.cancel();
    }

    /// Stop, wait for running turns, subagent deliveries and consolidation
    /// jobs, then flush sessions.
    pub async fn shutdown(&self) {
        self.stop();
        self.turns.close();
        self.turns.wait().await;
        self.subagents.drain().await;
        self.consolidator.drain().await;
        if let Err(e) = self.sessions.flush_all().await {
            warn!(error = %e, "Failed to flush sessions on shutdown");
        }
        info!("Agent loop shut down");
    }

    // ------------------------------------------------------------------------

    async fn dispatch(self: &Arc<Self>, msg: InboundMessage, permit: OwnedSemaphorePermit) {
        let key = msg.session_key.clone();
        let mut lanes = self.lanes.lock().await;
        let mut item = (msg, permit);
        if let Some(lane) = lanes.get(&key) {
            match lane.send(item) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => item = returned,
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(item).is_err() {
            warn!(session = %key, "Failed to queue inbound message");
            return;
        }
        lanes.insert(key.clone(), tx);
        drop(lanes);

        let agent = Arc::clone(self);
        self.turns.spawn(async move { agent.run_lane(key, rx).await });
    }

    /// Drain one session's queue, then retire the lane.
    async fn run_lane(
        self: Arc<Self>,
        key: String,
        mut rx: mpsc::UnboundedReceiver<(InboundMessage, OwnedSemaphorePermit)>,
    ) {
        loop {
            let next = match rx.try_recv() {
                Ok(item) => Some(item),
                Err(_) => {
                    // Emptiness is rechecked under the lanes lock, which
                    // dispatch holds while sending.
                    let mut lanes = self.lanes.lock().await;
                    match rx.try_recv() {
                        Ok(item) => Some(item),
                        Err(_) => {
                            lanes.remove(&key);
                            None
                        }
                    }
                }
            };
            let Some((msg, _permit)) = next else {
                break;
            };
            self.handle_inbound(msg).await;
        }
    }

    async fn handle_inbound(&self, msg: InboundMessage) {
        let request_id = uuid::Uuid::new_v4();
        let span = info_span!(
            "request",
            request_id = %request_id,
            session = %msg.session_key,
            channel = %msg.channel,
        );
        async {
            info!(sender = %msg.sender_id, system = msg.is_system(), "Processing message");
            let start = Instant::now();
            let reply = match self.process_message(&msg).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!(error = %e, "Request failed");
                    format!("Sorry, I encountered an error: {}", e)
                }
            };
            info!(
                latency_ms = start.elapsed().as_millis() as u64,
                response_len = reply.len(),
                "Request completed"
            );
            if let Err(e) = self.bus.publish_outbound(OutboundMessage::reply_to(&msg, &reply)).await {
                error!(error = %e, "Failed to publish outbound message");
            }
        }
        .instrument(span)
        .await
    }

    async fn start_new_session(&self, key: &str) -> Result<String> {
        let session = self.sessions.get_or_create(key).await?;

        match self.sessions.archive(key).await {
            Ok(Some(path)) => info!(session = %key, path = %path.display(), "Session archived"),
            Ok(None) => {}
            Err(e) => warn!(session = %key, error = %e, "Failed to archive session"),
        }
        self.subagents.cancel_session(key).await;
        self.consolidator.schedule_snapshot(session);

        if let Err(e) = self.sessions.clear(key).await {
            warn!(session = %key, error = %e, "Failed to persist session clear");
        }
        info!(session = %key, "Started new session");
        Ok(NEW_SESSION_REPLY.to_string())
    }

    async fn run_turn(&self, msg: &InboundMessage) -> Result<String> {
        let key = msg.session_key.as_str();
        let session = self.sessions.get_or_create(key).await?;

        let workspace = self.config.workspace_path();
        let workspace_str = workspace.to_string_lossy();
        let tool_ctx = ToolContext::new()
            .with_channel(&msg.channel, &msg.chat_id)
            .with_workspace(&workspace_str);
        let tool_names: Vec<String> = {
            let tools = self.tools.read().await;
            tools.names().into_iter().map(str::to_string).collect()
        };
        let runtime = self
            .context
            .runtime()
            .with_channel(&msg.channel, &msg.chat_id)
            .with_tools(tool_names);

        let mut turn = AgentTurn {
            history: session.messages,
            ..Default::default()
        };
        self.record(key, &mut turn, vec![Message::user(&msg.content)])
            .await;

        let max_iterations = self.config.agents.defaults.max_tool_iterations as usize;
        let reply = loop {
            if turn.iteration >= max_iterations {
                info!(
                    iterations = turn.iteration,
                    "Tool loop reached maximum iterations"
                );
                let reply = turn
                    .partial
                    .clone()
                    .unwrap_or_else(|| ITERATION_LIMIT_REPLY.to_string());
                self.record(key, &mut turn, vec![Message::assistant(&reply)])
                    .await;
                break reply;
            }

            self.maybe_compact(key, &mut turn, &runtime).await;

            let response = match self.call_provider(&turn, &runtime).await {
                Ok(response) => response,
                Err(e) => {
                    error!(error = %e, iteration = turn.iteration, "Provider call failed");
                    break PROVIDER_ERROR_REPLY.to_string();
                }
            };
            turn.iteration += 1;

            if !response.has_tool_calls() {
                let reply = if response.content.trim().is_empty() {
                    EMPTY_REPLY.to_string()
                } else {
                    response.content.clone()
                };
                let final_msg =
                    Message::assistant(&reply).with_reasoning(response.reasoning_content.clone());
                self.record(key, &mut turn, vec![final_msg]).await;
                break reply;
            }

            debug!(
                iteration = turn.iteration,
                calls = response.tool_calls.len(),
                "Executing tool calls"
            );
            if !response.content.trim().is_empty() {
                turn.partial = Some(response.content.clone());
            }
            let batch = self.execute_tools(&response, &tool_ctx, &mut turn).await;
            self.record(key, &mut turn, batch).await;
        };

        info!(
            iterations = turn.iteration,
            tools_used = ?turn.tools_used,
            "Turn finished"
        );
        Ok(reply)
    }

    /// Assistant message with its tool calls, followed by one result per call in call order.
    async fn execute_tools(
        &self,
        response: &LLMResponse,
        ctx: &ToolContext,
        turn: &mut AgentTurn,
    ) -> Vec<Message> {
        let calls = response.session_tool_calls();
        let mut batch = Vec::with_capacity(calls.len() + 1);
        batch.push(
            Message::assistant_with_tools(&response.content, calls.clone())
                .with_reasoning(response.reasoning_content.clone()),
        );

        for call in calls {
            info!(tool = %call.name, id = %call.id, "Executing tool");
            let args: serde_json::Value = match serde_json::from_str(&call.arguments) {
                Ok(v) => v,
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Invalid JSON in tool arguments");
                    serde_json::json!({})
                }
            };
            let result = {
                let tools = self.tools.read().await;
                tools.execute_with_context(&call.name, args, ctx).await
            };
            turn.tools_used.push(call.name.clone());
            batch.push(Message::tool_result(&call.id, &render_tool_result(result)));
        }
        batch
    }

    async fn call_provider(&self, turn: &AgentTurn, runtime: &RuntimeContext) -> Result<LLMResponse> {
        let messages = self
            .context
            .build_messages_with(turn.history.clone(), "", runtime);
        let definitions = self.tools.read().await.definitions();
        self.chat_with_timeout(messages, definitions).await
    }

    async fn chat_with_timeout(
        &self,
        messages: Vec<Message>,
        tools: Vec<crate::providers::ToolDefinition>,
    ) -> Result<LLMResponse> {
        let model = Some(self.config.agents.defaults.model.as_str()).filter(|m| !m.is_empty());
        chat_with_timeout(
            self.provider.as_ref(),
            provider_timeout(&self.config),
            messages,
            tools,
            model,
            chat_options(&self.config),
        )
        .await
    }

    /// Fold old history into a summary when the prompt grows too large.
    ///
    /// Failures are logged and the turn continues with the full history.
    async fn maybe_compact(&self, key: &str, turn: &mut AgentTurn, runtime: &RuntimeContext) {
        let cfg = &self.config.compaction;
        if !cfg.enabled {
            return;
        }
        let working = self
            .context
            .build_messages_with(turn.history.clone(), "", runtime);
        if !should_compact(
            &working,
            turn.history.len(),
            cfg.context_window,
            cfg.threshold,
            self.config.agents.defaults.max_history,
        ) {
            return;
        }
        let Some(span) = plan_compaction(&turn.history, cfg.keep_recent) else {
            debug!("Compaction triggered but nothing to fold");
            return;
        };

        let request = build_summary_request(&turn.history[span.clone()]);
        let summary = match self.chat_with_timeout(request, vec![]).await {
            Ok(response) if !response.content.trim().is_empty() => response.content.trim().to_string(),
            Ok(_) => {
                let err = PicoError::CompactionFailure("empty summary".into());
                warn!(error = %err, "Compaction skipped");
                return;
            }
            Err(e) => {
                let err = PicoError::CompactionFailure(e.to_string());
                warn!(error = %err, "Compaction skipped");
                return;
            }
        };

        match self.sessions.compact(key, span.start, span.end, &summary).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(session = %key, "Compaction span no longer matches the session");
                return;
            }
            Err(e) => warn!(session = %key, error = %e, "Failed to persist compaction"),
        }
        match self.sessions.get_or_create(key).await {
            Ok(session) => turn.history = session.messages,
            Err(e) => {
                warn!(session = %key, error = %e, "Failed to reload compacted session");
                let folded = turn.history[span.clone()].iter().map(Message::weight).sum();
                turn.history
                    .splice(span.clone(), std::iter::once(Message::summary(&summary, folded)));
            }
        }
        info!(
            session = %key,
            folded = span.len(),
            remaining = turn.history.len(),
            "Compacted conversation history"
        );

        let note = format!("## Conversation summary ({})\n\n{}", key, summary);
        if let Err(e) = self.memory.append_today(&note).await {
            warn!(error = %e, "Failed to append summary to daily note");
        }
    }

    /// Persist messages and mirror them into the turn.
    ///
    /// A durability failure is logged; the turn keeps going.
    async fn record(&self, key: &str, turn: &mut AgentTurn, messages: Vec<Message>) {
        turn.history.extend(messages.iter().cloned());
        if let Err(e) = self.sessions.append_many(key, messages).await {
            warn!(session = %key, error = %e, "Failed to persist session messages");
        }
    }

    async fn maybe_consolidate(&self, key: &str) {
        let backlog = match self.sessions.get(key).await {
            Ok(Some(session)) => session.unconsolidated_count(),
            _ => return,
        };
        if should_consolidate(backlog, self.config.compaction.consolidate_after) {
            debug!(session = %key, backlog, "Scheduling memory consolidation");
            self.consolidator.schedule(key).await;
        }
    }
}

fn provider_timeout(config: &Config) -> Duration {
    Duration::from_secs(config.agents.defaults.agent_timeout_secs.max(1))
}

fn chat_options(config: &Config) -> ChatOptions {
    ChatOptions::new()
        .with_max_tokens(config.agents.defaults.max_tokens)
        .with_temperature(config.agents.defaults.temperature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::providers::{LLMToolCall, ToolDefinition};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct Scripted {
        replies: std::sync::Mutex<Vec<Result<LLMResponse>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(replies: Vec<Result<LLMResponse>>) -> Arc<Self> {
            let mut replies = replies;
            replies.reverse();
            Arc::new(Self {
                replies: std::sync::Mutex::new(replies),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LLMProvider for Scripted {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(LLMResponse::text("default")))
        }

        fn default_model(&self) -> &str {
            "scripted"
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn agent(dir: &TempDir, provider: Arc<Scripted>, tweak: impl FnOnce(&mut Config)) -> AgentLoop {
        let mut config = Config::default();
        config.agents.defaults.workspace = dir.path().join("ws").to_string_lossy().to_string();
        tweak(&mut config);
        let sessions = SessionManager::with_path(dir.path().join("sessions"), 8).unwrap();
        AgentLoop::new(config, provider, sessions, Arc::new(MessageBus::new()))
    }

    #[tokio::test]
    async fn test_default_tools_registered() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir, Scripted::new(vec![]), |_| {});
        for name in ["echo", "read_file", "list_dir", "message", "spawn"] {
            assert!(agent.has_tool(name).await, "missing {}", name);
        }
        assert_eq!(agent.tool_count().await, 5);
    }

    #[tokio::test]
    async fn test_simple_reply_is_recorded() {
        let dir = TempDir::new().unwrap();
        let provider = Scripted::new(vec![Ok(LLMResponse::text("hi there").with_reasoning("thinking"))]);
        let agent = agent(&dir, provider.clone(), |_| {});

        let reply = agent.process_direct("hello", "cli:1").await.unwrap();
        assert_eq!(reply, "hi there");

        let session = agent.sessions().get_or_create("cli:1").await.unwrap();
        assert_eq!(session.message_count(), 2);
        assert_eq!(session.messages[0].content, "hello");
        assert_eq!(session.messages[1].reasoning_content.as_deref(), Some("thinking"));
    }

    #[tokio::test]
    async fn test_help_skips_model() {
        let dir = TempDir::new().unwrap();
        let provider = Scripted::new(vec![]);
        let agent = agent(&dir, provider.clone(), |_| {});

        assert_eq!(agent.process_direct("  /help ", "cli:1").await.unwrap(), HELP_REPLY);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_system_message_skips_commands() {
        let dir = TempDir::new().unwrap();
        let provider = Scripted::new(vec![Ok(LLMResponse::text("handled"))]);
        let agent = agent(&dir, provider.clone(), |_| {});

        let msg = InboundMessage::system("cli", "1", "subagent", "/new");
        assert_eq!(agent.process_message(&msg).await.unwrap(), "handled");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provider_error_gives_apology() {
        let dir = TempDir::new().unwrap();
        let provider = Scripted::new(vec![Err(PicoError::Provider(
            crate::error::ProviderError::ServerError("down".into()),
        ))]);
        let agent = agent(&dir, provider, |_| {});

        let reply = agent.process_direct("hello", "cli:1").await.unwrap();
        assert_eq!(reply, PROVIDER_ERROR_REPLY);
    }

    #[tokio::test]
    async fn test_iteration_limit_uses_partial_content() {
        let dir = TempDir::new().unwrap();
        let call = || LLMToolCall::new("c", "echo", r#"{"message": "x"}"#);
        let provider = Scripted::new(vec![
            Ok(LLMResponse::with_tools("working on it", vec![call()])),
            Ok(LLMResponse::with_tools("", vec![call()])),
        ]);
        let agent = agent(&dir, provider.clone(), |c| c.agents.defaults.max_tool_iterations = 2);

        let reply = agent.process_direct("loop", "cli:1").await.unwrap();
        assert_eq!(reply, "working on it");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_iteration_limit_fallback() {
        let dir = TempDir::new().unwrap();
        let call = || LLMToolCall::new("c", "echo", "{}");
        let provider = Scripted::new(vec![Ok(LLMResponse::with_tools("", vec![call()]))]);
        let agent = agent(&dir, provider, |c| c.agents.defaults.max_tool_iterations = 1);

        let reply = agent.process_direct("loop", "cli:1").await.unwrap();
        assert_eq!(reply, ITERATION_LIMIT_REPLY);
    }

    #[tokio::test]
    async fn test_compaction_failure_does_not_fail_turn() {
        let dir = TempDir::new().unwrap();
        let provider = Scripted::new(vec![
            Err(PicoError::Provider(crate::error::ProviderError::Timeout("slow".into()))),
            Ok(LLMResponse::text("still here")),
        ]);
        let agent = agent(&dir, provider.clone(), |c| {
            c.agents.defaults.max_history = 3;
            c.compaction.keep_recent = 1;
        });
        for i in 0..4 {
            agent
                .sessions()
                .append("cli:1", Message::user(&format!("old {}", i)))
                .await
                .unwrap();
        }

        let reply = agent.process_direct("next", "cli:1").await.unwrap();
        assert_eq!(reply, "still here");
        let session = agent.sessions().get_or_create("cli:1").await.unwrap();
        assert_eq!(session.leading_summaries(), 0);
        assert_eq!(session.message_count(), 6);
    }
}
