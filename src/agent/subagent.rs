//! Background subagents.
//!
//! [`SubagentManager`] runs at most `max_concurrent` tasks at once and queues
//! the rest in FIFO order. A reaper pass, run on every spawn and on a
//! background interval, delivers finished results to the parent conversation
//! as synthetic `system` inbound messages and starts queued tasks in the
//! freed slots.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::bus::{Bus, InboundMessage};
use crate::error::Result;
use crate::providers::{chat_with_timeout, ChatOptions, LLMProvider};
use crate::session::Message;
use crate::tools::{base_tools, render_tool_result, ToolContext, ToolRegistry, SUBAGENT_EXCLUDED_TOOLS};

/// Sender id of delivered results.
pub const SUBAGENT_SENDER: &str = "subagent";

const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(120);

/// How long [`SubagentManager::drain`] waits for queued deliveries.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const SUBAGENT_PROMPT: &str = "You are a subagent spawned by the main agent to complete one task.\n\n\
Rules:\n\
1. Stay focused on the assigned task and nothing else.\n\
2. Your final response is reported back to the main agent.\n\
3. You cannot message the user or spawn further subagents.\n\
4. Be concise but informative.";

/// Lifecycle of a subagent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentState {
    Pending,
    Running,
    Done,
    Failed,
}

impl SubagentState {
    pub fn is_finished(self) -> bool {
        matches!(self, SubagentState::Done | SubagentState::Failed)
    }
}

impl fmt::Display for SubagentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubagentState::Pending => "pending",
            SubagentState::Running => "running",
            SubagentState::Done => "done",
            SubagentState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One spawned task, owned by the manager until its result is delivered.
#[derive(Debug, Clone)]
pub struct SubagentTask {
    pub id: String,
    pub label: String,
    pub parent_key: String,
    pub prompt: String,
    pub state: SubagentState,
    /// Final answer, or the error text when `Failed`
    pub result: Option<String>,
    /// Set by `cancel_session`; the result is dropped instead of delivered
    pub discarded: bool,
}

/// Executes a subagent prompt in isolation.
#[async_trait]
pub trait SubagentRunner: Send + Sync {
    async fn run(&self, task_id: &str, prompt: &str) -> Result<String>;
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, SubagentTask>,
    pending: VecDeque<String>,
    /// Finished task ids in completion order
    completed: VecDeque<String>,
    running: usize,
}

/// Bounded pool of background agents reporting back through the bus.
///
/// Cloning is cheap; clones share the same task table.
#[derive(Clone)]
pub struct SubagentManager {
    runner: Arc<dyn SubagentRunner>,
    bus: Arc<dyn Bus>,
    max_concurrent: usize,
    inner: Arc<Mutex<Inner>>,
    finished: Arc<Notify>,
    /// Results waiting for the delivery task, in reap order
    outbox: Arc<Mutex<Option<mpsc::UnboundedSender<SubagentTask>>>>,
    deliveries: TaskTracker,
}

impl SubagentManager {
    pub fn new(runner: Arc<dyn SubagentRunner>, bus: Arc<dyn Bus>, max_concurrent: usize) -> Self {
        Self {
            runner,
            bus,
            max_concurrent: max_concurrent.max(1),
            inner: Arc::new(Mutex::new(Inner::default())),
            finished: Arc::new(Notify::new()),
            outbox: Arc::new(Mutex::new(None)),
            deliveries: TaskTracker::new(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Queue `prompt` for the conversation `parent_key` and return the task id.
    pub async fn spawn(&self, prompt: &str, parent_key: &str) -> Result<String> {
        self.spawn_labeled(prompt, None, parent_key).await
    }

    pub async fn spawn_labeled(
        &self,
        prompt: &str,
        label: Option<&str>,
        parent_key: &str,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let label = label
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| short_label(prompt));

        {
            let mut inner = self.inner.lock().await;
            inner.tasks.insert(
                id.clone(),
                SubagentTask {
                    id: id.clone(),
                    label: label.clone(),
                    parent_key: parent_key.to_string(),
                    prompt: prompt.to_string(),
                    state: SubagentState::Pending,
                    result: None,
                    discarded: false,
                },
            );
            inner.pending.push_back(id.clone());
        }
        info!(task_id = %id, label = %label, parent = %parent_key, "Subagent queued");

        self.reap().await;
        Ok(id)
    }

    /// Deliver finished tasks, release their slots and start queued tasks.
    ///
    /// Returns the number of results handed to the bus.
    pub async fn reap(&self) -> usize {
        // Held until the results are queued so concurrent reaps keep order.
        let mut outbox = self.outbox.lock().await;
        let deliveries = {
            let mut inner = self.inner.lock().await;

            let finished: Vec<String> = inner.completed.drain(..).collect();
            let mut deliveries = Vec::new();
            for id in finished {
                if let Some(task) = inner.tasks.remove(&id) {
                    inner.running = inner.running.saturating_sub(1);
                    if task.discarded {
                        debug!(task_id = %id, "Discarding result of cancelled subagent");
                    } else {
                        deliveries.push(task);
                    }
                }
            }

            while inner.running < self.max_concurrent {
                let Some(id) = inner.pending.pop_front() else {
                    break;
                };
                let Some(task) = inner.tasks.get_mut(&id) else {
                    continue;
                };
                task.state = SubagentState::Running;
                let prompt = task.prompt.clone();
                inner.running += 1;
                self.start(id, prompt);
            }
            deliveries
        };

        let delivered = deliveries.len();
        if delivered > 0 {
            self.deliver(&mut outbox, deliveries);
        }
        delivered
    }

    /// Hand results to the delivery task, starting it on first use.
    ///
    /// One task publishes every result in order. Publishing may wait on a full
    /// inbound queue whose consumer is the caller of `reap`, so it never runs
    /// inline.
    fn deliver(
        &self,
        outbox: &mut Option<mpsc::UnboundedSender<SubagentTask>>,
        tasks: Vec<SubagentTask>,
    ) {
        if outbox.is_none() {
            if self.deliveries.is_closed() {
                warn!(count = tasks.len(), "Subagent manager drained, dropping results");
                return;
            }
            let (tx, mut rx) = mpsc::unbounded_channel::<SubagentTask>();
            let bus = Arc::clone(&self.bus);
            self.deliveries.spawn(async move {
                while let Some(task) = rx.recv().await {
                    if let Err(e) = bus.publish_inbound(result_message(&task)).await {
                        warn!(task_id = %task.id, error = %e, "Failed to deliver subagent result");
                    }
                }
            });
            *outbox = Some(tx);
        }
        if let Some(tx) = outbox.as_ref() {
            for task in tasks {
                if let Err(mpsc::error::SendError(task)) = tx.send(task) {
                    warn!(task_id = %task.id, "Subagent delivery task gone, dropping result");
                }
            }
        }
    }

    /// Stop accepting results and wait for queued deliveries to reach the bus.
    pub async fn drain(&self) {
        self.outbox.lock().await.take();
        self.deliveries.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.deliveries.wait())
            .await
            .is_err()
        {
            warn!("Timed out delivering subagent results");
        }
    }

    /// Run [`reap`](Self::reap) on `interval` and whenever a task finishes.
    pub fn start_reaper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = manager.finished.notified() => {}
                }
                manager.reap().await;
            }
            debug!("Subagent reaper stopped");
        })
    }

    /// Drop queued tasks of `parent_key` and discard results of its running ones.
    ///
    /// In-flight provider calls are not aborted. Returns the number of tasks affected.
    pub async fn cancel_session(&self, parent_key: &str) -> usize {
        let mut inner = self.inner.lock().await;
        let mut affected = 0;
        let mut dropped = Vec::new();
        for task in inner.tasks.values_mut() {
            if task.parent_key != parent_key || task.discarded {
                continue;
            }
            affected += 1;
            if task.state == SubagentState::Pending {
                dropped.push(task.id.clone());
            } else {
                task.discarded = true;
            }
        }
        for id in &dropped {
            inner.tasks.remove(id);
        }
        inner.pending.retain(|id| !dropped.contains(id));
        if affected > 0 {
            info!(parent = %parent_key, affected, "Cancelled subagents");
        }
        affected
    }

    /// State of a task that has not been delivered yet.
    pub async fn status(&self, task_id: &str) -> Option<SubagentState> {
        self.inner.lock().await.tasks.get(task_id).map(|t| t.state)
    }

    pub async fn task(&self, task_id: &str) -> Option<SubagentTask> {
        self.inner.lock().await.tasks.get(task_id).cloned()
    }

    pub async fn running_count(&self) -> usize {
        self.inner.lock().await.running
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    fn start(&self, id: String, prompt: String) {
        let runner = Arc::clone(&self.runner);
        let inner = Arc::clone(&self.inner);
        let finished = Arc::clone(&self.finished);
        tokio::spawn(async move {
            debug!(task_id = %id, "Subagent started");
            let outcome = runner.run(&id, &prompt).await;
            let mut inner = inner.lock().await;
            if let Some(task) = inner.tasks.get_mut(&id) {
                match outcome {
                    Ok(result) => {
                        info!(task_id = %id, "Subagent completed");
                        task.state = SubagentState::Done;
                        task.result = Some(result);
                    }
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "Subagent failed");
                        task.state = SubagentState::Failed;
                        task.result = Some(e.to_string());
                    }
                }
                inner.completed.push_back(id);
            }
            drop(inner);
            finished.notify_one();
        });
    }
}

fn short_label(prompt: &str) -> String {
    let trimmed = prompt.trim();
    match trimmed.char_indices().nth(30) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

fn result_message(task: &SubagentTask) -> InboundMessage {
    let (channel, chat_id) = task
        .parent_key
        .split_once(':')
        .unwrap_or(("cli", task.parent_key.as_str()));
    let result = task.result.as_deref().unwrap_or("");
    let content = match task.state {
        SubagentState::Failed => format!(
            "[Subagent '{}' failed]\n\nTask: {}\n\nError: {}\n\n\
             Tell the user briefly that this background task did not complete.",
            task.label, task.prompt, result
        ),
        _ => format!(
            "[Subagent '{}' completed]\n\nTask: {}\n\nResult:\n{}\n\n\
             Summarize this naturally for the user in 1-2 sentences.",
            task.label, task.prompt, result
        ),
    };
    InboundMessage::system(channel, chat_id, SUBAGENT_SENDER, &content)
}

/// Runs subagents with the configured provider and the restricted base tool set.
pub struct AgentSubagentRunner {
    provider: Arc<dyn LLMProvider>,
    tools: ToolRegistry,
    model: Option<String>,
    workspace: String,
    max_iterations: usize,
    options: ChatOptions,
    timeout: Duration,
}

impl AgentSubagentRunner {
    pub fn new(provider: Arc<dyn LLMProvider>, workspace: &str) -> Self {
        Self {
            provider,
            tools: base_tools(),
            model: None,
            workspace: workspace.to_string(),
            max_iterations: 15,
            options: ChatOptions::new(),
            timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    /// Bound each provider call. An expired call fails the task.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Names of the tools a subagent can call.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.names()
    }
}

#[async_trait]
impl SubagentRunner for AgentSubagentRunner {
    async fn run(&self, task_id: &str, prompt: &str) -> Result<String> {
        let ctx = ToolContext::new()
            .with_channel(SUBAGENT_SENDER, task_id)
            .with_workspace(&self.workspace);
        let definitions: Vec<_> = self
            .tools
            .definitions()
            .into_iter()
            .filter(|d| !SUBAGENT_EXCLUDED_TOOLS.contains(&d.name.as_str()))
            .collect();

        let mut messages = vec![
            Message::system(&format!("{}\n\nWorkspace: {}", SUBAGENT_PROMPT, self.workspace)),
            Message::user(prompt),
        ];

        for _ in 0..self.max_iterations {
            let response = chat_with_timeout(
                self.provider.as_ref(),
                self.timeout,
                messages.clone(),
                definitions.clone(),
                self.model.as_deref(),
                self.options.clone(),
            )
            .await?;

            if !response.has_tool_calls() {
                return Ok(response.content);
            }

            let calls = response.session_tool_calls();
            messages.push(
                Message::assistant_with_tools(&response.content, calls.clone())
                    .with_reasoning(response.reasoning_content.clone()),
            );
            for call in calls {
                let args = serde_json::from_str(&call.arguments)
                    .unwrap_or(serde_json::Value::Object(Default::default()));
                let result = if SUBAGENT_EXCLUDED_TOOLS.contains(&call.name.as_str()) {
                    Err(crate::error::PicoError::UnknownTool(call.name.clone()))
                } else {
                    self.tools.execute_with_context(&call.name, args, &ctx).await
                };
                messages.push(Message::tool_result(&call.id, &render_tool_result(result)));
            }
        }

        Ok("Task stopped after reaching the tool iteration limit.".to_string())
    }
}
