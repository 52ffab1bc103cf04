//! Background memory consolidation.
//!
//! Messages beyond a session's `consolidated_count` are folded into the
//! workspace memory by one provider call that returns
//! `{"history_entry": ..., "memory_update": ...}`. Jobs run on a
//! [`TaskTracker`] so shutdown can wait for them. They run one at a time, since
//! they all rewrite `MEMORY.md`, and at most one regular job per session key is
//! queued or running.
//!
//! A session cleared while its job is in flight keeps its new, empty mark:
//! the job only advances the mark of the clear generation it read.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{PicoError, Result};
use crate::memory::MemoryStore;
use crate::providers::{chat_with_timeout, ChatOptions, LLMProvider};
use crate::session::{Message, Role, Session, SessionManager};

const CONSOLIDATION_PROMPT: &str = "You are a memory consolidation agent. \
You receive the current long-term memory and a conversation fragment. \
Respond with only a JSON object with two string fields:\n\
- \"history_entry\": a short paragraph (2-5 sentences) recording what happened, \
for the daily log.\n\
- \"memory_update\": the full updated long-term memory in markdown. Keep every \
existing fact that is still true, add durable new facts about the user and their \
projects, and drop nothing else. Return the existing memory unchanged if nothing \
new is worth remembering.";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Parsed reply of the consolidation call.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConsolidationOutcome {
    pub history_entry: String,
    pub memory_update: String,
}

/// Folds session history into `MEMORY.md` and the daily notes.
#[derive(Clone)]
pub struct MemoryConsolidator {
    provider: Arc<dyn LLMProvider>,
    sessions: SessionManager,
    memory: MemoryStore,
    model: Option<String>,
    timeout: Duration,
    tracker: TaskTracker,
    in_flight: Arc<Mutex<HashSet<String>>>,
    /// Held for the whole of a job. Per key: clear generation and logical
    /// count of the last successful fold.
    folded: Arc<Mutex<HashMap<String, (u64, usize)>>>,
}

impl MemoryConsolidator {
    pub fn new(provider: Arc<dyn LLMProvider>, sessions: SessionManager, memory: MemoryStore) -> Self {
        Self {
            provider,
            sessions,
            memory,
            model: None,
            timeout: DEFAULT_TIMEOUT,
            tracker: TaskTracker::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            folded: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    /// Bound the consolidation call. An expired call fails the job.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Consolidate everything past the mark of `key` and advance the mark.
    ///
    /// The mark advances to the logical count read before the provider call,
    /// so messages appended meanwhile stay unconsolidated. If the session was
    /// cleared meanwhile the mark is left alone. Returns `Ok(false)` when
    /// there is nothing new.
    pub async fn consolidate(&self, key: &str) -> Result<bool> {
        let mut folded = self.folded.lock().await;
        let Some(session) = self.sessions.get(key).await? else {
            return Ok(false);
        };
        let target = session.logical_count();
        let pending = session
            .messages_after(session.consolidated_count.max(already_folded(&folded, &session)))
            .to_vec();
        if pending.is_empty() {
            return Ok(false);
        }

        self.fold(&pending).await?;
        // The ledger covers what the mark could not record, for a pending snapshot.
        folded.insert(key.to_string(), (session.epoch, target));
        if self
            .sessions
            .mark_consolidated_in(key, session.epoch, target)
            .await?
        {
            folded.remove(key);
            info!(session = %key, consolidated = target, "Memory consolidated");
        } else {
            debug!(session = %key, "Memory consolidated, mark unchanged");
        }
        Ok(true)
    }

    /// Fold what `session`, captured before a clear, had not consolidated.
    ///
    /// Messages a job folded from the same clear generation are skipped.
    pub async fn consolidate_snapshot(&self, session: &Session) -> Result<bool> {
        let mut folded = self.folded.lock().await;
        let done = already_folded(&folded, session);
        if done > 0 {
            folded.remove(&session.key);
        }
        let pending = session
            .messages_after(session.consolidated_count.max(done))
            .to_vec();
        if pending.is_empty() {
            return Ok(false);
        }

        self.fold(&pending).await?;
        info!(session = %session.key, messages = pending.len(), "Snapshot consolidated");
        Ok(true)
    }

    /// Schedule [`consolidate`](Self::consolidate) in the background.
    ///
    /// Returns false if a job for `key` is already queued or running, or the
    /// tracker is closed.
    pub async fn schedule(&self, key: &str) -> bool {
        if !self.claim(key).await {
            return false;
        }
        let this = self.clone();
        let key = key.to_string();
        self.tracker.spawn(async move {
            if let Err(e) = this.consolidate(&key).await {
                warn!(session = %key, error = %e, "Memory consolidation failed");
            }
            this.in_flight.lock().await.remove(&key);
        });
        true
    }

    /// Schedule [`consolidate_snapshot`](Self::consolidate_snapshot) in the
    /// background, after any job already running.
    ///
    /// Returns false only if the tracker is closed or `session` has nothing
    /// unconsolidated.
    pub fn schedule_snapshot(&self, session: Session) -> bool {
        if self.tracker.is_closed() || session.unconsolidated_count() == 0 {
            return false;
        }
        let this = self.clone();
        self.tracker.spawn(async move {
            if let Err(e) = this.consolidate_snapshot(&session).await {
                warn!(session = %session.key, error = %e, "Snapshot consolidation failed");
            }
        });
        true
    }

    pub async fn is_running(&self, key: &str) -> bool {
        self.in_flight.lock().await.contains(key)
    }

    /// Stop accepting jobs and wait for the running ones.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn claim(&self, key: &str) -> bool {
        if self.tracker.is_closed() {
            return false;
        }
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.contains(key) {
            debug!(session = %key, "Consolidation already in flight");
            return false;
        }
        in_flight.insert(key.to_string());
        true
    }

    async fn fold(&self, messages: &[Message]) -> Result<()> {
        let current = self.memory.read_long_term().await?;
        let request = vec![
            Message::system(CONSOLIDATION_PROMPT),
            Message::user(&format!(
                "## Current Long-term Memory\n{}\n\n## Conversation to Process\n{}",
                if current.trim().is_empty() { "(empty)" } else { current.as_str() },
                render_transcript(messages)
            )),
        ];

        let response = chat_with_timeout(
            self.provider.as_ref(),
            self.timeout,
            request,
            vec![],
            self.model.as_deref(),
            ChatOptions::new(),
        )
        .await
        .map_err(|e| PicoError::ConsolidationFailure(e.to_string()))?;
        let outcome = parse_outcome(&response.content)?;

        self.memory.append_today(&outcome.history_entry).await?;
        let update = outcome.memory_update.trim();
        if !update.is_empty() && update != current.trim() {
            self.memory.write_long_term(update).await?;
        }
        Ok(())
    }
}

/// Logical count a previous job folded from the same clear generation.
fn already_folded(folded: &HashMap<String, (u64, usize)>, session: &Session) -> usize {
    match folded.get(&session.key) {
        Some(&(epoch, count)) if epoch == session.epoch => count,
        _ => 0,
    }
}

/// Whether a session's backlog is large enough to consolidate.
pub fn should_consolidate(unconsolidated: usize, consolidate_after: usize) -> bool {
    consolidate_after > 0 && unconsolidated >= consolidate_after
}

/// Parse the provider reply, tolerating a surrounding markdown code fence.
pub fn parse_outcome(text: &str) -> Result<ConsolidationOutcome> {
    let trimmed = text.trim();
    let body = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(PicoError::ConsolidationFailure(
                "response contained no JSON object".to_string(),
            ))
        }
    };
    serde_json::from_str(body).map_err(|e| PicoError::ConsolidationFailure(e.to_string()))
}

fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .filter(|m| m.role != Role::Tool)
        .map(|m| format!("{}: {}", m.role.to_string().to_uppercase(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{LLMResponse, ToolDefinition};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct ScriptedProvider {
        reply: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LLMResponse::text(&self.reply))
        }

        fn default_model(&self) -> &str {
            "scripted"
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn setup(reply: &str) -> (TempDir, Arc<ScriptedProvider>, SessionManager, MemoryConsolidator) {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
        });
        let sessions = SessionManager::with_path(dir.path().join("sessions"), 8).unwrap();
        let memory = MemoryStore::new(dir.path());
        let consolidator = MemoryConsolidator::new(provider.clone(), sessions.clone(), memory);
        (dir, provider, sessions, consolidator)
    }

    #[test]
    fn test_parse_outcome_with_fence() {
        let text = "```json\n{\"history_entry\": \"talked\", \"memory_update\": \"# Facts\"}\n```";
        let outcome = parse_outcome(text).unwrap();
        assert_eq!(outcome.history_entry, "talked");
        assert_eq!(outcome.memory_update, "# Facts");
        assert!(matches!(
            parse_outcome("no json here"),
            Err(PicoError::ConsolidationFailure(_))
        ));
    }

    #[test]
    fn test_should_consolidate() {
        assert!(should_consolidate(50, 50));
        assert!(!should_consolidate(49, 50));
        assert!(!should_consolidate(100, 0));
    }

    #[tokio::test]
    async fn test_consolidate_advances_mark_and_writes_memory() {
        let (_dir, provider, sessions, consolidator) =
            setup(r#"{"history_entry": "Discussed tokio.", "memory_update": "User likes tokio."}"#);
        sessions.append("cli:1", Message::user("I like tokio")).await.unwrap();
        sessions.append("cli:1", Message::assistant("Noted")).await.unwrap();

        assert!(consolidator.consolidate("cli:1").await.unwrap());
        let session = sessions.get_or_create("cli:1").await.unwrap();
        assert_eq!(session.consolidated_count, 2);
        assert_eq!(
            consolidator.memory().read_long_term().await.unwrap(),
            "User likes tokio."
        );
        let daily = std::fs::read_to_string(consolidator.memory().today_path()).unwrap();
        assert!(daily.contains("Discussed tokio."));

        // Nothing new: no provider call and the mark stays put.
        assert!(!consolidator.consolidate("cli:1").await.unwrap());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        let session = sessions.get_or_create("cli:1").await.unwrap();
        assert_eq!(session.consolidated_count, 2);
    }

    #[tokio::test]
    async fn test_failure_leaves_mark_unchanged() {
        let (_dir, _provider, sessions, consolidator) = setup("not json");
        sessions.append("cli:1", Message::user("hello")).await.unwrap();

        let err = consolidator.consolidate("cli:1").await.unwrap_err();
        assert!(matches!(err, PicoError::ConsolidationFailure(_)));
        let session = sessions.get_or_create("cli:1").await.unwrap();
        assert_eq!(session.consolidated_count, 0);
    }

    #[tokio::test]
    async fn test_schedule_and_drain() {
        let (_dir, provider, sessions, consolidator) =
            setup(r#"{"history_entry": "x", "memory_update": ""}"#);
        sessions.append("cli:1", Message::user("hello")).await.unwrap();

        assert!(consolidator.schedule("cli:1").await);
        consolidator.drain().await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(!consolidator.is_running("cli:1").await);
        // Empty memory_update leaves MEMORY.md absent.
        assert_eq!(consolidator.memory().read_long_term().await.unwrap(), "");
        // Closed tracker refuses new work.
        assert!(!consolidator.schedule("cli:1").await);
    }

    const REPLY: &str = r#"{"history_entry": "chatted", "memory_update": ""}"#;

    /// Parks every call until the test adds permits; optionally fails the first.
    struct GatedProvider {
        gate: tokio::sync::Semaphore,
        entered: tokio::sync::Notify,
        calls: AtomicUsize,
        fail_first: bool,
        seen: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LLMProvider for GatedProvider {
        async fn chat(
            &self,
            messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push(messages.last().map(|m| m.content.clone()).unwrap_or_default());
            self.entered.notify_one();
            self.gate.acquire().await.unwrap().forget();
            if self.fail_first && n == 0 {
                return Err(PicoError::Provider(crate::error::ProviderError::ServerError(
                    "overloaded".into(),
                )));
            }
            Ok(LLMResponse::text(REPLY))
        }

        fn default_model(&self) -> &str {
            "gated"
        }

        fn name(&self) -> &str {
            "gated"
        }
    }

    fn gated_setup(
        fail_first: bool,
    ) -> (TempDir, Arc<GatedProvider>, SessionManager, MemoryConsolidator) {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(GatedProvider {
            gate: tokio::sync::Semaphore::new(0),
            entered: tokio::sync::Notify::new(),
            calls: AtomicUsize::new(0),
            fail_first,
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let sessions = SessionManager::with_path(dir.path().join("sessions"), 8).unwrap();
        let memory = MemoryStore::new(dir.path());
        let consolidator = MemoryConsolidator::new(provider.clone(), sessions.clone(), memory);
        (dir, provider, sessions, consolidator)
    }

    /// Runs a `/new` while a regular job for the same key is parked.
    async fn clear_during_job(
        provider: &GatedProvider,
        sessions: &SessionManager,
        consolidator: &MemoryConsolidator,
    ) {
        for i in 0..10 {
            sessions
                .append("cli:1", Message::user(&format!("old {}", i)))
                .await
                .unwrap();
        }
        assert!(consolidator.schedule("cli:1").await);
        provider.entered.notified().await;

        let before_clear = sessions.get_or_create("cli:1").await.unwrap();
        sessions.clear("cli:1").await.unwrap();
        assert!(consolidator.schedule_snapshot(before_clear));
        for i in 0..4 {
            sessions
                .append("cli:1", Message::user(&format!("new {}", i)))
                .await
                .unwrap();
        }

        provider.gate.add_permits(10);
        consolidator.drain().await;
    }

    #[tokio::test]
    async fn test_clear_during_job_keeps_fresh_messages_unconsolidated() {
        let (_dir, provider, sessions, consolidator) = gated_setup(false);
        clear_during_job(&provider, &sessions, &consolidator).await;

        let session = sessions.get_or_create("cli:1").await.unwrap();
        assert_eq!(session.logical_count(), 4);
        assert_eq!(session.consolidated_count, 0);
        // The running job already folded the pre-clear messages.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_snapshot_folds_what_a_failed_job_missed() {
        let (_dir, provider, sessions, consolidator) = gated_setup(true);
        clear_during_job(&provider, &sessions, &consolidator).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        let seen = provider.seen.lock().unwrap().clone();
        assert!(seen[1].contains("old 9"));
        assert!(!seen[1].contains("new 0"));
        let session = sessions.get_or_create("cli:1").await.unwrap();
        assert_eq!(session.consolidated_count, 0);
        let daily = std::fs::read_to_string(consolidator.memory().today_path()).unwrap();
        assert!(daily.contains("chatted"));
    }

    struct Silent;

    #[async_trait]
    impl LLMProvider for Silent {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            std::future::pending().await
        }

        fn default_model(&self) -> &str {
            "silent"
        }

        fn name(&self) -> &str {
            "silent"
        }
    }

    #[tokio::test]
    async fn test_unresponsive_provider_times_out_and_drain_returns() {
        let dir = TempDir::new().unwrap();
        let sessions = SessionManager::with_path(dir.path().join("sessions"), 8).unwrap();
        let consolidator =
            MemoryConsolidator::new(Arc::new(Silent), sessions.clone(), MemoryStore::new(dir.path()))
                .with_timeout(Duration::from_millis(50));
        sessions.append("cli:1", Message::user("hello")).await.unwrap();

        let err = consolidator.consolidate("cli:1").await.unwrap_err();
        assert!(matches!(err, PicoError::ConsolidationFailure(_)));
        assert!(err.to_string().contains("Timeout"));
        assert_eq!(sessions.get_or_create("cli:1").await.unwrap().consolidated_count, 0);

        assert!(consolidator.schedule("cli:1").await);
        tokio::time::timeout(Duration::from_secs(3), consolidator.drain())
            .await
            .expect("drain must not wait on a silent provider");
    }
}
