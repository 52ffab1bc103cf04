//! Heartbeat service implementation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::AgentLoop;
use crate::bus::{Bus, InboundMessage};

/// Channel, chat id and sender of heartbeat messages.
pub const HEARTBEAT_CHANNEL: &str = "heartbeat";

pub const HEARTBEAT_FILE: &str = "HEARTBEAT.md";

/// Prompt sent to the agent when the heartbeat fires.
pub const HEARTBEAT_PROMPT: &str = r#"Read HEARTBEAT.md in your workspace.
Follow any actionable items listed there.
If nothing needs attention, reply with: HEARTBEAT_OK"#;

/// Where heartbeat prompts go.
#[derive(Clone)]
pub enum HeartbeatTarget {
    /// Publish a `system` inbound message on channel `heartbeat`.
    Bus(Arc<dyn Bus>),
    /// Run the prompt directly on an in-process agent.
    Agent(Arc<AgentLoop>),
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResult {
    pub file_found: bool,
    pub actionable: bool,
    pub delivered: bool,
    pub error: Option<String>,
}

impl HeartbeatResult {
    fn ok(file_found: bool, actionable: bool, delivered: bool) -> Self {
        Self {
            file_found,
            actionable,
            delivered,
            error: None,
        }
    }

    fn err(file_found: bool, msg: &str) -> Self {
        Self {
            file_found,
            actionable: file_found,
            delivered: false,
            error: Some(msg.to_string()),
        }
    }
}

/// Periodically wakes the agent when `HEARTBEAT.md` has open items.
pub struct HeartbeatService {
    file_path: PathBuf,
    interval: Duration,
    target: HeartbeatTarget,
    consecutive_failures: Arc<AtomicU32>,
    failure_alert_threshold: u32,
}

impl HeartbeatService {
    /// Heartbeat for `<workspace>/HEARTBEAT.md`.
    pub fn new(workspace: &Path, interval: Duration, target: HeartbeatTarget) -> Self {
        Self {
            file_path: workspace.join(HEARTBEAT_FILE),
            interval: interval.max(Duration::from_millis(10)),
            target,
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            failure_alert_threshold: 3,
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Tick on the interval until `shutdown` is cancelled. The first tick
    /// happens one interval after start.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            file = %self.file_path.display(),
            "Heartbeat service started"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let result = self.tick().await;
                if result.error.is_some() {
                    let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    if count >= self.failure_alert_threshold {
                        warn!(consecutive_failures = count, "Heartbeat is failing repeatedly");
                    }
                } else {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                }
            }
            info!("Heartbeat service stopped");
        })
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Read the heartbeat file and deliver the prompt if it has open items.
    pub async fn tick(&self) -> HeartbeatResult {
        let content = match tokio::fs::read_to_string(&self.file_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(file = %self.file_path.display(), "Heartbeat file missing, skipping tick");
                return HeartbeatResult::ok(false, false, false);
            }
            Err(e) => {
                warn!(file = %self.file_path.display(), error = %e, "Failed to read heartbeat file");
                return HeartbeatResult::err(false, &format!("read failed: {}", e));
            }
        };

        if !is_actionable(&content) {
            debug!("Heartbeat file has no actionable content");
            return HeartbeatResult::ok(true, false, false);
        }

        match &self.target {
            HeartbeatTarget::Bus(bus) => {
                let msg = InboundMessage::system(
                    HEARTBEAT_CHANNEL,
                    HEARTBEAT_CHANNEL,
                    HEARTBEAT_CHANNEL,
                    HEARTBEAT_PROMPT,
                );
                match bus.publish_inbound(msg).await {
                    Ok(()) => {
                        info!("Heartbeat delivered to bus");
                        HeartbeatResult::ok(true, true, true)
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to publish heartbeat");
                        HeartbeatResult::err(true, &format!("delivery failed: {}", e))
                    }
                }
            }
            HeartbeatTarget::Agent(agent) => {
                let key = crate::bus::session_key(HEARTBEAT_CHANNEL, HEARTBEAT_CHANNEL);
                match agent.process_direct(HEARTBEAT_PROMPT, &key).await {
                    Ok(reply) => {
                        info!(reply_len = reply.len(), "Heartbeat processed");
                        HeartbeatResult::ok(true, true, true)
                    }
                    Err(e) => {
                        error!(error = %e, "Heartbeat turn failed");
                        HeartbeatResult::err(true, &format!("turn failed: {}", e))
                    }
                }
            }
        }
    }
}

/// Whether the heartbeat file lists anything to do.
///
/// Headings, HTML comments, blank lines and empty checkboxes do not count.
pub fn is_actionable(content: &str) -> bool {
    content.lines().map(str::trim).any(|line| {
        !(line.is_empty()
            || line.starts_with('#')
            || line.starts_with("<!--")
            || line == "- [ ]"
            || line == "* [ ]")
    })
}
