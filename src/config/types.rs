//! Configuration type definitions for PicoClaw
//!
//! Every section derives serde traits and falls back to defaults for missing
//! fields, so a partial `config.json` is always valid.

use serde::{Deserialize, Serialize};

use crate::bus::network::{DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT};

/// Main configuration struct for PicoClaw
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agents: AgentConfig,
    pub compaction: CompactionConfig,
    pub sessions: SessionsConfig,
    pub subagents: SubagentConfig,
    pub bus: BusConfig,
    pub providers: ProvidersConfig,
    pub heartbeat: HeartbeatConfig,
    pub logging: LoggingConfig,
    pub skills: SkillsConfig,
}

// ============================================================================
// Agent Configuration
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub defaults: AgentDefaults,
}

/// Default settings for the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefaults {
    /// Workspace directory holding bootstrap docs, memory and skills
    pub workspace: String,
    /// Model passed to the provider
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Model calls per turn before the loop gives up
    pub max_tool_iterations: u32,
    /// Timeout for a single provider call
    pub agent_timeout_secs: u64,
    /// Stored messages per session before older ones are folded
    pub max_history: usize,
    /// Days of daily memory notes included in the prompt
    pub memory_days: u32,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: "~/.picoclaw/workspace".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            max_tool_iterations: 20,
            agent_timeout_secs: 120,
            max_history: 200,
            memory_days: 2,
        }
    }
}

// ============================================================================
// Compaction / Consolidation
// ============================================================================

/// Context compaction and memory consolidation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// Model context window in tokens
    pub context_window: usize,
    /// Fraction (0.0-1.0) of the window that triggers compaction
    pub threshold: f64,
    /// Most recent messages never compacted
    pub keep_recent: usize,
    /// Unconsolidated messages that trigger background consolidation
    /// (0 disables the automatic trigger)
    pub consolidate_after: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            context_window: 128_000,
            threshold: 0.80,
            keep_recent: 6,
            consolidate_after: 50,
        }
    }
}

impl CompactionConfig {
    /// Token estimate above which compaction runs.
    pub fn token_budget(&self) -> usize {
        (self.context_window as f64 * self.threshold.clamp(0.0, 1.0)) as usize
    }
}

// ============================================================================
// Sessions / Subagents / Bus
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Sessions held in memory before least-recently-used eviction
    pub capacity: usize,
    /// Override for the session log directory (default ~/.picoclaw/sessions)
    pub directory: Option<String>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            capacity: crate::session::DEFAULT_CACHE_CAPACITY,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubagentConfig {
    pub max_concurrent: usize,
    /// Interval of the background reaper
    pub reap_interval_ms: u64,
    pub max_tool_iterations: u32,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            reap_interval_ms: 500,
            max_tool_iterations: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Capacity of the inbound and outbound queues
    pub buffer_size: usize,
    pub host: String,
    pub port: u16,
    pub max_frame_len: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer_size: crate::bus::DEFAULT_BUFFER_SIZE,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl BusConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Providers
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub openai: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
}

// ============================================================================
// Logging
// ============================================================================

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    #[default]
    Component,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

// ============================================================================
// Heartbeat / Skills
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillsConfig {
    /// Skills whose full content is always inlined in the system prompt
    pub always_load: Vec<String>,
}
