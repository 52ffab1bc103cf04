//! Configuration management for PicoClaw
//!
//! Configuration is loaded from `~/.picoclaw/config.json` with environment
//! variable overrides of the form `PICOCLAW_SECTION_KEY`.

mod types;

pub use types::*;

use crate::error::{PicoError, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;

impl Config {
    /// Returns the PicoClaw configuration directory path (~/.picoclaw)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".picoclaw")
    }

    /// Returns the path to the config file (~/.picoclaw/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// A missing config file yields the defaults.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)
                .map_err(|e| PicoError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        let d = &mut self.agents.defaults;
        env_string("PICOCLAW_AGENTS_DEFAULTS_WORKSPACE", &mut d.workspace);
        env_string("PICOCLAW_AGENTS_DEFAULTS_MODEL", &mut d.model);
        env_parse("PICOCLAW_AGENTS_DEFAULTS_MAX_TOKENS", &mut d.max_tokens);
        env_parse("PICOCLAW_AGENTS_DEFAULTS_TEMPERATURE", &mut d.temperature);
        env_parse(
            "PICOCLAW_AGENTS_DEFAULTS_MAX_TOOL_ITERATIONS",
            &mut d.max_tool_iterations,
        );
        env_parse(
            "PICOCLAW_AGENTS_DEFAULTS_AGENT_TIMEOUT_SECS",
            &mut d.agent_timeout_secs,
        );
        env_parse("PICOCLAW_AGENTS_DEFAULTS_MAX_HISTORY", &mut d.max_history);

        let c = &mut self.compaction;
        env_parse("PICOCLAW_COMPACTION_ENABLED", &mut c.enabled);
        env_parse("PICOCLAW_COMPACTION_CONTEXT_WINDOW", &mut c.context_window);
        env_parse("PICOCLAW_COMPACTION_THRESHOLD", &mut c.threshold);
        env_parse("PICOCLAW_COMPACTION_KEEP_RECENT", &mut c.keep_recent);

        env_parse("PICOCLAW_SESSIONS_CAPACITY", &mut self.sessions.capacity);
        env_parse(
            "PICOCLAW_SUBAGENTS_MAX_CONCURRENT",
            &mut self.subagents.max_concurrent,
        );

        env_string("PICOCLAW_BUS_HOST", &mut self.bus.host);
        env_parse("PICOCLAW_BUS_PORT", &mut self.bus.port);
        env_parse("PICOCLAW_BUS_BUFFER_SIZE", &mut self.bus.buffer_size);

        env_parse("PICOCLAW_HEARTBEAT_ENABLED", &mut self.heartbeat.enabled);
        env_parse(
            "PICOCLAW_HEARTBEAT_INTERVAL_SECS",
            &mut self.heartbeat.interval_secs,
        );

        env_string("PICOCLAW_LOGGING_LEVEL", &mut self.logging.level);

        if let Ok(val) = std::env::var("PICOCLAW_PROVIDERS_OPENAI_API_KEY") {
            let provider = self
                .providers
                .openai
                .get_or_insert_with(ProviderConfig::default);
            provider.api_key = Some(val);
        }
        if let Ok(val) = std::env::var("PICOCLAW_PROVIDERS_OPENAI_API_BASE") {
            let provider = self
                .providers
                .openai
                .get_or_insert_with(ProviderConfig::default);
            provider.api_base = Some(val);
        }
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the expanded workspace path (resolves ~ to home directory)
    pub fn workspace_path(&self) -> PathBuf {
        expand_home(&self.agents.defaults.workspace)
    }

    /// Directory holding session logs.
    pub fn sessions_path(&self) -> PathBuf {
        match &self.sessions.directory {
            Some(dir) => expand_home(dir),
            None => Self::dir().join("sessions"),
        }
    }

    /// Configured OpenAI-compatible API key, if non-empty.
    pub fn api_key(&self) -> Option<String> {
        self.providers
            .openai
            .as_ref()
            .and_then(|p| p.api_key.clone())
            .filter(|k| !k.is_empty())
    }

    pub fn api_base(&self) -> Option<String> {
        self.providers
            .openai
            .as_ref()
            .and_then(|p| p.api_base.clone())
    }
}

fn env_string(name: &str, target: &mut String) {
    if let Ok(val) = std::env::var(name) {
        *target = val;
    }
}

fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    if let Some(v) = std::env::var(name).ok().and_then(|s| s.parse().ok()) {
        *target = v;
    }
}

/// Expand ~ to home directory in a path string
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return match rest.strip_prefix('/') {
                Some(tail) => home.join(tail),
                None if rest.is_empty() => home,
                None => PathBuf::from(path),
            };
        }
    }
    PathBuf::from(path)
}
