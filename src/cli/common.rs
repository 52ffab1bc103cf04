//! Shared helpers for CLI commands.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use picoclaw::agent::AgentLoop;
use picoclaw::bus::Bus;
use picoclaw::config::Config;
use picoclaw::providers::{LLMProvider, OpenAIProvider};
use picoclaw::session::SessionManager;

/// Load `.env`, then the config file (default path unless overridden).
pub(crate) fn load_config(path: Option<&Path>) -> Result<Config> {
    let _ = dotenvy::dotenv();
    let config = match path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };
    config.with_context(|| "Failed to load configuration")
}

/// Build the OpenAI-compatible provider from config.
pub(crate) fn create_provider(config: &Config) -> Result<Arc<dyn LLMProvider>> {
    let api_key = config.api_key().with_context(|| {
        format!(
            "No API key configured. Set PICOCLAW_PROVIDERS_OPENAI_API_KEY or edit {}",
            Config::path().display()
        )
    })?;
    let provider = match config.api_base() {
        Some(base) => OpenAIProvider::with_base_url(&api_key, &base),
        None => OpenAIProvider::new(&api_key),
    }
    .with_default_model(&config.agents.defaults.model)
    .with_timeout(Duration::from_secs(config.agents.defaults.agent_timeout_secs.max(1)));
    Ok(Arc::new(provider))
}

/// Open the persistent session store, falling back to memory-only sessions.
pub(crate) fn create_sessions(config: &Config) -> SessionManager {
    let dir = config.sessions_path();
    SessionManager::with_path(&dir, config.sessions.capacity).unwrap_or_else(|e| {
        warn!(dir = %dir.display(), error = %e, "Session directory unavailable, using in-memory sessions");
        SessionManager::new_memory()
    })
}

/// Create the agent on `bus` with the configured provider and workspace.
pub(crate) fn create_agent(config: &Config, bus: Arc<dyn Bus>) -> Result<Arc<AgentLoop>> {
    let workspace = config.workspace_path();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

    let provider = create_provider(config)?;
    let sessions = create_sessions(config);
    let agent = AgentLoop::new(config.clone(), provider, sessions, bus);
    info!(workspace = %workspace.display(), model = %config.agents.defaults.model, "Agent ready");
    Ok(Arc::new(agent))
}
