//! Status command handler.

use std::time::Duration;

use anyhow::Result;

use picoclaw::bus::NetworkBusClient;
use picoclaw::config::Config;
use picoclaw::heartbeat::HEARTBEAT_FILE;

use super::common::create_sessions;

pub(crate) async fn cmd_status(config: Config) -> Result<()> {
    let defaults = &config.agents.defaults;
    let workspace = config.workspace_path();

    println!("picoclaw Status");
    println!("===============");
    println!();
    println!("Config:     {}", Config::path().display());
    println!("Workspace:  {}", workspace.display());
    println!("Model:      {}", defaults.model);
    println!(
        "Provider:   {}",
        match (config.api_key(), config.api_base()) {
            (Some(_), Some(base)) => format!("configured ({})", base),
            (Some(_), None) => "configured (api.openai.com)".to_string(),
            (None, _) => "not configured".to_string(),
        }
    );
    println!();

    println!("Limits");
    println!("------");
    println!("  Max tool iterations: {}", defaults.max_tool_iterations);
    println!("  Agent timeout:       {}s", defaults.agent_timeout_secs);
    println!("  Max history:         {}", defaults.max_history);
    println!("  Subagents:           {} concurrent", config.subagents.max_concurrent);
    println!(
        "  Compaction:          {} (window {}, keep {})",
        if config.compaction.enabled { "on" } else { "off" },
        config.compaction.context_window,
        config.compaction.keep_recent
    );
    println!();

    let sessions = create_sessions(&config);
    let keys = sessions.list().await.unwrap_or_default();
    println!("Sessions:   {} in {}", keys.len(), config.sessions_path().display());
    println!(
        "Heartbeat:  {} ({})",
        if config.heartbeat.enabled { "enabled" } else { "disabled" },
        if workspace.join(HEARTBEAT_FILE).is_file() {
            "file present"
        } else {
            "no file"
        }
    );

    let address = config.bus.address();
    let engine = tokio::time::timeout(
        Duration::from_millis(500),
        NetworkBusClient::connect(&address, config.bus.max_frame_len),
    )
    .await;
    match engine {
        Ok(Ok(client)) => {
            println!("Engine:     running at {}", client.peer_addr());
            client.close();
        }
        _ => println!("Engine:     not reachable at {}", address),
    }

    Ok(())
}
