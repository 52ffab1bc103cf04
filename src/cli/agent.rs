//! Agent command: one-shot direct processing.

use std::sync::Arc;

use anyhow::Result;

use picoclaw::bus::{Bus, MessageBus};
use picoclaw::config::Config;

use super::common::create_agent;

/// Process `message` in `session` and print the reply.
pub(crate) async fn cmd_agent(config: Config, message: String, session: String) -> Result<()> {
    let bus: Arc<dyn Bus> = Arc::new(MessageBus::with_buffer_size(config.bus.buffer_size));
    let agent = create_agent(&config, bus)?;

    let result = agent.process_direct(&message, &session).await;
    agent.shutdown().await;

    let reply = result?;
    println!("{}", reply);
    Ok(())
}
