//! Gateway command: interactive terminal chat.
//!
//! Attaches to a running engine over the network bus when one answers on the
//! configured address; otherwise runs the agent in-process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use picoclaw::bus::{Bus, MessageBus, NetworkBusClient};
use picoclaw::channels::{ChannelManager, CliChannel};
use picoclaw::config::Config;

use super::common::create_agent;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) async fn cmd_gateway(config: Config) -> Result<()> {
    let address = config.bus.address();
    let remote = tokio::time::timeout(
        CONNECT_TIMEOUT,
        NetworkBusClient::connect(&address, config.bus.max_frame_len),
    )
    .await;

    match remote {
        Ok(Ok(client)) => {
            println!("Connected to picoclaw engine at {}", address);
            let client = Arc::new(client);
            chat(client.clone()).await?;
            client.close();
        }
        _ => {
            info!(%address, "No engine reachable, running in-process");
            let bus: Arc<dyn Bus> = Arc::new(MessageBus::with_buffer_size(config.bus.buffer_size));
            let agent = create_agent(&config, Arc::clone(&bus))?;
            let runner = tokio::spawn(Arc::clone(&agent).start());

            chat(bus).await?;

            agent.shutdown().await;
            if let Ok(Err(e)) = runner.await {
                error!(error = %e, "Agent loop exited with error");
            }
        }
    }
    Ok(())
}

/// Run the CLI channel on `bus` until the user quits or presses Ctrl-C.
async fn chat(bus: Arc<dyn Bus>) -> Result<()> {
    println!("picoclaw gateway. Type 'exit' to quit.");
    println!();

    let channel = CliChannel::stdio(Arc::clone(&bus));
    let closed = channel.closed();
    let manager = ChannelManager::new(bus);
    manager.register(Box::new(channel)).await;
    if manager.start_all().await == 0 {
        anyhow::bail!("CLI channel failed to start");
    }

    tokio::select! {
        _ = closed.cancelled() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    manager.stop_all().await?;
    println!("Goodbye!");
    Ok(())
}
