//! Serve command: the agent engine behind the network bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use picoclaw::bus::{handler, Bus, NetworkBusServer, OutboundMessage};
use picoclaw::config::Config;
use picoclaw::heartbeat::{HeartbeatService, HeartbeatTarget, HEARTBEAT_CHANNEL};
use picoclaw::log_component;

use super::common::create_agent;

/// Run the engine until Ctrl-C.
pub(crate) async fn cmd_serve(config: Config) -> Result<()> {
    let address = config.bus.address();
    let server = NetworkBusServer::bind(&address, config.bus.buffer_size, config.bus.max_frame_len)
        .await
        .with_context(|| format!("Failed to start bus server on {}", address))?;
    let bus: Arc<dyn Bus> = server.clone();
    println!("picoclaw engine listening on {}", server.local_addr());

    let agent = create_agent(&config, Arc::clone(&bus))?;
    let shutdown = CancellationToken::new();

    let heartbeat = if config.heartbeat.enabled {
        bus.subscribe_outbound(
            HEARTBEAT_CHANNEL,
            handler(|msg: OutboundMessage| async move {
                log_component!(info, "heartbeat", "Heartbeat reply", reply = msg.content.as_str());
                Ok(())
            }),
        )
        .await;
        let service = Arc::new(HeartbeatService::new(
            &config.workspace_path(),
            Duration::from_secs(config.heartbeat.interval_secs.max(1)),
            HeartbeatTarget::Bus(Arc::clone(&bus)),
        ));
        Some(service.start(shutdown.child_token()))
    } else {
        None
    };

    let runner = tokio::spawn(Arc::clone(&agent).start());

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    shutdown.cancel();
    if let Some(handle) = heartbeat {
        let _ = handle.await;
    }
    agent.shutdown().await;
    match runner.await {
        Ok(Err(e)) => error!(error = %e, "Agent loop exited with error"),
        Err(e) => error!(error = %e, "Agent loop task panicked"),
        Ok(Ok(())) => {}
    }
    server.shutdown();
    println!("picoclaw engine stopped");
    Ok(())
}
