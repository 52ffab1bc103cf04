//! Channel Manager for picoclaw
//!
//! Registers channels, subscribes each one to its surface on the bus and
//! drives their start/stop lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::bus::{handler, Bus, OutboundMessage};
use crate::error::{PicoError, Result};

use super::Channel;

/// Start attempts per channel before giving up.
pub const START_ATTEMPTS: u32 = 5;
/// Delay after the first failed start. Doubles on each retry.
pub const START_BACKOFF: Duration = Duration::from_secs(2);
/// Upper bound for the retry delay.
pub const START_BACKOFF_CAP: Duration = Duration::from_secs(60);

type ChannelMap = Arc<RwLock<HashMap<String, Box<dyn Channel>>>>;

/// Owns the registered channels and wires them to the bus.
///
/// ```text
///   Bus ── subscribe_outbound(name) ──> ChannelManager ──> channel.send()
///    ▲                                                          │
///    └──────────────── publish_inbound ◄─── channel listener ◄──┘
/// ```
pub struct ChannelManager {
    channels: ChannelMap,
    bus: Arc<dyn Bus>,
    attempts: u32,
    backoff: Duration,
    backoff_cap: Duration,
}

impl ChannelManager {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            bus,
            attempts: START_ATTEMPTS,
            backoff: START_BACKOFF,
            backoff_cap: START_BACKOFF_CAP,
        }
    }

    /// Override the start retry policy.
    pub fn with_retry_policy(mut self, attempts: u32, backoff: Duration, cap: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self.backoff_cap = cap;
        self
    }

    /// Register a channel and subscribe it to outbound messages for its name.
    ///
    /// Registering a second channel under the same name replaces the first.
    pub async fn register(&self, channel: Box<dyn Channel>) {
        let name = channel.name().to_string();
        info!("Registering channel: {}", name);
        let replaced = self
            .channels
            .write()
            .await
            .insert(name.clone(), channel)
            .is_some();
        if replaced {
            return;
        }

        let channels = Arc::clone(&self.channels);
        let target = name.clone();
        self.bus
            .subscribe_outbound(
                &name,
                handler(move |msg: OutboundMessage| {
                    let channels = Arc::clone(&channels);
                    let target = target.clone();
                    async move {
                        let guard = channels.read().await;
                        match guard.get(&target) {
                            Some(channel) => channel.send(msg).await,
                            None => Err(PicoError::Channel(format!(
                                "channel '{}' is no longer registered",
                                target
                            ))),
                        }
                    }
                }),
            )
            .await;
    }

    pub async fn channels(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn has_channel(&self, name: &str) -> bool {
        self.channels.read().await.contains_key(name)
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.channels
            .read()
            .await
            .get(name)
            .map(|c| c.is_running())
            .unwrap_or(false)
    }

    /// Start every registered channel, retrying failures with backoff.
    ///
    /// A channel that exhausts its attempts is logged and skipped. Returns
    /// the number of channels that are running afterwards.
    pub async fn start_all(&self) -> usize {
        let names = self.channels().await;
        let mut started = 0;
        for name in names {
            match self.start_channel(&name).await {
                Ok(()) => started += 1,
                Err(e) => error!("Giving up on channel {}: {}", name, e),
            }
        }
        started
    }

    /// Start one channel with the retry policy.
    pub async fn start_channel(&self, name: &str) -> Result<()> {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            let result = {
                let mut channels = self.channels.write().await;
                let channel = channels
                    .get_mut(name)
                    .ok_or_else(|| PicoError::NotFound(format!("channel '{}'", name)))?;
                if channel.is_running() {
                    return Ok(());
                }
                info!("Starting channel: {} (attempt {})", name, attempt);
                channel.start().await
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.attempts => {
                    warn!(
                        "Channel {} failed to start: {}. Retrying in {:?}",
                        name, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.backoff_cap);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn stop_all(&self) -> Result<()> {
        let mut channels = self.channels.write().await;
        for (name, channel) in channels.iter_mut() {
            if !channel.is_running() {
                continue;
            }
            info!("Stopping channel: {}", name);
            if let Err(e) = channel.stop().await {
                error!("Failed to stop channel {}: {}", name, e);
            }
        }
        Ok(())
    }

    /// Send directly through a named channel, bypassing the bus.
    pub async fn send(&self, channel_name: &str, msg: OutboundMessage) -> Result<()> {
        let channels = self.channels.read().await;
        match channels.get(channel_name) {
            Some(channel) => channel.send(msg).await,
            None => {
                warn!("Channel not found: {}", channel_name);
                Ok(())
            }
        }
    }

    pub fn bus(&self) -> Arc<dyn Bus> {
        Arc::clone(&self.bus)
    }
}
