//! Channel trait for picoclaw
//!
//! This module defines the `Channel` trait that every surface adapter
//! (the interactive CLI, chat platforms, ...) implements.

use async_trait::async_trait;

use crate::bus::OutboundMessage;
use crate::error::Result;

/// The `Channel` trait defines the interface for all communication channels.
///
/// Channels are responsible for:
/// - Receiving messages from users and publishing them to the bus
/// - Delivering outbound replies back to users
/// - Managing their connection lifecycle (start/stop)
///
/// # Example Implementation
///
/// ```ignore
/// use async_trait::async_trait;
/// use picoclaw::channels::Channel;
/// use picoclaw::bus::OutboundMessage;
/// use picoclaw::error::Result;
///
/// struct MyChannel {
///     running: bool,
/// }
///
/// #[async_trait]
/// impl Channel for MyChannel {
///     fn name(&self) -> &str {
///         "mine"
///     }
///
///     async fn start(&mut self) -> Result<()> {
///         self.running = true;
///         Ok(())
///     }
///
///     async fn stop(&mut self) -> Result<()> {
///         self.running = false;
///         Ok(())
///     }
///
///     async fn send(&self, msg: OutboundMessage) -> Result<()> {
///         println!("Sending: {}", msg.content);
///         Ok(())
///     }
///
///     fn is_running(&self) -> bool {
///         self.running
///     }
/// }
/// ```
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique surface name, matched against `OutboundMessage::channel`.
    fn name(&self) -> &str;

    /// Start listening for incoming messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel fails to start. The manager retries.
    async fn start(&mut self) -> Result<()>;

    /// Stop the channel and release its resources.
    async fn stop(&mut self) -> Result<()>;

    /// Deliver one outbound message to the user.
    async fn send(&self, msg: OutboundMessage) -> Result<()>;

    /// Whether the channel is currently running.
    fn is_running(&self) -> bool;
}
