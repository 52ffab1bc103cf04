//! Message Bus Module
//!
//! The bus decouples chat surfaces from the agent engine. Inbound messages
//! flow from channels to the agent loop; outbound messages flow back and are
//! fanned out to the handlers subscribed for each surface.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Channel   │────>│     Bus     │────>│  AgentLoop  │
//! │    (cli)    │     │  (inbound)  │     │             │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                                       │
//!        │            ┌─────────────┐            │
//!        └────────────│ dispatcher  │<───────────┘
//!                     │ (outbound)  │
//!                     └─────────────┘
//! ```
//!
//! Two transports implement [`Bus`]:
//! - [`MessageBus`]: bounded in-process tokio queues
//! - [`network::NetworkBusServer`] / [`network::NetworkBusClient`]: the same
//!   contract over length-prefixed JSON frames on TCP
//!
//! # Example
//!
//! ```
//! use picoclaw::bus::{Bus, MessageBus, InboundMessage};
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = MessageBus::new();
//!
//!     let msg = InboundMessage::new("telegram", "user123", "chat456", "Hello");
//!     bus.publish_inbound(msg).await.unwrap();
//!
//!     if let Some(received) = bus.consume_inbound().await {
//!         assert_eq!(received.content, "Hello");
//!     }
//! }
//! ```

pub mod message;
pub mod network;

pub use message::{
    session_key, InboundMessage, MediaAttachment, MediaType, OutboundMessage, SYSTEM_METADATA_KEY,
};
pub use network::{Frame, NetworkBusClient, NetworkBusServer};

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{PicoError, Result};

/// Default buffer size for message channels
pub const DEFAULT_BUFFER_SIZE: usize = 100;

/// Async callback invoked for each outbound message on a subscribed surface.
pub type OutboundHandler =
    Arc<dyn Fn(OutboundMessage) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as an [`OutboundHandler`].
///
/// # Example
/// ```
/// use picoclaw::bus::{handler, OutboundMessage};
///
/// let h = handler(|msg: OutboundMessage| async move {
///     println!("{}", msg.content);
///     Ok(())
/// });
/// # let _ = h;
/// ```
pub fn handler<F, Fut>(f: F) -> OutboundHandler
where
    F: Fn(OutboundMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// Transport-agnostic bus contract used by the agent loop and channels.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Enqueue a message for the agent. Suspends while the queue is full.
    async fn publish_inbound(&self, msg: InboundMessage) -> Result<()>;

    /// Pull the next inbound message. Returns `None` once the bus is closed.
    async fn consume_inbound(&self) -> Option<InboundMessage>;

    /// Deliver a reply toward the surface named by `msg.channel`.
    async fn publish_outbound(&self, msg: OutboundMessage) -> Result<()>;

    /// Register a handler for outbound messages addressed to `channel`.
    async fn subscribe_outbound(&self, channel: &str, handler: OutboundHandler);

    /// Short transport name for logs ("memory", "tcp-server", "tcp-client").
    fn transport(&self) -> &'static str;
}

// ============================================================================
// Subscriber registry
// ============================================================================

/// Outbound handlers keyed by surface name, shared by all transports.
#[derive(Clone, Default)]
pub struct Subscribers {
    inner: Arc<RwLock<HashMap<String, Vec<OutboundHandler>>>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, channel: &str, handler: OutboundHandler) {
        self.inner
            .write()
            .await
            .entry(channel.to_string())
            .or_default()
            .push(handler);
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Invoke every handler for `msg.channel` in registration order.
    ///
    /// Returns the number of handlers that were invoked. Handler errors are
    /// logged and do not stop delivery to the remaining handlers.
    pub async fn dispatch(&self, msg: &OutboundMessage) -> usize {
        let handlers = {
            let guard = self.inner.read().await;
            guard.get(&msg.channel).cloned().unwrap_or_default()
        };
        if handlers.is_empty() {
            warn!(channel = %msg.channel, "No outbound subscriber for channel");
            return 0;
        }
        for h in &handlers {
            if let Err(e) = h(msg.clone()).await {
                warn!(channel = %msg.channel, error = %e, "Outbound handler failed");
            }
        }
        handlers.len()
    }
}

// ============================================================================
// In-process transport
// ============================================================================

/// In-process message bus backed by bounded tokio MPSC queues.
///
/// The outbound queue is drained by a dispatcher task that is spawned the
/// first time a handler subscribes. Until then, outbound messages can be
/// pulled directly with [`MessageBus::consume_outbound`].
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Arc<Mutex<mpsc::Receiver<InboundMessage>>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<OutboundMessage>>>,
    subscribers: Subscribers,
    dispatcher_started: Arc<AtomicBool>,
    buffer_size: usize,
}

impl MessageBus {
    /// Creates a new `MessageBus` with the default buffer size of 100.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Creates a new `MessageBus` with a custom buffer size.
    ///
    /// # Example
    /// ```
    /// use picoclaw::bus::MessageBus;
    ///
    /// let bus = MessageBus::with_buffer_size(500);
    /// assert_eq!(bus.capacity(), 500);
    /// ```
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer_size);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer_size);

        Self {
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            subscribers: Subscribers::new(),
            dispatcher_started: Arc::new(AtomicBool::new(false)),
            buffer_size,
        }
    }

    /// Configured capacity of each direction's queue.
    pub fn capacity(&self) -> usize {
        self.buffer_size
    }

    /// Number of inbound messages waiting to be consumed.
    pub fn inbound_len(&self) -> usize {
        self.buffer_size - self.inbound_tx.capacity()
    }

    /// Pull the next outbound message directly, bypassing subscribers.
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        let mut rx = self.outbound_rx.lock().await;
        rx.recv().await
    }

    /// Publish without waiting.
    ///
    /// # Errors
    /// `BusCapacityExceeded` when the inbound queue is full, `BusClosed` when
    /// the receiver is gone.
    pub fn try_publish_inbound(&self, msg: InboundMessage) -> Result<()> {
        self.inbound_tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PicoError::BusCapacityExceeded,
            mpsc::error::TrySendError::Closed(_) => PicoError::BusClosed,
        })
    }

    /// Gets a clone of the inbound sender for use in channel adapters.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    fn ensure_dispatcher(&self) {
        if self.dispatcher_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let rx = Arc::clone(&self.outbound_rx);
        let subscribers = self.subscribers.clone();
        tokio::spawn(async move {
            debug!("Outbound dispatcher started");
            loop {
                let next = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                match next {
                    Some(msg) => {
                        subscribers.dispatch(&msg).await;
                    }
                    None => break,
                }
            }
            debug!("Outbound dispatcher stopped");
        });
    }
}

#[async_trait]
impl Bus for MessageBus {
    async fn publish_inbound(&self, msg: InboundMessage) -> Result<()> {
        self.inbound_tx
            .send(msg)
            .await
            .map_err(|_| PicoError::BusClosed)
    }

    async fn consume_inbound(&self) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await
    }

    async fn publish_outbound(&self, msg: OutboundMessage) -> Result<()> {
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| PicoError::BusClosed)
    }

    async fn subscribe_outbound(&self, channel: &str, handler: OutboundHandler) {
        self.subscribers.add(channel, handler).await;
        self.ensure_dispatcher();
    }

    fn transport(&self) -> &'static str {
        "memory"
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MessageBus {
    fn clone(&self) -> Self {
        Self {
            inbound_tx: self.inbound_tx.clone(),
            inbound_rx: Arc::clone(&self.inbound_rx),
            outbound_tx: self.outbound_tx.clone(),
            outbound_rx: Arc::clone(&self.outbound_rx),
            subscribers: self.subscribers.clone(),
            dispatcher_started: Arc::clone(&self.dispatcher_started),
            buffer_size: self.buffer_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bus_inbound_flow() {
        let bus = MessageBus::new();
        let msg = InboundMessage::new("telegram", "user1", "chat1", "Hello");
        bus.publish_inbound(msg.clone()).await.unwrap();

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_bus_outbound_direct_consume() {
        let bus = MessageBus::new();
        bus.publish_outbound(OutboundMessage::new("cli", "c", "reply"))
            .await
            .unwrap();
        let out = bus.consume_outbound().await.unwrap();
        assert_eq!(out.content, "reply");
    }

    #[tokio::test]
    async fn test_bus_preserves_enqueue_order() {
        let bus = MessageBus::new();
        for i in 0..10 {
            bus.publish_inbound(InboundMessage::new("cli", "u", "c", &i.to_string()))
                .await
                .unwrap();
        }
        for i in 0..10 {
            let msg = bus.consume_inbound().await.unwrap();
            assert_eq!(msg.content, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_try_publish_reports_capacity() {
        let bus = MessageBus::with_buffer_size(1);
        bus.try_publish_inbound(InboundMessage::new("cli", "u", "c", "1"))
            .unwrap();
        assert_eq!(bus.inbound_len(), 1);

        let err = bus
            .try_publish_inbound(InboundMessage::new("cli", "u", "c", "2"))
            .unwrap_err();
        assert!(matches!(err, PicoError::BusCapacityExceeded));
    }

    #[tokio::test]
    async fn test_full_queue_blocks_instead_of_dropping() {
        let bus = MessageBus::with_buffer_size(1);
        bus.publish_inbound(InboundMessage::new("cli", "u", "c", "first"))
            .await
            .unwrap();

        let publisher = bus.clone();
        let pending = tokio::spawn(async move {
            publisher
                .publish_inbound(InboundMessage::new("cli", "u", "c", "second"))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished(), "publisher should be suspended");

        assert_eq!(bus.consume_inbound().await.unwrap().content, "first");
        pending.await.unwrap().unwrap();
        assert_eq!(bus.consume_inbound().await.unwrap().content, "second");
    }

    #[tokio::test]
    async fn test_subscribers_receive_only_their_channel_in_order() {
        let bus = MessageBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx_cli = tx.clone();
        bus.subscribe_outbound(
            "cli",
            handler(move |msg| {
                let tx = tx_cli.clone();
                async move {
                    let _ = tx.send(format!("cli:{}", msg.content));
                    Ok(())
                }
            }),
        )
        .await;
        let tx_tg = tx.clone();
        bus.subscribe_outbound(
            "telegram",
            handler(move |msg| {
                let tx = tx_tg.clone();
                async move {
                    let _ = tx.send(format!("tg:{}", msg.content));
                    Ok(())
                }
            }),
        )
        .await;

        for i in 0..3 {
            bus.publish_outbound(OutboundMessage::new("cli", "c", &i.to_string()))
                .await
                .unwrap();
        }
        bus.publish_outbound(OutboundMessage::new("telegram", "c", "x"))
            .await
            .unwrap();

        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(
                tokio::time::timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert_eq!(got, vec!["cli:0", "cli:1", "cli:2", "tg:x"]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let subscribers = Subscribers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscribers
            .add(
                "cli",
                handler(|_msg| async { Err(PicoError::Channel("down".into())) }),
            )
            .await;
        subscribers
            .add(
                "cli",
                handler(move |msg| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(msg.content);
                        Ok(())
                    }
                }),
            )
            .await;

        let invoked = subscribers
            .dispatch(&OutboundMessage::new("cli", "c", "hello"))
            .await;
        assert_eq!(invoked, 2);
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_dispatch_without_subscriber() {
        let subscribers = Subscribers::new();
        assert!(subscribers.is_empty().await);
        let invoked = subscribers
            .dispatch(&OutboundMessage::new("nowhere", "c", "lost"))
            .await;
        assert_eq!(invoked, 0);
    }

    #[tokio::test]
    async fn test_bus_concurrent_publishers() {
        let bus = MessageBus::with_buffer_size(8);
        let mut handles = Vec::new();
        for p in 0..4 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    bus.publish_inbound(InboundMessage::new(
                        "cli",
                        "u",
                        &format!("chat{}", p),
                        &i.to_string(),
                    ))
                    .await
                    .unwrap();
                }
            }));
        }

        let mut last_seen: HashMap<String, i32> = HashMap::new();
        for _ in 0..100 {
            let msg = bus.consume_inbound().await.unwrap();
            let n: i32 = msg.content.parse().unwrap();
            let prev = last_seen.insert(msg.chat_id.clone(), n).unwrap_or(-1);
            assert_eq!(n, prev + 1, "per-conversation order must hold");
        }
        for h in handles {
            h.await.unwrap();
        }
    }
}
