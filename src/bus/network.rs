//! Networked bus transport
//!
//! The engine runs a [`NetworkBusServer`]; gateways and channel adapters in
//! other processes connect with a [`NetworkBusClient`]. Every message travels
//! as one frame: a 4-byte big-endian length followed by a JSON envelope
//! `{"type": "inbound" | "outbound", "data": {...}}`.
//!
//! The server treats each connection independently. A disconnect, a read
//! error, or a malformed frame closes only that connection. Reconnecting is
//! up to the client ([`NetworkBusClient::connect_with_retry`]). A client
//! whose outbound queue is full is disconnected rather than waited on.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Bus, InboundMessage, OutboundHandler, OutboundMessage, Subscribers};
use crate::error::{PicoError, Result};

/// Default TCP port for the engine's bus server.
pub const DEFAULT_PORT: u16 = 18791;

/// Default upper bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frames buffered per connected client before it is dropped as too slow.
const CLIENT_QUEUE: usize = 64;

/// Maximum delay between reconnect attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Frame {
    Inbound(InboundMessage),
    Outbound(OutboundMessage),
}

impl Frame {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(buf)?)
    }
}

/// Length-prefix codec shared by both ends.
pub fn frame_codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_len)
        .new_codec()
}

// ============================================================================
// Server (engine side)
// ============================================================================

/// Server half of one connection.
struct ClientHandle {
    tx: mpsc::Sender<Bytes>,
    token: CancellationToken,
}

/// Engine-side bus: accepts client connections and owns the inbound queue.
pub struct NetworkBusServer {
    local_addr: SocketAddr,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    clients: Mutex<HashMap<u64, ClientHandle>>,
    subscribers: Subscribers,
    shutdown: CancellationToken,
    max_frame_len: usize,
}

impl NetworkBusServer {
    /// Bind to `addr` and start accepting clients in the background.
    ///
    /// Use port 0 to let the OS pick one; [`local_addr`](Self::local_addr)
    /// reports the bound address.
    pub async fn bind(addr: &str, buffer_size: usize, max_frame_len: usize) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PicoError::Transport(format!("failed to bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer_size.max(1));

        let server = Arc::new(Self {
            local_addr,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            clients: Mutex::new(HashMap::new()),
            subscribers: Subscribers::new(),
            shutdown: CancellationToken::new(),
            max_frame_len,
        });

        info!(addr = %local_addr, "Network bus server listening");
        tokio::spawn(Arc::clone(&server).accept_loop(listener));
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Stop accepting clients and close every connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut next_id: u64 = 0;
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    next_id += 1;
                    tokio::spawn(Arc::clone(&self).handle_connection(next_id, stream, peer));
                }
                Err(e) => warn!(error = %e, "Failed to accept bus client"),
            }
        }
        debug!("Network bus accept loop stopped");
    }

    async fn handle_connection(self: Arc<Self>, id: u64, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, frame_codec(self.max_frame_len));
        let mut writer = FramedWrite::new(write_half, frame_codec(self.max_frame_len));

        let (tx, mut rx) = mpsc::channel::<Bytes>(CLIENT_QUEUE);
        let token = self.shutdown.child_token();
        self.clients.lock().await.insert(
            id,
            ClientHandle {
                tx,
                token: token.clone(),
            },
        );
        info!(%peer, "Bus client connected");

        let write_token = token.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = write_token.cancelled() => break,
                    next = rx.recv() => next,
                };
                let Some(bytes) = next else { break };
                let sent = tokio::select! {
                    _ = write_token.cancelled() => break,
                    sent = writer.send(bytes) => sent,
                };
                if let Err(e) = sent {
                    debug!(%peer, error = %e, "Bus client write failed");
                    break;
                }
            }
        });

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = reader.next() => next,
            };
            match next {
                Some(Ok(buf)) => match Frame::decode(&buf) {
                    // Awaiting here stops reading from the socket while the
                    // inbound queue is full.
                    Ok(Frame::Inbound(msg)) => {
                        if self.inbound_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(Frame::Outbound(msg)) => {
                        self.subscribers.dispatch(&msg).await;
                    }
                    Err(e) => {
                        warn!(%peer, error = %e, "Malformed bus frame, closing connection");
                        break;
                    }
                },
                Some(Err(e)) => {
                    warn!(%peer, error = %e, "Bus connection read error");
                    break;
                }
                None => break,
            }
        }

        self.clients.lock().await.remove(&id);
        token.cancel();
        let _ = writer_task.await;
        info!(%peer, "Bus client disconnected");
    }
}

#[async_trait]
impl Bus for NetworkBusServer {
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

    /// Broadcast to every connected client and to local subscribers.
    ///
    /// Never waits on a client: one whose queue is full is disconnected.
    async fn publish_outbound(&self, msg: OutboundMessage) -> Result<()> {
        let bytes = Frame::Outbound(msg.clone()).encode()?;
        {
            let mut clients = self.clients.lock().await;
            clients.retain(|id, client| match client.tx.try_send(bytes.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client = id, "Bus client too slow, disconnecting");
                    client.token.cancel();
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }

        if !self.subscribers.is_empty().await {
            self.subscribers.dispatch(&msg).await;
        }
        Ok(())
    }

    async fn subscribe_outbound(&self, channel: &str, handler: OutboundHandler) {
        self.subscribers.add(channel, handler).await;
    }

    fn transport(&self) -> &'static str {
        "tcp-server"
    }
}

// ============================================================================
// Client (gateway side)
// ============================================================================

/// Gateway-side bus: forwards inbound messages to the engine and dispatches
/// the engine's outbound messages to local subscribers in arrival order.
pub struct NetworkBusClient {
    peer: SocketAddr,
    writer: Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl NetworkBusClient {
    /// Connect once to an engine at `addr`.
    pub async fn connect(addr: &str, max_frame_len: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| PicoError::Transport(format!("failed to connect to {}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let (inbound_tx, inbound_rx) = mpsc::channel(super::DEFAULT_BUFFER_SIZE);
        let subscribers = Subscribers::new();
        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        let reader = FramedRead::new(read_half, frame_codec(max_frame_len));
        tokio::spawn(receive_loop(
            reader,
            inbound_tx,
            subscribers.clone(),
            Arc::clone(&connected),
            shutdown.clone(),
        ));

        info!(%peer, "Connected to agent bus");
        Ok(Self {
            peer,
            writer: Mutex::new(FramedWrite::new(write_half, frame_codec(max_frame_len))),
            inbound_rx: Mutex::new(inbound_rx),
            subscribers,
            connected,
            shutdown,
        })
    }

    /// Connect with exponential backoff, doubling `initial_delay` after each
    /// failure up to 60 seconds.
    pub async fn connect_with_retry(
        addr: &str,
        max_frame_len: usize,
        attempts: u32,
        initial_delay: Duration,
    ) -> Result<Self> {
        let attempts = attempts.max(1);
        let mut delay = initial_delay;
        let mut attempt = 1;
        loop {
            match Self::connect(addr, max_frame_len).await {
                Ok(client) => return Ok(client),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Bus connect failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                    attempt += 1;
                }
            }
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// False once the engine closed the connection or a read failed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Stop the receive loop. The socket closes when the client is dropped.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(PicoError::Transport(format!(
                "not connected to agent at {}",
                self.peer
            )));
        }
        let bytes = frame.encode()?;
        let mut writer = self.writer.lock().await;
        writer.send(bytes).await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            PicoError::Transport(format!("send to {} failed: {}", self.peer, e))
        })
    }
}

async fn receive_loop(
    mut reader: FramedRead<tokio::net::tcp::OwnedReadHalf, LengthDelimitedCodec>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = reader.next() => next,
        };
        match next {
            Some(Ok(buf)) => match Frame::decode(&buf) {
                Ok(Frame::Outbound(msg)) => {
                    subscribers.dispatch(&msg).await;
                }
                Ok(Frame::Inbound(msg)) => {
                    if inbound_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring malformed frame from agent"),
            },
            Some(Err(e)) => {
                warn!(error = %e, "Lost connection to agent");
                break;
            }
            None => {
                warn!("Agent closed the bus connection");
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

impl Drop for NetworkBusClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Bus for NetworkBusClient {
    async fn publish_inbound(&self, msg: InboundMessage) -> Result<()> {
        self.send_frame(Frame::Inbound(msg)).await
    }

    /// Inbound frames pushed by the peer. Returns `None` after disconnect.
    async fn consume_inbound(&self) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await
    }

    async fn publish_outbound(&self, msg: OutboundMessage) -> Result<()> {
        self.send_frame(Frame::Outbound(msg)).await
    }

    async fn subscribe_outbound(&self, channel: &str, handler: OutboundHandler) {
        self.subscribers.add(channel, handler).await;
    }

    fn transport(&self) -> &'static str {
        "tcp-client"
    }
}
