//! Interactive terminal channel.
//!
//! Reads lines from an input stream, publishes each as an inbound message on
//! channel `cli` and writes replies to an output stream. `exit` or `quit`
//! (or end of input) closes the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{Bus, InboundMessage, OutboundMessage};
use crate::error::{PicoError, Result};

use super::Channel;

pub const CLI_CHANNEL: &str = "cli";
pub const CLI_CHAT_ID: &str = "direct";
const CLI_SENDER: &str = "user";

type Input = Box<dyn AsyncBufRead + Send + Unpin>;
type Output = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

pub struct CliChannel {
    bus: Arc<dyn Bus>,
    chat_id: String,
    // The boxed reader is not `Sync`; the mutex makes the channel so.
    input: std::sync::Mutex<Option<Input>>,
    output: Output,
    running: Arc<AtomicBool>,
    closed: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

impl CliChannel {
    /// A channel on the process stdin/stdout.
    pub fn stdio(bus: Arc<dyn Bus>) -> Self {
        Self::with_io(
            bus,
            Box::new(BufReader::new(tokio::io::stdin())),
            Box::new(tokio::io::stdout()),
        )
    }

    pub fn with_io(
        bus: Arc<dyn Bus>,
        input: Input,
        output: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            bus,
            chat_id: CLI_CHAT_ID.to_string(),
            input: std::sync::Mutex::new(Some(input)),
            output: Arc::new(Mutex::new(output)),
            running: Arc::new(AtomicBool::new(false)),
            closed: CancellationToken::new(),
            reader: None,
        }
    }

    pub fn with_chat_id(mut self, chat_id: &str) -> Self {
        self.chat_id = chat_id.to_string();
        self
    }

    /// Cancelled when the user ends the session.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        CLI_CHANNEL
    }

    async fn start(&mut self) -> Result<()> {
        let mut input = self
            .input
            .get_mut()
            .ok()
            .and_then(Option::take)
            .ok_or_else(|| PicoError::Channel("cli input already consumed".into()))?;
        self.running.store(true, Ordering::SeqCst);

        let bus = Arc::clone(&self.bus);
        let chat_id = self.chat_id.clone();
        let running = Arc::clone(&self.running);
        let closed = self.closed.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                let read = tokio::select! {
                    _ = closed.cancelled() => break,
                    read = input.read_line(&mut line) => read,
                };
                match read {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Failed to read cli input");
                        break;
                    }
                }
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if matches!(text, "exit" | "quit") {
                    break;
                }
                let msg = InboundMessage::new(CLI_CHANNEL, CLI_SENDER, &chat_id, text);
                if let Err(e) = bus.publish_inbound(msg).await {
                    warn!(error = %e, "Failed to publish cli input");
                    break;
                }
            }
            debug!("CLI input closed");
            running.store(false, Ordering::SeqCst);
            closed.cancel();
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.closed.cancel();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, msg: OutboundMessage) -> Result<()> {
        let mut out = self.output.lock().await;
        out.write_all(format!("\n{}\n\n", msg.content).as_bytes())
            .await?;
        out.flush().await?;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
