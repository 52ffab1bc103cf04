//! Message tool for proactive outbound messages.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::bus::{Bus, OutboundMessage};
use crate::error::{PicoError, Result};

use super::{Tool, ToolContext};

/// Sends a message to a channel through the bus.
///
/// Defaults to the conversation the tool runs in when `channel` or `chat_id`
/// are omitted.
pub struct MessageTool {
    bus: Arc<dyn Bus>,
}

impl MessageTool {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to a chat. Omit channel and chat_id to message the current conversation."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "Message text to send"
                },
                "channel": {
                    "type": "string",
                    "description": "Destination channel name"
                },
                "chat_id": {
                    "type": "string",
                    "description": "Destination chat ID"
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PicoError::ToolExecution("missing 'content' argument".into()))?;

        let channel = args
            .get("channel")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| ctx.channel.clone())
            .ok_or_else(|| PicoError::ToolExecution("no target channel".into()))?;

        let chat_id = args
            .get("chat_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| ctx.chat_id.clone())
            .ok_or_else(|| PicoError::ToolExecution("no target chat_id".into()))?;

        self.bus
            .publish_outbound(OutboundMessage::new(&channel, &chat_id, content))
            .await?;

        Ok(format!("Message sent to {}:{}", channel, chat_id))
    }
}
