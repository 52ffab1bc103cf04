//! Envelope types carried by the message bus
//!
//! Channels publish [`InboundMessage`]s and consume [`OutboundMessage`]s. Both
//! serialize to JSON so they can cross the network bus unchanged.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata key that marks a synthetic (non-user) inbound message.
pub const SYSTEM_METADATA_KEY: &str = "system";

/// An incoming message from a surface (CLI, chat platform, heartbeat, subagent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// The surface this message came from (e.g., "cli", "telegram")
    pub channel: String,
    /// Unique identifier of the sender
    pub sender_id: String,
    /// Unique identifier of the chat/conversation
    pub chat_id: String,
    /// The text content of the message
    pub content: String,
    /// Attachments, if any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaAttachment>,
    /// Session key for routing (format: "channel:chat_id")
    pub session_key: String,
    /// Additional metadata key-value pairs
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// An outgoing message to be delivered through a surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// The surface to send this message through
    pub channel: String,
    /// The chat/conversation to send to
    pub chat_id: String,
    /// The text content to send
    pub content: String,
    /// Optional platform message ID to reply to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// A media attachment referenced by URL or local path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub media_type: MediaType,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Types of media that can be attached to messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Audio,
    Video,
    Document,
}

/// Build the session key for a surface and conversation.
pub fn session_key(channel: &str, chat_id: &str) -> String {
    format!("{}:{}", channel, chat_id)
}

impl InboundMessage {
    /// Creates a new inbound message with the required fields.
    ///
    /// The session key is generated as "channel:chat_id".
    ///
    /// # Example
    /// ```
    /// use picoclaw::bus::InboundMessage;
    ///
    /// let msg = InboundMessage::new("telegram", "user123", "chat456", "Hello, bot!");
    /// assert_eq!(msg.session_key, "telegram:chat456");
    /// assert!(!msg.is_system());
    /// ```
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            media: Vec::new(),
            session_key: session_key(channel, chat_id),
            metadata: HashMap::new(),
        }
    }

    /// Creates a synthetic message addressed to an existing session.
    ///
    /// System messages skip command parsing in the agent loop; they are used
    /// by the heartbeat and to deliver subagent results.
    ///
    /// # Example
    /// ```
    /// use picoclaw::bus::InboundMessage;
    ///
    /// let msg = InboundMessage::system("cli", "direct", "subagent", "task finished");
    /// assert!(msg.is_system());
    /// assert_eq!(msg.session_key, "cli:direct");
    /// ```
    pub fn system(channel: &str, chat_id: &str, sender_id: &str, content: &str) -> Self {
        Self::new(channel, sender_id, chat_id, content).with_metadata(SYSTEM_METADATA_KEY, "true")
    }

    /// Attaches media to the message (builder pattern).
    pub fn with_media(mut self, media: MediaAttachment) -> Self {
        self.media.push(media);
        self
    }

    /// Adds a metadata key-value pair to the message (builder pattern).
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Returns true if this message was generated by the runtime itself.
    pub fn is_system(&self) -> bool {
        self.metadata
            .get(SYSTEM_METADATA_KEY)
            .is_some_and(|v| v == "true")
    }

    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }
}

impl OutboundMessage {
    /// Creates a new outbound message.
    ///
    /// # Example
    /// ```
    /// use picoclaw::bus::OutboundMessage;
    ///
    /// let msg = OutboundMessage::new("telegram", "chat456", "Hello from the bot!");
    /// assert_eq!(msg.channel, "telegram");
    /// assert!(msg.reply_to.is_none());
    /// ```
    pub fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            reply_to: None,
        }
    }

    /// Sets the message ID to reply to (builder pattern).
    pub fn with_reply(mut self, message_id: &str) -> Self {
        self.reply_to = Some(message_id.to_string());
        self
    }

    /// Creates an outbound message as a response to an inbound message.
    ///
    /// If the inbound message carries a `message_id` metadata entry, the reply
    /// references it.
    pub fn reply_to(msg: &InboundMessage, content: &str) -> Self {
        let out = Self::new(&msg.channel, &msg.chat_id, content);
        match msg.metadata.get("message_id") {
            Some(id) => out.with_reply(id),
            None => out,
        }
    }
}

impl MediaAttachment {
    pub fn new(media_type: MediaType, location: &str) -> Self {
        Self {
            media_type,
            location: location.to_string(),
            filename: None,
        }
    }

    pub fn with_filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }
}
