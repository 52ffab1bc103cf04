//! Session types for PicoClaw
//!
//! A [`Session`] is the ordered history of one conversation plus the
//! bookkeeping the agent needs for compaction and memory consolidation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of the synthetic message that replaces a compacted span.
pub const SUMMARY_PREFIX: &str = "[Previous conversation summary]";

/// A conversation session containing messages and metadata.
///
/// Message order is append-only except for compaction, which replaces a span
/// with one summary message. Counts that survive compaction (like
/// `consolidated_count`) are measured in *logical* messages: a summary counts
/// as every message it folded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier for this session (e.g., "telegram:chat123")
    pub key: String,
    /// Ordered list of messages in this conversation
    pub messages: Vec<Message>,
    /// Logical messages already folded into long-term memory
    pub consolidated_count: usize,
    /// Clear generation, bumped by every [`Session::clear`]
    #[serde(default)]
    pub epoch: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl Session {
    /// Create a new empty session with the given key.
    ///
    /// # Example
    /// ```
    /// use picoclaw::session::Session;
    ///
    /// let session = Session::new("telegram:chat123");
    /// assert!(session.messages.is_empty());
    /// assert_eq!(session.consolidated_count, 0);
    /// ```
    pub fn new(key: &str) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            messages: Vec::new(),
            consolidated_count: 0,
            epoch: 0,
            created_at: now,
            updated_at: now,
            last_accessed: now,
        }
    }

    /// Add a message to this session.
    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// Drop every message, reset the consolidation mark and start a new
    /// generation.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.consolidated_count = 0;
        self.epoch += 1;
        self.updated_at = Utc::now();
    }

    /// Copy of the metadata without the history.
    pub fn header(&self) -> Session {
        Session {
            key: self.key.clone(),
            messages: Vec::new(),
            consolidated_count: self.consolidated_count,
            epoch: self.epoch,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_accessed: self.last_accessed,
        }
    }

    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }

    /// Number of stored messages.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Number of original messages represented, counting each summary as the
    /// messages it replaced.
    ///
    /// # Example
    /// ```
    /// use picoclaw::session::{Message, Session};
    ///
    /// let mut session = Session::new("k");
    /// session.add_message(Message::summary("talked about rust", 4));
    /// session.add_message(Message::user("and now?"));
    /// assert_eq!(session.message_count(), 2);
    /// assert_eq!(session.logical_count(), 5);
    /// ```
    pub fn logical_count(&self) -> usize {
        self.messages.iter().map(Message::weight).sum()
    }

    /// Logical messages not yet folded into long-term memory.
    pub fn unconsolidated_count(&self) -> usize {
        self.logical_count().saturating_sub(self.consolidated_count)
    }

    /// Stored messages beyond the consolidation mark.
    ///
    /// A summary straddling the mark is included.
    pub fn unconsolidated_messages(&self) -> &[Message] {
        self.messages_after(self.consolidated_count)
    }

    /// Stored messages beyond the first `count` logical messages.
    pub fn messages_after(&self, count: usize) -> &[Message] {
        let mut seen = 0;
        for (idx, msg) in self.messages.iter().enumerate() {
            if seen + msg.weight() > count {
                return &self.messages[idx..];
            }
            seen += msg.weight();
        }
        &[]
    }

    /// Advance the consolidation mark. Never moves it backwards and never past
    /// the logical count. Returns true if the mark moved.
    pub fn mark_consolidated(&mut self, count: usize) -> bool {
        let target = count.min(self.logical_count());
        if target > self.consolidated_count {
            self.consolidated_count = target;
            self.updated_at = Utc::now();
            true
        } else {
            false
        }
    }

    /// Replace `messages[start..end]` with a summary of that span.
    ///
    /// The summary carries the combined weight of the span, so the logical
    /// count is unchanged. The consolidation mark advances past the span.
    /// Returns false and leaves the session untouched if the range is invalid.
    pub fn compact_span(&mut self, start: usize, end: usize, summary: &str) -> bool {
        if start >= end || end > self.messages.len() {
            return false;
        }
        let before: usize = self.messages[..start].iter().map(Message::weight).sum();
        let folded: usize = self.messages[start..end].iter().map(Message::weight).sum();
        self.messages
            .splice(start..end, std::iter::once(Message::summary(summary, folded)));
        self.mark_consolidated(before + folded);
        self.updated_at = Utc::now();
        true
    }

    /// Number of summary messages at the head of the history.
    pub fn leading_summaries(&self) -> usize {
        self.messages.iter().take_while(|m| m.is_summary()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool calls made by the assistant (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// ID of the tool call this message is responding to (for tool results)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Reasoning trace returned by thinking models, resent on later calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Set on summary messages: how many logical messages were folded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folded: Option<usize>,
}

impl Message {
    fn with_role(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            tool_calls: None,
            tool_call_id: None,
            reasoning_content: None,
            folded: None,
        }
    }

    /// # Example
    /// ```
    /// use picoclaw::session::{Message, Role};
    ///
    /// let msg = Message::user("Hello, assistant!");
    /// assert_eq!(msg.role, Role::User);
    /// ```
    pub fn user(content: &str) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: &str) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn system(content: &str) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Create a tool result message answering `tool_call_id`.
    ///
    /// # Example
    /// ```
    /// use picoclaw::session::{Message, Role};
    ///
    /// let msg = Message::tool_result("call_123", "Tool executed successfully");
    /// assert_eq!(msg.role, Role::Tool);
    /// assert_eq!(msg.tool_call_id.as_deref(), Some("call_123"));
    /// ```
    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        let mut msg = Self::with_role(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.to_string());
        msg
    }

    /// Create an assistant message with tool calls.
    pub fn assistant_with_tools(content: &str, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.tool_calls = Some(tool_calls);
        msg
    }

    /// Create the synthetic message that stands in for `folded` compacted
    /// messages.
    pub fn summary(text: &str, folded: usize) -> Self {
        let mut msg = Self::with_role(Role::User, &format!("{}\n{}", SUMMARY_PREFIX, text));
        msg.folded = Some(folded.max(1));
        msg
    }

    /// Attach a reasoning trace (builder pattern).
    pub fn with_reasoning(mut self, reasoning: Option<String>) -> Self {
        self.reasoning_content = reasoning.filter(|r| !r.is_empty());
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty())
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == Role::Tool && self.tool_call_id.is_some()
    }

    pub fn is_summary(&self) -> bool {
        self.folded.is_some()
    }

    /// Logical message count this entry represents.
    pub fn weight(&self) -> usize {
        self.folded.unwrap_or(1).max(1)
    }

    /// Rough token estimate (4 characters per token).
    pub fn estimated_tokens(&self) -> usize {
        let mut chars = self.content.len();
        if let Some(calls) = &self.tool_calls {
            chars += calls
                .iter()
                .map(|c| c.name.len() + c.arguments.len())
                .sum::<usize>();
        }
        if let Some(reasoning) = &self.reasoning_content {
            chars += reasoning.len();
        }
        chars / 4 + 4
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A tool call made by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments for the tool
    pub arguments: String,
}

impl ToolCall {
    /// # Example
    /// ```
    /// use picoclaw::session::ToolCall;
    ///
    /// let call = ToolCall::new("call_123", "read_file", r#"{"path": "notes.md"}"#);
    /// assert_eq!(call.name, "read_file");
    /// ```
    pub fn new(id: &str, name: &str, arguments: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    /// Parse the arguments as a specific type.
    pub fn parse_arguments<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.arguments)
    }
}

/// Total estimated tokens for a list of messages.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(Message::estimated_tokens).sum()
}
