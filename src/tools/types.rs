//! Tool types for PicoClaw
//!
//! This module defines the `Tool` trait that all tools implement and the
//! `ToolContext` passed to every execution.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Trait that all tools must implement.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use serde_json::Value;
/// use picoclaw::tools::{Tool, ToolContext};
/// use picoclaw::error::Result;
///
/// struct MyTool;
///
/// #[async_trait]
/// impl Tool for MyTool {
///     fn name(&self) -> &str { "my_tool" }
///     fn description(&self) -> &str { "Does something useful" }
///     fn parameters(&self) -> Value {
///         serde_json::json!({"type": "object", "properties": {}, "required": []})
///     }
///     async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
///         Ok("Done!".to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the LLM uses to request this tool. Unique within a registry.
    fn name(&self) -> &str;

    /// Description sent to the LLM.
    fn description(&self) -> &str;

    /// JSON schema for the tool's arguments.
    fn parameters(&self) -> Value;

    /// Execute the tool with the given arguments.
    ///
    /// Errors are converted into `Error [tool_execution_error]: ...` tool
    /// results by the agent loop; they never end the turn.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String>;
}

/// Context provided to tools during execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// The channel name (e.g., "cli", "heartbeat")
    pub channel: Option<String>,
    /// The chat/conversation ID within the channel
    pub chat_id: Option<String>,
    /// The workspace directory for file operations
    pub workspace: Option<String>,
}

impl ToolContext {
    /// Create a new empty tool context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the channel and chat ID.
    ///
    /// # Example
    /// ```
    /// use picoclaw::tools::ToolContext;
    ///
    /// let ctx = ToolContext::new().with_channel("cli", "direct");
    /// assert_eq!(ctx.channel.as_deref(), Some("cli"));
    /// assert_eq!(ctx.session_key().as_deref(), Some("cli:direct"));
    /// ```
    pub fn with_channel(mut self, channel: &str, chat_id: &str) -> Self {
        self.channel = Some(channel.to_string());
        self.chat_id = Some(chat_id.to_string());
        self
    }

    pub fn with_workspace(mut self, workspace: &str) -> Self {
        self.workspace = Some(workspace.to_string());
        self
    }

    /// Session key of the conversation the tool runs in, when known.
    pub fn session_key(&self) -> Option<String> {
        match (&self.channel, &self.chat_id) {
            (Some(channel), Some(chat_id)) => Some(crate::bus::session_key(channel, chat_id)),
            _ => None,
        }
    }
}
