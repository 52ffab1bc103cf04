//! Tools module - Tool definitions and execution for LLM function calling
//!
//! - `Tool` trait: the interface every tool implements
//! - `ToolContext`: execution context (channel, chat_id, workspace)
//! - `ToolRegistry`: name-keyed dispatch used by the agent loop
//!
//! # Built-in Tools
//!
//! - `EchoTool`: echoes its input
//! - `ReadFileTool` / `ListDirTool`: workspace-confined reads
//! - `MessageTool`: publishes an outbound message on the bus
//! - `SpawnTool`: hands a task to the subagent manager

pub mod filesystem;
pub mod message;
mod registry;
pub mod spawn;
mod types;

pub use filesystem::{ListDirTool, ReadFileTool};
pub use message::MessageTool;
pub use registry::{render_tool_result, ToolRegistry};
pub use spawn::SpawnTool;
pub use types::{Tool, ToolContext};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Tool names a subagent may never use.
pub const SUBAGENT_EXCLUDED_TOOLS: &[&str] = &["message", "spawn"];

/// A simple echo tool.
///
/// # Example
///
/// ```rust
/// use picoclaw::tools::{EchoTool, Tool, ToolContext};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let result = EchoTool.execute(json!({"message": "Hello"}), &ToolContext::new()).await;
/// assert_eq!(result.unwrap(), "Hello");
/// # });
/// ```
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the provided message"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String> {
        let message = args
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)");
        Ok(message.to_string())
    }
}

/// Registry of side-effect-free tools shared by the main agent and subagents.
pub fn base_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(EchoTool));
    registry.register(Box::new(ReadFileTool));
    registry.register(Box::new(ListDirTool));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_tool_missing_message() {
        let out = EchoTool
            .execute(json!({}), &ToolContext::new())
            .await
            .unwrap();
        assert_eq!(out, "(no message)");
    }

    #[test]
    fn test_base_tools_exclude_messaging_and_spawn() {
        let registry = base_tools();
        assert_eq!(registry.names(), vec!["echo", "list_dir", "read_file"]);
        for name in SUBAGENT_EXCLUDED_TOOLS {
            assert!(!registry.has(name));
        }
    }
}
