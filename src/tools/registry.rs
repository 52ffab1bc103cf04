//! Tool registry for PicoClaw
//!
//! Name-keyed dynamic dispatch over `Box<dyn Tool>`. An unknown name is a
//! data-driven error path, never a panic.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{PicoError, Result};
use crate::providers::ToolDefinition;

use super::{Tool, ToolContext};

/// A registry that holds and manages tools.
///
/// # Example
///
/// ```rust
/// use picoclaw::tools::{EchoTool, ToolContext, ToolRegistry};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let mut registry = ToolRegistry::new();
/// registry.register(Box::new(EchoTool));
/// assert!(registry.has("echo"));
///
/// let ctx = ToolContext::new();
/// let result = registry.execute_with_context("echo", json!({"message": "hello"}), &ctx).await;
/// assert_eq!(result.unwrap(), "hello");
/// # });
/// ```
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        info!(tool = %name, "Registering tool");
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "Replaced previously registered tool");
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Names of all registered tools, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for the provider, sorted by name so prompts are stable.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.parameters()))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name.
    ///
    /// Returns `PicoError::UnknownTool` for an unregistered name. Any failure
    /// raised by the tool is returned as `PicoError::ToolExecution`.
    pub async fn execute_with_context(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| PicoError::UnknownTool(name.to_string()))?;

        let start = Instant::now();
        match tool.execute(args, ctx).await {
            Ok(output) => {
                info!(
                    tool = name,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Tool executed successfully"
                );
                Ok(output)
            }
            Err(e) => {
                error!(
                    tool = name,
                    error = %e,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Tool execution failed"
                );
                Err(match e {
                    PicoError::ToolExecution(_) => e,
                    other => PicoError::ToolExecution(other.to_string()),
                })
            }
        }
    }
}

/// Render a tool outcome as the content of a tool result message.
///
/// Failures become `Error [<kind>]: <detail>` so the model can react to them.
pub fn render_tool_result(result: Result<String>) -> String {
    match result {
        Ok(output) => output,
        Err(PicoError::UnknownTool(name)) => {
            format!("Error [unknown_tool]: tool '{}' is not registered", name)
        }
        Err(PicoError::ToolExecution(detail)) => {
            format!("Error [tool_execution_error]: {}", detail)
        }
        Err(e) => format!("Error [{}]: {}", e.kind(), e),
    }
}
