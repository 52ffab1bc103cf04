//! Background sub-task tool.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::SubagentManager;
use crate::error::{PicoError, Result};

use super::{Tool, ToolContext};

/// Hands a task to the subagent manager. The result arrives later as a
/// system message in the same conversation.
pub struct SpawnTool {
    manager: Arc<SubagentManager>,
}

impl SpawnTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a background subagent for a self-contained task. \
         Its result is reported back to this conversation when it completes."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Task description for the subagent"
                },
                "label": {
                    "type": "string",
                    "description": "Optional short task label"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let task = args
            .get("task")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PicoError::ToolExecution("missing 'task' argument".into()))?;
        let label = args.get("label").and_then(|v| v.as_str());

        let parent_key = ctx
            .session_key()
            .ok_or_else(|| PicoError::ToolExecution("no conversation in tool context".into()))?;

        let task_id = self.manager.spawn_labeled(task, label, &parent_key).await?;
        Ok(format!(
            "Spawned subagent task {}. I will report back when it completes.",
            task_id
        ))
    }
}
