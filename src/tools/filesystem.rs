//! Filesystem tools for PicoClaw
//!
//! Read-only access to the workspace. Paths may be relative to the workspace
//! or absolute, but must resolve inside it after symlinks are followed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{PicoError, Result};

use super::{Tool, ToolContext};

/// Largest file `read_file` will return in full.
const MAX_READ_BYTES: usize = 256 * 1024;

/// Resolve `path` against the workspace and reject anything that escapes it.
fn resolve_path(path: &str, ctx: &ToolContext) -> Result<PathBuf> {
    let workspace = ctx.workspace.as_deref().ok_or_else(|| {
        PicoError::ToolExecution("workspace not configured for filesystem tools".to_string())
    })?;
    let root = std::fs::canonicalize(workspace).map_err(|e| {
        PicoError::ToolExecution(format!("workspace '{}' unavailable: {}", workspace, e))
    })?;

    let requested = Path::new(path);
    let joined = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };
    let resolved = std::fs::canonicalize(&joined)
        .map_err(|e| PicoError::ToolExecution(format!("cannot access '{}': {}", path, e)))?;

    if !resolved.starts_with(&root) {
        return Err(PicoError::ToolExecution(format!(
            "path '{}' is outside the workspace",
            path
        )));
    }
    Ok(resolved)
}

fn path_arg(args: &Value) -> Result<&str> {
    args.get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| PicoError::ToolExecution("missing 'path' argument".into()))
}

/// Tool for reading file contents.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file in the workspace"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let full_path = resolve_path(path_arg(&args)?, ctx)?;

        let mut content = tokio::fs::read_to_string(&full_path).await.map_err(|e| {
            PicoError::ToolExecution(format!(
                "failed to read '{}': {}",
                full_path.display(),
                e
            ))
        })?;

        if content.len() > MAX_READ_BYTES {
            let mut cut = MAX_READ_BYTES;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
            content.push_str("\n... (truncated)");
        }
        Ok(content)
    }
}

/// Tool for listing a directory.
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory in the workspace"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path, relative to the workspace (default '.')"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let full_path = resolve_path(path, ctx)?;

        let mut entries = tokio::fs::read_dir(&full_path).await.map_err(|e| {
            PicoError::ToolExecution(format!(
                "failed to read directory '{}': {}",
                full_path.display(),
                e
            ))
        })?;

        let mut items = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PicoError::ToolExecution(format!("failed to read entry: {}", e)))?
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let suffix = match entry.file_type().await {
                Ok(ft) if ft.is_dir() => "/",
                Ok(ft) if ft.is_symlink() => "@",
                _ => "",
            };
            items.push(format!("{}{}", file_name, suffix));
        }

        items.sort();
        if items.is_empty() {
            return Ok("(empty directory)".to_string());
        }
        Ok(items.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx_for(dir: &TempDir) -> ToolContext {
        ToolContext::new().with_workspace(dir.path().to_str().unwrap())
    }

    #[tokio::test]
    async fn test_read_file_relative() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.md"), "hello").unwrap();

        let out = ReadFileTool
            .execute(json!({"path": "notes.md"}), &ctx_for(&dir))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_read_file_missing_path_arg() {
        let dir = TempDir::new().unwrap();
        let err = ReadFileTool
            .execute(json!({}), &ctx_for(&dir))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing 'path'"));
    }

    #[tokio::test]
    async fn test_read_file_requires_workspace() {
        let err = ReadFileTool
            .execute(json!({"path": "x"}), &ToolContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PicoError::ToolExecution(_)));
    }

    #[tokio::test]
    async fn test_path_traversal_blocked() {
        let outer = TempDir::new().unwrap();
        let ws = outer.path().join("ws");
        std::fs::create_dir(&ws).unwrap();
        std::fs::write(outer.path().join("secret.txt"), "nope").unwrap();

        let ctx = ToolContext::new().with_workspace(ws.to_str().unwrap());
        let err = ReadFileTool
            .execute(json!({"path": "../secret.txt"}), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside the workspace"));

        let abs = outer.path().join("secret.txt");
        let err = ReadFileTool
            .execute(json!({"path": abs.to_str().unwrap()}), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside the workspace"));
    }

    #[tokio::test]
    async fn test_list_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();

        let out = ListDirTool.execute(json!({}), &ctx_for(&dir)).await.unwrap();
        assert_eq!(out, "a/\nb.txt");
    }

    #[tokio::test]
    async fn test_list_dir_empty() {
        let dir = TempDir::new().unwrap();
        let out = ListDirTool
            .execute(json!({"path": "."}), &ctx_for(&dir))
            .await
            .unwrap();
        assert_eq!(out, "(empty directory)");
    }
}
