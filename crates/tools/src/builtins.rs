use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::{Tool, ToolContext, ToolSpec};

// ── Utilities ────────────────────────────────────────────────────────────────

/// Serialize a `JsonSchema` type into the parameter object the LLM sees.
/// Drops the schema-meta keys providers choke on.
pub fn schema_of<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}));
    if let Some(object) = value.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    value
}

/// Find the largest byte offset ≤ `max` that falls on a UTF-8 character
/// boundary.  Safe to use as `&s[..truncate_byte_boundary(s, max)]`.
fn truncate_byte_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Resolve `rel` against the context's workspace root, refusing escapes.
fn resolve_in_workspace(ctx: &ToolContext, rel: &str) -> Result<(PathBuf, PathBuf)> {
    let Some(ref root) = ctx.workspace_root else {
        bail!("this tool requires a workspace");
    };
    let full = root.join(rel);
    Ok((root.clone(), full))
}

fn assert_inside(root: &Path, resolved: &Path, rel: &str) -> Result<()> {
    let root_canonical = root.canonicalize()?;
    let canonical = resolved
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("cannot resolve path '{}': {}", rel, e))?;
    if !canonical.starts_with(&root_canonical) {
        bail!("path escapes workspace boundary: {}", canonical.display());
    }
    Ok(())
}

fn parse_args<T: serde::de::DeserializeOwned>(args: serde_json::Value) -> Result<T> {
    serde_json::from_value(args).map_err(|e| anyhow::anyhow!("invalid arguments: {e}"))
}

// ── read_file ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct ReadFileArgs {
    /// Relative path from the workspace root.
    path: String,
    /// Maximum bytes to read.
    #[serde(default)]
    max_bytes: Option<u64>,
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            id: "fs.read_file".to_string(),
            description: "Read the contents of a file within the agent workspace.".to_string(),
            parameters: schema_of::<ReadFileArgs>(),
        }
    }

    async fn run(&self, ctx: &ToolContext, args: serde_json::Value) -> Result<String> {
        let args: ReadFileArgs = parse_args(args)?;
        let (root, full) = resolve_in_workspace(ctx, &args.path)?;
        assert_inside(&root, &full, &args.path)?;

        let max_bytes = args.max_bytes.unwrap_or(65536) as usize;
        let content = tokio::fs::read_to_string(&full).await?;
        if content.len() > max_bytes {
            let end = truncate_byte_boundary(&content, max_bytes);
            Ok(format!("{}…[truncated at {} bytes]", &content[..end], max_bytes))
        } else {
            Ok(content)
        }
    }
}

// ── write_file ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct WriteFileArgs {
    /// Relative path from the workspace root.
    path: String,
    /// File content to write.
    content: String,
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            id: "fs.write_file".to_string(),
            description: "Write content to a file within the agent workspace (creates or overwrites)."
                .to_string(),
            parameters: schema_of::<WriteFileArgs>(),
        }
    }

    async fn run(&self, ctx: &ToolContext, args: serde_json::Value) -> Result<String> {
        let args: WriteFileArgs = parse_args(args)?;
        let (root, full) = resolve_in_workspace(ctx, &args.path)?;

        // The file may not exist yet — canonicalize its parent instead.
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
            assert_inside(&root, parent, &args.path)?;
        }

        tokio::fs::write(&full, &args.content).await?;
        Ok(format!("wrote {} bytes to {}", args.content.len(), args.path))
    }
}

// ── list_dir ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct ListDirArgs {
    /// Relative path from the workspace root; the root itself when omitted.
    #[serde(default)]
    path: Option<String>,
}

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            id: "fs.list_dir".to_string(),
            description: "List files and directories under a workspace path.".to_string(),
            parameters: schema_of::<ListDirArgs>(),
        }
    }

    async fn run(&self, ctx: &ToolContext, args: serde_json::Value) -> Result<String> {
        let args: ListDirArgs = parse_args(args)?;
        let rel = args.path.as_deref().unwrap_or(".");
        let (root, full) = resolve_in_workspace(ctx, rel)?;
        assert_inside(&root, &full, rel)?;

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&full).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let suffix = if entry.file_type().await?.is_dir() { "/" } else { "" };
            entries.push(format!("{name}{suffix}"));
        }
        entries.sort();
        Ok(entries.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx(root: &Path) -> ToolContext {
        ToolContext {
            workspace_root: Some(root.to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn schemas_are_plain_parameter_objects() {
        let schema = schema_of::<ReadFileArgs>();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["path"].is_object());
        assert!(schema.get("$schema").is_none());
        // Required fields survive the cleanup.
        assert!(schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v == "path"));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());

        WriteFileTool
            .run(&ctx, json!({"path": "notes/a.txt", "content": "hello"}))
            .await
            .unwrap();
        let out = ReadFileTool
            .run(&ctx, json!({"path": "notes/a.txt"}))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn read_refuses_workspace_escape() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let err = ReadFileTool
            .run(&ctx, json!({"path": "../../etc/passwd"}))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("escapes") || msg.contains("cannot resolve"), "{msg}");
    }

    #[tokio::test]
    async fn missing_required_arg_is_a_clean_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let err = WriteFileTool.run(&ctx, json!({"path": "a.txt"})).await.unwrap_err();
        assert!(err.to_string().contains("invalid arguments"));
    }

    #[tokio::test]
    async fn list_dir_marks_directories() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        WriteFileTool
            .run(&ctx, json!({"path": "sub/file.txt", "content": "x"}))
            .await
            .unwrap();
        let out = ListDirTool.run(&ctx, json!({})).await.unwrap();
        assert_eq!(out, "sub/");
    }

    #[tokio::test]
    async fn tools_without_workspace_fail_cleanly() {
        let bare = ToolContext::default();
        let err = ReadFileTool.run(&bare, json!({"path": "a"})).await.unwrap_err();
        assert!(err.to_string().contains("requires a workspace"));
        // And they still register fine.
        let mut reg = crate::ToolRegistry::default();
        reg.register(Arc::new(ReadFileTool));
        assert_eq!(reg.manifest()[0].id, "fs.read_file");
    }
}
