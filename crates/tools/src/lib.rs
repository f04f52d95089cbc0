use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use dotbot_llm::ToolDefinition;

// ── Tool trait and registry ──────────────────────────────────────────────────

/// Static metadata about a tool: the id the model calls it by, a description,
/// and a JSON-schema object describing its arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub id: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.id.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Ambient state handed to every tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Sandbox root for file-touching tools. `None` means no file access.
    pub workspace_root: Option<PathBuf>,
    pub device_id: Option<String>,
    pub user_id: Option<String>,
}

/// Trait implemented by every tool handler. Failures become `Error:`-prefixed
/// tool messages in the loop; they never abort a request.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, ctx: &ToolContext, args: serde_json::Value) -> Result<String>;
}

/// Central registry for all available tools. The full spec list doubles as
/// the tool manifest sent to the recruiter and planner.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn manifest(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.spec().id == id).cloned()
    }

    /// The manifest restricted to the given ids, preserving manifest order.
    /// Unknown ids are dropped with a warning rather than failing the step.
    pub fn intersect(&self, ids: &[String]) -> ToolRegistry {
        let mut subset = ToolRegistry::default();
        for tool in &self.tools {
            if ids.contains(&tool.spec().id) {
                subset.register(tool.clone());
            }
        }
        for id in ids {
            if self.get(id).is_none() {
                warn!(tool = %id, "unknown tool id dropped from step toolset");
            }
        }
        subset
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.spec().to_definition()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

// ── Execution ────────────────────────────────────────────────────────────────

/// Default wall-clock budget for a single tool invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs tools from a registry with a per-call timeout.
#[derive(Clone)]
pub struct ToolExecutor {
    timeout: Duration,
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self { timeout: DEFAULT_TOOL_TIMEOUT }
    }
}

impl ToolExecutor {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Execute tool `id` with `args`. Unknown tools and timeouts are errors
    /// for the caller to stringify into the transcript.
    pub async fn execute(
        &self,
        registry: &ToolRegistry,
        ctx: &ToolContext,
        id: &str,
        args: serde_json::Value,
    ) -> Result<String> {
        let Some(tool) = registry.get(id) else {
            anyhow::bail!("unknown tool '{id}'");
        };
        match tokio::time::timeout(self.timeout, tool.run(ctx, args)).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("tool '{id}' timed out after {:?}", self.timeout),
        }
    }
}

/// Convenience for building a handler map keyed by tool id from a registry,
/// the shape the tool loop consumes.
pub fn handler_map(
    registry: &ToolRegistry,
    executor: ToolExecutor,
    ctx: ToolContext,
) -> HashMap<String, ToolHandler> {
    let mut map = HashMap::new();
    for spec in registry.manifest() {
        let registry = registry.clone();
        let executor = executor.clone();
        let ctx = ctx.clone();
        let id = spec.id.clone();
        let handler: ToolHandler = Arc::new(move |args: serde_json::Value| {
            let registry = registry.clone();
            let executor = executor.clone();
            let ctx = ctx.clone();
            let id = id.clone();
            Box::pin(async move { executor.execute(&registry, &ctx, &id, args).await })
        });
        map.insert(spec.id, handler);
    }
    map
}

/// Boxed async tool handler: args in, string result out.
pub type ToolHandler = Arc<
    dyn Fn(
            serde_json::Value,
        ) -> std::pin::Pin<Box<dyn Future<Output = Result<String>> + Send>>
        + Send
        + Sync,
>;

pub mod builtins;
pub use builtins::{ListDirTool, ReadFileTool, WriteFileTool};

// ── Registry tests ───────────────────────────────────────────────────────────
