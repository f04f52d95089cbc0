//! The multi-phase task runner behind Dot: intake → recruit → plan → step
//! loop → re-plan, with `plan.json` as the single source of truth for
//! progress and crash recovery.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use dotbot_config::{AgentConfig, DispatchConfig};
use dotbot_llm::{ChatMessage, ResilientClient, Role, ToolCall, ToolDefinition};
use dotbot_memory::MemoryStore;
use dotbot_runtime::{
    DispatchRequest, Escalation, LaunchedPipeline, PipelineLauncher, PipelineResult, Termination,
    ToolLoopConfig, ToolObserver, run_tool_loop,
};
use dotbot_tools::{ToolContext, ToolExecutor, ToolHandler, ToolRegistry, handler_map};

use crate::intake;
use crate::persona::{AgentPersona, AgentStatus, PersonaProfile, recruit};
use crate::plan::{StepPlan, build_plan, progress_summary};
use crate::registry::{AgentTaskMeta, TaskRegistry};
use crate::replan::review_plan;
use crate::workspace::Workspace;

/// The step runner's synthetic stop tool.
pub const ESCALATE_TOOL: &str = "escalate";

/// Everything a pipeline run needs, shared by value. All heavy state is
/// behind `Arc`, so cloning is cheap and `launch` can detach runs freely.
#[derive(Clone)]
pub struct AgentPipeline {
    llm: Arc<ResilientClient>,
    tools: ToolRegistry,
    registry: Arc<TaskRegistry>,
    memory: Arc<MemoryStore>,
    personas: Arc<Vec<PersonaProfile>>,
    config: AgentConfig,
    dispatch_config: DispatchConfig,
    workspaces_root: PathBuf,
}

impl AgentPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<ResilientClient>,
        tools: ToolRegistry,
        registry: Arc<TaskRegistry>,
        memory: Arc<MemoryStore>,
        personas: Vec<PersonaProfile>,
        config: AgentConfig,
        dispatch_config: DispatchConfig,
        workspaces_root: PathBuf,
    ) -> Self {
        Self {
            llm,
            tools,
            registry,
            memory,
            personas: Arc::new(personas),
            config,
            dispatch_config,
            workspaces_root,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Fresh run: context build, intake, recruit, plan, then the step loop.
    async fn run_fresh(self, agent_id: String, request: DispatchRequest) -> Result<PipelineResult> {
        let workspace = Workspace::create(&self.workspaces_root, &agent_id)?;

        // Stage 1-2: context build + intake classification.
        let spines = self.memory.models.spines().unwrap_or_default();
        let restated = intake::classify(&self.llm, &request.prompt, &spines).await?;
        info!(agent_id = %agent_id, "intake classified");

        let research_index = self
            .memory
            .research
            .list()
            .into_iter()
            .map(|e| format!("- {} ({})", e.filename, e.topic))
            .collect::<Vec<_>>()
            .join("\n");
        workspace.save_intake(&format!(
            "# Intake\n\n## Request\n{restated}\n\n## Memory spines\n{}\n\n## Research cache\n{}\n",
            spines.join("\n"),
            research_index
        ))?;

        // Stage 3: two-phase recruiting.
        let manifest_ids: Vec<String> = self.tools.manifest().into_iter().map(|s| s.id).collect();
        let recruitment = recruit(&self.llm, &restated, &self.personas, &manifest_ids).await?;
        let mut persona = AgentPersona {
            agent_id: agent_id.clone(),
            status: AgentStatus::Running,
            persona_ids: recruitment.persona_ids,
            council: recruitment.council,
            model_role: recruitment.model_role,
            system_prompt: recruitment.system_prompt,
            tool_ids: recruitment.tool_ids,
            restated_requests: vec![restated.clone()],
            created_at: Utc::now(),
        };
        workspace.save_persona(&persona)?;

        // Stage 4: planning.
        let plan = build_plan(
            &self.llm,
            &restated,
            &persona.system_prompt,
            &persona.tool_ids,
            self.config.max_plan_steps,
        )
        .await?;
        plan.save(&workspace.plan_path())?;
        info!(agent_id = %agent_id, steps = plan.steps.len(), "plan persisted");

        // Stage 5-6: the step loop with re-planning.
        self.run_steps(&agent_id, &workspace, &mut persona, plan).await
    }

    /// Re-entry after a crash: persona and plan come from the workspace.
    async fn run_recovered(self, agent_id: String) -> Result<PipelineResult> {
        let workspace = Workspace::open(&self.workspaces_root, &agent_id);
        let Some(mut persona) = workspace.load_persona() else {
            anyhow::bail!("recovery: no persona in workspace {agent_id}");
        };
        let Some(plan) = workspace.load_plan() else {
            anyhow::bail!("recovery: no readable plan in workspace {agent_id}");
        };
        info!(agent_id = %agent_id, remaining = plan.progress.remaining.len(), "re-entering pipeline");
        self.run_steps(&agent_id, &workspace, &mut persona, plan).await
    }

    async fn run_steps(
        &self,
        agent_id: &str,
        workspace: &Workspace,
        persona: &mut AgentPersona,
        plan: StepPlan,
    ) -> Result<PipelineResult> {
        let plan = Arc::new(Mutex::new(plan));
        let mut step_outputs: Vec<String> = Vec::new();

        loop {
            // Cancellation check at every step boundary.
            if self.registry.status(agent_id) == Some(AgentStatus::Cancelled) {
                return Ok(self.finish(
                    agent_id,
                    workspace,
                    persona,
                    AgentStatus::Cancelled,
                    "cancelled".to_string(),
                ));
            }

            let Some(step_id) = current_step(&plan) else { break };
            let step = {
                let guard = lock(&plan);
                guard.step(&step_id).cloned()
            };
            let Some(step) = step else {
                // Progress names a step the plan no longer holds — drop it.
                lock(&plan).progress.remaining.retain(|s| s != &step_id);
                continue;
            };

            {
                let mut plan = lock(&plan);
                plan.begin_step(&step_id);
                plan.save(&workspace.plan_path())?;
            }

            // Per-step briefing: workspace listing, progress, injections.
            let injections = self.registry.drain_injections(agent_id);
            let mut briefing = workspace.briefing(&progress_summary(&lock(&plan)));
            if !injections.is_empty() {
                briefing.push_str(&format!("\nUSER UPDATES:\n{}\n", injections.join("\n")));
            }

            let (tools, handlers) = self.step_toolset(&step.tool_ids, workspace);
            let observer = Arc::new(PlanFlusher {
                plan: plan.clone(),
                path: workspace.plan_path(),
                step_id: step_id.clone(),
            });

            let messages = vec![
                ChatMessage::system(persona.system_prompt.clone()),
                ChatMessage::user(format!(
                    "{briefing}\nCURRENT STEP: {}\n{}\nEXPECTED OUTPUT: {}\n\
                     Work the step with your tools. Call `{ESCALATE_TOOL}` only if you \
                     cannot proceed without outside help.",
                    step.title, step.description, step.expected_output
                )),
            ];

            let role = persona.model_role.unwrap_or(Role::Workhorse);
            let outcome = run_tool_loop(
                &self.llm,
                role,
                messages,
                &tools,
                &handlers,
                ToolLoopConfig {
                    max_iterations: self.config.step_max_iterations,
                    stop_tool: Some(ESCALATE_TOOL.to_string()),
                    on_escalate: Some(self.escalation_hook()),
                    observer: Some(observer),
                    ..Default::default()
                },
            )
            .await?;

            match outcome.termination {
                Termination::StoppedByTool { args, .. } => {
                    let reason = args["reason"].as_str().unwrap_or("unspecified").to_string();
                    warn!(agent_id, step = %step.title, %reason, "step escalated out");
                    {
                        let mut plan = lock(&plan);
                        plan.stop_at_step(&step_id);
                        plan.save(&workspace.plan_path())?;
                    }
                    return Ok(self.finish(
                        agent_id,
                        workspace,
                        persona,
                        AgentStatus::Blocked,
                        format!("Escalated during '{}': {reason}", step.title),
                    ));
                }
                Termination::Cancelled => {
                    return Ok(self.finish(
                        agent_id,
                        workspace,
                        persona,
                        AgentStatus::Cancelled,
                        "cancelled".to_string(),
                    ));
                }
                Termination::Done | Termination::MaxIterations => {
                    let failed = matches!(outcome.termination, Termination::MaxIterations);
                    let output = if outcome.final_text.is_empty() {
                        "(no step output)".to_string()
                    } else {
                        outcome.final_text.clone()
                    };
                    {
                        let mut plan = lock(&plan);
                        if failed {
                            plan.fail_step(&step_id);
                        }
                        plan.complete_step(&step_id);
                        plan.save(&workspace.plan_path())?;
                    }
                    step_outputs.push(format!("## {}\n{output}", step.title));

                    // Stage 6: conservative plan review between steps. The
                    // review works on a copy so no lock is held across the
                    // LLM call; the runner is the only writer meanwhile.
                    let listing = workspace.listing().unwrap_or_default();
                    let manifest_ids: Vec<String> =
                        self.tools.manifest().into_iter().map(|s| s.id).collect();
                    let mut reviewed = lock(&plan).clone();
                    if let Err(err) = review_plan(
                        &self.llm,
                        &mut reviewed,
                        &step.title,
                        &output,
                        failed,
                        &listing,
                        &manifest_ids,
                    )
                    .await
                    {
                        warn!(%err, "plan review failed — keeping the plan");
                    }
                    reviewed.save(&workspace.plan_path())?;
                    *lock(&plan) = reviewed;
                }
            }
        }

        let summary = if step_outputs.is_empty() {
            "No steps produced output.".to_string()
        } else {
            step_outputs.join("\n\n")
        };
        Ok(self.finish(agent_id, workspace, persona, AgentStatus::Completed, summary))
    }

    /// Terminal bookkeeping. The registry write is the arbiter: if the task
    /// was cancelled while we were finishing, the cancelled status stands and
    /// the result flips to unsuccessful.
    fn finish(
        &self,
        agent_id: &str,
        workspace: &Workspace,
        persona: &mut AgentPersona,
        status: AgentStatus,
        summary: String,
    ) -> PipelineResult {
        let accepted = self.registry.set_status(agent_id, status);
        let effective = if accepted { status } else { AgentStatus::Cancelled };
        persona.status = effective;
        if let Err(err) = workspace.save_persona(persona) {
            warn!(%err, "failed to persist terminal persona status");
        }
        PipelineResult {
            success: effective == AgentStatus::Completed,
            summary: if accepted { summary } else { "cancelled".to_string() },
            workspace_path: workspace.root().display().to_string(),
        }
    }

    /// Per-step toolset: the manifest intersected with the step's ids, plus
    /// the synthetic escalate tool.
    fn step_toolset(
        &self,
        step_tool_ids: &[String],
        workspace: &Workspace,
    ) -> (Vec<ToolDefinition>, HashMap<String, ToolHandler>) {
        let subset = self.tools.intersect(step_tool_ids);
        let ctx = ToolContext {
            workspace_root: Some(workspace.sandbox()),
            ..Default::default()
        };
        let mut handlers = handler_map(&subset, ToolExecutor::default(), ctx);
        let mut tools = subset.definitions();

        tools.push(ToolDefinition {
            name: ESCALATE_TOOL.to_string(),
            description: "Stop this step and escalate out when you cannot proceed \
                          without outside help."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string"},
                    "resume_hint": {"type": "string"}
                },
                "required": ["reason"]
            }),
        });
        handlers.insert(
            ESCALATE_TOOL.to_string(),
            Arc::new(|_args| Box::pin(async move { Ok("escalation recorded".to_string()) })),
        );

        (tools, handlers)
    }

    fn escalation_hook(&self) -> dotbot_runtime::EscalateFn {
        let workhorse_at = self.dispatch_config.escalate_workhorse_at;
        let architect_at = self.dispatch_config.escalate_architect_at;
        Arc::new(move |iteration| {
            if iteration == architect_at {
                Some(Escalation {
                    role: Role::Architect,
                    temperature: None,
                    max_tokens: None,
                    tier: "architect".to_string(),
                })
            } else if iteration == workhorse_at {
                Some(Escalation {
                    role: Role::Workhorse,
                    temperature: None,
                    max_tokens: None,
                    tier: "workhorse".to_string(),
                })
            } else {
                None
            }
        })
    }

    /// Startup recovery scan: workspaces whose persona still says `running`
    /// but which no live registry entry backs are re-entered, provided they
    /// have remaining steps and at least one restated request.
    pub fn recover_orphans(&self) -> Vec<String> {
        let mut recovered = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.workspaces_root) else {
            return recovered;
        };

        for entry in entries.flatten() {
            let Some(agent_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let workspace = Workspace::open(&self.workspaces_root, &agent_id);
            let Some(persona) = workspace.load_persona() else { continue };
            if persona.status != AgentStatus::Running
                || self.registry.contains(&agent_id)
                || persona.restated_requests.is_empty()
            {
                continue;
            }
            let Some(plan) = workspace.load_plan() else { continue };
            if plan.progress.remaining.is_empty() {
                continue;
            }

            info!(agent_id = %agent_id, "recovering orphaned agent task");
            self.registry.register_pending(AgentTaskMeta {
                id: agent_id.clone(),
                device_id: String::new(),
                user_id: String::new(),
                prompt: persona.restated_requests.last().cloned().unwrap_or_default(),
                persona_id: persona.persona_ids.first().cloned(),
                created_at: persona.created_at,
            });
            let pipeline = self.clone();
            let id_clone = agent_id.clone();
            let handle = tokio::spawn(async move { pipeline.run_recovered(id_clone).await });
            self.registry.attach_abort(&agent_id, handle.abort_handle());
            recovered.push(agent_id);
        }
        recovered
    }
}

#[async_trait]
impl PipelineLauncher for AgentPipeline {
    async fn launch(&self, request: DispatchRequest) -> Result<LaunchedPipeline> {
        let agent_id = format!("ag-{}", Uuid::new_v4().simple());

        // Register before spawning so the run can never outrace its own
        // registry entry; the abort handle follows right after.
        self.registry.register_pending(AgentTaskMeta {
            id: agent_id.clone(),
            device_id: request.device_id.clone(),
            user_id: request.user_id.clone(),
            prompt: request.prompt.clone(),
            persona_id: request.persona_id.clone(),
            created_at: Utc::now(),
        });

        let pipeline = self.clone();
        let id_clone = agent_id.clone();
        let handle = tokio::spawn(async move { pipeline.run_fresh(id_clone, request).await });
        self.registry.attach_abort(&agent_id, handle.abort_handle());

        Ok(LaunchedPipeline { agent_id, handle })
    }
}

/// Flushes `plan.json` after every tool result, so recovery can resume at
/// the last completed call.
struct PlanFlusher {
    plan: Arc<Mutex<StepPlan>>,
    path: PathBuf,
    step_id: String,
}

impl ToolObserver for PlanFlusher {
    fn on_tool_result(&self, call: &ToolCall, _output: &str, success: bool) -> Result<()> {
        let mut plan = self.plan.lock().unwrap_or_else(|e| e.into_inner());
        crate::plan::flush_tool_result(
            &self.path,
            &mut plan,
            &self.step_id,
            &call.function.name,
            success,
        );
        Ok(())
    }
}

fn lock(plan: &Arc<Mutex<StepPlan>>) -> std::sync::MutexGuard<'_, StepPlan> {
    plan.lock().unwrap_or_else(|e| e.into_inner())
}

fn current_step(plan: &Arc<Mutex<StepPlan>>) -> Option<String> {
    lock(plan).progress.remaining.first().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotbot_llm::{
        ApiKeys, ChatOptions, ChatResponse, LlmClient, LlmError, Provider, ProviderRegistry,
        ToolCallFunction,
    };
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    struct ScriptClient {
        responses: Mutex<VecDeque<ChatResponse>>,
    }

    #[async_trait]
    impl LlmClient for ScriptClient {
        fn provider(&self) -> Provider {
            Provider::Deepseek
        }
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> Result<ChatResponse, LlmError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LlmError::Unknown("script exhausted".to_string()))
        }
        async fn stream(
            &self,
            messages: &[ChatMessage],
            options: &ChatOptions,
            _tx: mpsc::Sender<String>,
        ) -> Result<ChatResponse, LlmError> {
            self.chat(messages, options).await
        }
    }

    fn text(content: &str) -> ChatResponse {
        ChatResponse {
            provider: Provider::Deepseek,
            model: "deepseek-chat".to_string(),
            content: content.to_string(),
            tool_calls: vec![],
            finish_reason: "stop".to_string(),
            reasoning_content: None,
            usage: None,
        }
    }

    fn tool_call(name: &str, args: serde_json::Value) -> ChatResponse {
        ChatResponse {
            provider: Provider::Deepseek,
            model: "deepseek-chat".to_string(),
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "c1".to_string(),
                r#type: "function".to_string(),
                function: ToolCallFunction { name: name.to_string(), arguments: args },
            }],
            finish_reason: "tool_calls".to_string(),
            reasoning_content: None,
            usage: None,
        }
    }

    async fn pipeline_with_script(
        root: &std::path::Path,
        responses: Vec<ChatResponse>,
    ) -> AgentPipeline {
        let keys = ApiKeys::default().with_key(Provider::Deepseek, "k");
        let registry = Arc::new(ProviderRegistry::new(keys));
        registry
            .insert(
                Provider::Deepseek,
                Arc::new(ScriptClient { responses: Mutex::new(responses.into()) }),
            )
            .await;

        let mut tools = ToolRegistry::default();
        tools.register(Arc::new(dotbot_tools::WriteFileTool));
        tools.register(Arc::new(dotbot_tools::ReadFileTool));

        AgentPipeline::new(
            Arc::new(ResilientClient::new(registry)),
            tools,
            Arc::new(TaskRegistry::new()),
            Arc::new(MemoryStore::open(root.join("memory"))),
            vec![PersonaProfile {
                id: "researcher".to_string(),
                name: "Researcher".to_string(),
                summary: "digs things up".to_string(),
                body: "You research carefully and cite sources.".to_string(),
            }],
            AgentConfig::default(),
            DispatchConfig::default(),
            root.join("agent-workspaces"),
        )
    }

    fn request(prompt: &str) -> DispatchRequest {
        DispatchRequest {
            user_id: "u1".to_string(),
            device_id: "dev-1".to_string(),
            prompt: prompt.to_string(),
            persona_id: None,
            source: "dot".to_string(),
        }
    }

    #[tokio::test]
    async fn single_step_pipeline_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        // Script: intake, recruit phase 1, recruit phase 2, planner,
        // step answer. (One step, so the re-planner never fires.)
        let script = vec![
            text(r#"{"restated_request":"write a haiku to notes.md"}"#),
            text(r#"{"persona_ids":["researcher"],"model_role":"workhorse"}"#),
            text(r#"{"system_prompt":"You write crisp haiku.","tool_ids":["fs.write_file"]}"#),
            text(
                r#"{"approach":"one step","is_simple_task":true,"steps":[{"title":"write haiku",
                    "description":"write it to notes.md","expected_output":"notes.md",
                    "tool_ids":["fs.write_file"]}]}"#,
            ),
            tool_call("fs.write_file", serde_json::json!({"path": "output/notes.md", "content": "haiku"})),
            text("Wrote the haiku to output/notes.md."),
        ];
        let pipeline = pipeline_with_script(dir.path(), script).await;

        let launched = pipeline.launch(request("write me a haiku")).await.unwrap();
        let agent_id = launched.agent_id.clone();
        let result = launched.handle.await.unwrap().unwrap();

        assert!(result.success);
        assert!(result.summary.contains("haiku"));
        assert_eq!(pipeline.registry.status(&agent_id), Some(AgentStatus::Completed));

        // The workspace holds the documented artifacts.
        let workspace = Workspace::open(&dir.path().join("agent-workspaces"), &agent_id);
        let persona = workspace.load_persona().unwrap();
        assert_eq!(persona.status, AgentStatus::Completed);
        assert_eq!(persona.persona_ids, vec!["researcher"]);
        assert_eq!(persona.tool_ids, vec!["fs.write_file"]);

        let plan = workspace.load_plan().unwrap();
        assert!(plan.progress.remaining.is_empty());
        assert_eq!(plan.progress.completed.len(), 1);
        // The tool result was flushed into the log before the step ended.
        assert_eq!(plan.progress.tool_log.len(), 1);
        assert_eq!(plan.progress.tool_log[0].tool, "fs.write_file");

        // And the tool really ran inside the sandbox.
        let written =
            std::fs::read_to_string(workspace.sandbox().join("output/notes.md")).unwrap();
        assert_eq!(written, "haiku");
    }

    #[tokio::test]
    async fn escalate_stops_the_run_as_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let script = vec![
            text(r#"{"restated_request":"do the blocked thing"}"#),
            text(r#"{"persona_ids":["researcher"]}"#),
            text(r#"{"system_prompt":"p","tool_ids":[]}"#),
            text(
                r#"{"approach":"x","is_simple_task":true,"steps":[{"title":"try",
                    "description":"d","expected_output":"o","tool_ids":[]}]}"#,
            ),
            tool_call(ESCALATE_TOOL, serde_json::json!({"reason": "need credentials"})),
        ];
        let pipeline = pipeline_with_script(dir.path(), script).await;

        let launched = pipeline.launch(request("blocked task")).await.unwrap();
        let agent_id = launched.agent_id.clone();
        let result = launched.handle.await.unwrap().unwrap();

        assert!(!result.success);
        assert!(result.summary.contains("need credentials"));
        assert_eq!(pipeline.registry.status(&agent_id), Some(AgentStatus::Blocked));

        let workspace = Workspace::open(&dir.path().join("agent-workspaces"), &agent_id);
        let plan = workspace.load_plan().unwrap();
        assert!(plan.progress.stopped_at.is_some());
    }

    #[tokio::test]
    async fn cancelled_task_is_never_marked_completed() {
        let dir = tempfile::tempdir().unwrap();
        // Intake never resolves: the fake hangs by exhausting the script and
        // erroring, so cancel first instead — the race the registry guards.
        let script = vec![
            text(r#"{"restated_request":"slow task"}"#),
            text(r#"{"persona_ids":["researcher"]}"#),
            text(r#"{"system_prompt":"p","tool_ids":[]}"#),
            text(
                r#"{"approach":"x","is_simple_task":true,"steps":[{"title":"s",
                    "description":"d","expected_output":"o","tool_ids":[]}]}"#,
            ),
            text("step answer"),
        ];
        let pipeline = pipeline_with_script(dir.path(), script).await;

        let launched = pipeline.launch(request("task")).await.unwrap();
        let agent_id = launched.agent_id.clone();
        // Cancel immediately; the run may be anywhere in its stages.
        pipeline.registry.cancel(&agent_id);

        // Whether the run finished or was aborted, status stays cancelled.
        let _ = launched.handle.await;
        assert_eq!(pipeline.registry.status(&agent_id), Some(AgentStatus::Cancelled));
    }

    #[tokio::test]
    async fn orphaned_running_workspace_is_recovered_and_finished() {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = dir.path().join("agent-workspaces");

        // Hand-build an orphan: persona says running, plan has one remaining
        // step, nothing registered in memory.
        let workspace = Workspace::create(&workspaces, "ag-orphan").unwrap();
        workspace
            .save_persona(&AgentPersona {
                agent_id: "ag-orphan".to_string(),
                status: AgentStatus::Running,
                persona_ids: vec!["researcher".to_string()],
                council: vec![],
                model_role: None,
                system_prompt: "finish the job".to_string(),
                tool_ids: vec![],
                restated_requests: vec!["finish the report".to_string()],
                created_at: Utc::now(),
            })
            .unwrap();
        let plan = StepPlan {
            approach: "one step".to_string(),
            steps: vec![crate::plan::PlanStep {
                id: "step-1".to_string(),
                title: "finish".to_string(),
                description: "finish the report".to_string(),
                expected_output: "report".to_string(),
                tool_ids: vec![],
                needs_external_data: false,
            }],
            progress: crate::plan::PlanProgress {
                remaining: vec!["step-1".to_string()],
                ..Default::default()
            },
        };
        plan.save(&workspace.plan_path()).unwrap();

        // Script covers only the remaining step — recovery skips intake,
        // recruiting, and planning.
        let pipeline =
            pipeline_with_script(dir.path(), vec![text("report finished")]).await;
        let recovered = pipeline.recover_orphans();
        assert_eq!(recovered, vec!["ag-orphan"]);
        assert!(pipeline.registry.contains("ag-orphan"));

        // Wait for the respawned run to finish.
        for _ in 0..100 {
            if pipeline.registry.status("ag-orphan") == Some(AgentStatus::Completed) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(pipeline.registry.status("ag-orphan"), Some(AgentStatus::Completed));
        let plan = workspace.load_plan().unwrap();
        assert!(plan.progress.remaining.is_empty());

        // A second scan finds nothing left to recover.
        assert!(pipeline.recover_orphans().is_empty());
    }

    #[tokio::test]
    async fn completed_workspaces_are_not_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = dir.path().join("agent-workspaces");
        let workspace = Workspace::create(&workspaces, "ag-done").unwrap();
        workspace
            .save_persona(&AgentPersona {
                agent_id: "ag-done".to_string(),
                status: AgentStatus::Completed,
                persona_ids: vec![],
                council: vec![],
                model_role: None,
                system_prompt: String::new(),
                tool_ids: vec![],
                restated_requests: vec!["done already".to_string()],
                created_at: Utc::now(),
            })
            .unwrap();

        let pipeline = pipeline_with_script(dir.path(), vec![]).await;
        assert!(pipeline.recover_orphans().is_empty());
    }
}
