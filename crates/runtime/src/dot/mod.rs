//! Dot — the per-request conversational driver.
//!
//! One prompt in, one reply out: tailor the context, consolidate the
//! briefing, run the tool loop on the assistant tier with staged escalation,
//! and either answer inline or hand off to the agent pipeline and
//! acknowledge. Completion of a hand-off arrives later as a
//! `dispatch_followup` on the event bus.

pub mod tailor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{info, warn};

use dotbot_config::DispatchConfig;
use dotbot_llm::{
    ChatMessage, ChatOptions, LlmError, ResilientClient, Role, ToolDefinition,
};
use dotbot_memory::MemoryStore;
use dotbot_tools::ToolHandler;

use crate::bus::{BusEvent, EventBus};
use crate::dispatch::{CRASH_FOLLOWUP, DispatchRequest, PipelineLauncher};
use crate::journal::RequestJournal;
use crate::tool_loop::{
    Escalation, EscalateFn, Termination, ToolExecution, ToolLoopConfig, run_tool_loop,
};

use self::tailor::{HistoryTurn, Principle, TailorContext, TailorOutput, run_consolidator, run_tailor};

/// Model-call budget for one Dot turn. Must clear the architect escalation
/// threshold so the final tier actually gets a turn.
const DOT_MAX_ITERATIONS: u32 = 12;
/// Recent turns pulled from the hot thread for the tailor.
const RECENT_HISTORY_TURNS: usize = 12;
/// The synthetic dispatch tool's id.
pub const DISPATCH_TOOL: &str = "task.dispatch";

/// Optional skill lookup the orchestrator may pre-fetch a turn from. Skill
/// content itself lives outside the core.
pub trait SkillIndex: Send + Sync {
    fn search(&self, query: &str) -> Vec<SkillHit>;
}

#[derive(Debug, Clone)]
pub struct SkillHit {
    pub slug: String,
    pub summary: String,
}

/// Persona constraints relevant to Dot: a forced model role disables the
/// escalation ladder.
#[derive(Debug, Clone, Default)]
pub struct PersonaHint {
    pub id: Option<String>,
    pub forced_role: Option<Role>,
}

#[derive(Debug, Clone)]
pub struct DotRequest {
    pub user_id: String,
    pub device_id: String,
    pub prompt: String,
    pub source: String,
    pub persona: PersonaHint,
    pub cancel: Option<watch::Receiver<bool>>,
}

#[derive(Debug, Clone)]
pub struct DotReply {
    pub text: String,
    /// Set when this turn handed work to the pipeline.
    pub dispatched_agent_id: Option<String>,
    pub skill_feedback: Option<String>,
}

pub struct DotOrchestrator {
    llm: Arc<ResilientClient>,
    bus: Arc<EventBus>,
    launcher: Arc<dyn PipelineLauncher>,
    memory: Arc<MemoryStore>,
    config: DispatchConfig,
    always_on_rules: Vec<Principle>,
    skills: Option<Arc<dyn SkillIndex>>,
}

impl DotOrchestrator {
    pub fn new(
        llm: Arc<ResilientClient>,
        bus: Arc<EventBus>,
        launcher: Arc<dyn PipelineLauncher>,
        memory: Arc<MemoryStore>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            llm,
            bus,
            launcher,
            memory,
            config,
            always_on_rules: Vec::new(),
            skills: None,
        }
    }

    pub fn with_always_on_rules(mut self, rules: Vec<Principle>) -> Self {
        self.always_on_rules = rules;
        self
    }

    pub fn with_skill_index(mut self, skills: Arc<dyn SkillIndex>) -> Self {
        self.skills = Some(skills);
        self
    }

    /// Handle one user prompt end to end.
    pub async fn handle_prompt(&self, request: DotRequest) -> Result<DotReply, LlmError> {
        let mut journal = RequestJournal::new(format!("dot-{}", request.user_id));

        journal.phase("tailor");
        let spines = self.memory.models.spines().unwrap_or_default();
        let cache_files: Vec<String> = self
            .memory
            .research
            .list()
            .into_iter()
            .map(|e| e.filename)
            .collect();
        let history = self.recent_history();
        let tailor_ctx = TailorContext {
            prompt: &request.prompt,
            recent_history: &history,
            memory_spines: &spines,
            cache_filenames: &cache_files,
        };
        let tailor = match run_tailor(&self.llm, &tailor_ctx).await {
            Ok(tailor) => tailor,
            Err(err) => {
                warn!(%err, "tailor failed — continuing with pass-through context");
                journal.record_error(&err);
                TailorOutput {
                    restated_request: request.prompt.clone(),
                    complexity: 3.0,
                    ..Default::default()
                }
            }
        };

        journal.phase("consolidate");
        let briefing =
            run_consolidator(&self.llm, &tailor, &self.always_on_rules, &[]).await;

        // Multi-topic mode: one loop per segment, answers joined with `---`.
        if tailor.topic_segments.len() >= 2 {
            journal.phase("multi_topic");
            let mut answers = Vec::new();
            for segment in &tailor.topic_segments {
                let segment_prompt = format!("{} (focus on: {segment})", tailor.restated_request);
                let reply = self
                    .run_single(&request, &tailor, &briefing, &segment_prompt, &mut journal)
                    .await?;
                answers.push(reply.text);
            }
            return Ok(DotReply {
                text: answers.join("\n---\n"),
                dispatched_agent_id: None,
                skill_feedback: tailor.skill_feedback.clone(),
            });
        }

        let restated = tailor.restated_request.clone();
        self.run_single(&request, &tailor, &briefing, &restated, &mut journal)
            .await
    }

    async fn run_single(
        &self,
        request: &DotRequest,
        tailor: &TailorOutput,
        briefing: &str,
        effective_prompt: &str,
        journal: &mut RequestJournal,
    ) -> Result<DotReply, LlmError> {
        journal.phase("tool_loop");

        let must_dispatch = tailor.complexity >= self.config.threshold;
        let messages = self.assemble_messages(tailor, briefing, effective_prompt, must_dispatch);

        // The dispatch tool records the launched agent id through this slot.
        let dispatched: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let (tools, handlers) = self.dispatch_toolset(request, effective_prompt, dispatched.clone());

        let initial_role = request.persona.forced_role.unwrap_or(Role::Assistant);
        let escalation = self.escalation_hook(&request.persona);

        let outcome = run_tool_loop(
            &self.llm,
            initial_role,
            messages,
            &tools,
            &handlers,
            ToolLoopConfig {
                max_iterations: DOT_MAX_ITERATIONS,
                on_escalate: escalation,
                cancel: request.cancel.clone(),
                ..Default::default()
            },
        )
        .await?;

        let dispatched_id = dispatched.lock().unwrap_or_else(|e| e.into_inner()).clone();

        match outcome.termination {
            Termination::Cancelled => Ok(DotReply {
                text: "Request cancelled.".to_string(),
                dispatched_agent_id: dispatched_id,
                skill_feedback: None,
            }),
            Termination::MaxIterations => {
                journal.phase("max_iterations_handoff");
                let handoff = build_handoff_prompt(effective_prompt, &outcome.executions);
                let agent_id = self
                    .launch_detached(request, &handoff, "dot_max_iterations")
                    .await;
                Ok(DotReply {
                    text: "I've handed this off — it needs more steps than I can take inline. \
                           I'll follow up when it's done."
                        .to_string(),
                    dispatched_agent_id: agent_id,
                    skill_feedback: tailor.skill_feedback.clone(),
                })
            }
            _ => {
                // Mandatory dispatch: the model was told to hand off; if it
                // answered inline anyway, dispatch now and acknowledge.
                if must_dispatch && dispatched_id.is_none() {
                    journal.phase("forced_dispatch");
                    let agent_id = self
                        .launch_detached(request, effective_prompt, "dot_forced")
                        .await;
                    return Ok(DotReply {
                        text: "This needs real work — I've kicked off a background task and \
                               will follow up with the result."
                            .to_string(),
                        dispatched_agent_id: agent_id,
                        skill_feedback: tailor.skill_feedback.clone(),
                    });
                }
                Ok(DotReply {
                    text: outcome.final_text,
                    dispatched_agent_id: dispatched_id,
                    skill_feedback: tailor.skill_feedback.clone(),
                })
            }
        }
    }

    fn recent_history(&self) -> Vec<HistoryTurn> {
        let Some(thread) = self.memory.threads.hot().into_iter().next() else {
            return Vec::new();
        };
        let messages = self.memory.threads.messages(&thread.thread_id).unwrap_or_default();
        messages
            .into_iter()
            .rev()
            .take(RECENT_HISTORY_TURNS)
            .rev()
            .map(|m| HistoryTurn { role: m.role, content: m.content })
            .collect()
    }

    fn assemble_messages(
        &self,
        tailor: &TailorOutput,
        briefing: &str,
        effective_prompt: &str,
        must_dispatch: bool,
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(
            "You are Dot, the user's assistant. Be direct and concrete. Use tools when \
             they help. For complex multi-step work, call task.dispatch instead of \
             attempting it inline.",
        )];

        // Synthesized recap turns extracted from real history.
        for turn in &tailor.manufactured_history {
            match turn.role.as_str() {
                "assistant" => messages.push(ChatMessage::assistant(turn.content.clone())),
                _ => messages.push(ChatMessage::user(turn.content.clone())),
            }
        }

        // Pre-fetched skill search, injected as a synthesized exchange.
        if let (Some(skills), Some(query)) = (&self.skills, &tailor.skill_search_query) {
            let hits = skills.search(query);
            if !hits.is_empty() {
                let listing = hits
                    .iter()
                    .map(|h| format!("- {}: {}", h.slug, h.summary))
                    .collect::<Vec<_>>()
                    .join("\n");
                messages.push(ChatMessage::user(format!("(skill lookup: {query})")));
                messages.push(ChatMessage::assistant(format!("Relevant skills:\n{listing}")));
            }
        }

        let mut user_message = String::new();
        if !briefing.is_empty() {
            user_message.push_str(&format!("BRIEFING:\n{briefing}\n\n"));
        }
        if must_dispatch {
            user_message.push_str(
                "MANDATORY: this request is too complex to answer inline. Call \
                 task.dispatch with the full request, then acknowledge briefly.\n\n",
            );
        }
        user_message.push_str(effective_prompt);
        messages.push(ChatMessage::user(user_message));
        messages
    }

    /// Dot's toolset: just the synthetic dispatch tool. Device tools run in
    /// the pipeline, not inline.
    fn dispatch_toolset(
        &self,
        request: &DotRequest,
        effective_prompt: &str,
        dispatched: Arc<Mutex<Option<String>>>,
    ) -> (Vec<ToolDefinition>, HashMap<String, ToolHandler>) {
        let tools = vec![ToolDefinition {
            name: DISPATCH_TOOL.to_string(),
            description: "Hand a complex task to the background agent pipeline. \
                          Returns immediately; the result arrives as a follow-up."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "task": {"type": "string", "description": "Full task description"},
                    "context": {"type": "string", "description": "Anything the agent should know"}
                },
                "required": ["task"]
            }),
        }];

        let llm = self.llm.clone();
        let bus = self.bus.clone();
        let launcher = self.launcher.clone();
        let request = request.clone();
        let effective_prompt = effective_prompt.to_string();

        let mut handlers: HashMap<String, ToolHandler> = HashMap::new();
        handlers.insert(
            DISPATCH_TOOL.to_string(),
            Arc::new(move |args: Value| {
                let llm = llm.clone();
                let bus = bus.clone();
                let launcher = launcher.clone();
                let request = request.clone();
                let effective_prompt = effective_prompt.clone();
                let dispatched = dispatched.clone();
                Box::pin(async move {
                    let task = args["task"].as_str().unwrap_or(&effective_prompt);
                    let context = args["context"].as_str().unwrap_or("");
                    let enriched = if context.is_empty() {
                        task.to_string()
                    } else {
                        format!("{task}\n\nContext from the conversation:\n{context}")
                    };

                    let agent_id = dispatch_and_supervise(
                        llm,
                        bus,
                        launcher,
                        DispatchRequest {
                            user_id: request.user_id.clone(),
                            device_id: request.device_id.clone(),
                            prompt: enriched,
                            persona_id: request.persona.id.clone(),
                            source: "dot".to_string(),
                        },
                    )
                    .await?;
                    *dispatched.lock().unwrap_or_else(|e| e.into_inner()) = Some(agent_id);
                    Ok(json!({"success": true}).to_string())
                })
            }),
        );

        (tools, handlers)
    }

    /// Programmatic dispatch used by forced hand-offs (threshold and
    /// max-iterations paths). Failure degrades to no dispatch.
    async fn launch_detached(
        &self,
        request: &DotRequest,
        prompt: &str,
        source: &str,
    ) -> Option<String> {
        match dispatch_and_supervise(
            self.llm.clone(),
            self.bus.clone(),
            self.launcher.clone(),
            DispatchRequest {
                user_id: request.user_id.clone(),
                device_id: request.device_id.clone(),
                prompt: prompt.to_string(),
                persona_id: request.persona.id.clone(),
                source: source.to_string(),
            },
        )
        .await
        {
            Ok(agent_id) => Some(agent_id),
            Err(err) => {
                warn!(%err, "forced dispatch failed");
                None
            }
        }
    }

    fn escalation_hook(&self, persona: &PersonaHint) -> Option<EscalateFn> {
        // A persona that pins architect or gui_fast opts out of the ladder.
        if matches!(persona.forced_role, Some(Role::Architect) | Some(Role::GuiFast)) {
            return None;
        }
        let workhorse_at = self.config.escalate_workhorse_at;
        let architect_at = self.config.escalate_architect_at;
        Some(Arc::new(move |iteration| {
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
        }))
    }
}

/// Launch the pipeline and detach a supervisor that summarizes the result
/// with a follow-up LLM call, then broadcasts `dispatch_followup`. A crashed
/// pipeline still produces a (fixed-text) follow-up.
pub async fn dispatch_and_supervise(
    llm: Arc<ResilientClient>,
    bus: Arc<EventBus>,
    launcher: Arc<dyn PipelineLauncher>,
    request: DispatchRequest,
) -> anyhow::Result<String> {
    let user_id = request.user_id.clone();
    let prompt = request.prompt.clone();
    let launched = launcher.launch(request).await?;
    let agent_id = launched.agent_id.clone();
    info!(agent_id = %agent_id, "pipeline dispatched");

    let supervisor_agent_id = agent_id.clone();
    tokio::spawn(async move {
        let message_id = uuid::Uuid::new_v4().to_string();
        let event = match launched.handle.await {
            Ok(Ok(result)) => {
                let response = summarize_followup(&llm, &prompt, &result.summary, result.success)
                    .await
                    .unwrap_or_else(|| result.summary.clone());
                BusEvent::DispatchFollowup {
                    user_id,
                    message_id,
                    agent_id: supervisor_agent_id,
                    success: result.success,
                    response,
                    workspace_path: result.workspace_path,
                }
            }
            Ok(Err(err)) => {
                warn!(%err, "pipeline returned an error");
                BusEvent::DispatchFollowup {
                    user_id,
                    message_id,
                    agent_id: supervisor_agent_id,
                    success: false,
                    response: CRASH_FOLLOWUP.to_string(),
                    workspace_path: String::new(),
                }
            }
            Err(join_err) => {
                warn!(%join_err, "pipeline task aborted");
                BusEvent::DispatchFollowup {
                    user_id,
                    message_id,
                    agent_id: supervisor_agent_id,
                    success: false,
                    response: CRASH_FOLLOWUP.to_string(),
                    workspace_path: String::new(),
                }
            }
        };
        bus.publish(event);
    });

    Ok(agent_id)
}

/// One short LLM call turning the pipeline's raw summary into a user-facing
/// follow-up. `None` on failure — the caller falls back to the raw summary.
async fn summarize_followup(
    llm: &ResilientClient,
    original_prompt: &str,
    raw_summary: &str,
    success: bool,
) -> Option<String> {
    let status = if success { "completed" } else { "failed" };
    let messages = vec![
        ChatMessage::system(
            "Write a short friendly follow-up message reporting a background task's \
             outcome to the user. Two sentences maximum.",
        ),
        ChatMessage::user(format!(
            "Task ({status}): {original_prompt}\n\nAgent summary:\n{raw_summary}"
        )),
    ];
    match llm.chat(Role::Assistant, &messages, &ChatOptions::default()).await {
        Ok(response) if !response.content.trim().is_empty() => {
            Some(response.content.trim().to_string())
        }
        _ => None,
    }
}

/// The hand-off prompt Dot builds when it runs out of iterations: the
/// original ask plus every tool call made so far with a result snippet.
fn build_handoff_prompt(original: &str, executions: &[ToolExecution]) -> String {
    let mut out = format!(
        "Continue this task; an assistant ran out of inline steps working on it.\n\n\
         ORIGINAL REQUEST:\n{original}\n\nWORK SO FAR:\n"
    );
    if executions.is_empty() {
        out.push_str("(no tool calls were made)\n");
    }
    for execution in executions {
        let status = if execution.success { "ok" } else { "FAILED" };
        let snippet: String = execution.output.chars().take(120).collect();
        out.push_str(&format!("- {} [{status}]: {snippet}\n", execution.tool));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{LaunchedPipeline, PipelineResult};
    use async_trait::async_trait;
    use dotbot_llm::{ApiKeys, ChatResponse, LlmClient, Provider, ProviderRegistry, ToolCall, ToolCallFunction};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    struct ScriptClient {
        responses: std::sync::Mutex<VecDeque<ChatResponse>>,
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
            tx: mpsc::Sender<String>,
        ) -> Result<ChatResponse, LlmError> {
            let response = self.chat(messages, options).await?;
            let _ = tx.send(response.content.clone()).await;
            Ok(response)
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

    fn dispatch_call(task: &str) -> ChatResponse {
        ChatResponse {
            provider: Provider::Deepseek,
            model: "deepseek-chat".to_string(),
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "c1".to_string(),
                r#type: "function".to_string(),
                function: ToolCallFunction {
                    name: DISPATCH_TOOL.to_string(),
                    arguments: json!({"task": task}),
                },
            }],
            finish_reason: "tool_calls".to_string(),
            reasoning_content: None,
            usage: None,
        }
    }

    async fn llm_with_script(responses: Vec<ChatResponse>) -> Arc<ResilientClient> {
        let keys = ApiKeys::default().with_key(Provider::Deepseek, "k");
        let registry = Arc::new(ProviderRegistry::new(keys));
        registry
            .insert(
                Provider::Deepseek,
                Arc::new(ScriptClient {
                    responses: std::sync::Mutex::new(responses.into()),
                }),
            )
            .await;
        Arc::new(ResilientClient::new(registry))
    }

    struct FakeLauncher {
        launches: AtomicU32,
        /// The fake pipeline completes only once the test opens this gate,
        /// keeping the supervisor's script consumption out of the main turn.
        gate: Arc<tokio::sync::Notify>,
    }

    impl FakeLauncher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicU32::new(0),
                gate: Arc::new(tokio::sync::Notify::new()),
            })
        }
    }

    #[async_trait]
    impl PipelineLauncher for FakeLauncher {
        async fn launch(&self, request: DispatchRequest) -> anyhow::Result<LaunchedPipeline> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let prompt = request.prompt;
            let gate = self.gate.clone();
            Ok(LaunchedPipeline {
                agent_id: "ag-test".to_string(),
                handle: tokio::spawn(async move {
                    gate.notified().await;
                    Ok(PipelineResult {
                        success: true,
                        summary: format!("finished: {prompt}"),
                        workspace_path: "/tmp/ws".to_string(),
                    })
                }),
            })
        }
    }

    fn dot(
        llm: Arc<ResilientClient>,
        launcher: Arc<FakeLauncher>,
        memory_dir: &std::path::Path,
    ) -> (DotOrchestrator, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let orchestrator = DotOrchestrator::new(
            llm,
            bus.clone(),
            launcher,
            Arc::new(MemoryStore::open(memory_dir)),
            DispatchConfig::default(),
        );
        (orchestrator, bus)
    }

    fn request(prompt: &str) -> DotRequest {
        DotRequest {
            user_id: "u1".to_string(),
            device_id: "dev-1".to_string(),
            prompt: prompt.to_string(),
            source: "user".to_string(),
            persona: PersonaHint::default(),
            cancel: None,
        }
    }

    #[tokio::test]
    async fn simple_prompt_answers_inline() {
        let dir = tempfile::tempdir().unwrap();
        // Script: tailor JSON, consolidator skipped (no principles), answer.
        let llm = llm_with_script(vec![
            text(r#"{"restated_request":"say hi","complexity":1,"context_confidence":0.9}"#),
            text("hi there!"),
        ])
        .await;
        let launcher = FakeLauncher::new();
        let (dot, _bus) = dot(llm, launcher.clone(), dir.path());

        let reply = dot.handle_prompt(request("say hi")).await.unwrap();
        assert_eq!(reply.text, "hi there!");
        assert!(reply.dispatched_agent_id.is_none());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn voluntary_dispatch_returns_ack_and_publishes_followup() {
        let dir = tempfile::tempdir().unwrap();
        let llm = llm_with_script(vec![
            text(r#"{"restated_request":"rebuild the index","complexity":5,"context_confidence":0.8}"#),
            dispatch_call("rebuild the index"),
            text("On it — I'll follow up when the rebuild lands."),
            // Follow-up summarizer call.
            text("Done! The index rebuild finished cleanly."),
        ])
        .await;
        let launcher = FakeLauncher::new();
        let (dot, bus) = dot(llm, launcher.clone(), dir.path());
        let mut events = bus.subscribe("u1");

        let reply = dot.handle_prompt(request("rebuild the index")).await.unwrap();
        assert_eq!(reply.dispatched_agent_id.as_deref(), Some("ag-test"));
        assert!(reply.text.contains("follow up"));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

        // Let the fake pipeline finish now that the turn is over.
        launcher.gate.notify_one();
        match events.recv().await.unwrap() {
            BusEvent::DispatchFollowup { success, response, .. } => {
                assert!(success);
                assert_eq!(response, "Done! The index rebuild finished cleanly.");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn high_complexity_forces_dispatch_even_when_model_answers_inline() {
        let dir = tempfile::tempdir().unwrap();
        let llm = llm_with_script(vec![
            text(r#"{"restated_request":"migrate the database","complexity":9,"context_confidence":0.7}"#),
            // The model ignores the directive and answers inline anyway.
            text("Sure, here's a 40-step migration plan inline..."),
            // Follow-up summarizer call for the forced dispatch.
            text("Migration task finished."),
        ])
        .await;
        let launcher = FakeLauncher::new();
        let (dot, _bus) = dot(llm, launcher.clone(), dir.path());

        let reply = dot.handle_prompt(request("migrate the database")).await.unwrap();
        // Inline answer suppressed, dispatch forced.
        assert!(reply.text.contains("background task"));
        assert_eq!(reply.dispatched_agent_id.as_deref(), Some("ag-test"));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multi_topic_segments_join_answers() {
        let dir = tempfile::tempdir().unwrap();
        let llm = llm_with_script(vec![
            text(
                r#"{"restated_request":"status of project A and trip B","complexity":3,
                    "context_confidence":0.8,"topic_segments":["project A","trip B"]}"#,
            ),
            text("Project A is on track."),
            text("Trip B leaves Tuesday."),
        ])
        .await;
        let launcher = FakeLauncher::new();
        let (dot, _bus) = dot(llm, launcher.clone(), dir.path());

        let reply = dot.handle_prompt(request("status of A and B?")).await.unwrap();
        assert_eq!(reply.text, "Project A is on track.\n---\nTrip B leaves Tuesday.");
    }

    #[tokio::test]
    async fn max_iterations_hands_off_with_tool_history() {
        let dir = tempfile::tempdir().unwrap();
        // Tailor, then DOT_MAX_ITERATIONS rounds of dispatchless tool calls…
        let mut script = vec![text(
            r#"{"restated_request":"endless","complexity":2,"context_confidence":0.5}"#,
        )];
        for i in 0..DOT_MAX_ITERATIONS {
            // Unknown tool: answered with an error, loop keeps going.
            script.push(ChatResponse {
                provider: Provider::Deepseek,
                model: "deepseek-chat".to_string(),
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: format!("c{i}"),
                    r#type: "function".to_string(),
                    function: ToolCallFunction {
                        name: "poke".to_string(),
                        arguments: json!({}),
                    },
                }],
                finish_reason: "tool_calls".to_string(),
                reasoning_content: None,
                usage: None,
            });
        }
        // Follow-up summarizer for the hand-off dispatch.
        script.push(text("Handed off."));
        let llm = llm_with_script(script).await;
        let launcher = FakeLauncher::new();
        let (dot, _bus) = dot(llm, launcher.clone(), dir.path());

        let reply = dot.handle_prompt(request("endless")).await.unwrap();
        assert!(reply.text.contains("handed this off"));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handoff_prompt_lists_every_tool_call() {
        let executions = vec![
            ToolExecution {
                tool: "fs.read_file".to_string(),
                args: json!({}),
                success: true,
                output: "contents of the file".to_string(),
            },
            ToolExecution {
                tool: "web.search".to_string(),
                args: json!({}),
                success: false,
                output: "Error: offline".to_string(),
            },
        ];
        let prompt = build_handoff_prompt("original ask", &executions);
        assert!(prompt.contains("original ask"));
        assert!(prompt.contains("fs.read_file [ok]"));
        assert!(prompt.contains("web.search [FAILED]"));
    }

    #[tokio::test]
    async fn forced_architect_persona_skips_escalation_ladder() {
        let dir = tempfile::tempdir().unwrap();
        let llm = llm_with_script(vec![
            text(r#"{"restated_request":"x","complexity":1,"context_confidence":0.9}"#),
            text("answer"),
        ])
        .await;
        let launcher = FakeLauncher::new();
        let (dot, _bus) = dot(llm, launcher, dir.path());
        assert!(dot
            .escalation_hook(&PersonaHint {
                id: None,
                forced_role: Some(Role::Architect),
            })
            .is_none());
        assert!(dot.escalation_hook(&PersonaHint::default()).is_some());
    }
}
