//! Native function-calling loop shared by every LLM-driven component.
//!
//! Drives a role-selected model until it answers in plain text, a stop tool
//! fires, the iteration budget runs out, or cancellation is signalled. Tool
//! handlers fail soft: their errors become `Error:`-prefixed tool messages
//! the model can read and adapt to.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use dotbot_llm::{
    ChatMessage, ChatOptions, LlmError, ResilientClient, Role, ToolCall, ToolDefinition,
    definitions_to_openai_tools,
};
use dotbot_tools::ToolHandler;

/// Mid-loop model swap produced by the escalation hook. The message list is
/// preserved; only the role/tuning change from the next model call on.
#[derive(Debug, Clone)]
pub struct Escalation {
    pub role: Role,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Human label for logs ("workhorse", "architect").
    pub tier: String,
}

/// Called with the iteration number before each model call; `Some` swaps the
/// model starting with that call.
pub type EscalateFn = Arc<dyn Fn(u32) -> Option<Escalation> + Send + Sync>;

/// Observer callbacks around each tool execution. Errors are logged and
/// swallowed — an observer can never abort the loop.
pub trait ToolObserver: Send + Sync {
    fn on_tool_call(&self, call: &ToolCall) -> anyhow::Result<()> {
        let _ = call;
        Ok(())
    }
    fn on_tool_result(&self, call: &ToolCall, output: &str, success: bool) -> anyhow::Result<()> {
        let _ = (call, output, success);
        Ok(())
    }
}

/// Loop configuration. `max_iterations` bounds model calls, not tool calls.
pub struct ToolLoopConfig {
    pub max_iterations: u32,
    /// Tool id that terminates the loop immediately after its result is
    /// produced ("escalate out of this scope").
    pub stop_tool: Option<String>,
    pub on_escalate: Option<EscalateFn>,
    pub cancel: Option<watch::Receiver<bool>>,
    /// Streaming text chunks are forwarded here during model calls only.
    pub on_stream: Option<mpsc::Sender<String>>,
    pub observer: Option<Arc<dyn ToolObserver>>,
    /// Extra guidance appended to a tool's description for this run only.
    pub tool_hints: HashMap<String, String>,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            stop_tool: None,
            on_escalate: None,
            cancel: None,
            on_stream: None,
            observer: None,
            tool_hints: HashMap::new(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// The model answered with text only.
    Done,
    /// The stop tool fired; its arguments ride along.
    StoppedByTool { tool: String, args: Value },
    MaxIterations,
    Cancelled,
}

/// Record of a single tool execution within the loop, in order.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub tool: String,
    pub args: Value,
    pub success: bool,
    pub output: String,
}

#[derive(Debug)]
pub struct ToolLoopOutcome {
    pub messages: Vec<ChatMessage>,
    /// Text of the final assistant message (empty on stop/cancel).
    pub final_text: String,
    /// Model calls made.
    pub iterations: u32,
    pub executions: Vec<ToolExecution>,
    pub termination: Termination,
}

/// Run the loop to completion.
///
/// Ordering guarantees: within one response, tool calls execute sequentially
/// in the order the model emitted them, and every call id is answered before
/// the next model call (`|tool_results| == |tool_calls|` per batch). The one
/// exception is the stop tool, which ends the run immediately after its own
/// result — trailing calls in that final batch are never executed because no
/// further model call happens.
pub async fn run_tool_loop(
    client: &ResilientClient,
    initial_role: Role,
    mut messages: Vec<ChatMessage>,
    tools: &[ToolDefinition],
    handlers: &HashMap<String, ToolHandler>,
    config: ToolLoopConfig,
) -> Result<ToolLoopOutcome, LlmError> {
    let tools_json = render_tools(tools, &config.tool_hints);
    let mut role = initial_role;
    let mut options = ChatOptions {
        tools: Some(tools_json),
        cancel: config.cancel.clone(),
        ..Default::default()
    };

    let mut executions: Vec<ToolExecution> = Vec::new();
    let mut iterations = 0u32;

    while iterations < config.max_iterations {
        if is_cancelled(&config.cancel) {
            return Ok(outcome(messages, String::new(), iterations, executions, Termination::Cancelled));
        }

        iterations += 1;
        if let Some(ref escalate) = config.on_escalate {
            if let Some(escalation) = escalate(iterations) {
                info!(iteration = iterations, tier = %escalation.tier, "escalating mid-loop");
                role = escalation.role;
                options.temperature = escalation.temperature;
                options.max_tokens = escalation.max_tokens;
            }
        }

        debug!(iteration = iterations, role = role.as_str(), msg_count = messages.len(), "tool loop model call");
        let response = match config.on_stream {
            Some(ref tx) => client.stream(role, &messages, &options, tx.clone()).await,
            None => client.chat(role, &messages, &options).await,
        };
        let response = match response {
            Ok(response) => response,
            Err(LlmError::Cancelled) => {
                return Ok(outcome(messages, String::new(), iterations, executions, Termination::Cancelled));
            }
            Err(err) => return Err(err),
        };

        messages.push(response.to_message());

        if response.tool_calls.is_empty() {
            return Ok(outcome(
                messages,
                response.content,
                iterations,
                executions,
                Termination::Done,
            ));
        }

        for call in &response.tool_calls {
            notify_call(&config.observer, call);

            let result = match handlers.get(&call.function.name) {
                Some(handler) => handler(call.function.arguments.clone()).await,
                None => Err(anyhow::anyhow!("unknown tool '{}'", call.function.name)),
            };
            let (success, content) = match result {
                Ok(output) => (true, output),
                Err(err) => (false, format!("Error: {err}")),
            };

            messages.push(ChatMessage::tool_result(&call.id, &content));
            notify_result(&config.observer, call, &content, success);
            executions.push(ToolExecution {
                tool: call.function.name.clone(),
                args: call.function.arguments.clone(),
                success,
                output: content,
            });

            if config.stop_tool.as_deref() == Some(call.function.name.as_str()) {
                return Ok(outcome(
                    messages,
                    String::new(),
                    iterations,
                    executions,
                    Termination::StoppedByTool {
                        tool: call.function.name.clone(),
                        args: call.function.arguments.clone(),
                    },
                ));
            }
        }

        if is_cancelled(&config.cancel) {
            return Ok(outcome(messages, String::new(), iterations, executions, Termination::Cancelled));
        }
    }

    // Budget exhausted: an outcome, not an error.
    let final_text = messages
        .iter()
        .rev()
        .find(|m| m.role == dotbot_llm::ChatRole::Assistant)
        .and_then(|m| m.content.clone())
        .unwrap_or_default();
    Ok(outcome(messages, final_text, iterations, executions, Termination::MaxIterations))
}

fn outcome(
    messages: Vec<ChatMessage>,
    final_text: String,
    iterations: u32,
    executions: Vec<ToolExecution>,
    termination: Termination,
) -> ToolLoopOutcome {
    ToolLoopOutcome {
        messages,
        final_text,
        iterations,
        executions,
        termination,
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
}

fn notify_call(observer: &Option<Arc<dyn ToolObserver>>, call: &ToolCall) {
    if let Some(observer) = observer {
        if let Err(err) = observer.on_tool_call(call) {
            warn!(%err, tool = %call.function.name, "tool observer failed on call");
        }
    }
}

fn notify_result(observer: &Option<Arc<dyn ToolObserver>>, call: &ToolCall, output: &str, success: bool) {
    if let Some(observer) = observer {
        if let Err(err) = observer.on_tool_result(call, output, success) {
            warn!(%err, tool = %call.function.name, "tool observer failed on result");
        }
    }
}

fn render_tools(tools: &[ToolDefinition], hints: &HashMap<String, String>) -> Value {
    let hinted: Vec<ToolDefinition> = tools
        .iter()
        .map(|t| {
            let mut def = t.clone();
            if let Some(hint) = hints.get(&t.name) {
                def.description = format!("{} Hint: {hint}", def.description);
            }
            def
        })
        .collect();
    definitions_to_openai_tools(&hinted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dotbot_llm::{
        ApiKeys, ChatResponse, LlmClient, Provider, ProviderRegistry, ToolCallFunction,
    };
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fake client that plays back a fixed script of responses.
    struct ScriptClient {
        responses: Mutex<VecDeque<ChatResponse>>,
        calls: AtomicU32,
    }

    impl ScriptClient {
        fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
            }
        }
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
            self.calls.fetch_add(1, Ordering::SeqCst);
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
            if !response.content.is_empty() {
                let _ = tx.send(response.content.clone()).await;
            }
            Ok(response)
        }
    }

    fn text_response(content: &str) -> ChatResponse {
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

    fn tool_response(calls: Vec<(&str, &str, Value)>) -> ChatResponse {
        ChatResponse {
            provider: Provider::Deepseek,
            model: "deepseek-chat".to_string(),
            content: String::new(),
            tool_calls: calls
                .into_iter()
                .map(|(id, name, args)| ToolCall {
                    id: id.to_string(),
                    r#type: "function".to_string(),
                    function: ToolCallFunction {
                        name: name.to_string(),
                        arguments: args,
                    },
                })
                .collect(),
            finish_reason: "tool_calls".to_string(),
            reasoning_content: None,
            usage: None,
        }
    }

    async fn client_with_script(responses: Vec<ChatResponse>) -> ResilientClient {
        let keys = ApiKeys::default().with_key(Provider::Deepseek, "k");
        let registry = Arc::new(ProviderRegistry::new(keys));
        registry
            .insert(Provider::Deepseek, Arc::new(ScriptClient::new(responses)))
            .await;
        ResilientClient::new(registry)
    }

    fn echo_handlers() -> HashMap<String, ToolHandler> {
        let mut handlers: HashMap<String, ToolHandler> = HashMap::new();
        handlers.insert(
            "echo".to_string(),
            Arc::new(|args: Value| {
                Box::pin(async move { Ok(format!("echo: {}", args["text"].as_str().unwrap_or(""))) })
            }),
        );
        handlers.insert(
            "fails".to_string(),
            Arc::new(|_args: Value| Box::pin(async move { anyhow::bail!("disk on fire") })),
        );
        handlers.insert(
            "escalate".to_string(),
            Arc::new(|_args: Value| Box::pin(async move { Ok("escalating".to_string()) })),
        );
        handlers
    }

    fn tool_defs() -> Vec<ToolDefinition> {
        ["echo", "fails", "escalate"]
            .into_iter()
            .map(|name| ToolDefinition {
                name: name.to_string(),
                description: format!("{name} tool"),
                parameters: json!({"type": "object"}),
            })
            .collect()
    }

    #[tokio::test]
    async fn plain_text_response_terminates_done() {
        let client = client_with_script(vec![text_response("hello there")]).await;
        let outcome = run_tool_loop(
            &client,
            Role::Assistant,
            vec![ChatMessage::user("hi")],
            &tool_defs(),
            &echo_handlers(),
            ToolLoopConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.termination, Termination::Done);
        assert_eq!(outcome.final_text, "hello there");
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.executions.is_empty());
    }

    #[tokio::test]
    async fn tool_calls_are_answered_in_order_before_next_model_call() {
        let client = client_with_script(vec![
            tool_response(vec![
                ("c1", "echo", json!({"text": "one"})),
                ("c2", "echo", json!({"text": "two"})),
            ]),
            text_response("done"),
        ])
        .await;
        let outcome = run_tool_loop(
            &client,
            Role::Assistant,
            vec![ChatMessage::user("run tools")],
            &tool_defs(),
            &echo_handlers(),
            ToolLoopConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.termination, Termination::Done);
        assert_eq!(outcome.executions.len(), 2);
        assert_eq!(outcome.executions[0].output, "echo: one");
        assert_eq!(outcome.executions[1].output, "echo: two");

        // Transcript: user, assistant(tool_calls), tool(c1), tool(c2), assistant.
        assert_eq!(outcome.messages.len(), 5);
        assert_eq!(outcome.messages[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(outcome.messages[3].tool_call_id.as_deref(), Some("c2"));
        assert!(dotbot_llm::validate_transcript(&outcome.messages).is_none());
    }

    #[tokio::test]
    async fn handler_failure_becomes_error_message_and_loop_continues() {
        let client = client_with_script(vec![
            tool_response(vec![("c1", "fails", json!({}))]),
            text_response("recovered"),
        ])
        .await;
        let outcome = run_tool_loop(
            &client,
            Role::Assistant,
            vec![ChatMessage::user("try")],
            &tool_defs(),
            &echo_handlers(),
            ToolLoopConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.termination, Termination::Done);
        assert!(!outcome.executions[0].success);
        assert!(outcome.messages[2]
            .content
            .as_deref()
            .unwrap()
            .starts_with("Error: "));
    }

    #[tokio::test]
    async fn unknown_tool_id_is_answered_with_error() {
        let client = client_with_script(vec![
            tool_response(vec![("c1", "mystery", json!({}))]),
            text_response("ok")
        ])
        .await;
        let outcome = run_tool_loop(
            &client,
            Role::Assistant,
            vec![ChatMessage::user("go")],
            &tool_defs(),
            &echo_handlers(),
            ToolLoopConfig::default(),
        )
        .await
        .unwrap();

        assert!(outcome.messages[2]
            .content
            .as_deref()
            .unwrap()
            .contains("unknown tool 'mystery'"));
        assert_eq!(outcome.termination, Termination::Done);
    }

    #[tokio::test]
    async fn stop_tool_terminates_with_its_args_and_no_further_model_call() {
        let client = client_with_script(vec![
            tool_response(vec![("c1", "escalate", json!({"reason": "need human"}))]),
            text_response("NEVER REACHED"),
        ])
        .await;
        let outcome = run_tool_loop(
            &client,
            Role::Assistant,
            vec![ChatMessage::user("go")],
            &tool_defs(),
            &echo_handlers(),
            ToolLoopConfig {
                stop_tool: Some("escalate".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        match outcome.termination {
            Termination::StoppedByTool { ref tool, ref args } => {
                assert_eq!(tool, "escalate");
                assert_eq!(args["reason"], "need human");
            }
            other => panic!("expected StoppedByTool, got {other:?}"),
        }
        // The stop tool's result was still appended before terminating.
        assert_eq!(outcome.messages.last().unwrap().tool_call_id.as_deref(), Some("c1"));
        assert_eq!(outcome.iterations, 1);
    }

    #[tokio::test]
    async fn max_iterations_is_an_outcome_not_an_error() {
        // The model insists on tools every round.
        let ids: Vec<String> = (0..5).map(|i| format!("c{i}")).collect();
        let responses = ids
            .iter()
            .map(|id| tool_response(vec![(id.as_str(), "echo", json!({"text": "again"}))]))
            .collect::<Vec<_>>();
        let client = client_with_script(responses).await;
        let outcome = run_tool_loop(
            &client,
            Role::Assistant,
            vec![ChatMessage::user("loop forever")],
            &tool_defs(),
            &echo_handlers(),
            ToolLoopConfig {
                max_iterations: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.termination, Termination::MaxIterations);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.executions.len(), 3);
    }

    #[tokio::test]
    async fn escalation_swaps_tuning_mid_loop() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let hits_clone = hits.clone();
        let escalate: EscalateFn = Arc::new(move |iteration| {
            if iteration == 2 {
                hits_clone.lock().unwrap().push(iteration);
                Some(Escalation {
                    role: Role::Workhorse,
                    temperature: Some(0.3),
                    max_tokens: Some(2048),
                    tier: "workhorse".to_string(),
                })
            } else {
                None
            }
        });

        let client = client_with_script(vec![
            tool_response(vec![("c1", "echo", json!({"text": "x"}))]),
            text_response("after escalation"),
        ])
        .await;
        let outcome = run_tool_loop(
            &client,
            Role::Assistant,
            vec![ChatMessage::user("go")],
            &tool_defs(),
            &echo_handlers(),
            ToolLoopConfig {
                on_escalate: Some(escalate),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.termination, Termination::Done);
        assert_eq!(*hits.lock().unwrap(), vec![2]);
        // Message list was preserved across the swap.
        assert!(dotbot_llm::validate_transcript(&outcome.messages).is_none());
    }

    #[tokio::test]
    async fn cancellation_between_iterations_exits_cleanly() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let client = client_with_script(vec![
            tool_response(vec![("c1", "echo", json!({"text": "x"}))]),
            text_response("NEVER REACHED"),
        ])
        .await;

        // Cancel fires while the first batch executes.
        let mut handlers = echo_handlers();
        let cancel_tx = Arc::new(cancel_tx);
        let tx = cancel_tx.clone();
        handlers.insert(
            "echo".to_string(),
            Arc::new(move |_args: Value| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(true);
                    Ok("done".to_string())
                })
            }),
        );

        let outcome = run_tool_loop(
            &client,
            Role::Assistant,
            vec![ChatMessage::user("go")],
            &tool_defs(),
            &handlers,
            ToolLoopConfig {
                cancel: Some(cancel_rx),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.termination, Termination::Cancelled);
        assert_eq!(outcome.iterations, 1);
    }

    #[tokio::test]
    async fn observer_failures_never_abort_the_loop() {
        struct AngryObserver;
        impl ToolObserver for AngryObserver {
            fn on_tool_call(&self, _call: &ToolCall) -> anyhow::Result<()> {
                anyhow::bail!("observer exploded")
            }
            fn on_tool_result(&self, _call: &ToolCall, _o: &str, _s: bool) -> anyhow::Result<()> {
                anyhow::bail!("observer exploded again")
            }
        }

        let client = client_with_script(vec![
            tool_response(vec![("c1", "echo", json!({"text": "x"}))]),
            text_response("fine"),
        ])
        .await;
        let outcome = run_tool_loop(
            &client,
            Role::Assistant,
            vec![ChatMessage::user("go")],
            &tool_defs(),
            &echo_handlers(),
            ToolLoopConfig {
                observer: Some(Arc::new(AngryObserver)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.termination, Termination::Done);
        assert_eq!(outcome.final_text, "fine");
    }

    #[tokio::test]
    async fn streaming_forwards_chunks_from_model_calls_only() {
        let client = client_with_script(vec![
            tool_response(vec![("c1", "echo", json!({"text": "x"}))]),
            text_response("streamed answer"),
        ])
        .await;
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = run_tool_loop(
            &client,
            Role::Assistant,
            vec![ChatMessage::user("go")],
            &tool_defs(),
            &echo_handlers(),
            ToolLoopConfig {
                on_stream: Some(tx),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.final_text, "streamed answer");
        // Only the model's text came through the stream — nothing from tools.
        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        assert_eq!(chunks, vec!["streamed answer".to_string()]);
    }
}
