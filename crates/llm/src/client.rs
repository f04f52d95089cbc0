use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{LlmError, classify};
use crate::role::Provider;
use crate::types::{ChatMessage, ChatResponse, ChatRole, TokenUsage, ToolCall, ToolCallFunction};

/// Wall-clock ceiling for a single chat call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-call options. `None` fields fall back to the selected model choice.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// OpenAI-compatible `tools` array.
    pub tools: Option<serde_json::Value>,
    /// JSON schema the response must satisfy (providers that support
    /// `response_format` get it natively; others get a prompt suffix).
    pub response_schema: Option<serde_json::Value>,
    /// Cooperative cancellation; flips to `true` when the request should stop.
    pub cancel: Option<watch::Receiver<bool>>,
    /// Parse-error retry mode: drop tool hints and run cold.
    pub simple_mode: bool,
}

impl ChatOptions {
    pub fn cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }
}

/// Provider-neutral chat client. One implementation per vendor, plus the
/// on-device loader behind [`LocalModel`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider(&self) -> Provider;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError>;

    /// Stream text chunks through `tx` as they arrive; the accumulated
    /// response (including any tool calls) is returned at the end.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatResponse, LlmError>;
}

/// Interface to the local GGUF loader. The loader itself lives outside this
/// crate; the host injects an implementation at startup.
#[async_trait]
pub trait LocalModel: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> anyhow::Result<String>;
}

// ── OpenAI-compatible vendors ────────────────────────────────────────────────

/// Chat-completions client for every vendor speaking the OpenAI wire shape
/// (deepseek, openai, xai, gemini's OpenAI endpoint).
pub struct OpenAiCompatClient {
    provider: Provider,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(provider: Provider, api_key: impl Into<String>) -> Self {
        let base_url = match provider {
            Provider::Deepseek => "https://api.deepseek.com/chat/completions",
            Provider::Openai => "https://api.openai.com/v1/chat/completions",
            Provider::Xai => "https://api.x.ai/v1/chat/completions",
            Provider::Gemini => {
                "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
            }
            other => panic!("{other:?} is not an OpenAI-compatible provider"),
        };
        Self {
            provider,
            base_url: base_url.to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn build_payload(&self, messages: &[ChatMessage], options: &ChatOptions, stream: bool) -> serde_json::Value {
        let mut payload = json!({
            "model": options.model.as_deref().unwrap_or(self.provider.default_model()),
            "messages": messages_to_openai(messages),
        });
        if let Some(t) = options.temperature {
            payload["temperature"] = json!(t);
        }
        if let Some(m) = options.max_tokens {
            payload["max_tokens"] = json!(m);
        }
        if let Some(ref tools) = options.tools {
            if !options.simple_mode {
                payload["tools"] = tools.clone();
            }
        }
        if let Some(ref schema) = options.response_schema {
            payload["response_format"] = json!({
                "type": "json_schema",
                "json_schema": { "name": "response", "schema": schema },
            });
        }
        if stream {
            payload["stream"] = json!(true);
        }
        payload
    }

    async fn send(
        &self,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, LlmError> {
        let name = self.provider.as_str();
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(format!("{name}: {e}"))
                } else if e.is_connect() {
                    LlmError::Transient {
                        provider: name.to_string(),
                        message: e.to_string(),
                    }
                } else {
                    classify(name, None, &e.to_string(), None)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            return Err(classify(name, Some(status.as_u16()), &body, retry_after.as_deref()));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        if options.cancelled() {
            return Err(LlmError::Cancelled);
        }
        let payload = self.build_payload(messages, options, false);
        debug!(provider = self.provider.as_str(), msg_count = messages.len(), "chat request");

        let request = async {
            let response = self.send(&payload).await?;
            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|e| LlmError::Parse(e.to_string()))?;
            parse_openai_response(self.provider, &payload, &body)
        };

        match options.cancel.clone() {
            Some(mut rx) => tokio::select! {
                result = request => result,
                _ = cancelled(&mut rx) => Err(LlmError::Cancelled),
            },
            None => request.await,
        }
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatResponse, LlmError> {
        if options.cancelled() {
            return Err(LlmError::Cancelled);
        }
        let payload = self.build_payload(messages, options, true);
        let model = payload["model"].as_str().unwrap_or_default().to_string();

        let mut response = self.send(&payload).await?;

        let mut full_response = String::new();
        let mut reasoning = String::new();
        // Tool-call deltas accumulate by index: (id, name, arguments-fragment).
        let mut tool_call_map: HashMap<usize, (String, String, String)> = HashMap::new();
        let mut finish_reason = "stop".to_string();
        let mut cancel = options.cancel.clone();

        loop {
            let chunk = match cancel.as_mut() {
                Some(rx) => tokio::select! {
                    chunk = response.chunk() => chunk,
                    _ = cancelled(rx) => return Err(LlmError::Cancelled),
                },
                None => response.chunk().await,
            };
            let Some(chunk) = chunk.map_err(|e| classify(self.provider.as_str(), None, &e.to_string(), None))? else {
                break;
            };

            let chunk_str = String::from_utf8_lossy(&chunk);
            for line in chunk_str.lines() {
                let line = line.trim();
                if line.is_empty() || line == "data: [DONE]" {
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else { continue };

                let Some(choice) = json.get("choices").and_then(|c| c.get(0)) else { continue };
                if let Some(fr) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                    finish_reason = fr.to_string();
                }
                let Some(delta) = choice.get("delta") else { continue };

                if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                    if !content.is_empty() {
                        full_response.push_str(content);
                        let _ = tx.send(content.to_string()).await;
                    }
                }
                if let Some(rc) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
                    reasoning.push_str(rc);
                }
                if let Some(tcs) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                    for tc in tcs {
                        let idx = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                        let entry = tool_call_map.entry(idx).or_default();
                        if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                            entry.0 = id.to_string();
                        }
                        if let Some(func) = tc.get("function") {
                            if let Some(name) = func.get("name").and_then(|v| v.as_str()) {
                                // Name arrives once in the first delta, not
                                // incrementally — assign rather than append.
                                entry.1 = name.to_string();
                            }
                            if let Some(args) = func.get("arguments").and_then(|v| v.as_str()) {
                                entry.2.push_str(args);
                            }
                        }
                    }
                }
            }
        }

        let mut tool_calls = Vec::new();
        if !tool_call_map.is_empty() {
            let mut indices: Vec<usize> = tool_call_map.keys().copied().collect();
            indices.sort();
            for idx in indices {
                let (id, name, args_str) = &tool_call_map[&idx];
                let arguments = serde_json::from_str(args_str).unwrap_or(json!({}));
                tool_calls.push(ToolCall {
                    id: if id.is_empty() { format!("call_{idx}") } else { id.clone() },
                    r#type: "function".to_string(),
                    function: ToolCallFunction { name: name.clone(), arguments },
                });
            }
            if finish_reason == "stop" {
                finish_reason = "tool_calls".to_string();
            }
        }

        Ok(ChatResponse {
            provider: self.provider,
            model,
            content: full_response,
            tool_calls,
            finish_reason,
            reasoning_content: if reasoning.is_empty() { None } else { Some(reasoning) },
            usage: None,
        })
    }
}

// ── Anthropic native messages API ────────────────────────────────────────────

pub struct AnthropicClient {
    api_key: String,
    client: reqwest::Client,
}

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn build_payload(&self, messages: &[ChatMessage], options: &ChatOptions) -> serde_json::Value {
        let (system, turns) = messages_to_anthropic(messages);
        let mut payload = json!({
            "model": options.model.as_deref().unwrap_or(Provider::Anthropic.default_model()),
            "max_tokens": options.max_tokens.unwrap_or(8192),
            "messages": turns,
        });
        if !system.is_empty() {
            payload["system"] = json!(system);
        }
        if let Some(t) = options.temperature {
            payload["temperature"] = json!(t);
        }
        if let Some(ref tools) = options.tools {
            if !options.simple_mode {
                payload["tools"] = openai_tools_to_anthropic(tools);
            }
        }
        payload
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        if options.cancelled() {
            return Err(LlmError::Cancelled);
        }
        let payload = self.build_payload(messages, options);
        let model = payload["model"].as_str().unwrap_or_default().to_string();

        let request = async {
            let response = self
                .client
                .post(ANTHROPIC_URL)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&payload)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        LlmError::Timeout(format!("anthropic: {e}"))
                    } else if e.is_connect() {
                        LlmError::Transient {
                            provider: "anthropic".to_string(),
                            message: e.to_string(),
                        }
                    } else {
                        classify("anthropic", None, &e.to_string(), None)
                    }
                })?;

            let status = response.status();
            if !status.is_success() {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = response.text().await.unwrap_or_default();
                return Err(classify("anthropic", Some(status.as_u16()), &body, retry_after.as_deref()));
            }

            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|e| LlmError::Parse(e.to_string()))?;
            parse_anthropic_response(&model, &body)
        };

        match options.cancel.clone() {
            Some(mut rx) => tokio::select! {
                result = request => result,
                _ = cancelled(&mut rx) => Err(LlmError::Cancelled),
            },
            None => request.await,
        }
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatResponse, LlmError> {
        // Anthropic streaming accumulates content_block deltas; the final
        // message_delta carries the stop reason.
        if options.cancelled() {
            return Err(LlmError::Cancelled);
        }
        let mut payload = self.build_payload(messages, options);
        payload["stream"] = json!(true);
        let model = payload["model"].as_str().unwrap_or_default().to_string();

        let mut response = self
            .client
            .post(ANTHROPIC_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| classify("anthropic", None, &e.to_string(), None))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify("anthropic", Some(status.as_u16()), &body, None));
        }

        let mut full_response = String::new();
        let mut finish_reason = "stop".to_string();
        // tool_use blocks accumulate by content-block index: (id, name, json fragment).
        let mut tool_map: HashMap<usize, (String, String, String)> = HashMap::new();
        let mut cancel = options.cancel.clone();

        loop {
            let chunk = match cancel.as_mut() {
                Some(rx) => tokio::select! {
                    chunk = response.chunk() => chunk,
                    _ = cancelled(rx) => return Err(LlmError::Cancelled),
                },
                None => response.chunk().await,
            };
            let Some(chunk) = chunk.map_err(|e| classify("anthropic", None, &e.to_string(), None))? else {
                break;
            };

            for line in String::from_utf8_lossy(&chunk).lines() {
                let Some(data) = line.trim().strip_prefix("data: ") else { continue };
                let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else { continue };
                match event.get("type").and_then(|v| v.as_str()) {
                    Some("content_block_start") => {
                        let idx = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                        let block = &event["content_block"];
                        if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                            tool_map.insert(
                                idx,
                                (
                                    block.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                                    block.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                                    String::new(),
                                ),
                            );
                        }
                    }
                    Some("content_block_delta") => {
                        let idx = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                        let delta = &event["delta"];
                        match delta.get("type").and_then(|v| v.as_str()) {
                            Some("text_delta") => {
                                if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                                    full_response.push_str(text);
                                    let _ = tx.send(text.to_string()).await;
                                }
                            }
                            Some("input_json_delta") => {
                                if let Some(part) = delta.get("partial_json").and_then(|v| v.as_str()) {
                                    if let Some(entry) = tool_map.get_mut(&idx) {
                                        entry.2.push_str(part);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                    Some("message_delta") => {
                        if let Some(sr) = event["delta"].get("stop_reason").and_then(|v| v.as_str()) {
                            finish_reason = match sr {
                                "tool_use" => "tool_calls".to_string(),
                                "max_tokens" => "length".to_string(),
                                other => other.to_string(),
                            };
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut indices: Vec<usize> = tool_map.keys().copied().collect();
        indices.sort();
        let tool_calls = indices
            .into_iter()
            .map(|idx| {
                let (id, name, args) = &tool_map[&idx];
                ToolCall {
                    id: if id.is_empty() { format!("call_{idx}") } else { id.clone() },
                    r#type: "function".to_string(),
                    function: ToolCallFunction {
                        name: name.clone(),
                        arguments: serde_json::from_str(args).unwrap_or(json!({})),
                    },
                }
            })
            .collect::<Vec<_>>();
        if !tool_calls.is_empty() && finish_reason == "stop" {
            finish_reason = "tool_calls".to_string();
        }

        Ok(ChatResponse {
            provider: Provider::Anthropic,
            model,
            content: full_response,
            tool_calls,
            finish_reason,
            reasoning_content: None,
            usage: None,
        })
    }
}

// ── Local loader bridge ──────────────────────────────────────────────────────

/// Adapts the injected [`LocalModel`] to the client trait. Text-only: the
/// local loader does not do native tool calling.
pub struct LocalClient {
    model: Arc<dyn LocalModel>,
}

impl LocalClient {
    pub fn new(model: Arc<dyn LocalModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl LlmClient for LocalClient {
    fn provider(&self) -> Provider {
        Provider::Local
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        if options.cancelled() {
            return Err(LlmError::Cancelled);
        }
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| Provider::Local.default_model().to_string());
        let content = self
            .model
            .generate(
                messages,
                &model,
                options.temperature.unwrap_or(0.7),
                options.max_tokens.unwrap_or(4096),
            )
            .await
            .map_err(|e| LlmError::Transient {
                provider: "local".to_string(),
                message: e.to_string(),
            })?;
        Ok(ChatResponse {
            provider: Provider::Local,
            model,
            content,
            tool_calls: vec![],
            finish_reason: "stop".to_string(),
            reasoning_content: None,
            usage: None,
        })
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

// ── Wire-format conversion ───────────────────────────────────────────────────

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    // Resolves when the flag flips to true; pends forever otherwise.
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender dropped without cancelling — treat as never-cancel.
            std::future::pending::<()>().await;
        }
    }
}

/// Convert our `ChatMessage` array to OpenAI-compatible message format.
fn messages_to_openai(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::Tool => "tool",
            };
            let mut msg = json!({ "role": role });
            match (&m.content, m.images.is_empty()) {
                (Some(content), false) => {
                    let mut parts = vec![json!({"type": "text", "text": content})];
                    for image in &m.images {
                        parts.push(json!({"type": "image_url", "image_url": {"url": image}}));
                    }
                    msg["content"] = json!(parts);
                }
                (Some(content), true) => msg["content"] = json!(content),
                (None, _) => msg["content"] = json!(null),
            }
            if !m.tool_calls.is_empty() {
                let calls: Vec<serde_json::Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.function.name,
                                "arguments": if tc.function.arguments.is_string() {
                                    tc.function.arguments.clone()
                                } else {
                                    json!(tc.function.arguments.to_string())
                                }
                            }
                        })
                    })
                    .collect();
                msg["tool_calls"] = json!(calls);
            }
            if let Some(ref id) = m.tool_call_id {
                msg["tool_call_id"] = json!(id);
            }
            msg
        })
        .collect()
}

/// Split a transcript into Anthropic's `(system, messages)` shape: system
/// turns concatenate into the system string, tool results become
/// `tool_result` user blocks, assistant tool calls become `tool_use` blocks.
fn messages_to_anthropic(messages: &[ChatMessage]) -> (String, Vec<serde_json::Value>) {
    let mut system = String::new();
    let mut turns: Vec<serde_json::Value> = Vec::new();

    for m in messages {
        match m.role {
            ChatRole::System => {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(m.content.as_deref().unwrap_or(""));
            }
            ChatRole::User => {
                turns.push(json!({"role": "user", "content": m.content.as_deref().unwrap_or("")}));
            }
            ChatRole::Assistant => {
                let mut blocks = Vec::new();
                if let Some(ref content) = m.content {
                    if !content.is_empty() {
                        blocks.push(json!({"type": "text", "text": content}));
                    }
                }
                for tc in &m.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.function.name,
                        "input": tc.function.arguments,
                    }));
                }
                turns.push(json!({"role": "assistant", "content": blocks}));
            }
            ChatRole::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id.as_deref().unwrap_or(""),
                    "content": m.content.as_deref().unwrap_or(""),
                });
                // Consecutive tool results fold into one user turn.
                let folded = turns
                    .last_mut()
                    .filter(|t| t["role"] == "user")
                    .and_then(|t| t["content"].as_array_mut())
                    .map(|blocks| blocks.push(block.clone()))
                    .is_some();
                if !folded {
                    turns.push(json!({"role": "user", "content": [block]}));
                }
            }
        }
    }
    (system, turns)
}

fn openai_tools_to_anthropic(tools: &serde_json::Value) -> serde_json::Value {
    let converted: Vec<serde_json::Value> = tools
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    let f = t.get("function")?;
                    Some(json!({
                        "name": f.get("name")?,
                        "description": f.get("description").cloned().unwrap_or(json!("")),
                        "input_schema": f.get("parameters").cloned().unwrap_or(json!({"type": "object"})),
                    }))
                })
                .collect()
        })
        .unwrap_or_default();
    json!(converted)
}

/// Parse an OpenAI-compatible `/chat/completions` non-streaming response.
fn parse_openai_response(
    provider: Provider,
    payload: &serde_json::Value,
    body: &serde_json::Value,
) -> Result<ChatResponse, LlmError> {
    let choice = body.get("choices").and_then(|c| c.get(0));
    let message = choice.and_then(|c| c.get("message"));
    if message.is_none() {
        return Err(LlmError::Parse(format!("no choices in response: {body}")));
    }

    let content = message
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let reasoning_content = message
        .and_then(|m| m.get("reasoning_content"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let finish_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();

    let tool_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(i, tc)| {
                    let id = tc.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let arguments = func
                        .get("arguments")
                        .map(|v| {
                            if let Some(s) = v.as_str() {
                                serde_json::from_str(s).unwrap_or(json!({}))
                            } else {
                                v.clone()
                            }
                        })
                        .unwrap_or(json!({}));
                    Some(ToolCall {
                        id: if id.is_empty() { format!("call_{i}") } else { id },
                        r#type: "function".to_string(),
                        function: ToolCallFunction { name, arguments },
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let usage = body.get("usage").map(|u| TokenUsage {
        prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        completion_tokens: u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
    });

    Ok(ChatResponse {
        provider,
        model: payload["model"].as_str().unwrap_or_default().to_string(),
        content,
        tool_calls,
        finish_reason,
        reasoning_content,
        usage,
    })
}

fn parse_anthropic_response(model: &str, body: &serde_json::Value) -> Result<ChatResponse, LlmError> {
    let blocks = body
        .get("content")
        .and_then(|v| v.as_array())
        .ok_or_else(|| LlmError::Parse(format!("no content blocks: {body}")))?;

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for (i, block) in blocks.iter().enumerate() {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                content.push_str(block.get("text").and_then(|v| v.as_str()).unwrap_or(""));
            }
            Some("tool_use") => {
                tool_calls.push(ToolCall {
                    id: block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{i}")),
                    r#type: "function".to_string(),
                    function: ToolCallFunction {
                        name: block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        arguments: block.get("input").cloned().unwrap_or(json!({})),
                    },
                });
            }
            _ => {}
        }
    }

    let finish_reason = match body.get("stop_reason").and_then(|v| v.as_str()) {
        Some("tool_use") => "tool_calls".to_string(),
        Some("max_tokens") => "length".to_string(),
        Some(other) => other.to_string(),
        None => "stop".to_string(),
    };

    let usage = body.get("usage").map(|u| {
        let input = u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let output = u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        TokenUsage {
            prompt_tokens: input,
            completion_tokens: output,
            total_tokens: input + output,
        }
    });

    Ok(ChatResponse {
        provider: Provider::Anthropic,
        model: model.to_string(),
        content,
        tool_calls,
        finish_reason,
        reasoning_content: None,
        usage,
    })
}
