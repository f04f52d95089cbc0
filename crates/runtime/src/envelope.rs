//! Transport envelope — the wire frames exchanged with the local agent.
//!
//! The core treats transport as an abstraction: frames go through the
//! [`Transport`] trait and the prototype's WebSocket carrier lives outside
//! this crate. A loopback pair serves tests and same-process wiring.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

/// `{type, id, timestamp, payload}` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub r#type: String,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl Envelope {
    pub fn new(r#type: &str, payload: Value) -> Self {
        Self {
            r#type: r#type.to_string(),
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

// ── Payloads ─────────────────────────────────────────────────────────────────

/// C→S: a user (or scheduler-injected) prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPayload {
    pub prompt: String,
    /// `"user"`, `"scheduled_task"`, `"deferred_task"`, …
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub hints: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_task_id: Option<String>,
}

/// S→C: inline answer, or a routing acknowledgement naming the agent task
/// that will deliver the real result later.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_routing_ack: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_task_id: Option<String>,
    /// Correlates with the prompt frame that produced this response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
}

/// S→C: a background agent task finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCompletePayload {
    pub task_id: String,
    pub success: bool,
    pub response: String,
}

/// S→C: follow-up message after a fire-and-forget dispatch completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchFollowupPayload {
    pub response: String,
    pub message_id: String,
    pub agent_id: String,
    pub success: bool,
    pub workspace_path: String,
}

/// S→C: run a tool on the device and report back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCommandPayload {
    pub id: String,
    pub r#type: String,
    pub payload: ExecutionCommandInner,
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCommandInner {
    pub tool_id: String,
    pub tool_args: Value,
}

/// C→S: result of an execution command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResultPayload {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// C→S: a file failed format validation and needs an LLM fix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatFixRequestPayload {
    pub file_path: String,
    pub content: String,
    pub errors: Vec<String>,
    pub template: String,
}

// ── Transport trait ──────────────────────────────────────────────────────────

/// Bidirectional frame channel. Send never blocks on slow peers for long;
/// recv returns `None` when the peer is gone.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()>;
    async fn recv(&self) -> Option<Envelope>;
}

/// In-process transport pair for tests and same-process wiring.
pub struct LoopbackTransport {
    tx: mpsc::Sender<Envelope>,
    rx: Mutex<mpsc::Receiver<Envelope>>,
}

impl LoopbackTransport {
    /// Two connected endpoints: what one sends, the other receives.
    pub fn pair(capacity: usize) -> (LoopbackTransport, LoopbackTransport) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            LoopbackTransport { tx: a_tx, rx: Mutex::new(b_rx) },
            LoopbackTransport { tx: b_tx, rx: Mutex::new(a_rx) },
        )
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| anyhow::anyhow!("peer disconnected"))
    }

    async fn recv(&self) -> Option<Envelope> {
        self.rx.lock().await.recv().await
    }
}
