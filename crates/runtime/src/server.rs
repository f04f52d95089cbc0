//! Per-connection session loop: authenticate the device, then serve prompt
//! frames through Dot and forward bus follow-ups back over transport.
//!
//! Scheduler-injected prompts enter through the same path as user traffic —
//! the only difference is the `source` tag and the correlation bookkeeping
//! on the way back out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, oneshot, watch};
use tracing::{info, warn};

use dotbot_credentials::{AuthError, DeviceRegistry};

use crate::bus::{BusEvent, EventBus};
use crate::dot::{DotReply, DotRequest, PersonaHint};
use crate::envelope::{
    AgentCompletePayload, DispatchFollowupPayload, Envelope, ExecutionResultPayload,
    PromptPayload, ResponsePayload, Transport,
};
use crate::scheduler::LocalScheduler;
use dotbot_llm::LlmError;

/// What the server needs from Dot. Split out as a trait so sessions are
/// testable without a full orchestrator.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    async fn handle(&self, request: DotRequest) -> Result<DotReply, LlmError>;
}

#[async_trait]
impl PromptHandler for crate::dot::DotOrchestrator {
    async fn handle(&self, request: DotRequest) -> Result<DotReply, LlmError> {
        self.handle_prompt(request).await
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthPayload {
    device_id: String,
    device_secret: String,
    #[serde(default)]
    hw_fingerprint: String,
}

/// Dependencies shared by every session.
pub struct SessionDeps {
    pub handler: Arc<dyn PromptHandler>,
    pub devices: Arc<DeviceRegistry>,
    pub bus: Arc<EventBus>,
    pub scheduler: Option<Arc<LocalScheduler>>,
}

/// In-flight execution commands awaiting their `execution_result` frame.
type PendingExecutions = Arc<Mutex<HashMap<String, oneshot::Sender<ExecutionResultPayload>>>>;

pub struct ServerSession {
    deps: Arc<SessionDeps>,
    transport: Arc<dyn Transport>,
    pending_executions: PendingExecutions,
}

impl ServerSession {
    pub fn new(deps: Arc<SessionDeps>, transport: Arc<dyn Transport>) -> Self {
        Self {
            deps,
            transport,
            pending_executions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Serve the connection until the peer goes away or shutdown flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        // First frame must authenticate the device.
        let Some(first) = self.transport.recv().await else {
            return Ok(());
        };
        let device_id = match self.authenticate(&first).await {
            Ok(device_id) => device_id,
            Err(err) => {
                let _ = self
                    .transport
                    .send(Envelope::new("auth_error", json!({"error": err.to_string()})))
                    .await;
                return Ok(());
            }
        };
        // Devices map 1:1 to users in the prototype. Subscribe before the
        // auth_ok goes out so no follow-up published right after the
        // handshake can slip past.
        let user_id = device_id.clone();
        let mut bus_rx = self.deps.bus.subscribe(&user_id);

        self.transport
            .send(Envelope::new("auth_ok", json!({"deviceId": &device_id})))
            .await?;
        info!(device_id = %device_id, "session authenticated");
        let followup_transport = self.transport.clone();
        let forwarder = tokio::spawn(async move {
            while let Ok(event) = bus_rx.recv().await {
                if let BusEvent::DispatchFollowup {
                    message_id,
                    agent_id,
                    success,
                    response,
                    workspace_path,
                    ..
                } = event
                {
                    let payload = DispatchFollowupPayload {
                        response,
                        message_id,
                        agent_id,
                        success,
                        workspace_path,
                    };
                    let envelope = Envelope::new(
                        "dispatch_followup",
                        serde_json::to_value(&payload).unwrap_or(json!({})),
                    );
                    if followup_transport.send(envelope).await.is_err() {
                        break;
                    }
                }
            }
        });

        loop {
            tokio::select! {
                frame = self.transport.recv() => {
                    let Some(envelope) = frame else { break };
                    if let Err(err) = self.handle_frame(&user_id, &device_id, envelope).await {
                        warn!(%err, "frame handling failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        forwarder.abort();
        if let Some(ref scheduler) = self.deps.scheduler {
            scheduler.on_reconnect().await;
        }
        Ok(())
    }

    /// Run a tool on the connected device: send an `execution_command` frame
    /// and suspend until the matching `execution_result` arrives or the
    /// timeout lapses. This is the bridge pipeline tool handlers use for
    /// device-side work.
    pub async fn execute_on_device(
        &self,
        tool_id: &str,
        tool_args: serde_json::Value,
        timeout: std::time::Duration,
    ) -> anyhow::Result<ExecutionResultPayload> {
        let command = crate::envelope::ExecutionCommandPayload {
            id: uuid::Uuid::new_v4().to_string(),
            r#type: "tool".to_string(),
            payload: crate::envelope::ExecutionCommandInner {
                tool_id: tool_id.to_string(),
                tool_args,
            },
            timeout: timeout.as_secs(),
        };
        let (tx, rx) = oneshot::channel();
        self.pending_executions
            .lock()
            .await
            .insert(command.id.clone(), tx);

        let command_id = command.id.clone();
        let send = self
            .transport
            .send(Envelope::new(
                "execution_command",
                serde_json::to_value(&command)?,
            ))
            .await;
        if let Err(err) = send {
            self.pending_executions.lock().await.remove(&command_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => anyhow::bail!("execution channel closed"),
            Err(_) => {
                self.pending_executions.lock().await.remove(&command_id);
                anyhow::bail!("device execution timed out after {timeout:?}")
            }
        }
    }

    async fn authenticate(&self, envelope: &Envelope) -> Result<String, AuthError> {
        if envelope.r#type != "auth" {
            return Err(AuthError::SessionInvalid);
        }
        let payload: AuthPayload = envelope.decode().ok_or(AuthError::SessionInvalid)?;
        let outcome = self.deps.devices.authenticate(
            &payload.device_id,
            &payload.device_secret,
            &payload.hw_fingerprint,
            Utc::now(),
        )?;
        Ok(outcome.device.id)
    }

    async fn handle_frame(
        &self,
        user_id: &str,
        device_id: &str,
        envelope: Envelope,
    ) -> anyhow::Result<()> {
        match envelope.r#type.as_str() {
            "prompt" => {
                let Some(payload) = envelope.decode::<PromptPayload>() else {
                    anyhow::bail!("malformed prompt payload");
                };
                self.handle_prompt_frame(user_id, device_id, &envelope.id, payload)
                    .await
            }
            "execution_result" => {
                let Some(payload) = envelope.decode::<ExecutionResultPayload>() else {
                    anyhow::bail!("malformed execution_result payload");
                };
                if let Some(waiter) = self.pending_executions.lock().await.remove(&payload.id) {
                    let _ = waiter.send(payload);
                }
                Ok(())
            }
            "agent_complete" => {
                // Correlation for scheduler-submitted background runs.
                if let (Some(scheduler), Some(payload)) = (
                    self.deps.scheduler.as_ref(),
                    envelope.decode::<AgentCompletePayload>(),
                ) {
                    scheduler.on_agent_complete(&payload, Utc::now()).await?;
                }
                Ok(())
            }
            other => {
                warn!(frame_type = %other, "ignoring unknown frame type");
                Ok(())
            }
        }
    }

    async fn handle_prompt_frame(
        &self,
        user_id: &str,
        device_id: &str,
        prompt_id: &str,
        payload: PromptPayload,
    ) -> anyhow::Result<()> {
        let request = DotRequest {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            prompt: payload.prompt,
            source: if payload.source.is_empty() {
                "user".to_string()
            } else {
                payload.source
            },
            persona: PersonaHint::default(),
            cancel: None,
        };

        let reply = match self.deps.handler.handle(request).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, "prompt handling failed");
                DotReply {
                    text: format!("I couldn't process that. {}", err.user_hint()),
                    dispatched_agent_id: None,
                    skill_feedback: None,
                }
            }
        };

        let response = ResponsePayload {
            response: reply.text,
            is_routing_ack: reply.dispatched_agent_id.is_some().then_some(true),
            agent_task_id: reply.dispatched_agent_id,
            prompt_id: Some(prompt_id.to_string()),
        };

        // Scheduler prompts route through correlation before transport so
        // routing acks are never mistaken for results.
        if payload.scheduled_task_id.is_some() {
            if let Some(ref scheduler) = self.deps.scheduler {
                scheduler.on_response(&response, Utc::now()).await?;
            }
        }

        self.transport
            .send(Envelope::new(
                "response",
                serde_json::to_value(&response)?,
            ))
            .await
    }
}
