//! The Dot → pipeline seam.
//!
//! Dispatch is fire-and-forget: Dot calls [`PipelineLauncher::launch`], gets
//! a handle back immediately, and a supervisor task observes the handle and
//! publishes completion on the event bus. Dot and the pipeline never hold
//! references to each other.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus};

/// What Dot hands the pipeline.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub user_id: String,
    pub device_id: String,
    pub prompt: String,
    pub persona_id: Option<String>,
    /// `"dot"`, `"dot_max_iterations"`, `"scheduled_task"`, …
    pub source: String,
}

/// Terminal result of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub success: bool,
    pub summary: String,
    pub workspace_path: String,
}

/// A launched pipeline: its id plus the handle the supervisor observes.
pub struct LaunchedPipeline {
    pub agent_id: String,
    pub handle: JoinHandle<anyhow::Result<PipelineResult>>,
}

/// Implemented by the agent pipeline; injected into Dot at startup.
#[async_trait]
pub trait PipelineLauncher: Send + Sync {
    async fn launch(&self, request: DispatchRequest) -> anyhow::Result<LaunchedPipeline>;
}

/// Fixed text sent when the pipeline crashed before producing a result.
pub const CRASH_FOLLOWUP: &str =
    "I ran into trouble finishing the background task. The workspace holds whatever progress was made.";

/// Detach a supervisor that awaits the pipeline and publishes the follow-up
/// event. Returns the message id the follow-up will carry.
pub fn supervise(bus: Arc<EventBus>, user_id: String, launched: LaunchedPipeline) -> String {
    let message_id = Uuid::new_v4().to_string();
    let agent_id = launched.agent_id.clone();
    let followup_id = message_id.clone();

    tokio::spawn(async move {
        let event = match launched.handle.await {
            Ok(Ok(result)) => {
                info!(agent_id = %agent_id, success = result.success, "pipeline completed");
                BusEvent::DispatchFollowup {
                    user_id,
                    message_id: followup_id,
                    agent_id,
                    success: result.success,
                    response: result.summary,
                    workspace_path: result.workspace_path,
                }
            }
            Ok(Err(err)) => {
                error!(agent_id = %agent_id, %err, "pipeline failed");
                BusEvent::DispatchFollowup {
                    user_id,
                    message_id: followup_id,
                    agent_id,
                    success: false,
                    response: CRASH_FOLLOWUP.to_string(),
                    workspace_path: String::new(),
                }
            }
            Err(join_err) => {
                error!(agent_id = %agent_id, %join_err, "pipeline task panicked or was aborted");
                BusEvent::DispatchFollowup {
                    user_id,
                    message_id: followup_id,
                    agent_id,
                    success: false,
                    response: CRASH_FOLLOWUP.to_string(),
                    workspace_path: String::new(),
                }
            }
        };
        bus.publish(event);
    });

    message_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn supervisor_publishes_success_followup() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe("u1");

        let handle = tokio::spawn(async {
            Ok(PipelineResult {
                success: true,
                summary: "all done".to_string(),
                workspace_path: "/tmp/ws".to_string(),
            })
        });
        supervise(
            bus.clone(),
            "u1".to_string(),
            LaunchedPipeline { agent_id: "ag-1".to_string(), handle },
        );

        match rx.recv().await.unwrap() {
            BusEvent::DispatchFollowup { success, response, agent_id, .. } => {
                assert!(success);
                assert_eq!(response, "all done");
                assert_eq!(agent_id, "ag-1");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn supervisor_sends_fixed_text_when_pipeline_crashes() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe("u1");

        let handle =
            tokio::spawn(async { Err::<PipelineResult, _>(anyhow::anyhow!("planner exploded")) });
        supervise(
            bus.clone(),
            "u1".to_string(),
            LaunchedPipeline { agent_id: "ag-2".to_string(), handle },
        );

        match rx.recv().await.unwrap() {
            BusEvent::DispatchFollowup { success, response, .. } => {
                assert!(!success);
                assert_eq!(response, CRASH_FOLLOWUP);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
