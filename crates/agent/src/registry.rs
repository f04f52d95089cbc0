//! In-memory registry of live agent tasks: status, abort handles, and the
//! injection queue. The one rule that matters: `cancelled` is terminal — a
//! completion handler that lost the race must never overwrite it.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;
use tracing::{info, warn};

use crate::persona::AgentStatus;

#[derive(Debug, Clone)]
pub struct AgentTaskMeta {
    pub id: String,
    pub device_id: String,
    pub user_id: String,
    pub prompt: String,
    pub persona_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

struct AgentEntry {
    meta: AgentTaskMeta,
    status: AgentStatus,
    abort: Option<AbortHandle>,
    injection_queue: Vec<String>,
}

/// Typed handle injected at startup; no module-level global.
#[derive(Default)]
pub struct TaskRegistry {
    entries: Mutex<HashMap<String, AgentEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, meta: AgentTaskMeta, abort: AbortHandle) {
        self.register_pending(meta.clone());
        self.attach_abort(&meta.id, abort);
    }

    /// Register before the task is spawned, so a completion can never race
    /// an absent entry. The abort handle follows via [`attach_abort`].
    ///
    /// [`attach_abort`]: TaskRegistry::attach_abort
    pub fn register_pending(&self, meta: AgentTaskMeta) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            meta.id.clone(),
            AgentEntry {
                meta,
                status: AgentStatus::Running,
                abort: None,
                injection_queue: Vec::new(),
            },
        );
    }

    /// Attach the spawned task's abort handle. If a cancel arrived in the
    /// window before attachment, the handle fires immediately.
    pub fn attach_abort(&self, agent_id: &str, abort: AbortHandle) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get_mut(agent_id) else {
            return false;
        };
        if entry.status == AgentStatus::Cancelled {
            abort.abort();
        } else {
            entry.abort = Some(abort);
        }
        true
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(agent_id)
    }

    pub fn status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .map(|e| e.status)
    }

    /// Transition an agent's status. Returns `false` when the write was
    /// refused because the task is already cancelled — callers racing a
    /// cancellation simply lose.
    pub fn set_status(&self, agent_id: &str, status: AgentStatus) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get_mut(agent_id) else {
            return false;
        };
        if entry.status == AgentStatus::Cancelled && status != AgentStatus::Cancelled {
            warn!(agent_id, ?status, "refusing status overwrite of cancelled task");
            return false;
        }
        entry.status = status;
        true
    }

    /// Cancel a task: set the terminal status and fire the abort handle.
    /// Idempotent.
    pub fn cancel(&self, agent_id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get_mut(agent_id) else {
            return false;
        };
        entry.status = AgentStatus::Cancelled;
        if let Some(abort) = entry.abort.take() {
            abort.abort();
        }
        info!(agent_id, "agent task cancelled");
        true
    }

    /// Cancel every task on a device and return their prompts so the caller
    /// can re-dispatch after the restart.
    pub fn cancel_all_for_restart(&self, device_id: &str) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut prompts = Vec::new();
        for entry in entries.values_mut() {
            if entry.meta.device_id == device_id && entry.status == AgentStatus::Running {
                entry.status = AgentStatus::Cancelled;
                if let Some(abort) = entry.abort.take() {
                    abort.abort();
                }
                prompts.push(entry.meta.prompt.clone());
            }
        }
        prompts
    }

    /// Queue a mid-flight message for the agent; the step runner drains it
    /// into the next step briefing.
    pub fn inject(&self, agent_id: &str, message: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(agent_id) {
            Some(entry) => {
                entry.injection_queue.push(message.to_string());
                true
            }
            None => false,
        }
    }

    pub fn drain_injections(&self, agent_id: &str) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get_mut(agent_id)
            .map(|e| std::mem::take(&mut e.injection_queue))
            .unwrap_or_default()
    }

    pub fn remove(&self, agent_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent_id);
    }

    pub fn running_for_device(&self, device_id: &str) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|e| e.meta.device_id == device_id && e.status == AgentStatus::Running)
            .map(|e| e.meta.id.clone())
            .collect()
    }
}
