//! Two-phase response correlation for scheduler-submitted prompts.
//!
//! Phase 1: submitting a prompt records `prompt_id → meta`. Phase 2: a
//! routing acknowledgement carrying a server-assigned agent task id moves the
//! meta under that id. Inline results resolve by prompt id, background
//! results by agent task id, and a routing ack is never itself a result.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// What we remember about one in-flight scheduled prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMeta {
    pub task_id: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct CorrelationMap {
    /// prompt_id → meta (phase 1).
    by_prompt: HashMap<String, PendingMeta>,
    /// agent_task_id → meta (phase 2).
    by_agent: HashMap<String, PendingMeta>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase 1: a prompt went out.
    pub fn record_submission(&mut self, prompt_id: &str, task_id: &str, now: DateTime<Utc>) {
        self.by_prompt.insert(
            prompt_id.to_string(),
            PendingMeta {
                task_id: task_id.to_string(),
                submitted_at: now,
            },
        );
    }

    /// Phase 2: a routing ack assigned an agent task id. Returns whether the
    /// prompt was known.
    pub fn promote_to_agent(&mut self, prompt_id: &str, agent_task_id: &str) -> bool {
        match self.by_prompt.remove(prompt_id) {
            Some(meta) => {
                self.by_agent.insert(agent_task_id.to_string(), meta);
                true
            }
            None => false,
        }
    }

    /// An inline (non-ack) response arrived for a prompt.
    pub fn take_by_prompt(&mut self, prompt_id: &str) -> Option<PendingMeta> {
        self.by_prompt.remove(prompt_id)
    }

    /// A background completion arrived for an agent task.
    pub fn take_by_agent(&mut self, agent_task_id: &str) -> Option<PendingMeta> {
        self.by_agent.remove(agent_task_id)
    }

    /// Whether this scheduled task already has a prompt in flight (either
    /// phase).
    pub fn is_in_flight(&self, task_id: &str) -> bool {
        self.by_prompt.values().chain(self.by_agent.values()).any(|m| m.task_id == task_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.by_prompt.len() + self.by_agent.len()
    }

    /// Remove and return every entry older than `timeout` in either phase.
    pub fn expire(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<PendingMeta> {
        let mut expired = Vec::new();
        let cutoff = now - timeout;
        for map in [&mut self.by_prompt, &mut self.by_agent] {
            let stale: Vec<String> = map
                .iter()
                .filter(|(_, meta)| meta.submitted_at < cutoff)
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                if let Some(meta) = map.remove(&key) {
                    expired.push(meta);
                }
            }
        }
        expired
    }

    /// Drop everything. Called across transport reconnects — responses from
    /// the previous connection can no longer arrive.
    pub fn clear(&mut self) {
        self.by_prompt.clear();
        self.by_agent.clear();
    }
}
