//! Deferred tasks: one-shot delayed prompts with retries.
//!
//! A 30-second poller selects due tasks by `(priority, scheduled_for)` with
//! at most two executing at once. Execution retries back off exponentially
//! with a cap; tasks that sat undelivered far past their slot expire instead
//! of running stale.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};
use uuid::Uuid;

use super::PromptSink;

/// Poller cadence.
const POLL_INTERVAL_SECS: u64 = 30;
/// Server-wide executing cap.
const MAX_CONCURRENT: usize = 2;
/// Retry backoff: base * 2^(attempt-1), capped.
const RETRY_BASE: Duration = Duration::seconds(60);
const RETRY_CAP: Duration = Duration::seconds(3600);
/// A task more than this far past its slot when picked up has gone stale.
const EXPIRE_AFTER: Duration = Duration::hours(6);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredStatus {
    Scheduled,
    Executing,
    Completed,
    Failed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredTask {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub original_prompt: String,
    /// Who asked for the deferral ("user", "dot", a persona id).
    pub deferred_by: String,
    pub defer_reason: String,
    pub scheduled_for: DateTime<Utc>,
    #[serde(default)]
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub priority: i32,
    pub status: DeferredStatus,
    pub created_at: DateTime<Utc>,
}

/// JSON-file-backed deferred queue with the due-selection logic.
pub struct DeferredQueue {
    path: PathBuf,
    tasks: Mutex<Vec<DeferredTask>>,
}

impl DeferredQueue {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tasks = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(%err, "corrupt deferred task file — starting empty");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self {
            path,
            tasks: Mutex::new(tasks),
        }
    }

    pub async fn schedule(
        &self,
        user_id: &str,
        session_id: &str,
        prompt: &str,
        deferred_by: &str,
        reason: &str,
        scheduled_for: DateTime<Utc>,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<DeferredTask> {
        let task = DeferredTask {
            id: format!("dt-{}", Uuid::new_v4()),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            original_prompt: prompt.to_string(),
            deferred_by: deferred_by.to_string(),
            defer_reason: reason.to_string(),
            scheduled_for,
            attempt_count: 0,
            max_attempts: 3,
            priority,
            status: DeferredStatus::Scheduled,
            created_at: now,
        };
        let mut tasks = self.tasks.lock().await;
        tasks.push(task.clone());
        self.persist(&tasks)?;
        Ok(task)
    }

    /// One poll pass: expire stale tasks, then claim due ones up to the
    /// concurrency cap, marking them `executing`. Returns the claimed tasks.
    pub async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<DeferredTask>> {
        let mut tasks = self.tasks.lock().await;

        for task in tasks.iter_mut() {
            if task.status == DeferredStatus::Scheduled
                && task.attempt_count == 0
                && now > task.scheduled_for + EXPIRE_AFTER
            {
                info!(task_id = %task.id, "deferred task expired unexecuted");
                task.status = DeferredStatus::Expired;
            }
        }

        let executing = tasks.iter().filter(|t| t.status == DeferredStatus::Executing).count();
        let slots = MAX_CONCURRENT.saturating_sub(executing);

        let mut due_ids: Vec<(i32, DateTime<Utc>, String)> = tasks
            .iter()
            .filter(|t| t.status == DeferredStatus::Scheduled && t.scheduled_for <= now)
            .map(|t| (t.priority, t.scheduled_for, t.id.clone()))
            .collect();
        // Higher priority first, then earlier slot.
        due_ids.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        due_ids.truncate(slots);

        let mut claimed = Vec::new();
        for (_, _, id) in due_ids {
            if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
                task.status = DeferredStatus::Executing;
                task.attempt_count += 1;
                claimed.push(task.clone());
            }
        }
        if !claimed.is_empty() {
            self.persist(&tasks)?;
        }
        Ok(claimed)
    }

    /// Report an execution outcome. Failures reschedule with exponential
    /// backoff until `max_attempts`, then fail terminally.
    pub async fn report(&self, task_id: &str, success: bool, now: DateTime<Utc>) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) else {
            return Ok(());
        };

        if success {
            task.status = DeferredStatus::Completed;
        } else if task.attempt_count >= task.max_attempts {
            warn!(task_id = %task.id, attempts = task.attempt_count, "deferred task failed terminally");
            task.status = DeferredStatus::Failed;
        } else {
            let exponent = task.attempt_count.saturating_sub(1).min(10);
            let backoff = std::cmp::min(RETRY_BASE * 2_i32.pow(exponent), RETRY_CAP);
            task.status = DeferredStatus::Scheduled;
            task.scheduled_for = now + backoff;
        }
        self.persist(&tasks)?;
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Option<DeferredTask> {
        self.tasks.lock().await.iter().find(|t| t.id == task_id).cloned()
    }

    fn persist(&self, tasks: &[DeferredTask]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(tasks)?)?;
        if let Err(err) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    /// The 30-second poller: claim due tasks and push their prompts through
    /// the sink. The sink's eventual response is reported back by transport
    /// plumbing via [`DeferredQueue::report`].
    pub async fn run(
        self: Arc<Self>,
        sink: Arc<dyn PromptSink>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let interval = std::time::Duration::from_secs(POLL_INTERVAL_SECS);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let now = Utc::now();
                    match self.claim_due(now).await {
                        Ok(claimed) => {
                            for task in claimed {
                                let submit = sink
                                    .submit(&task.id, &task.original_prompt, "deferred_task", None)
                                    .await;
                                if let Err(err) = submit {
                                    warn!(task_id = %task.id, %err, "deferred submission failed");
                                    let _ = self.report(&task.id, false, now).await;
                                }
                            }
                        }
                        Err(err) => warn!(%err, "deferred poll failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2025-01-10T12:00:00Z".parse().unwrap()
    }

    async fn queue_with(tasks: Vec<(&str, DateTime<Utc>, i32)>) -> (tempfile::TempDir, DeferredQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = DeferredQueue::open(dir.path().join("deferred.json"));
        for (id_hint, when, priority) in tasks {
            let task = queue
                .schedule("u1", "s1", id_hint, "user", "test", when, priority, now())
                .await
                .unwrap();
            // Rename for test readability.
            let mut all = queue.tasks.lock().await;
            all.iter_mut().find(|t| t.id == task.id).unwrap().id = id_hint.to_string();
        }
        (dir, queue)
    }

    #[tokio::test]
    async fn claims_by_priority_then_time_with_cap_of_two() {
        let (_dir, queue) = queue_with(vec![
            ("low-early", now() - Duration::minutes(10), 0),
            ("high-late", now() - Duration::minutes(1), 5),
            ("low-late", now() - Duration::minutes(2), 0),
        ])
        .await;

        let claimed = queue.claim_due(now()).await.unwrap();
        let ids: Vec<&str> = claimed.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["high-late", "low-early"]);
        for task in &claimed {
            assert_eq!(task.status, DeferredStatus::Executing);
            assert_eq!(task.attempt_count, 1);
        }

        // Third task waits for a free slot.
        assert!(queue.claim_due(now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn future_tasks_are_not_claimed() {
        let (_dir, queue) = queue_with(vec![("later", now() + Duration::minutes(30), 0)]).await;
        assert!(queue.claim_due(now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_reschedules_with_growing_backoff_then_fails() {
        let (_dir, queue) = queue_with(vec![("t", now() - Duration::minutes(1), 0)]).await;

        // Attempt 1 fails → rescheduled 60 s out.
        queue.claim_due(now()).await.unwrap();
        queue.report("t", false, now()).await.unwrap();
        let task = queue.get("t").await.unwrap();
        assert_eq!(task.status, DeferredStatus::Scheduled);
        assert_eq!(task.scheduled_for, now() + Duration::seconds(60));

        // Attempt 2 fails → 120 s backoff.
        let t2 = task.scheduled_for;
        queue.claim_due(t2).await.unwrap();
        queue.report("t", false, t2).await.unwrap();
        let task = queue.get("t").await.unwrap();
        assert_eq!(task.scheduled_for, t2 + Duration::seconds(120));

        // Attempt 3 fails → attempts exhausted (max 3).
        let t3 = task.scheduled_for;
        queue.claim_due(t3).await.unwrap();
        queue.report("t", false, t3).await.unwrap();
        assert_eq!(queue.get("t").await.unwrap().status, DeferredStatus::Failed);
    }

    #[tokio::test]
    async fn success_completes() {
        let (_dir, queue) = queue_with(vec![("t", now() - Duration::minutes(1), 0)]).await;
        queue.claim_due(now()).await.unwrap();
        queue.report("t", true, now()).await.unwrap();
        assert_eq!(queue.get("t").await.unwrap().status, DeferredStatus::Completed);
    }

    #[tokio::test]
    async fn stale_unexecuted_tasks_expire() {
        let (_dir, queue) = queue_with(vec![("old", now() - Duration::hours(7), 0)]).await;
        let claimed = queue.claim_due(now()).await.unwrap();
        assert!(claimed.is_empty());
        assert_eq!(queue.get("old").await.unwrap().status, DeferredStatus::Expired);
    }

    #[tokio::test]
    async fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deferred.json");
        {
            let queue = DeferredQueue::open(&path);
            queue
                .schedule("u1", "s1", "remember the milk", "user", "test", now(), 0, now())
                .await
                .unwrap();
        }
        let queue = DeferredQueue::open(&path);
        let tasks = queue.tasks.lock().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].original_prompt, "remember the milk");
    }
}
