//! Local scheduled tasks: `scheduled-tasks.json`, a 60-second checker, a
//! two-hour grace window, and two-phase response correlation.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};
use uuid::Uuid;

use dotbot_config::SchedulerConfig;

use super::correlation::CorrelationMap;
use super::schedule::Schedule;
use super::{Notifier, PromptSink};
use crate::envelope::{AgentCompletePayload, ResponsePayload};

/// Checker cadence.
const CHECK_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub prompt: String,
    pub schedule: Schedule,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub persona_hint: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

/// `~/.bot/scheduled-tasks.json`.
pub struct ScheduledTaskStore {
    path: PathBuf,
}

impl ScheduledTaskStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Vec<ScheduledTask> {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(%err, "corrupt scheduled-tasks.json — starting empty");
            Vec::new()
        })
    }

    pub fn store(&self, tasks: &[ScheduledTask]) -> Result<()> {
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

    pub fn add(&self, task: ScheduledTask) -> Result<()> {
        let mut tasks = self.load();
        tasks.push(task);
        self.store(&tasks)
    }
}

/// The periodic checker plus the response-correlation surface the transport
/// layer calls into.
pub struct LocalScheduler {
    store: ScheduledTaskStore,
    sink: Arc<dyn PromptSink>,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
    tz: Tz,
    correlation: Mutex<CorrelationMap>,
}

impl LocalScheduler {
    pub fn new(
        store: ScheduledTaskStore,
        sink: Arc<dyn PromptSink>,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
        tz: Tz,
    ) -> Self {
        Self {
            store,
            sink,
            notifier,
            config,
            tz,
            correlation: Mutex::new(CorrelationMap::new()),
        }
    }

    /// One checker pass. Split out from the loop so tests drive the clock.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        self.expire_timeouts(now).await?;

        let mut tasks = self.store.load();
        let grace = Duration::minutes(self.config.grace_minutes);
        let mut dirty = false;

        for task in &mut tasks {
            if task.status != TaskStatus::Active || now < task.next_run_at {
                continue;
            }

            if now > task.next_run_at + grace {
                // Missed the whole grace window: consult the user once, then
                // advance regardless. Advancing makes re-detection on the
                // same clock a no-op.
                self.notifier.notify(
                    &task.id,
                    &format!(
                        "'{}' missed its {} run. It will run next at the regular time; \
                         tell me if you want it now.",
                        task.name,
                        task.next_run_at.format("%H:%M")
                    ),
                );
                task.next_run_at = task.schedule.next_occurrence(now, self.tz);
                dirty = true;
                continue;
            }

            let correlation = self.correlation.lock().await;
            let capacity_left = correlation.in_flight_count() < self.config.max_concurrent;
            let already_running = correlation.is_in_flight(&task.id);
            drop(correlation);
            if !capacity_left || already_running {
                continue;
            }

            let prompt_id = format!("sched_{}", &Uuid::new_v4().simple().to_string()[..8]);
            info!(task_id = %task.id, prompt_id = %prompt_id, "submitting scheduled task prompt");
            self.sink
                .submit(&prompt_id, &task.prompt, "scheduled_task", Some(&task.id))
                .await?;
            self.correlation
                .lock()
                .await
                .record_submission(&prompt_id, &task.id, now);

            task.next_run_at = task.schedule.next_occurrence(now, self.tz);
            dirty = true;
        }

        if dirty {
            self.store.store(&tasks)?;
        }
        Ok(())
    }

    /// A `response` frame arrived. Routing acks promote correlation to phase
    /// 2 and are never treated as results.
    pub async fn on_response(&self, payload: &ResponsePayload, now: DateTime<Utc>) -> Result<()> {
        let Some(ref prompt_id) = payload.prompt_id else {
            return Ok(());
        };

        if payload.is_routing_ack.unwrap_or(false) {
            if let Some(ref agent_task_id) = payload.agent_task_id {
                let promoted = self
                    .correlation
                    .lock()
                    .await
                    .promote_to_agent(prompt_id, agent_task_id);
                if !promoted {
                    warn!(prompt_id = %prompt_id, "routing ack for unknown prompt");
                }
            }
            return Ok(());
        }

        let meta = self.correlation.lock().await.take_by_prompt(prompt_id);
        if let Some(meta) = meta {
            self.complete(&meta.task_id, true, &payload.response, now)?;
        }
        Ok(())
    }

    /// An `agent_complete` frame arrived for a background run.
    pub async fn on_agent_complete(
        &self,
        payload: &AgentCompletePayload,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let meta = self.correlation.lock().await.take_by_agent(&payload.task_id);
        if let Some(meta) = meta {
            self.complete(&meta.task_id, payload.success, &payload.response, now)?;
        }
        Ok(())
    }

    /// Transport reconnected: responses from the old connection will never
    /// arrive, so in-flight state resets.
    pub async fn on_reconnect(&self) {
        self.correlation.lock().await.clear();
    }

    async fn expire_timeouts(&self, now: DateTime<Utc>) -> Result<()> {
        let timeout = Duration::minutes(self.config.response_timeout_minutes);
        let expired = self.correlation.lock().await.expire(now, timeout);
        for meta in expired {
            warn!(task_id = %meta.task_id, "scheduled task response timed out");
            self.complete(&meta.task_id, false, "timed out waiting for a response", now)?;
        }
        Ok(())
    }

    fn complete(&self, task_id: &str, success: bool, response: &str, now: DateTime<Utc>) -> Result<()> {
        let mut tasks = self.store.load();
        let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) else {
            return Ok(());
        };

        if success {
            task.last_run_at = Some(now);
            task.consecutive_failures = 0;
            self.notifier.notify(task_id, response);
        } else {
            task.consecutive_failures += 1;
            if task.consecutive_failures >= self.config.max_consecutive_failures {
                task.status = TaskStatus::Paused;
                self.notifier.notify(
                    task_id,
                    &format!(
                        "'{}' failed {} times in a row and is paused. Fix the underlying \
                         problem and resume it.",
                        task.name, task.consecutive_failures
                    ),
                );
            }
        }
        self.store.store(&tasks)?;
        Ok(())
    }

    /// The long-running checker. Exits when the shutdown flag flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = std::time::Duration::from_secs(CHECK_INTERVAL_SECS);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = self.tick(Utc::now()).await {
                        warn!(%err, "scheduled task tick failed");
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
