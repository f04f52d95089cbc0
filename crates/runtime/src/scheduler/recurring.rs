//! Server-side recurring tasks: the persisted analogue of local scheduled
//! tasks, with per-user timezones, a preferred device, and an optional cron
//! expression for operator-defined cadences.

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::schedule::Schedule;
use super::local::TaskStatus;

/// Wall-clock budget for one recurring execution.
pub const EXECUTION_TIMEOUT_MINUTES: i64 = 5;

/// Cadence of a recurring task: the four schedule kinds, or a cron
/// expression evaluated in the task's timezone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecurringSchedule {
    Simple(Schedule),
    Cron { cron: String },
}

impl RecurringSchedule {
    pub fn validate(&self) -> Result<()> {
        match self {
            RecurringSchedule::Simple(schedule) => schedule.validate(),
            RecurringSchedule::Cron { cron: expr } => {
                cron::Schedule::from_str(expr)
                    .with_context(|| format!("invalid cron expression {expr:?}"))?;
                Ok(())
            }
        }
    }

    pub fn next_occurrence(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            RecurringSchedule::Simple(schedule) => Some(schedule.next_occurrence(after, tz)),
            RecurringSchedule::Cron { cron: expr } => {
                let schedule = cron::Schedule::from_str(expr).ok()?;
                schedule
                    .after(&after.with_timezone(&tz))
                    .next()
                    .map(|dt| dt.with_timezone(&Utc))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringTask {
    pub id: String,
    pub user_id: String,
    /// Preferred device for execution; any connected device when absent.
    #[serde(default)]
    pub device_id: Option<String>,
    pub name: String,
    pub prompt: String,
    pub schedule: RecurringSchedule,
    /// IANA timezone the schedule is evaluated in.
    pub timezone: String,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub max_failures: u32,
    /// Set once when the missed-run prompt was sent, so the user is asked at
    /// most once per miss.
    #[serde(default)]
    pub missed_prompt_sent_at: Option<DateTime<Utc>>,
}

impl RecurringTask {
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            warn!(timezone = %self.timezone, "unrecognised timezone — falling back to UTC");
            chrono_tz::UTC
        })
    }
}

/// JSON-file persistence for recurring tasks.
pub struct RecurringStore {
    path: PathBuf,
}

impl RecurringStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn create(
        &self,
        user_id: &str,
        name: &str,
        prompt: &str,
        schedule: RecurringSchedule,
        timezone: &str,
        device_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RecurringTask> {
        schedule.validate()?;
        let tz: Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
        let next_run_at = schedule
            .next_occurrence(now, tz)
            .context("schedule yields no future occurrence")?;

        let task = RecurringTask {
            id: format!("rt-{}", Uuid::new_v4()),
            user_id: user_id.to_string(),
            device_id,
            name: name.to_string(),
            prompt: prompt.to_string(),
            schedule,
            timezone: timezone.to_string(),
            next_run_at,
            last_run_at: None,
            status: TaskStatus::Active,
            consecutive_failures: 0,
            max_failures: 3,
            missed_prompt_sent_at: None,
        };
        let mut tasks = self.load();
        tasks.push(task.clone());
        self.store(&tasks)?;
        Ok(task)
    }

    /// Active tasks due at `now`, for dispatch to their preferred device.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<RecurringTask> {
        self.load()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Active && t.next_run_at <= now)
            .collect()
    }

    /// Advance a task past a run: update bookkeeping and compute the next
    /// timezone-aware occurrence.
    pub fn complete_run(&self, task_id: &str, success: bool, now: DateTime<Utc>) -> Result<()> {
        let mut tasks = self.load();
        let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) else {
            return Ok(());
        };

        if success {
            task.last_run_at = Some(now);
            task.consecutive_failures = 0;
            task.missed_prompt_sent_at = None;
        } else {
            task.consecutive_failures += 1;
            if task.consecutive_failures >= task.max_failures {
                task.status = TaskStatus::Paused;
            }
        }
        let tz = task.tz();
        if let Some(next) = task.schedule.next_occurrence(now, tz) {
            task.next_run_at = next;
        }
        self.store(&tasks)
    }

    /// Record that the missed-run prompt went out, exactly once per miss.
    /// Returns whether this call was the one that sent it.
    pub fn mark_missed_prompt(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut tasks = self.load();
        let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) else {
            return Ok(false);
        };
        if task.missed_prompt_sent_at.is_some() {
            return Ok(false);
        }
        task.missed_prompt_sent_at = Some(now);
        let tz = task.tz();
        if let Some(next) = task.schedule.next_occurrence(now, tz) {
            task.next_run_at = next;
        }
        self.store(&tasks)?;
        Ok(true)
    }

    pub fn load(&self) -> Vec<RecurringTask> {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(%err, "corrupt recurring task file — starting empty");
            Vec::new()
        })
    }

    fn store(&self, tasks: &[RecurringTask]) -> Result<()> {
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
}
