//! Scheduler family: periodic local tasks, server-side recurring tasks,
//! one-shot deferred tasks, the auto-update checker, and workspace GC.

mod correlation;
mod deferred;
mod gc;
mod local;
mod parse;
mod recurring;
mod schedule;
mod update;

use async_trait::async_trait;

pub use correlation::{CorrelationMap, PendingMeta};
pub use deferred::{DeferredQueue, DeferredStatus, DeferredTask};
pub use gc::sweep_workspaces;
pub use local::{LocalScheduler, ScheduledTask, ScheduledTaskStore, TaskStatus};
pub use parse::parse_schedule_time;
pub use recurring::{EXECUTION_TIMEOUT_MINUTES, RecurringSchedule, RecurringStore, RecurringTask};
pub use schedule::{MIN_INTERVAL_MINUTES, Schedule, is_in_window};
pub use update::{UpdateChecker, UpdateStatus};

/// Where scheduler-originated prompts go: the same entry user traffic uses.
#[async_trait]
pub trait PromptSink: Send + Sync {
    /// Submit a prompt tagged with its source and correlation id.
    async fn submit(
        &self,
        prompt_id: &str,
        prompt: &str,
        source: &str,
        scheduled_task_id: Option<&str>,
    ) -> anyhow::Result<()>;
}

/// User-facing notifications raised by the schedulers (missed tasks, pauses,
/// available updates).
pub trait Notifier: Send + Sync {
    fn notify(&self, task_id: &str, message: &str);
}
