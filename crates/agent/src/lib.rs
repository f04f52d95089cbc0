//! The agent pipeline: recruit → plan → execute steps → re-plan, dispatched
//! asynchronously while Dot answers early.

mod intake;
mod persona;
mod pipeline;
mod plan;
mod registry;
mod replan;
mod workspace;

pub use intake::classify;
pub use persona::{AgentPersona, AgentStatus, PersonaProfile, Recruitment, recruit};
pub use pipeline::{AgentPipeline, ESCALATE_TOOL};
pub use plan::{
    MAX_STEPS, PlanProgress, PlanStep, StepPlan, ToolLogEntry, build_plan, progress_summary,
};
pub use registry::{AgentTaskMeta, TaskRegistry};
pub use replan::review_plan;
pub use workspace::Workspace;
