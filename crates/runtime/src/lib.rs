//! Request dispatch and execution core: the tool loop engine, the Dot
//! orchestrator with its pre-pass tailoring, the scheduler family, and the
//! transport seam they all share.

mod bus;
mod dispatch;
pub mod dot;
mod envelope;
mod journal;
pub mod scheduler;
mod server;
mod tool_loop;

pub use bus::{BusEvent, EventBus};
pub use dispatch::{
    CRASH_FOLLOWUP, DispatchRequest, LaunchedPipeline, PipelineLauncher, PipelineResult, supervise,
};
pub use dot::{
    DISPATCH_TOOL, DotOrchestrator, DotReply, DotRequest, PersonaHint, SkillHit, SkillIndex,
    dispatch_and_supervise,
};
pub use envelope::{
    AgentCompletePayload, DispatchFollowupPayload, Envelope, ExecutionCommandInner,
    ExecutionCommandPayload, ExecutionResultPayload, FormatFixRequestPayload, LoopbackTransport,
    PromptPayload, ResponsePayload, Transport,
};
pub use journal::{MAX_RECOVERY_ATTEMPTS, RequestJournal};
pub use server::{PromptHandler, ServerSession, SessionDeps};
pub use tool_loop::{
    EscalateFn, Escalation, Termination, ToolExecution, ToolLoopConfig, ToolLoopOutcome,
    ToolObserver, run_tool_loop,
};
