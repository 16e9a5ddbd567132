//! The task execution engine: planning, roles, and the orchestrator.
//!
//! A task flows in as a natural-language description, is classified into a
//! mode with an output contract ([`plan`]), and is then driven through the
//! researcher → designer → coder → reviewer pipeline by the
//! [`Orchestrator`], which enforces iteration and LLM budgets, handles
//! clarification pauses, and decides the terminal state.

pub mod contract;
pub mod observer;
pub mod orchestrator;
pub mod plan;
pub mod roles;
pub mod scheduler;

pub use contract::{build_contract_repair_prompt, validate_output_contract};
pub use observer::{NullObserver, OrchestratorObserver};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, OutcomeStatus, ProcessRequest, TaskOutcome,
};
pub use plan::{build_default_plan, build_task_plan, OutputContract, TaskMode, TaskPlan};
pub use roles::{
    Coder, CoderOutcome, Designer, ResearchOutcome, Researcher, ReviewReport, Reviewer,
    ToolReports,
};
pub use scheduler::{next_task, CoderTask, CoderTaskKind};
