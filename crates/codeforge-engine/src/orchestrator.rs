//! The per-task state machine: sequences roles, enforces budgets, handles
//! pauses, and decides the terminal state.

use crate::contract::build_contract_repair_prompt;
use crate::observer::{NullObserver, OrchestratorObserver};
use crate::plan::{build_task_plan, TaskPlan};
use crate::roles::{Coder, Designer, Researcher, ResearchOutcome, Reviewer, ReviewReport};
use crate::scheduler;
use codeforge_core::{
    ArtifactKind, ClarificationQuestion, Codex, CodeforgeError, CodeforgeResult, Container,
    EngineConfig, ProjectState, ReviewSummary, RoleKind, Stage, UnlimitedGate, UsageGate,
};
use codeforge_llm::LlmGateway;
use codeforge_runner::{CommandRunner, TaskWorkspace};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Budget knobs for the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Parse/contract repair attempts per step.
    pub max_retries_per_step: u32,
    /// Per-task LLM call ceiling, 0 = unlimited.
    pub llm_max_calls_per_task: u64,
    /// Per-task LLM token ceiling, 0 = unlimited.
    pub llm_max_total_tokens_per_task: u64,
    /// Iteration ceiling for micro-file tasks.
    pub micro_max_iterations: u64,
    /// Pause after each reviewed iteration for a user decision.
    pub manual_step_enabled: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries_per_step: 2,
            llm_max_calls_per_task: 0,
            llm_max_total_tokens_per_task: 0,
            micro_max_iterations: 3,
            manual_step_enabled: false,
        }
    }
}

impl From<&EngineConfig> for OrchestratorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_retries_per_step: config.llm_max_retries_per_step,
            llm_max_calls_per_task: config.llm_max_calls_per_task,
            llm_max_total_tokens_per_task: config.llm_max_total_tokens_per_task,
            micro_max_iterations: config.micro_max_iterations,
            manual_step_enabled: config.manual_step_enabled,
        }
    }
}

/// Terminal disposition of one `process_task` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The task finished with an approving review.
    Completed,
    /// The task finished with a terminal failure.
    Failed,
    /// The task paused for user input and may be resumed.
    NeedsInput,
}

/// Result of one `process_task` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Terminal disposition.
    pub status: OutcomeStatus,
    /// Progress at return time.
    pub progress: f64,
    /// Failure reason, verbatim for the task view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Stage that failed, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_stage: Option<Stage>,
    /// Implementation iterations executed.
    pub iterations: u64,
    /// Iteration ceiling in effect.
    pub max_iterations: u64,
    /// Files in the container at return time.
    pub files_count: usize,
    /// Artifacts in the container at return time.
    pub artifacts_count: usize,
    /// Questions the task is waiting on, for `needs_input`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<ClarificationQuestion>,
    /// Stage to resume from, for `needs_input`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from_stage: Option<Stage>,
    /// Latest review summary, when a review ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewSummary>,
}

/// Everything one `process_task` call needs beyond the container.
pub struct ProcessRequest<'a> {
    /// The natural-language task.
    pub description: &'a str,
    /// Workspace mirror, when command passes should run.
    pub workspace: Option<&'a TaskWorkspace>,
    /// Sandboxed runner for the reviewer, when dynamic checks should run.
    pub command_runner: Option<&'a CommandRunner>,
    /// Answers submitted for a resumed task.
    pub provided_answers: BTreeMap<String, String>,
    /// Stage to re-enter on resume.
    pub resume_from_stage: Option<Stage>,
}

/// The orchestrator: one instance drives one task at a time.
pub struct Orchestrator {
    codex: Codex,
    gateway: LlmGateway,
    config: OrchestratorConfig,
    observer: Arc<dyn OrchestratorObserver>,
    gate: Arc<dyn UsageGate>,
}

impl Orchestrator {
    /// Build an orchestrator with a null observer and an unlimited gate.
    pub fn new(codex: Codex, gateway: LlmGateway, config: OrchestratorConfig) -> Self {
        Self {
            codex,
            gateway,
            config,
            observer: Arc::new(NullObserver),
            gate: Arc::new(UnlimitedGate),
        }
    }

    /// Attach the progress observer.
    pub fn with_observer(mut self, observer: Arc<dyn OrchestratorObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Attach the daily-usage gate.
    pub fn with_gate(mut self, gate: Arc<dyn UsageGate>) -> Self {
        self.gate = gate;
        self
    }

    /// The codex in effect.
    pub fn codex(&self) -> &Codex {
        &self.codex
    }

    /// Drive the task through its stages until it completes, fails, or
    /// pauses for input.
    pub async fn process_task(
        &self,
        container: &mut Container,
        request: ProcessRequest<'_>,
    ) -> CodeforgeResult<TaskOutcome> {
        let plan = build_task_plan(
            request.description,
            &self.codex,
            self.config.micro_max_iterations,
            Some(&self.gateway),
        )
        .await;
        info!(mode = ?plan.mode, stages = ?plan.stages, "task plan ready");

        container.metadata.max_iterations = Some(plan.max_iterations);
        container.metadata.codex_hash = Some(self.codex.content_hash());

        let stages = self.stages_to_run(&plan, container, request.resume_from_stage);
        let mut final_review: Option<ReviewReport> = None;

        for stage in stages {
            self.observer.stage_started(stage).await;
            match stage {
                Stage::Research => match self.run_research(container, &request).await {
                    Ok(Some(outcome)) => return Ok(outcome),
                    Ok(None) => {}
                    Err(err) => return self.fail(container, &plan, Stage::Research, err).await,
                },
                Stage::Design => {
                    if let Err(err) = self.run_design(container).await {
                        return self.fail(container, &plan, Stage::Design, err).await;
                    }
                }
                Stage::Planning => {
                    // Sub-task shaping happens inside the implementation
                    // loop's scheduler; the stage itself has no side effects.
                }
                Stage::Implementation => {
                    match self.run_implementation(container, &plan, &request).await {
                        Ok(Some(outcome)) => return Ok(outcome),
                        Ok(None) => {}
                        Err(err) => {
                            return self.fail(container, &plan, Stage::Implementation, err).await
                        }
                    }
                }
                Stage::Review => {
                    if !plan.use_review {
                        continue;
                    }
                    match self.run_final_review(container, &request).await {
                        Ok(report) => {
                            if !report.passed {
                                return self
                                    .fail(
                                        container,
                                        &plan,
                                        Stage::Review,
                                        CodeforgeError::Orchestrator("final_review_failed".into()),
                                    )
                                    .await;
                            }
                            final_review = Some(report);
                        }
                        Err(err) => return self.fail(container, &plan, Stage::Review, err).await,
                    }
                }
            }
        }

        container.update_state(ProjectState::Complete, Some("Project completed"));
        container.update_progress(1.0);
        info!("task completed");
        Ok(TaskOutcome {
            status: OutcomeStatus::Completed,
            progress: 1.0,
            failure_reason: None,
            failure_stage: None,
            iterations: container.metadata.iterations,
            max_iterations: plan.max_iterations,
            files_count: container.files.len(),
            artifacts_count: container.artifacts.values().map(Vec::len).sum(),
            questions: Vec::new(),
            resume_from_stage: None,
            review: final_review.map(|r| r.to_summary()),
        })
    }

    /// Re-run the reviewer on the current container without touching the
    /// rest of the pipeline.
    pub async fn rerun_review(
        &self,
        container: &mut Container,
        workspace: Option<&TaskWorkspace>,
        runner: Option<&CommandRunner>,
    ) -> CodeforgeResult<ReviewReport> {
        container.metadata.active_role = Some(RoleKind::Reviewer.to_string());
        self.observer.review_started("rerun", None).await;
        let report = Reviewer::new(self.codex.rules.reviewer.clone())
            .execute(container, workspace, runner, self.gate.as_ref())
            .await?;
        let payload = serde_json::to_value(&report)?;
        self.observer.review_finished("rerun", None, &payload).await;
        self.observer.review_result("rerun", &payload).await;
        Ok(report)
    }

    fn stages_to_run(
        &self,
        plan: &TaskPlan,
        container: &Container,
        resume_from: Option<Stage>,
    ) -> Vec<Stage> {
        let mut stages = plan.stages.clone();
        if let Some(resume) = resume_from {
            if let Some(index) = stages.iter().position(|s| *s == resume) {
                stages = stages.split_off(index);
            }
        }
        stages.retain(|stage| match stage {
            // A stage whose artifacts already exist was finished before the
            // pause; skip it on resume.
            Stage::Research => {
                resume_from == Some(Stage::Research)
                    || container
                        .artifacts
                        .get(&ArtifactKind::Requirements)
                        .map_or(true, Vec::is_empty)
            }
            Stage::Design => {
                resume_from == Some(Stage::Design) || container.target_architecture.is_none()
            }
            _ => true,
        });
        stages
    }

    async fn run_research(
        &self,
        container: &mut Container,
        request: &ProcessRequest<'_>,
    ) -> CodeforgeResult<Option<TaskOutcome>> {
        container.update_state(ProjectState::Research, Some("Analyzing requirements"));
        container.update_progress(0.2);
        container.metadata.active_role = Some(RoleKind::Researcher.to_string());
        self.check_task_budget(container)?;

        let researcher = Researcher::new(self.codex.rules.researcher.clone());
        let outcome = researcher
            .execute(
                request.description,
                container,
                &self.gateway,
                &request.provided_answers,
            )
            .await?;
        match outcome {
            ResearchOutcome::Complete(doc) => {
                self.observer
                    .research_complete(&serde_json::to_value(&doc)?)
                    .await;
                Ok(None)
            }
            ResearchOutcome::NeedsClarification(questions) => {
                let resume_from = Stage::Research;
                container.add_artifact(
                    ArtifactKind::ClarificationQuestions,
                    json!({
                        "questions": &questions,
                        "requested_at": chrono::Utc::now().to_rfc3339(),
                    }),
                    RoleKind::Planner.to_string(),
                );
                self.observer
                    .clarification_requested(&questions, resume_from)
                    .await;
                info!(questions = questions.len(), "task paused for clarification");
                Ok(Some(TaskOutcome {
                    status: OutcomeStatus::NeedsInput,
                    progress: container.progress,
                    failure_reason: None,
                    failure_stage: None,
                    iterations: container.metadata.iterations,
                    max_iterations: container.metadata.max_iterations.unwrap_or_default(),
                    files_count: container.files.len(),
                    artifacts_count: container.artifacts.values().map(Vec::len).sum(),
                    questions,
                    resume_from_stage: Some(resume_from),
                    review: None,
                }))
            }
        }
    }

    async fn run_design(&self, container: &mut Container) -> CodeforgeResult<()> {
        container.update_state(ProjectState::Design, Some("Creating architecture"));
        container.update_progress(0.4);
        container.metadata.active_role = Some(RoleKind::Designer.to_string());
        self.check_task_budget(container)?;

        let architecture = Designer.execute(container, &self.gateway).await?;
        self.observer
            .design_complete(&serde_json::to_value(&architecture)?)
            .await;
        Ok(())
    }

    async fn run_implementation(
        &self,
        container: &mut Container,
        plan: &TaskPlan,
        request: &ProcessRequest<'_>,
    ) -> CodeforgeResult<Option<TaskOutcome>> {
        container.update_state(ProjectState::Implementation, Some("Implementing solution"));
        container.update_progress(0.6);

        let coder = Coder::new(self.codex.rules.coder.clone());
        let reviewer = Reviewer::new(self.codex.rules.reviewer.clone());
        let max_iterations = plan.max_iterations;
        let mut iteration = container.metadata.iterations;
        let mut correction_prompt: Option<String> = None;

        loop {
            if container.is_complete() {
                break;
            }
            let Some(task) = scheduler::next_task(
                container,
                plan.mode,
                &plan.contract,
                request.description,
            ) else {
                break;
            };
            if iteration >= max_iterations {
                warn!(iteration, max_iterations, "iteration budget exhausted");
                return Err(CodeforgeError::BudgetExceeded(
                    "max_iterations_exhausted".into(),
                ));
            }
            iteration += 1;
            container.metadata.iterations = iteration;
            container.current_task = Some(task.description.clone());
            container.metadata.active_role = Some(RoleKind::Coder.to_string());
            info!(iteration, task = %task.description, "implementation iteration");

            // Per-step repair loop: parse and contract failures get repair
            // prompts until the step budget runs out.
            let mut attempts = 0u32;
            let outcome = loop {
                self.check_task_budget(container)?;
                match coder
                    .execute(
                        &task,
                        container,
                        &self.gateway,
                        &plan.contract,
                        correction_prompt.as_deref(),
                        self.gate.as_ref(),
                    )
                    .await
                {
                    Ok(outcome) => break outcome,
                    Err(err @ CodeforgeError::ContractViolation { .. })
                    | Err(err @ CodeforgeError::ResponseParse { .. }) => {
                        self.observer.llm_error(&err.to_string()).await;
                        attempts += 1;
                        if attempts > self.config.max_retries_per_step {
                            error!(attempts, "step repair budget exhausted");
                            return Err(CodeforgeError::BudgetExceeded("llm_invalid_json".into()));
                        }
                        correction_prompt = Some(match &err {
                            CodeforgeError::ContractViolation { violations } => {
                                build_contract_repair_prompt(&plan.contract, violations)
                            }
                            _ => "Your previous response was not valid JSON. \
                                  Return ONLY a valid JSON object with a 'files' list."
                                .to_string(),
                        });
                    }
                    Err(err) => return Err(err),
                }
            };
            correction_prompt = None;

            self.observer
                .coder_finished(&json!({
                    "files": outcome.files,
                    "primary_file": outcome.primary_file,
                    "iteration": iteration,
                }))
                .await;
            self.observer
                .llm_usage(&serde_json::to_value(&outcome.usage_report)?)
                .await;

            if plan.use_review && self.codex.workflow.review_required {
                container.metadata.active_role = Some(RoleKind::Reviewer.to_string());
                self.observer.review_started("iteration", Some(iteration)).await;
                let report = reviewer
                    .execute(
                        container,
                        request.workspace,
                        request.command_runner,
                        self.gate.as_ref(),
                    )
                    .await?;
                let payload = serde_json::to_value(&report)?;
                self.observer
                    .review_finished("iteration", Some(iteration), &payload)
                    .await;
                self.observer.review_result("iteration", &payload).await;

                if report.passed {
                    container.update_progress(iteration as f64 / max_iterations as f64);
                } else {
                    warn!(iteration, issues = report.errors.len(), "iteration rejected");
                    correction_prompt = Some(format!(
                        "The last review rejected the changes. Fix these problems: {}",
                        report.errors.join("; ")
                    ));
                }

                if self.config.manual_step_enabled {
                    container
                        .metadata
                        .extra
                        .insert("awaiting_manual_step".into(), json!(true));
                    info!(iteration, "task paused at the manual gate");
                    return Ok(Some(TaskOutcome {
                        status: OutcomeStatus::NeedsInput,
                        progress: container.progress,
                        failure_reason: None,
                        failure_stage: None,
                        iterations: iteration,
                        max_iterations,
                        files_count: container.files.len(),
                        artifacts_count: container.artifacts.values().map(Vec::len).sum(),
                        questions: Vec::new(),
                        resume_from_stage: Some(Stage::Implementation),
                        review: Some(report.to_summary()),
                    }));
                }
            }
        }

        Ok(None)
    }

    async fn run_final_review(
        &self,
        container: &mut Container,
        request: &ProcessRequest<'_>,
    ) -> CodeforgeResult<ReviewReport> {
        container.update_state(ProjectState::Review, Some("Final quality check"));
        container.update_progress(0.9);
        container.metadata.active_role = Some(RoleKind::Reviewer.to_string());

        self.observer.review_started("final", None).await;
        let report = Reviewer::new(self.codex.rules.reviewer.clone())
            .execute(
                container,
                request.workspace,
                request.command_runner,
                self.gate.as_ref(),
            )
            .await?;
        let payload = serde_json::to_value(&report)?;
        self.observer.review_finished("final", None, &payload).await;
        self.observer.review_result("final", &payload).await;
        Ok(report)
    }

    fn check_task_budget(&self, container: &Container) -> CodeforgeResult<()> {
        if self.config.llm_max_calls_per_task > 0
            && container.llm_call_count() >= self.config.llm_max_calls_per_task
        {
            return Err(CodeforgeError::BudgetExceeded("llm_budget_exhausted".into()));
        }
        if self.config.llm_max_total_tokens_per_task > 0
            && container.metadata.total_tokens >= self.config.llm_max_total_tokens_per_task
        {
            return Err(CodeforgeError::BudgetExceeded("llm_budget_exceeded".into()));
        }
        Ok(())
    }

    async fn fail(
        &self,
        container: &mut Container,
        plan: &TaskPlan,
        stage: Stage,
        err: CodeforgeError,
    ) -> CodeforgeResult<TaskOutcome> {
        let reason = err.failure_reason();
        error!(stage = %stage, reason = %reason, "stage failed");
        container.errors.push(reason.clone());
        container.update_state(ProjectState::Error, Some(&reason));
        container.update_progress(1.0);
        self.observer.stage_failed(stage, &reason).await;

        Ok(TaskOutcome {
            status: OutcomeStatus::Failed,
            progress: 1.0,
            failure_reason: Some(reason),
            failure_stage: Some(stage),
            iterations: container.metadata.iterations,
            max_iterations: plan.max_iterations,
            files_count: container.files.len(),
            artifacts_count: container.artifacts.values().map(Vec::len).sum(),
            questions: Vec::new(),
            resume_from_stage: None,
            review: None,
        })
    }
}
