//! The background task runner: the glue between the governor, the engine,
//! and persistence.

use crate::app::AppContext;
use async_trait::async_trait;
use chrono::Utc;
use codeforge_core::{
    ArtifactKind, ClarificationQuestion, CodeforgeError, CodeforgeResult, Container, EventKind,
    ReviewSummary, Stage, TaskEvent, TaskPatch, TaskStatus,
};
use codeforge_engine::{
    Orchestrator, OrchestratorConfig, OrchestratorObserver, OutcomeStatus, ProcessRequest,
    TaskOutcome,
};
use codeforge_governor::{QueueItem, TaskRunner};
use codeforge_llm::LlmGateway;
use codeforge_patch::{build_git_export, build_patch_diff, build_repro_manifest};
use codeforge_runner::{CommandRecord, CommandRunner, RunnerSink, TaskWorkspace};
use codeforge_store::{build_container_snapshot, load_container, ArtifactRow, TaskStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Runs dequeued tasks through the orchestrator and mirrors progress into
/// the store.
pub struct EngineRunner {
    context: Arc<AppContext>,
}

impl EngineRunner {
    /// Runner over the shared context.
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    async fn event(&self, task_id: &str, kind: EventKind, payload: Value) {
        let event = TaskEvent::new(task_id.to_string(), kind, payload);
        if let Err(err) = self.context.store.append_event(event).await {
            error!(task_id, error = %err, "event append failed");
        }
    }

    async fn persist_container(&self, task_id: &str, container: &Container) {
        let snapshot = build_container_snapshot(container);
        if let Err(err) = self
            .context
            .store
            .save_container_snapshot(task_id, &snapshot)
            .await
        {
            error!(task_id, error = %err, "snapshot save failed");
        }
        if !self.context.config.file_persistence {
            return;
        }
        for (path, content) in &container.files {
            if let Err(err) = self.context.store.save_task_file(task_id, path, content).await {
                error!(task_id, path = %path, error = %err, "file save failed");
                break;
            }
        }
    }

    async fn record_artifact(&self, task_id: &str, kind: ArtifactKind, by: &str, payload: Value) {
        let row = ArtifactRow {
            id: Uuid::new_v4(),
            task_id: task_id.to_string(),
            kind: kind.clone(),
            produced_by: by.to_string(),
            payload,
            created_at: Utc::now(),
        };
        if let Err(err) = self.context.store.add_artifact(row).await {
            error!(task_id, error = %err, "artifact save failed");
            return;
        }
        self.event(
            task_id,
            EventKind::ArtifactAdded,
            json!({ "type": kind.as_str() }),
        )
        .await;
    }

    async fn fail_before_start(&self, task_id: &str, reason: &str) {
        self.event(
            task_id,
            EventKind::StageFailed,
            json!({ "stage": "initializing", "reason": reason, "status": "failed" }),
        )
        .await;
        let _ = self
            .context
            .store
            .update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    progress: Some(1.0),
                    current_stage: Some("failed".to_string()),
                    failure_reason: Some(reason.to_string()),
                    completed_at: Some(Utc::now()),
                    ..TaskPatch::default()
                },
            )
            .await;
        self.event(task_id, EventKind::TaskFailed, json!({ "error": reason }))
            .await;
    }

    async fn build_export_artifacts(
        &self,
        task_id: &str,
        container: &mut Container,
        outcome: &TaskOutcome,
        created_at: Option<String>,
    ) {
        let patch = build_patch_diff(&container.metadata.baseline_files, &container.files);
        let patch_value = serde_json::to_value(&patch).unwrap_or_default();
        container.add_artifact(ArtifactKind::PatchDiff, patch_value.clone(), "system");
        self.record_artifact(task_id, ArtifactKind::PatchDiff, "system", patch_value)
            .await;

        let export = build_git_export(task_id, &patch);
        let export_value = serde_json::to_value(&export).unwrap_or_default();
        container.add_artifact(ArtifactKind::GitExport, export_value.clone(), "system");
        self.record_artifact(task_id, ArtifactKind::GitExport, "system", export_value)
            .await;

        let review_summary = outcome.review.clone().unwrap_or_else(|| {
            container
                .latest_artifact(&ArtifactKind::ReviewReport)
                .map(|artifact| ReviewSummary {
                    passed: artifact.content["passed"].as_bool().unwrap_or(false),
                    status: artifact.content["status"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    issues_count: artifact.content["errors"]
                        .as_array()
                        .map(Vec::len)
                        .unwrap_or(0),
                    run_id: None,
                })
                .unwrap_or_default()
        });
        let manifest = build_repro_manifest(
            task_id,
            container,
            created_at,
            Some(Utc::now().to_rfc3339()),
            review_summary,
        );
        let manifest_value = serde_json::to_value(&manifest).unwrap_or_default();
        container.add_artifact(ArtifactKind::ReproManifest, manifest_value.clone(), "system");
        self.record_artifact(task_id, ArtifactKind::ReproManifest, "system", manifest_value)
            .await;
    }
}

#[async_trait]
impl TaskRunner for EngineRunner {
    async fn run(&self, item: QueueItem) -> CodeforgeResult<()> {
        let task_id = item.task_id.clone();
        info!(task_id = %task_id, resume = ?item.resume_from_stage, "task runner starting");

        let Some(row) = self.context.store.get_task(&task_id).await? else {
            return Err(CodeforgeError::Persistence(format!(
                "task {task_id} not found"
            )));
        };
        let owner = row.owner_key_hash.clone();

        if self.context.gate.quota_exceeded(owner.as_deref()).await? {
            self.fail_before_start(&task_id, "quota_exceeded").await;
            return Ok(());
        }

        self.context
            .store
            .update_task(
                &task_id,
                TaskPatch {
                    status: Some(TaskStatus::Processing),
                    progress: Some(0.1),
                    current_stage: Some("initializing".to_string()),
                    ..TaskPatch::default()
                },
            )
            .await?;
        self.event(
            &task_id,
            EventKind::StageStarted,
            json!({ "stage": "initializing" }),
        )
        .await;

        // Container: reload on resume, otherwise seed a fresh one.
        let mut container = match item.resume_from_stage {
            Some(_) => load_container(self.context.store.as_ref(), &task_id).await?,
            None => None,
        }
        .unwrap_or_else(|| Container::new(None));
        if container.metadata.baseline_files.is_empty() {
            if let Some(template_id) = &item.template_id {
                if let Some(template) = self.context.templates.resolve(template_id)? {
                    for (path, content) in &template.files {
                        container.add_file(path, content.clone())?;
                    }
                    container.metadata.template_id = Some(template.template_id.clone());
                    container.metadata.template_hash = Some(template.hash.clone());
                }
            }
            container.capture_baseline();
        }
        container.metadata.owner_key_hash = owner.clone();
        container.metadata.owner_user_id = row.owner_user_id.clone();

        let workspace = TaskWorkspace::new(task_id.clone(), &self.context.config.workspace_root);
        workspace.materialize(&container)?;
        container.metadata.workspace_path = Some(workspace.path().display().to_string());
        container.set_file_sink(Some(Arc::new(workspace.clone())));

        let mut command_runner = CommandRunner::new(workspace.path())
            .with_timeout(std::time::Duration::from_secs(
                self.context.config.command_timeout_seconds,
            ))
            .with_max_output_bytes(self.context.config.command_max_output_bytes)
            .with_sink(Arc::new(StoreSink {
                store: self.context.store.clone(),
                task_id: task_id.clone(),
            }));
        if let Some(allowed) = &self.context.config.allowed_commands {
            command_runner = command_runner.with_allowed_commands(allowed.clone());
        }

        self.context
            .store
            .update_task(
                &task_id,
                TaskPatch {
                    project_id: Some(container.project_id.clone()),
                    ..TaskPatch::default()
                },
            )
            .await?;
        self.persist_container(&task_id, &container).await;

        let gateway = LlmGateway::from_settings(self.context.llm.clone())?;
        let observer = Arc::new(PersistObserver {
            store: self.context.store.clone(),
            task_id: task_id.clone(),
        });
        let orchestrator = Orchestrator::new(
            self.context.codex.clone(),
            gateway,
            OrchestratorConfig::from(&self.context.config),
        )
        .with_observer(observer)
        .with_gate(self.context.gate.clone());

        let result = orchestrator
            .process_task(
                &mut container,
                ProcessRequest {
                    description: &item.description,
                    workspace: Some(&workspace),
                    command_runner: Some(&command_runner),
                    provided_answers: row.provided_answers.clone(),
                    resume_from_stage: item.resume_from_stage,
                },
            )
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                let reason = err.failure_reason();
                error!(task_id = %task_id, error = %err, "task processing error");
                self.event(
                    &task_id,
                    EventKind::StageFailed,
                    json!({ "stage": "processing", "reason": &reason, "status": "error" }),
                )
                .await;
                self.context
                    .store
                    .update_task(
                        &task_id,
                        TaskPatch {
                            status: Some(TaskStatus::Error),
                            progress: Some(1.0),
                            current_stage: Some("failed".to_string()),
                            failure_reason: Some(reason.clone()),
                            completed_at: Some(Utc::now()),
                            ..TaskPatch::default()
                        },
                    )
                    .await?;
                self.event(&task_id, EventKind::TaskFailed, json!({ "error": reason }))
                    .await;
                self.persist_container(&task_id, &container).await;
                return Ok(());
            }
        };

        match outcome.status {
            OutcomeStatus::NeedsInput => {
                self.persist_container(&task_id, &container).await;
                self.context
                    .store
                    .update_task(
                        &task_id,
                        TaskPatch {
                            status: Some(TaskStatus::NeedsInput),
                            progress: Some(container.progress),
                            current_stage: Some("needs_input".to_string()),
                            pending_questions: Some(outcome.questions.clone()),
                            resume_from_stage: Some(outcome.resume_from_stage),
                            ..TaskPatch::default()
                        },
                    )
                    .await?;
                info!(task_id = %task_id, "task paused for clarification input");
            }
            OutcomeStatus::Completed | OutcomeStatus::Failed => {
                let created_at = Some(row.created_at.to_rfc3339());
                self.build_export_artifacts(&task_id, &mut container, &outcome, created_at)
                    .await;
                self.persist_container(&task_id, &container).await;

                let completed = outcome.status == OutcomeStatus::Completed;
                self.context
                    .store
                    .update_task(
                        &task_id,
                        TaskPatch {
                            status: Some(if completed {
                                TaskStatus::Completed
                            } else {
                                TaskStatus::Failed
                            }),
                            progress: Some(1.0),
                            current_stage: Some(
                                if completed { "completed" } else { "failed" }.to_string(),
                            ),
                            failure_reason: outcome.failure_reason.clone(),
                            completed_at: Some(Utc::now()),
                            result: Some(serde_json::to_value(&outcome)?),
                            ..TaskPatch::default()
                        },
                    )
                    .await?;
                if completed {
                    self.event(
                        &task_id,
                        EventKind::TaskCompleted,
                        json!({ "status": "completed", "progress": 1.0 }),
                    )
                    .await;
                } else {
                    self.event(
                        &task_id,
                        EventKind::TaskFailed,
                        json!({ "error": outcome.failure_reason }),
                    )
                    .await;
                }
                info!(task_id = %task_id, completed, "task runner finished");
            }
        }
        Ok(())
    }
}

/// Mirrors orchestrator hooks into events and artifact rows.
struct PersistObserver {
    store: Arc<dyn TaskStore>,
    task_id: String,
}

impl PersistObserver {
    async fn event(&self, kind: EventKind, payload: Value) {
        let event = TaskEvent::new(self.task_id.clone(), kind, payload);
        if let Err(err) = self.store.append_event(event).await {
            error!(task_id = %self.task_id, error = %err, "event append failed");
        }
    }

    async fn artifact(&self, kind: ArtifactKind, produced_by: &str, payload: Value) {
        let row = ArtifactRow {
            id: Uuid::new_v4(),
            task_id: self.task_id.clone(),
            kind: kind.clone(),
            produced_by: produced_by.to_string(),
            payload,
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.add_artifact(row).await {
            error!(task_id = %self.task_id, error = %err, "artifact save failed");
            return;
        }
        self.event(EventKind::ArtifactAdded, json!({ "type": kind.as_str() }))
            .await;
    }

    fn stage_progress(stage: Stage) -> f64 {
        match stage {
            Stage::Research => 0.2,
            Stage::Design | Stage::Planning => 0.4,
            Stage::Implementation => 0.6,
            Stage::Review => 0.9,
        }
    }
}

#[async_trait]
impl OrchestratorObserver for PersistObserver {
    async fn stage_started(&self, stage: Stage) {
        self.event(EventKind::StageStarted, json!({ "stage": stage.as_str() }))
            .await;
        let _ = self
            .store
            .update_task(
                &self.task_id,
                TaskPatch {
                    progress: Some(Self::stage_progress(stage)),
                    current_stage: Some(stage.as_str().to_string()),
                    ..TaskPatch::default()
                },
            )
            .await;
    }

    async fn research_complete(&self, result: &Value) {
        self.artifact(ArtifactKind::ResearchSummary, "researcher", result.clone())
            .await;
    }

    async fn design_complete(&self, result: &Value) {
        self.artifact(ArtifactKind::Architecture, "designer", result.clone())
            .await;
    }

    async fn coder_finished(&self, result: &Value) {
        self.event(EventKind::ProgressUpdate, result.clone()).await;
    }

    async fn review_started(&self, kind: &str, iteration: Option<u64>) {
        self.event(
            EventKind::ReviewStarted,
            json!({ "kind": kind, "iteration": iteration }),
        )
        .await;
    }

    async fn review_finished(&self, kind: &str, iteration: Option<u64>, result: &Value) {
        self.event(
            EventKind::ReviewFinished,
            json!({
                "kind": kind,
                "iteration": iteration,
                "passed": result["passed"],
                "status": result["status"],
            }),
        )
        .await;
    }

    async fn review_result(&self, kind: &str, result: &Value) {
        self.artifact(ArtifactKind::ReviewReport, "reviewer", result.clone())
            .await;
        let issues_count = result["errors"].as_array().map(Vec::len).unwrap_or(0);
        self.event(
            EventKind::ReviewResult,
            json!({ "status": result["status"], "issues_count": issues_count, "kind": kind }),
        )
        .await;
    }

    async fn llm_usage(&self, usage: &Value) {
        self.event(EventKind::LlmUsage, usage.clone()).await;
        self.artifact(ArtifactKind::UsageReport, "coder", usage.clone())
            .await;
    }

    async fn llm_error(&self, message: &str) {
        self.event(EventKind::LlmError, json!({ "error": message })).await;
    }

    async fn stage_failed(&self, stage: Stage, reason: &str) {
        self.event(
            EventKind::StageFailed,
            json!({ "stage": stage.as_str(), "reason": reason, "status": "failed" }),
        )
        .await;
    }

    async fn clarification_requested(
        &self,
        questions: &[ClarificationQuestion],
        resume_from: Stage,
    ) {
        self.artifact(
            ArtifactKind::ClarificationQuestions,
            "planner",
            json!({
                "questions": questions,
                "requested_at": Utc::now().to_rfc3339(),
            }),
        )
        .await;
        self.event(
            EventKind::ClarificationRequested,
            json!({
                "questions": questions,
                "resume_from_stage": resume_from.as_str(),
            }),
        )
        .await;
    }
}

/// Mirrors command-runner events and logs into the store.
struct StoreSink {
    store: Arc<dyn TaskStore>,
    task_id: String,
}

#[async_trait]
impl RunnerSink for StoreSink {
    async fn event(&self, kind: EventKind, payload: Value) {
        let event = TaskEvent::new(self.task_id.clone(), kind, payload);
        if let Err(err) = self.store.append_event(event).await {
            error!(task_id = %self.task_id, error = %err, "command event append failed");
        }
    }

    async fn artifact(&self, record: &CommandRecord) {
        let row = ArtifactRow {
            id: Uuid::new_v4(),
            task_id: self.task_id.clone(),
            kind: ArtifactKind::CommandLog,
            produced_by: "runner".to_string(),
            payload: serde_json::to_value(record).unwrap_or_default(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.add_artifact(row).await {
            error!(task_id = %self.task_id, error = %err, "command log save failed");
        }
    }
}
