//! Process-wide application context and the task submission surface.

use codeforge_core::{
    missing_required_answers, owner_key_hash, Codex, CodeforgeError, CodeforgeResult,
    EngineConfig, EventKind, Stage, TaskEvent, TaskPatch, TaskRow, TaskStatus, TemplateCatalog,
};
use codeforge_governor::{
    enforce_rate_limit, scope, DailyQuotaGate, QuotaLimits, QueueItem, RateLimiter, TaskGovernor,
};
use codeforge_llm::LlmSettings;
use codeforge_store::{FileCaps, MemoryStore, SqliteStore, TaskStore};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Everything a handler needs, built once per process and passed
/// explicitly. No globals.
pub struct AppContext {
    /// Engine limits and paths.
    pub config: EngineConfig,
    /// The codex in effect.
    pub codex: Codex,
    /// LLM provider settings.
    pub llm: LlmSettings,
    /// Persistence.
    pub store: Arc<dyn TaskStore>,
    /// Queue and concurrency.
    pub governor: Arc<TaskGovernor>,
    /// Advisory request limiter.
    pub rate_limiter: Arc<RateLimiter>,
    /// Daily quota gate.
    pub gate: Arc<DailyQuotaGate>,
    /// Template catalog.
    pub templates: TemplateCatalog,
}

impl AppContext {
    /// Build the context from the environment and an optional codex file.
    pub fn from_env(codex_path: Option<&Path>) -> CodeforgeResult<Self> {
        let config = EngineConfig::from_env();
        let codex = Codex::load(codex_path)?;
        let llm = LlmSettings::from_env();

        let caps = FileCaps {
            max_task_bytes: config.max_task_bytes,
            max_task_files: config.max_task_files,
        };
        let store: Arc<dyn TaskStore> = match &config.database_url {
            Some(url) => {
                let path = url.strip_prefix("sqlite://").unwrap_or(url);
                info!(path, "using durable sqlite store");
                Arc::new(SqliteStore::open(Path::new(path), caps)?)
            }
            None => {
                info!("no DATABASE_URL set, using the in-memory store");
                Arc::new(MemoryStore::with_caps(caps))
            }
        };

        let governor = Arc::new(TaskGovernor::new(config.max_concurrent_tasks));
        let gate = Arc::new(DailyQuotaGate::new(
            store.clone(),
            QuotaLimits {
                max_tokens_per_day: config.max_tokens_per_day,
                max_command_runs_per_day: config.max_command_runs_per_day,
            },
        ));
        let templates = TemplateCatalog::new(config.templates_dir.clone());

        Ok(Self {
            config,
            codex,
            llm,
            store,
            governor,
            rate_limiter: Arc::new(RateLimiter::new()),
            gate,
            templates,
        })
    }

    /// Create a task row and enqueue it. Returns the task id.
    pub async fn submit_task(
        &self,
        description: &str,
        api_key: Option<&str>,
        template_id: Option<&str>,
        request_id: Option<&str>,
    ) -> CodeforgeResult<String> {
        let owner = api_key.map(owner_key_hash);
        if let Some(owner) = &owner {
            enforce_rate_limit(
                &self.rate_limiter,
                self.store.as_ref(),
                owner,
                scope::CREATE_TASK,
                self.config.rate_limit_create_tasks_per_min,
            )
            .await?;
        }
        if let Some(template_id) = template_id {
            if self.templates.resolve(template_id)?.is_none() {
                return Err(CodeforgeError::Config(format!(
                    "template '{template_id}' not found"
                )));
            }
        }

        let task_id = Uuid::new_v4().to_string();
        let mut row = TaskRow::new(task_id.clone(), description);
        row.owner_key_hash = owner;
        row.template_id = template_id.map(str::to_string);
        self.store.create_task(row).await?;
        self.store
            .append_event(TaskEvent::new(
                task_id.clone(),
                EventKind::TaskCreated,
                json!({ "description": description, "template_id": template_id }),
            ))
            .await?;

        self.governor.enqueue(QueueItem {
            task_id: task_id.clone(),
            description: description.to_string(),
            template_id: template_id.map(str::to_string),
            request_id: request_id.map(str::to_string),
            resume_from_stage: None,
        })?;
        info!(task_id = %task_id, "task submitted");
        Ok(task_id)
    }

    /// Record clarification answers for a paused task, optionally
    /// re-enqueueing it immediately.
    pub async fn submit_answers(
        &self,
        task_id: &str,
        answers: BTreeMap<String, String>,
        auto_resume: bool,
    ) -> CodeforgeResult<()> {
        let Some(row) = self.store.get_task(task_id).await? else {
            return Err(CodeforgeError::Persistence(format!(
                "task {task_id} not found"
            )));
        };
        let mut merged = row.provided_answers.clone();
        merged.extend(answers);

        self.store
            .update_task(
                task_id,
                TaskPatch {
                    provided_answers: Some(merged),
                    ..TaskPatch::default()
                },
            )
            .await?;
        self.store
            .append_event(TaskEvent::new(
                task_id.to_string(),
                EventKind::ClarificationReceived,
                json!({ "auto_resume": auto_resume }),
            ))
            .await?;

        if auto_resume {
            self.resume_task(task_id).await?;
        }
        Ok(())
    }

    /// Re-enqueue a paused task. Refuses with `missing_answers` while
    /// required questions remain unanswered.
    pub async fn resume_task(&self, task_id: &str) -> CodeforgeResult<()> {
        let Some(row) = self.store.get_task(task_id).await? else {
            return Err(CodeforgeError::Persistence(format!(
                "task {task_id} not found"
            )));
        };
        if row.status != TaskStatus::NeedsInput {
            return Err(CodeforgeError::Orchestrator(format!(
                "task {task_id} is not awaiting input"
            )));
        }
        let missing = missing_required_answers(&row.pending_questions, &row.provided_answers);
        if !missing.is_empty() {
            return Err(CodeforgeError::Orchestrator(format!(
                "missing_answers: {}",
                missing.join(", ")
            )));
        }

        let resume_stage = row.resume_from_stage.unwrap_or(Stage::Implementation);
        self.store
            .update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Queued),
                    current_stage: Some("clarification_resume".to_string()),
                    ..TaskPatch::default()
                },
            )
            .await?;
        self.store
            .append_event(TaskEvent::new(
                task_id.to_string(),
                EventKind::TaskResumed,
                json!({ "resume_from_stage": resume_stage.as_str() }),
            ))
            .await?;
        self.governor.enqueue(QueueItem {
            task_id: task_id.to_string(),
            description: row.description,
            template_id: row.template_id,
            request_id: None,
            resume_from_stage: Some(resume_stage),
        })?;
        info!(task_id, resume_stage = resume_stage.as_str(), "task re-enqueued");
        Ok(())
    }
}
