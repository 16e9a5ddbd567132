//! Full task lifecycle through the runner, the store, and the governor.

use codeforge_cli::{AppContext, EngineRunner};
use codeforge_core::{
    missing_required_answers, ArtifactKind, ClarificationQuestion, Codex, EngineConfig,
    EventKind, TaskRow, TaskStatus, TemplateCatalog,
};
use codeforge_governor::{
    DailyQuotaGate, QuotaLimits, QueueItem, RateLimiter, TaskGovernor, TaskRunner as _,
};
use codeforge_llm::LlmSettings;
use codeforge_store::{ListOrder, MemoryStore, TaskStore};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Whether the reviewer's tool passes can actually run on this host. A
/// missing ruff or pytest is a blocking review finding, so full-pipeline
/// tasks only complete when the tools exist.
fn review_tools_available() -> bool {
    let ok = |cmd: &str, args: &[&str]| {
        std::process::Command::new(cmd)
            .args(args)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    };
    ok("ruff", &["--version"])
        && ok("python3", &["--version"])
        && ok("python3", &["-m", "pytest", "--version"])
}

fn test_context(workspace_root: &std::path::Path) -> Arc<AppContext> {
    let config = EngineConfig {
        workspace_root: workspace_root.to_path_buf(),
        ..EngineConfig::default()
    };
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
    let gate = Arc::new(DailyQuotaGate::new(store.clone(), QuotaLimits::default()));
    Arc::new(AppContext {
        governor: Arc::new(TaskGovernor::new(config.max_concurrent_tasks)),
        codex: Codex::default(),
        llm: LlmSettings::default(),
        rate_limiter: Arc::new(RateLimiter::new()),
        templates: TemplateCatalog::new(None),
        config,
        store,
        gate,
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn project_task_runs_to_completion_and_persists_everything() {
    let workspace = tempfile::tempdir().unwrap();
    let context = test_context(workspace.path());
    let engine = EngineRunner::new(context.clone());

    let task_id = context
        .submit_task(
            "Create a REST API for managing todo items with CRUD operations",
            Some("secret-key"),
            None,
            Some("req-1"),
        )
        .await
        .unwrap();

    let row = context.store.get_task(&task_id).await.unwrap().unwrap();
    engine
        .run(QueueItem {
            task_id: task_id.clone(),
            description: row.description.clone(),
            template_id: None,
            request_id: None,
            resume_from_stage: None,
        })
        .await
        .unwrap();

    let row = context.store.get_task(&task_id).await.unwrap().unwrap();
    if review_tools_available() {
        assert_eq!(row.status, TaskStatus::Completed);
    } else {
        // Without the tools the final review rejects, which is itself the
        // specified behavior.
        assert_eq!(row.status, TaskStatus::Failed);
        assert_eq!(row.failure_reason.as_deref(), Some("final_review_failed"));
    }
    assert_eq!(row.progress, 1.0);
    assert!(row.completed_at.is_some());
    assert!(row.time_taken_seconds() >= 0.0);

    // Events were appended in monotonic order and include the lifecycle
    // markers.
    let events = context
        .store
        .list_events(&task_id, 1000, ListOrder::Asc)
        .await
        .unwrap();
    for pair in events.windows(2) {
        assert!(pair[1].created_at >= pair[0].created_at);
    }
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    assert!(kinds.contains(&"TaskCreated"));
    assert!(kinds.contains(&"StageStarted"));
    assert!(kinds.contains(&"ReviewResult"));
    if review_tools_available() {
        assert!(kinds.contains(&"TaskCompleted"));
    } else {
        assert!(kinds.contains(&"TaskFailed"));
    }

    // Every ArtifactAdded event has a matching artifact row.
    let artifacts = context
        .store
        .list_artifacts(&task_id, None, 1000, ListOrder::Asc)
        .await
        .unwrap();
    let artifact_added = kinds.iter().filter(|k| **k == "ArtifactAdded").count();
    assert!(artifacts.len() >= artifact_added);

    // Export artifacts exist.
    for kind in [
        ArtifactKind::PatchDiff,
        ArtifactKind::GitExport,
        ArtifactKind::ReproManifest,
        ArtifactKind::ReviewReport,
    ] {
        assert!(
            artifacts.iter().any(|a| a.kind == kind),
            "missing {kind} artifact"
        );
    }

    // The container snapshot and the persisted files agree with each other.
    let snapshot = context
        .store
        .load_container_snapshot(&task_id)
        .await
        .unwrap()
        .unwrap();
    let files = context.store.list_task_files(&task_id).await.unwrap();
    assert_eq!(snapshot.files.len(), files.len());
    assert!(files.iter().any(|(path, _)| path == "requirements.md"));

    // The patch diff covers every generated file (empty baseline).
    let patch = artifacts
        .iter()
        .find(|a| a.kind == ArtifactKind::PatchDiff)
        .unwrap();
    assert_eq!(
        patch.payload["stats"]["added"].as_u64().unwrap() as usize,
        files.len()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn quota_exceeded_owner_fails_before_processing() {
    let workspace = tempfile::tempdir().unwrap();
    let mut context = test_context(workspace.path());
    {
        let inner = Arc::get_mut(&mut context).unwrap();
        inner.gate = Arc::new(DailyQuotaGate::new(
            inner.store.clone(),
            QuotaLimits {
                max_tokens_per_day: 10,
                max_command_runs_per_day: 0,
            },
        ));
    }
    let engine = EngineRunner::new(context.clone());

    let task_id = context
        .submit_task("Create a CRUD API", Some("burned-key"), None, None)
        .await
        .unwrap();
    let owner = context
        .store
        .get_task(&task_id)
        .await
        .unwrap()
        .unwrap()
        .owner_key_hash
        .unwrap();
    context.store.record_usage(&owner, 10, 5, 0).await.unwrap();

    engine
        .run(QueueItem {
            task_id: task_id.clone(),
            description: "Create a CRUD API".into(),
            template_id: None,
            request_id: None,
            resume_from_stage: None,
        })
        .await
        .unwrap();

    let row = context.store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(row.failure_reason.as_deref(), Some("quota_exceeded"));
    let events = context
        .store
        .list_events(&task_id, 100, ListOrder::Asc)
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::StageFailed
            && e.payload["reason"] == "quota_exceeded"));
}

#[tokio::test]
async fn answer_submission_validates_required_questions() {
    let workspace = tempfile::tempdir().unwrap();
    let context = test_context(workspace.path());

    // A paused task with one required and one optional question.
    let mut row = TaskRow::new("t-paused", "Build an API");
    row.status = TaskStatus::NeedsInput;
    row.pending_questions = vec![
        ClarificationQuestion {
            id: "q1".into(),
            text: "Which fields?".into(),
            question_type: "free_text".into(),
            choices: Vec::new(),
            required: true,
            rationale: None,
        },
        ClarificationQuestion {
            id: "q2".into(),
            text: "Pagination?".into(),
            question_type: "free_text".into(),
            choices: Vec::new(),
            required: false,
            rationale: None,
        },
    ];
    row.resume_from_stage = Some(codeforge_core::Stage::Research);
    context.store.create_task(row).await.unwrap();

    // Only the optional answer: resume is refused with missing_answers.
    let mut optional_only = BTreeMap::new();
    optional_only.insert("q2".to_string(), "no".to_string());
    context
        .submit_answers("t-paused", optional_only, false)
        .await
        .unwrap();
    let err = context.resume_task("t-paused").await.unwrap_err();
    assert!(err.to_string().contains("missing_answers"));
    assert!(err.to_string().contains("q1"));

    // The required answer with auto-resume re-enqueues the task.
    let mut required = BTreeMap::new();
    required.insert("q1".to_string(), "title and body".to_string());
    context
        .submit_answers("t-paused", required, true)
        .await
        .unwrap();

    let row = context.store.get_task("t-paused").await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Queued);
    assert!(missing_required_answers(&row.pending_questions, &row.provided_answers).is_empty());
    let events = context
        .store
        .list_events("t-paused", 100, ListOrder::Asc)
        .await
        .unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    assert!(kinds.contains(&"clarification_received"));
    assert!(kinds.contains(&"task_resumed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn governor_drives_submitted_tasks_to_terminal_states() {
    let workspace = tempfile::tempdir().unwrap();
    let context = test_context(workspace.path());
    let engine = Arc::new(EngineRunner::new(context.clone()));
    context.governor.start(engine);

    let mut task_ids = Vec::new();
    for index in 0..3 {
        let task_id = context
            .submit_task(
                &format!("Create a REST API variant {index}"),
                None,
                None,
                None,
            )
            .await
            .unwrap();
        task_ids.push(task_id);
    }

    for _ in 0..1200 {
        let mut done = 0;
        for task_id in &task_ids {
            let row = context.store.get_task(task_id).await.unwrap().unwrap();
            if row.status.is_terminal() {
                done += 1;
            }
        }
        if done == task_ids.len() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    let expected = if review_tools_available() {
        TaskStatus::Completed
    } else {
        TaskStatus::Failed
    };
    for task_id in &task_ids {
        let row = context.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(row.status, expected, "task {task_id}");
    }
    context.governor.stop();
}
