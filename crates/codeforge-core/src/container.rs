//! The per-task container: files, typed artifacts, history, and metadata.
//!
//! The container is the single source of truth for one task. It is mutated
//! only by the currently active role, and every mutation is appended to its
//! history log.

use crate::artifact::{Artifact, ArtifactKind, FileContent, FileRecord};
use crate::docs::ArchitectureDoc;
use crate::error::CodeforgeResult;
use crate::paths::normalize_rel_path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Project lifecycle state driven by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectState {
    /// Requirements analysis.
    Research,
    /// Architecture design.
    Design,
    /// Iterative coding loop.
    Implementation,
    /// Final quality gate.
    Review,
    /// Finished with an approving review.
    Complete,
    /// Finished with a terminal failure.
    Error,
}

impl ProjectState {
    /// Wire string for the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Design => "design",
            Self::Implementation => "implementation",
            Self::Review => "review",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of each agent in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    /// Analyzes the task and produces requirements.
    Researcher,
    /// Produces the target architecture.
    Designer,
    /// Classifies tasks and shapes sub-tasks.
    Planner,
    /// Writes files for one sub-task at a time.
    Coder,
    /// Runs static and dynamic quality checks.
    Reviewer,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Researcher => "researcher",
            Self::Designer => "designer",
            Self::Planner => "planner",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
        };
        f.write_str(name)
    }
}

/// One entry of the append-only history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the mutation happened.
    pub timestamp: DateTime<Utc>,
    /// Action name (`file_added`, `artifact_added`, `state_changed`, ...).
    pub action: String,
    /// Action-specific details.
    pub details: Value,
    /// Project state at the time of the mutation.
    pub state: ProjectState,
    /// Progress at the time of the mutation.
    pub progress: f64,
}

/// One recorded LLM call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmUsageRecord {
    /// Pipeline stage that made the call.
    pub stage: String,
    /// Provider name.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Prompt tokens.
    pub tokens_in: u64,
    /// Completion tokens.
    pub tokens_out: u64,
    /// Total tokens.
    pub total_tokens: u64,
    /// Record timestamp.
    pub created_at: DateTime<Utc>,
    /// Call-specific metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Aggregated usage for one stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageUsage {
    /// Prompt tokens for the stage.
    pub tokens_in: u64,
    /// Completion tokens for the stage.
    pub tokens_out: u64,
    /// Total tokens for the stage.
    pub total_tokens: u64,
    /// Calls per model within the stage.
    pub models: BTreeMap<String, u64>,
}

/// Aggregated usage counters kept in sync with the per-call records.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LlmUsageSummary {
    /// Total prompt tokens across all calls.
    pub total_tokens_in: u64,
    /// Total completion tokens across all calls.
    pub total_tokens_out: u64,
    /// Per-stage breakdown.
    pub by_stage: BTreeMap<String, StageUsage>,
    /// Calls per model across all stages.
    pub models: BTreeMap<String, u64>,
}

impl LlmUsageSummary {
    /// Sum of prompt and completion tokens.
    pub fn total_tokens(&self) -> u64 {
        self.total_tokens_in + self.total_tokens_out
    }
}

/// Container metadata: budgets, attribution, template and baseline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    /// Container format version.
    pub version: String,
    /// Implementation-loop iteration counter.
    pub iterations: u64,
    /// Iteration ceiling for the implementation loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
    /// Role currently mutating the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_role: Option<String>,
    /// Models that served at least one call.
    #[serde(default)]
    pub ai_models_used: Vec<String>,
    /// Running token total, mirrors the usage summary.
    #[serde(default)]
    pub total_tokens: u64,
    /// Per-call usage records.
    #[serde(default)]
    pub llm_usage: Vec<LlmUsageRecord>,
    /// Aggregated usage counters.
    #[serde(default)]
    pub llm_usage_summary: LlmUsageSummary,
    /// Template the container was seeded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Content hash of the template tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_hash: Option<String>,
    /// Content hash of the codex in effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codex_hash: Option<String>,
    /// Hash of the owner's API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_key_hash: Option<String>,
    /// Owner user id, when the task came from an authenticated user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    /// On-disk workspace bound to this container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    /// File records captured at container creation; immutable afterwards.
    #[serde(default)]
    pub baseline_files: BTreeMap<String, FileRecord>,
    /// Path restriction applied to coder output, when set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_paths: Vec<String>,
    /// Anything the engine does not model explicitly.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl Default for ContainerMetadata {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            iterations: 0,
            max_iterations: None,
            active_role: None,
            ai_models_used: Vec::new(),
            total_tokens: 0,
            llm_usage: Vec::new(),
            llm_usage_summary: LlmUsageSummary::default(),
            template_id: None,
            template_hash: None,
            codex_hash: None,
            owner_key_hash: None,
            owner_user_id: None,
            workspace_path: None,
            baseline_files: BTreeMap::new(),
            allowed_paths: Vec::new(),
            extra: BTreeMap::new(),
        }
    }
}

/// Receiver for file mutations, implemented by the on-disk workspace.
///
/// The container owns no reference back to the workspace; the orchestrator
/// wires the sink in at task start and mediates the reverse sync.
pub trait FileSink: Send + Sync {
    /// Mirror one file mutation. `None` content means the file was removed.
    fn apply(&self, path: &str, content: Option<&FileContent>);
}

/// Arguments for [`Container::record_llm_usage`].
#[derive(Debug, Clone)]
pub struct LlmUsageUpdate {
    /// Pipeline stage that made the call.
    pub stage: String,
    /// Provider name.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Prompt tokens.
    pub tokens_in: u64,
    /// Completion tokens.
    pub tokens_out: u64,
    /// Call-specific metadata.
    pub metadata: Option<Value>,
}

/// The per-task aggregate and single source of truth.
#[derive(Clone, Serialize, Deserialize)]
pub struct Container {
    /// Stable opaque project identifier.
    pub project_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Project files by normalized relative path.
    pub files: BTreeMap<String, FileContent>,
    /// Typed artifact buckets, append-only.
    pub artifacts: BTreeMap<ArtifactKind, Vec<Artifact>>,
    /// Append-only mutation log.
    pub history: Vec<HistoryEntry>,
    /// Current lifecycle state.
    pub state: ProjectState,
    /// Architecture the coder works towards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_architecture: Option<ArchitectureDoc>,
    /// Description of the in-flight iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    /// Overall progress in `[0, 1]`.
    pub progress: f64,
    /// Stringified terminal errors.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Metadata bag.
    pub metadata: ContainerMetadata,
    #[serde(skip)]
    file_sink: Option<Arc<dyn FileSink>>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("project_id", &self.project_id)
            .field("state", &self.state)
            .field("progress", &self.progress)
            .field("files", &self.files.len())
            .field("artifacts", &self.artifacts.values().map(Vec::len).sum::<usize>())
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Container {
    fn eq(&self, other: &Self) -> bool {
        self.project_id == other.project_id
            && self.created_at == other.created_at
            && self.updated_at == other.updated_at
            && self.files == other.files
            && self.artifacts == other.artifacts
            && self.history == other.history
            && self.state == other.state
            && self.target_architecture == other.target_architecture
            && self.current_task == other.current_task
            && self.progress == other.progress
            && self.errors == other.errors
            && self.metadata == other.metadata
    }
}

impl Container {
    /// Create a fresh container and log its creation.
    pub fn new(project_id: Option<String>) -> Self {
        let now = Utc::now();
        let project_id = project_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut container = Self {
            project_id: project_id.clone(),
            created_at: now,
            updated_at: now,
            files: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            history: Vec::new(),
            state: ProjectState::Research,
            target_architecture: None,
            current_task: None,
            progress: 0.0,
            errors: Vec::new(),
            metadata: ContainerMetadata::default(),
            file_sink: None,
        };
        container.push_history("container_created", json!({ "project_id": project_id }));
        container
    }

    /// Attach the file sink that mirrors mutations to disk.
    pub fn set_file_sink(&mut self, sink: Option<Arc<dyn FileSink>>) {
        self.file_sink = sink;
    }

    /// Run `f` with the sink detached, so bulk reverse-syncs do not echo
    /// back into the workspace.
    pub fn with_sink_suppressed<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let sink = self.file_sink.take();
        let result = f(self);
        self.file_sink = sink;
        result
    }

    /// Add or replace a file. The path is validated and normalized.
    pub fn add_file(
        &mut self,
        path: &str,
        content: impl Into<FileContent>,
    ) -> CodeforgeResult<()> {
        let path = normalize_rel_path(path)?;
        let content = content.into();
        let size = content.size_bytes();
        self.files.insert(path.clone(), content);
        self.updated_at = Utc::now();
        self.push_history("file_added", json!({ "filepath": path, "size": size }));
        if let Some(sink) = &self.file_sink {
            sink.apply(&path, self.files.get(&path));
        }
        Ok(())
    }

    /// Remove a file. Removing an absent path is a no-op.
    pub fn remove_file(&mut self, path: &str) -> CodeforgeResult<()> {
        let path = normalize_rel_path(path)?;
        if self.files.remove(&path).is_none() {
            return Ok(());
        }
        self.updated_at = Utc::now();
        self.push_history("file_removed", json!({ "filepath": path }));
        if let Some(sink) = &self.file_sink {
            sink.apply(&path, None);
        }
        Ok(())
    }

    /// Append an artifact; unknown kinds get their bucket created lazily.
    pub fn add_artifact(
        &mut self,
        kind: ArtifactKind,
        content: Value,
        created_by: impl Into<String>,
    ) -> Uuid {
        let artifact = Artifact::new(kind.clone(), content, created_by);
        let id = artifact.id;
        let created_by = artifact.created_by.clone();
        self.artifacts.entry(kind.clone()).or_default().push(artifact);
        self.updated_at = Utc::now();
        self.push_history(
            "artifact_added",
            json!({ "artifact_id": id, "type": kind.as_str(), "created_by": created_by }),
        );
        id
    }

    /// The most recent artifact of a kind, if any.
    pub fn latest_artifact(&self, kind: &ArtifactKind) -> Option<&Artifact> {
        self.artifacts.get(kind).and_then(|bucket| bucket.last())
    }

    /// Role-scoped view of the container used to keep prompts compact.
    pub fn relevant_context(&self, role: RoleKind) -> Value {
        let mut context = json!({
            "project_id": self.project_id,
            "state": self.state.as_str(),
            "progress": self.progress,
            "active_task": self.current_task,
        });
        let extra = match role {
            RoleKind::Researcher => json!({
                "requirements": self.artifact_contents(&ArtifactKind::Requirements),
            }),
            RoleKind::Designer => json!({
                "requirements": self.artifact_contents(&ArtifactKind::Requirements),
                "existing_architecture": self.target_architecture,
            }),
            RoleKind::Planner | RoleKind::Coder => json!({
                "architecture": self.target_architecture,
                "files": self.files.keys().collect::<Vec<_>>(),
                "recent_changes": self.recent_history(5),
            }),
            RoleKind::Reviewer => json!({
                "files": self
                    .files
                    .iter()
                    .map(|(path, content)| {
                        (path.clone(), json!(content.as_text().unwrap_or("<binary>")))
                    })
                    .collect::<serde_json::Map<_, _>>(),
                "architecture": self.target_architecture,
                "requirements": self.artifact_contents(&ArtifactKind::Requirements),
            }),
        };
        if let (Value::Object(base), Value::Object(additions)) = (&mut context, extra) {
            base.extend(additions);
        }
        context
    }

    fn artifact_contents(&self, kind: &ArtifactKind) -> Vec<Value> {
        self.artifacts
            .get(kind)
            .map(|bucket| bucket.iter().map(|a| a.content.clone()).collect())
            .unwrap_or_default()
    }

    fn recent_history(&self, n: usize) -> Vec<&HistoryEntry> {
        let start = self.history.len().saturating_sub(n);
        self.history[start..].iter().collect()
    }

    /// Paths the target architecture expects but the container lacks.
    pub fn architecture_gaps(&self) -> Vec<String> {
        let Some(architecture) = &self.target_architecture else {
            return Vec::new();
        };
        architecture
            .expected_files()
            .filter(|(_, file)| !self.files.contains_key(*file))
            .map(|(component, file)| format!("missing file: {file} for component {component}"))
            .collect()
    }

    /// Whether the project is complete: terminal state, or no architecture
    /// gaps remain.
    pub fn is_complete(&self) -> bool {
        if self.state == ProjectState::Complete {
            return true;
        }
        self.target_architecture.is_some() && self.architecture_gaps().is_empty()
    }

    /// Transition the lifecycle state, optionally updating the task line.
    pub fn update_state(&mut self, new_state: ProjectState, task_description: Option<&str>) {
        let old_state = self.state;
        self.state = new_state;
        if let Some(description) = task_description {
            self.current_task = Some(description.to_string());
        }
        self.updated_at = Utc::now();
        self.push_history(
            "state_changed",
            json!({
                "from": old_state.as_str(),
                "to": new_state.as_str(),
                "task": task_description,
            }),
        );
    }

    /// Set progress, clamped to `[0, 1]`.
    pub fn update_progress(&mut self, progress: f64) {
        self.progress = progress.clamp(0.0, 1.0);
        self.updated_at = Utc::now();
        self.push_history("progress_updated", json!({ "progress": self.progress }));
    }

    /// Record one LLM call and update the summary counters atomically with
    /// the per-call record.
    pub fn record_llm_usage(&mut self, update: LlmUsageUpdate) {
        let total = update.tokens_in + update.tokens_out;
        self.metadata.llm_usage.push(LlmUsageRecord {
            stage: update.stage.clone(),
            provider: update.provider,
            model: update.model.clone(),
            tokens_in: update.tokens_in,
            tokens_out: update.tokens_out,
            total_tokens: total,
            created_at: Utc::now(),
            metadata: update.metadata,
        });

        let summary = &mut self.metadata.llm_usage_summary;
        summary.total_tokens_in += update.tokens_in;
        summary.total_tokens_out += update.tokens_out;
        let stage = summary.by_stage.entry(update.stage).or_default();
        stage.tokens_in += update.tokens_in;
        stage.tokens_out += update.tokens_out;
        stage.total_tokens += total;
        *stage.models.entry(update.model.clone()).or_insert(0) += 1;
        *summary.models.entry(update.model.clone()).or_insert(0) += 1;

        self.metadata.total_tokens = summary.total_tokens();
        if !self.metadata.ai_models_used.contains(&update.model) {
            self.metadata.ai_models_used.push(update.model);
        }
        self.updated_at = Utc::now();
    }

    /// Number of LLM calls recorded so far.
    pub fn llm_call_count(&self) -> u64 {
        self.metadata.llm_usage.len() as u64
    }

    /// Capture the baseline file records. Only effective once: the baseline
    /// is immutable after container creation.
    pub fn capture_baseline(&mut self) {
        if self.metadata.baseline_files.is_empty() {
            self.metadata.baseline_files = FileRecord::capture_all(&self.files);
        }
    }

    fn push_history(&mut self, action: &str, details: Value) {
        self.history.push(HistoryEntry {
            timestamp: Utc::now(),
            action: action.to_string(),
            details,
            state: self.state,
            progress: self.progress,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn add_file_records_history() {
        let mut container = Container::new(None);
        container.add_file("main.py", "print('hi')").unwrap();
        assert_eq!(container.files.len(), 1);
        let last = container.history.last().unwrap();
        assert_eq!(last.action, "file_added");
        assert_eq!(last.details["filepath"], "main.py");
    }

    #[test]
    fn add_file_rejects_traversal() {
        let mut container = Container::new(None);
        assert!(container.add_file("../evil.py", "x").is_err());
        assert!(container.add_file("/abs.py", "x").is_err());
        assert!(container.files.is_empty());
    }

    #[test]
    fn remove_absent_file_is_noop() {
        let mut container = Container::new(None);
        let history_len = container.history.len();
        container.remove_file("ghost.py").unwrap();
        assert_eq!(container.history.len(), history_len);
    }

    #[test]
    fn artifact_bucket_created_lazily() {
        let mut container = Container::new(None);
        let kind = ArtifactKind::Other("novel_kind".into());
        let id = container.add_artifact(kind.clone(), json!({"x": 1}), "tester");
        assert_eq!(container.artifacts[&kind].len(), 1);
        assert_eq!(container.artifacts[&kind][0].id, id);
        assert_eq!(container.history.last().unwrap().action, "artifact_added");
    }

    #[test]
    fn usage_summary_tracks_per_call_records() {
        let mut container = Container::new(None);
        for (stage, tokens_in, tokens_out) in
            [("implementation", 100, 40), ("implementation", 60, 20), ("review", 10, 5)]
        {
            container.record_llm_usage(LlmUsageUpdate {
                stage: stage.into(),
                provider: "mock".into(),
                model: "gpt-4o-mini".into(),
                tokens_in,
                tokens_out,
                metadata: None,
            });
        }
        let summary = &container.metadata.llm_usage_summary;
        assert_eq!(summary.total_tokens_in, 170);
        assert_eq!(summary.total_tokens_out, 65);
        let per_call: u64 = container
            .metadata
            .llm_usage
            .iter()
            .map(|r| r.total_tokens)
            .sum();
        assert_eq!(summary.total_tokens(), per_call);
        assert_eq!(summary.by_stage["implementation"].total_tokens, 220);
        assert_eq!(summary.models["gpt-4o-mini"], 3);
        assert_eq!(container.metadata.ai_models_used, vec!["gpt-4o-mini"]);
    }

    #[test]
    fn progress_is_clamped() {
        let mut container = Container::new(None);
        container.update_progress(1.7);
        assert_eq!(container.progress, 1.0);
        container.update_progress(-0.2);
        assert_eq!(container.progress, 0.0);
    }

    #[test]
    fn baseline_captured_once() {
        let mut container = Container::new(None);
        container.add_file("a.txt", "one").unwrap();
        container.capture_baseline();
        container.add_file("b.txt", "two").unwrap();
        container.capture_baseline();
        assert_eq!(container.metadata.baseline_files.len(), 1);
        assert!(container.metadata.baseline_files.contains_key("a.txt"));
    }

    #[test]
    fn completeness_follows_architecture_gaps() {
        let mut container = Container::new(None);
        assert!(!container.is_complete());
        container.target_architecture = Some(ArchitectureDoc {
            name: "app".into(),
            components: vec![crate::docs::ComponentSpec {
                name: "api".into(),
                files: vec!["main.py".into()],
                ..Default::default()
            }],
            ..Default::default()
        });
        assert_eq!(container.architecture_gaps().len(), 1);
        assert!(!container.is_complete());
        container.add_file("main.py", "app = 1").unwrap();
        assert!(container.is_complete());
    }

    struct RecordingSink(Mutex<Vec<(String, bool)>>);

    impl FileSink for RecordingSink {
        fn apply(&self, path: &str, content: Option<&FileContent>) {
            self.0
                .lock()
                .unwrap()
                .push((path.to_string(), content.is_some()));
        }
    }

    #[test]
    fn sink_sees_adds_and_removes_but_not_suppressed_writes() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let mut container = Container::new(None);
        container.set_file_sink(Some(sink.clone()));
        container.add_file("x.py", "1").unwrap();
        container.remove_file("x.py").unwrap();
        container.with_sink_suppressed(|c| c.add_file("y.py", "2").unwrap());
        let seen = sink.0.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![("x.py".to_string(), true), ("x.py".to_string(), false)]
        );
    }

    #[test]
    fn serde_roundtrip_preserves_everything() {
        let mut container = Container::new(Some("proj-1".into()));
        container.add_file("main.py", "print(1)").unwrap();
        container
            .add_file("logo.bin", FileContent::Binary(vec![1, 2, 3]))
            .unwrap();
        container.add_artifact(ArtifactKind::Requirements, json!({"k": "v"}), "researcher");
        container.update_state(ProjectState::Implementation, Some("build it"));
        container.update_progress(0.4);
        container.record_llm_usage(LlmUsageUpdate {
            stage: "implementation".into(),
            provider: "mock".into(),
            model: "m".into(),
            tokens_in: 3,
            tokens_out: 4,
            metadata: Some(json!({"task_type": "implement_component"})),
        });
        container.capture_baseline();

        let value = serde_json::to_value(&container).unwrap();
        let restored: Container = serde_json::from_value(value).unwrap();
        assert_eq!(restored, container);
    }
}
