//! Task classification: mode, stages, and the output contract.

use codeforge_core::{Codex, Stage};
use codeforge_llm::{ChatMessage, GenerateOptions, LlmGateway};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::OnceLock;
use tracing::debug;

/// How much pipeline a task gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Single-file exact-JSON task; implementation only, no review.
    MicroFile,
    /// Few-file change; implementation + review.
    SmallCode,
    /// Full pipeline.
    Project,
}

/// Machine-checkable shape of an LLM response for a task mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputContract {
    /// The raw response must be a single JSON object and nothing else.
    #[serde(default)]
    pub exact_json_only: bool,
    /// Exact number of entries required under `files`.
    #[serde(default)]
    pub allowed_files_count: Option<usize>,
    /// Closed set of permitted file paths.
    #[serde(default)]
    pub allowed_paths: Option<Vec<String>>,
    /// No files beyond the allowed set.
    #[serde(default)]
    pub no_extra_files: bool,
    /// No prose or fences around the JSON payload.
    #[serde(default)]
    pub no_extra_text_outside_json: bool,
    /// Top-level keys the payload must contain.
    #[serde(default = "default_required_keys")]
    pub required_json_top_level_keys: Vec<String>,
}

fn default_required_keys() -> Vec<String> {
    vec!["files".to_string()]
}

impl Default for OutputContract {
    fn default() -> Self {
        Self {
            exact_json_only: false,
            allowed_files_count: None,
            allowed_paths: None,
            no_extra_files: false,
            no_extra_text_outside_json: false,
            required_json_top_level_keys: default_required_keys(),
        }
    }
}

/// The finalized plan for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    /// Classified mode.
    pub mode: TaskMode,
    /// Stages to run, in order.
    pub stages: Vec<Stage>,
    /// Implementation-loop ceiling.
    pub max_iterations: u64,
    /// Output contract for coder responses.
    pub contract: OutputContract,
    /// Whether each iteration runs the reviewer.
    pub use_review: bool,
    /// Classification provenance.
    #[serde(default)]
    pub notes: Value,
}

const STRICT_JSON_MARKERS: [&str; 3] =
    ["return exactly this json", "return exact json", "exact json"];

const PROJECT_MARKERS: [&str; 12] = [
    "fastapi", "website", "next.js", "docker", "crud", "db", "auth", "tests", "ci", "api",
    "rest", "landing",
];

fn json_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""path"\s*:\s*"([^"]+)""#).unwrap_or_else(|_| unreachable!()))
}

fn create_file_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)create a file\s+(\S+)").unwrap_or_else(|_| unreachable!())
    })
}

/// Build a plan for a task: heuristics first, an optional LLM classification
/// second, then the full-pipeline fallback.
pub async fn build_task_plan(
    task_text: &str,
    codex: &Codex,
    micro_max_iterations: u64,
    gateway: Option<&LlmGateway>,
) -> TaskPlan {
    if let Some((mode, contract, notes)) = heuristic_plan(task_text) {
        return finalize_plan(mode, contract, notes, codex, micro_max_iterations);
    }

    if let Some(gateway) = gateway {
        if let Some((mode, contract)) = classify_with_llm(gateway, task_text).await {
            return finalize_plan(
                mode,
                contract,
                json!({"source": "llm"}),
                codex,
                micro_max_iterations,
            );
        }
    }

    finalize_plan(
        TaskMode::Project,
        OutputContract::default(),
        json!({"source": "fallback"}),
        codex,
        micro_max_iterations,
    )
}

/// The full-pipeline plan the codex defaults to.
pub fn build_default_plan(codex: &Codex, micro_max_iterations: u64) -> TaskPlan {
    finalize_plan(
        TaskMode::Project,
        OutputContract::default(),
        json!({"source": "default"}),
        codex,
        micro_max_iterations,
    )
}

fn heuristic_plan(task_text: &str) -> Option<(TaskMode, OutputContract, Value)> {
    let lowered = task_text.to_lowercase();
    let strict_json = STRICT_JSON_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker));

    let mut paths: Vec<String> = json_path_regex()
        .captures_iter(task_text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect();
    for capture in create_file_regex().captures_iter(task_text) {
        if let Some(path) = capture.get(1) {
            let cleaned = path.as_str().trim_matches(['`', '"', '\'']).to_string();
            if !cleaned.is_empty() && !paths.contains(&cleaned) {
                paths.push(cleaned);
            }
        }
    }
    let allowed_paths = (!paths.is_empty()).then_some(paths);

    if strict_json || allowed_paths.is_some() {
        let contract = OutputContract {
            exact_json_only: true,
            allowed_files_count: Some(1),
            allowed_paths: allowed_paths.clone(),
            no_extra_files: true,
            no_extra_text_outside_json: true,
            required_json_top_level_keys: default_required_keys(),
        };
        let notes = json!({
            "source": "heuristic",
            "strict_json": strict_json,
            "allowed_paths": allowed_paths,
        });
        return Some((TaskMode::MicroFile, contract, notes));
    }

    if PROJECT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return Some((
            TaskMode::Project,
            OutputContract::default(),
            json!({"source": "heuristic"}),
        ));
    }

    None
}

async fn classify_with_llm(
    gateway: &LlmGateway,
    task_text: &str,
) -> Option<(TaskMode, OutputContract)> {
    let messages = [
        ChatMessage::system(
            "You classify tasks into modes. Return JSON only with keys: mode, needs_review, contract.",
        ),
        ChatMessage::user(format!(
            "Classify the task into one of: micro_file, small_code, project. \
             If the task demands exact JSON or a single file, choose micro_file. \
             Respond with JSON like: \
             {{\"mode\":\"micro_file\",\"needs_review\":false,\"contract\":{{\"exact_json_only\":true}}}}\n\
             Task: {task_text}"
        )),
    ];
    let response = gateway
        .generate_with_retry(
            &messages,
            GenerateOptions {
                require_json: true,
                max_tokens_override: Some(256),
            },
        )
        .await
        .ok()?;
    let payload: Value = serde_json::from_str(&response.text).ok()?;
    let mode: TaskMode = serde_json::from_value(payload.get("mode")?.clone()).ok()?;
    let contract = payload
        .get("contract")
        .cloned()
        .and_then(|c| serde_json::from_value(c).ok())
        .unwrap_or_default();
    debug!(?mode, "task classified by llm");
    Some((mode, contract))
}

fn finalize_plan(
    mode: TaskMode,
    contract: OutputContract,
    notes: Value,
    codex: &Codex,
    micro_max_iterations: u64,
) -> TaskPlan {
    let workflow = &codex.workflow;
    let (mut stages, max_iterations, use_review) = match mode {
        TaskMode::MicroFile => (vec![Stage::Implementation], micro_max_iterations, false),
        TaskMode::SmallCode => {
            let allowed = [
                Stage::Implementation,
                Stage::Review,
                Stage::Design,
                Stage::Planning,
            ];
            let mut stages: Vec<Stage> = workflow
                .stages
                .iter()
                .copied()
                .filter(|stage| allowed.contains(stage))
                .collect();
            if stages.is_empty() {
                stages = vec![Stage::Implementation, Stage::Review];
            }
            (stages, workflow.max_iterations, workflow.review_required)
        }
        TaskMode::Project => (
            workflow.stages.clone(),
            workflow.max_iterations,
            workflow.review_required,
        ),
    };

    ensure_research_before_design(&mut stages);
    ensure_planning_after_design(&mut stages);

    TaskPlan {
        mode,
        stages,
        max_iterations,
        contract,
        use_review,
        notes,
    }
}

fn ensure_research_before_design(stages: &mut Vec<Stage>) {
    if !stages.contains(&Stage::Design) || stages.contains(&Stage::Research) {
        return;
    }
    if let Some(index) = stages.iter().position(|s| *s == Stage::Design) {
        stages.insert(index, Stage::Research);
    }
}

fn ensure_planning_after_design(stages: &mut Vec<Stage>) {
    let (Some(design_index), Some(planning_index)) = (
        stages.iter().position(|s| *s == Stage::Design),
        stages.iter().position(|s| *s == Stage::Planning),
    ) else {
        return;
    };
    if planning_index > design_index {
        return;
    }
    stages.retain(|s| *s != Stage::Planning);
    if let Some(index) = stages.iter().position(|s| *s == Stage::Design) {
        stages.insert(index + 1, Stage::Planning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exact_json_description_is_micro_file() {
        let description =
            r#"Return EXACTLY this JSON: {"files":[{"path":"hello.txt","content":"hi"}]}"#;
        let plan = build_task_plan(description, &Codex::default(), 3, None).await;
        assert_eq!(plan.mode, TaskMode::MicroFile);
        assert_eq!(plan.stages, vec![Stage::Implementation]);
        assert_eq!(plan.max_iterations, 3);
        assert!(!plan.use_review);
        assert!(plan.contract.exact_json_only);
        assert_eq!(plan.contract.allowed_files_count, Some(1));
        assert_eq!(
            plan.contract.allowed_paths,
            Some(vec!["hello.txt".to_string()])
        );
    }

    #[tokio::test]
    async fn create_file_description_is_micro_file() {
        let plan =
            build_task_plan("Please create a file `notes.md` with a greeting", &Codex::default(), 3, None)
                .await;
        assert_eq!(plan.mode, TaskMode::MicroFile);
        assert_eq!(
            plan.contract.allowed_paths,
            Some(vec!["notes.md".to_string()])
        );
    }

    #[tokio::test]
    async fn project_markers_select_full_pipeline() {
        let plan = build_task_plan(
            "Create a REST API for managing todo items with CRUD operations",
            &Codex::default(),
            3,
            None,
        )
        .await;
        assert_eq!(plan.mode, TaskMode::Project);
        assert_eq!(
            plan.stages,
            vec![
                Stage::Research,
                Stage::Design,
                Stage::Implementation,
                Stage::Review
            ]
        );
        assert_eq!(plan.max_iterations, 15);
        assert!(plan.use_review);
    }

    #[tokio::test]
    async fn unmarked_description_falls_back_to_project() {
        let plan = build_task_plan("Make something nice", &Codex::default(), 3, None).await;
        assert_eq!(plan.mode, TaskMode::Project);
        assert_eq!(plan.notes["source"], "fallback");
    }

    #[test]
    fn research_is_inserted_before_design() {
        let mut stages = vec![Stage::Design, Stage::Implementation];
        ensure_research_before_design(&mut stages);
        assert_eq!(
            stages,
            vec![Stage::Research, Stage::Design, Stage::Implementation]
        );
    }

    #[test]
    fn planning_is_moved_after_design() {
        let mut stages = vec![Stage::Planning, Stage::Design, Stage::Implementation];
        ensure_planning_after_design(&mut stages);
        assert_eq!(
            stages,
            vec![Stage::Design, Stage::Planning, Stage::Implementation]
        );
    }
}
