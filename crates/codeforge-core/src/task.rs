//! Task rows: the persistence-facing projection of a task's lifecycle.

use crate::docs::ClarificationQuestion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle status of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the governor's queue.
    Queued,
    /// A runner is executing the task.
    Processing,
    /// Paused awaiting user answers or a manual decision.
    NeedsInput,
    /// Finished with an approving review.
    Completed,
    /// Finished with a terminal, reported failure.
    Failed,
    /// Finished with an unexpected error.
    Error,
}

impl TaskStatus {
    /// Wire string for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::NeedsInput => "needs_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }

    /// Whether the task can never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Error)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pipeline stage name, also used as a resume target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Requirements analysis.
    Research,
    /// Architecture design.
    Design,
    /// Sub-task shaping.
    Planning,
    /// Iterative coding loop.
    Implementation,
    /// Final quality gate.
    Review,
}

impl Stage {
    /// Wire string for the stage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Design => "design",
            Self::Planning => "planning",
            Self::Implementation => "implementation",
            Self::Review => "review",
        }
    }

    /// Parse a stage name; unknown names yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "research" => Some(Self::Research),
            "design" => Some(Self::Design),
            "planning" => Some(Self::Planning),
            "implementation" => Some(Self::Implementation),
            "review" => Some(Self::Review),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    /// Task identifier.
    pub id: String,
    /// SHA-256 of the owning API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_key_hash: Option<String>,
    /// Owner user id, for user-authenticated tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    /// The natural-language task description.
    pub description: String,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Progress in `[0, 1]`.
    pub progress: f64,
    /// Stage currently executing or last executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    /// Template the task was seeded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Container project id, once a container exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Clarification questions the task is waiting on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_questions: Vec<ClarificationQuestion>,
    /// Answers submitted so far, by question id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provided_answers: BTreeMap<String, String>,
    /// Stage to re-enter when the task resumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from_stage: Option<Stage>,
    /// Reason for a terminal failure, verbatim for the task view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
    /// Terminal completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Final orchestrator result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl TaskRow {
    /// Create a queued row for a new task.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_key_hash: None,
            owner_user_id: None,
            description: description.into(),
            status: TaskStatus::Queued,
            progress: 0.0,
            current_stage: None,
            template_id: None,
            project_id: None,
            pending_questions: Vec::new(),
            provided_answers: BTreeMap::new(),
            resume_from_stage: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
        }
    }

    /// Wall-clock seconds from creation to completion (or to now while the
    /// task is still running).
    pub fn time_taken_seconds(&self) -> f64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.created_at).num_milliseconds() as f64 / 1000.0
    }
}

/// A partial update applied to a task row. `None` fields are untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    /// New status.
    pub status: Option<TaskStatus>,
    /// New progress.
    pub progress: Option<f64>,
    /// New current stage.
    pub current_stage: Option<String>,
    /// New project id.
    pub project_id: Option<String>,
    /// Replacement pending questions.
    pub pending_questions: Option<Vec<ClarificationQuestion>>,
    /// Replacement provided answers.
    pub provided_answers: Option<BTreeMap<String, String>>,
    /// New resume stage (`Some(None)` clears it).
    pub resume_from_stage: Option<Option<Stage>>,
    /// New failure reason.
    pub failure_reason: Option<String>,
    /// New completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// New result payload.
    pub result: Option<Value>,
}

impl TaskPatch {
    /// Apply the patch to a row, bumping `updated_at`.
    pub fn apply(self, row: &mut TaskRow) {
        if let Some(status) = self.status {
            row.status = status;
        }
        if let Some(progress) = self.progress {
            row.progress = progress;
        }
        if let Some(stage) = self.current_stage {
            row.current_stage = Some(stage);
        }
        if let Some(project_id) = self.project_id {
            row.project_id = Some(project_id);
        }
        if let Some(questions) = self.pending_questions {
            row.pending_questions = questions;
        }
        if let Some(answers) = self.provided_answers {
            row.provided_answers = answers;
        }
        if let Some(resume) = self.resume_from_stage {
            row.resume_from_stage = resume;
        }
        if let Some(reason) = self.failure_reason {
            row.failure_reason = Some(reason);
        }
        if let Some(completed_at) = self.completed_at {
            row.completed_at = Some(completed_at);
        }
        if let Some(result) = self.result {
            row.result = Some(result);
        }
        row.updated_at = Utc::now();
    }
}

/// Validate submitted answers against the pending questions.
///
/// Returns the ids of required questions that remain unanswered; an empty
/// result means the task may resume.
pub fn missing_required_answers(
    questions: &[ClarificationQuestion],
    answers: &BTreeMap<String, String>,
) -> Vec<String> {
    questions
        .iter()
        .filter(|q| q.required)
        .filter(|q| {
            answers
                .get(&q.id)
                .map(|a| a.trim().is_empty())
                .unwrap_or(true)
        })
        .map(|q| q.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(id: &str, required: bool) -> ClarificationQuestion {
        ClarificationQuestion {
            id: id.into(),
            text: format!("question {id}"),
            question_type: "free_text".into(),
            choices: Vec::new(),
            required,
            rationale: None,
        }
    }

    #[test]
    fn status_strings() {
        assert_eq!(TaskStatus::NeedsInput.as_str(), "needs_input");
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::NeedsInput.is_terminal());
    }

    #[test]
    fn patch_applies_selected_fields() {
        let mut row = TaskRow::new("t1", "do a thing");
        TaskPatch {
            status: Some(TaskStatus::Processing),
            progress: Some(0.5),
            current_stage: Some("implementation".into()),
            ..TaskPatch::default()
        }
        .apply(&mut row);
        assert_eq!(row.status, TaskStatus::Processing);
        assert_eq!(row.progress, 0.5);
        assert_eq!(row.current_stage.as_deref(), Some("implementation"));
        assert!(row.failure_reason.is_none());
    }

    #[test]
    fn required_answers_validation() {
        let questions = vec![question("q1", true), question("q2", false)];
        let mut answers = BTreeMap::new();
        answers.insert("q2".to_string(), "optional answer".to_string());
        assert_eq!(missing_required_answers(&questions, &answers), vec!["q1"]);

        answers.insert("q1".to_string(), "  ".to_string());
        assert_eq!(missing_required_answers(&questions, &answers), vec!["q1"]);

        answers.insert("q1".to_string(), "real answer".to_string());
        assert!(missing_required_answers(&questions, &answers).is_empty());
    }

    #[test]
    fn stage_parse_roundtrip() {
        for stage in [
            Stage::Research,
            Stage::Design,
            Stage::Planning,
            Stage::Implementation,
            Stage::Review,
        ] {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("deploy"), None);
    }
}
