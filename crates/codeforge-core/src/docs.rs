//! Structured documents exchanged between roles.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One requirement extracted from the user task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementItem {
    /// Stable requirement id, e.g. `REQ-001`.
    pub id: String,
    /// Requirement text.
    pub description: String,
    /// Priority bucket (`high`/`medium`/`low`).
    #[serde(default)]
    pub priority: String,
    /// Category bucket (`functional`/`security`/...).
    #[serde(default)]
    pub category: String,
}

/// A question the pipeline needs the user to answer before continuing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    /// Stable question id, referenced by submitted answers.
    pub id: String,
    /// Question text.
    pub text: String,
    /// Question type (`free_text`/`choice`).
    #[serde(default = "default_question_type", rename = "type")]
    pub question_type: String,
    /// Offered choices, when `question_type` is `choice`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    /// Whether the task cannot resume without this answer.
    #[serde(default)]
    pub required: bool,
    /// Why the question is being asked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

fn default_question_type() -> String {
    "free_text".to_string()
}

/// Requirements document produced by the researcher.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequirementsDoc {
    /// The original user task.
    pub user_task: String,
    /// Analysis timestamp, ISO-8601.
    #[serde(default)]
    pub analyzed_at: String,
    /// Extracted requirements.
    #[serde(default)]
    pub requirements: Vec<RequirementItem>,
    /// User stories.
    #[serde(default)]
    pub user_stories: Vec<String>,
    /// Assumptions the analysis made.
    #[serde(default)]
    pub assumptions: Vec<String>,
    /// Open questions for the user.
    #[serde(default)]
    pub questions_to_user: Vec<ClarificationQuestion>,
    /// Technical constraints.
    #[serde(default)]
    pub technical_constraints: Vec<String>,
}

/// One component of the target architecture.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Component name.
    pub name: String,
    /// What the component is responsible for.
    #[serde(default)]
    pub responsibility: String,
    /// Implementation technology.
    #[serde(default)]
    pub technology: String,
    /// Files the component is expected to produce.
    #[serde(default)]
    pub files: Vec<String>,
    /// Names of components this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// HTTP endpoints the component exposes, when applicable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
}

/// Architecture document produced by the designer and consumed by the
/// coder, the reviewer, and the scheduler.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArchitectureDoc {
    /// Project name.
    pub name: String,
    /// One-line description.
    #[serde(default)]
    pub description: String,
    /// Creation timestamp, ISO-8601.
    #[serde(default)]
    pub created_at: String,
    /// Components with their expected files.
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
    /// Optional data-model sketch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_model: Option<Value>,
}

impl ArchitectureDoc {
    /// Every file any component expects, in component order.
    pub fn expected_files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.components.iter().flat_map(|component| {
            component
                .files
                .iter()
                .map(move |file| (component.name.as_str(), file.as_str()))
        })
    }
}

/// Per-call LLM usage attribution, emitted as a `usage_report` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    /// Pipeline stage the call belongs to.
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
    /// Request start, ISO-8601.
    pub started_at: String,
    /// Request end, ISO-8601.
    pub finished_at: String,
    /// Sub-task description, when attributable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

/// Compact review outcome threaded into the repro manifest and task views.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReviewSummary {
    /// Whether the review passed.
    #[serde(default)]
    pub passed: bool,
    /// `approved` / `approved_with_warnings` / `rejected`.
    #[serde(default)]
    pub status: String,
    /// Number of blocking issues.
    #[serde(default)]
    pub issues_count: usize,
    /// Run id of the review pass, when one was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_files_walks_components() {
        let doc = ArchitectureDoc {
            name: "svc".into(),
            components: vec![
                ComponentSpec {
                    name: "api".into(),
                    files: vec!["main.py".into(), "api/routes.py".into()],
                    ..ComponentSpec::default()
                },
                ComponentSpec {
                    name: "tests".into(),
                    files: vec!["tests/test_api.py".into()],
                    ..ComponentSpec::default()
                },
            ],
            ..ArchitectureDoc::default()
        };
        let files: Vec<_> = doc.expected_files().collect();
        assert_eq!(
            files,
            vec![
                ("api", "main.py"),
                ("api", "api/routes.py"),
                ("tests", "tests/test_api.py"),
            ]
        );
    }

    #[test]
    fn clarification_question_defaults() {
        let q: ClarificationQuestion =
            serde_json::from_str(r#"{"id":"q1","text":"Which fields?"}"#).unwrap();
        assert_eq!(q.question_type, "free_text");
        assert!(!q.required);
        assert!(q.choices.is_empty());
    }
}
