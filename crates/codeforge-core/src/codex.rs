//! The codex: role rules and workflow parameters for the pipeline.

use crate::error::{CodeforgeError, CodeforgeResult};
use crate::task::Stage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Workflow parameters: stage order and iteration policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Stage order for full-pipeline tasks.
    pub stages: Vec<Stage>,
    /// Implementation-loop ceiling for full-pipeline tasks.
    pub max_iterations: u64,
    /// Whether each iteration runs the reviewer.
    pub review_required: bool,
}

impl Default for Workflow {
    fn default() -> Self {
        Self {
            stages: vec![
                Stage::Research,
                Stage::Design,
                Stage::Implementation,
                Stage::Review,
            ],
            max_iterations: 15,
            review_required: true,
        }
    }
}

/// Rules for the researcher role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearcherRules {
    /// Maximum clarification questions per task.
    pub max_questions: u32,
}

impl Default for ResearcherRules {
    fn default() -> Self {
        Self { max_questions: 3 }
    }
}

/// Rules for the coder role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoderRules {
    /// Whether generated code must come with tests.
    pub testing_required: bool,
    /// Files the coder may write in one iteration.
    pub max_files_per_iteration: usize,
    /// Prompt constraints appended to every coder call.
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl Default for CoderRules {
    fn default() -> Self {
        Self {
            testing_required: true,
            max_files_per_iteration: 5,
            constraints: Vec::new(),
        }
    }
}

/// Rules for the reviewer role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerRules {
    /// Checklist echoed into review reports.
    #[serde(default = "default_checklist")]
    pub checklist: Vec<String>,
}

fn default_checklist() -> Vec<String> {
    vec![
        "Style conventions followed?".to_string(),
        "Tests present?".to_string(),
        "Matches the architecture?".to_string(),
        "No codex violations?".to_string(),
    ]
}

impl Default for ReviewerRules {
    fn default() -> Self {
        Self {
            checklist: default_checklist(),
        }
    }
}

/// Per-role rule blocks.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CodexRules {
    /// Researcher rules.
    #[serde(default)]
    pub researcher: ResearcherRules,
    /// Coder rules.
    #[serde(default)]
    pub coder: CoderRules,
    /// Reviewer rules.
    #[serde(default)]
    pub reviewer: ReviewerRules,
}

/// The configuration document of role rules and workflow parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Codex {
    /// Codex version string.
    pub version: String,
    /// Workflow parameters.
    #[serde(default)]
    pub workflow: Workflow,
    /// Role rules.
    #[serde(default)]
    pub rules: CodexRules,
}

impl Default for Codex {
    fn default() -> Self {
        Self {
            version: "1.0.0-default".to_string(),
            workflow: Workflow::default(),
            rules: CodexRules::default(),
        }
    }
}

impl Codex {
    /// Load a codex from a TOML file, falling back to the default document
    /// when the path is absent.
    pub fn load(path: Option<&Path>) -> CodeforgeResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| CodeforgeError::Config(format!("codex parse: {e}")))
    }

    /// Hex-encoded SHA-256 over the canonical JSON form of the document.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_codex_has_full_pipeline() {
        let codex = Codex::default();
        assert_eq!(codex.workflow.stages.len(), 4);
        assert_eq!(codex.workflow.max_iterations, 15);
        assert!(codex.workflow.review_required);
        assert_eq!(codex.rules.coder.max_files_per_iteration, 5);
    }

    #[test]
    fn content_hash_is_stable() {
        let a = Codex::default();
        let b = Codex::default();
        assert_eq!(a.content_hash(), b.content_hash());
        let mut c = Codex::default();
        c.workflow.max_iterations = 3;
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn parses_partial_toml() {
        let codex: Codex = toml::from_str(
            r#"
            version = "2.0.0"

            [workflow]
            stages = ["implementation", "review"]
            max_iterations = 5
            review_required = false
            "#,
        )
        .unwrap();
        assert_eq!(codex.version, "2.0.0");
        assert_eq!(codex.workflow.stages, vec![Stage::Implementation, Stage::Review]);
        assert_eq!(codex.rules.researcher.max_questions, 3);
    }
}
