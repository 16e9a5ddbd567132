//! Reproducibility manifest for a finished task.

use chrono::Utc;
use codeforge_core::{Container, FileContent, ReviewSummary};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::process::Command;

/// The `repro_manifest` artifact payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReproManifest {
    /// Task the manifest belongs to.
    pub task_id: String,
    /// Manifest generation time, ISO-8601.
    pub generated_at: String,
    /// Task creation time, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Task completion time, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    /// `python3 --version` on the host, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
    /// `ruff --version`, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruff_version: Option<String>,
    /// `pytest --version`, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pytest_version: Option<String>,
    /// SHA-256 of the generated `requirements.txt`, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements_sha256: Option<String>,
    /// Codex hash in effect for the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codex_hash: Option<String>,
    /// Template the container was seeded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Template content hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_hash: Option<String>,
    /// Final review outcome.
    pub review_summary: ReviewSummary,
}

/// Build the manifest from the finished container and review summary.
pub fn build_repro_manifest(
    task_id: &str,
    container: &Container,
    created_at: Option<String>,
    completed_at: Option<String>,
    review_summary: ReviewSummary,
) -> ReproManifest {
    let requirements_sha256 = container
        .files
        .get("requirements.txt")
        .map(sha256_of_content);
    ReproManifest {
        task_id: task_id.to_string(),
        generated_at: Utc::now().to_rfc3339(),
        created_at,
        completed_at,
        python_version: tool_version("python3", &["--version"]),
        ruff_version: tool_version("ruff", &["--version"]),
        pytest_version: tool_version("pytest", &["--version"]),
        requirements_sha256,
        codex_hash: container.metadata.codex_hash.clone(),
        template_id: container.metadata.template_id.clone(),
        template_hash: container.metadata.template_hash.clone(),
        review_summary,
    }
}

fn sha256_of_content(content: &FileContent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn tool_version(executable: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(executable).args(args).output().ok()?;
    let text = if output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    } else {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    };
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_captures_container_identity() {
        let mut container = Container::new(None);
        container.metadata.codex_hash = Some("abc123".into());
        container.metadata.template_id = Some("python_cli".into());
        container
            .add_file("requirements.txt", "fastapi\n")
            .unwrap();

        let manifest = build_repro_manifest(
            "task-1",
            &container,
            Some("2026-01-01T00:00:00Z".into()),
            None,
            ReviewSummary {
                passed: true,
                status: "approved".into(),
                issues_count: 0,
                run_id: None,
            },
        );
        assert_eq!(manifest.task_id, "task-1");
        assert_eq!(manifest.codex_hash.as_deref(), Some("abc123"));
        assert_eq!(manifest.template_id.as_deref(), Some("python_cli"));
        assert!(manifest.requirements_sha256.is_some());
        assert!(manifest.review_summary.passed);
    }

    #[test]
    fn missing_tools_are_none_not_errors() {
        assert!(tool_version("definitely-not-a-real-tool-xyz", &["--version"]).is_none());
    }
}
