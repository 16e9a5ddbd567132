//! Container snapshots: the structured projection persisted per task.

use chrono::{DateTime, Utc};
use codeforge_core::{ArchitectureDoc, Container, ContainerMetadata, HistoryEntry, ProjectState};
use serde::{Deserialize, Serialize};

/// One file's identity inside a snapshot; bodies live in the task-files
/// table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFileEntry {
    /// File path.
    pub path: String,
    /// Hex-encoded SHA-256 of the content.
    pub sha256: String,
    /// Content size in bytes.
    pub size: u64,
    /// Rough content type (`text/plain` or `application/octet-stream`).
    pub mime: String,
}

/// The persisted container projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    /// Container project id.
    pub project_id: String,
    /// Lifecycle state.
    pub state: ProjectState,
    /// Progress in `[0, 1]`.
    pub progress: f64,
    /// Full metadata bag.
    pub metadata: ContainerMetadata,
    /// Target architecture, when designed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_architecture: Option<ArchitectureDoc>,
    /// Current task line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    /// Full history log.
    pub history: Vec<HistoryEntry>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// File identities (bodies stored separately).
    pub files: Vec<SnapshotFileEntry>,
    /// Codex hash in effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codex_hash: Option<String>,
    /// Implementation iterations executed.
    pub iterations: u64,
}

/// Project a container into its snapshot form.
pub fn build_container_snapshot(container: &Container) -> ContainerSnapshot {
    let files = container
        .files
        .iter()
        .map(|(path, content)| SnapshotFileEntry {
            path: path.clone(),
            sha256: content.sha256_hex(),
            size: content.size_bytes(),
            mime: if content.is_binary() {
                "application/octet-stream".to_string()
            } else {
                "text/plain".to_string()
            },
        })
        .collect();
    ContainerSnapshot {
        project_id: container.project_id.clone(),
        state: container.state,
        progress: container.progress,
        metadata: container.metadata.clone(),
        target_architecture: container.target_architecture.clone(),
        current_task: container.current_task.clone(),
        history: container.history.clone(),
        created_at: container.created_at,
        updated_at: container.updated_at,
        files,
        codex_hash: container.metadata.codex_hash.clone(),
        iterations: container.metadata.iterations,
    }
}
