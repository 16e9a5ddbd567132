//! Persistence for tasks, events, artifacts, container snapshots, files,
//! usage counters, and rate-limit windows.
//!
//! One [`TaskStore`] trait, two implementations: [`MemoryStore`] for
//! ephemeral runs and [`SqliteStore`] for durable mode. The engine never
//! branches on which one it holds.

pub mod memory;
pub mod resume;
pub mod snapshot;
pub mod sqlite;

pub use memory::MemoryStore;
pub use resume::load_container;
pub use snapshot::{build_container_snapshot, ContainerSnapshot, SnapshotFileEntry};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codeforge_core::{
    ArtifactKind, CodeforgeResult, FileContent, TaskEvent, TaskPatch, TaskRow,
};
use serde_json::Value;
use uuid::Uuid;

/// Sort order for event and artifact listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListOrder {
    /// Oldest first.
    Asc,
    /// Newest first (the API default).
    #[default]
    Desc,
}

/// One persisted artifact row.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ArtifactRow {
    /// Artifact id.
    pub id: Uuid,
    /// Task the artifact belongs to.
    pub task_id: String,
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Role or subsystem that produced it.
    pub produced_by: String,
    /// Structured payload.
    pub payload: Value,
    /// Append timestamp.
    pub created_at: DateTime<Utc>,
}

/// Daily usage counters for one owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DailyUsage {
    /// Prompt tokens consumed today.
    pub tokens_in: u64,
    /// Completion tokens consumed today.
    pub tokens_out: u64,
    /// Sandboxed command runs today.
    pub command_runs: u64,
}

/// Size and count caps applied to persisted task files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileCaps {
    /// Total bytes per task.
    pub max_task_bytes: u64,
    /// File count per task.
    pub max_task_files: u64,
}

impl Default for FileCaps {
    fn default() -> Self {
        Self {
            max_task_bytes: 50 * 1024 * 1024,
            max_task_files: 2000,
        }
    }
}

/// The persistence interface the engine and governor read.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task row.
    async fn create_task(&self, row: TaskRow) -> CodeforgeResult<()>;

    /// Fetch one task row.
    async fn get_task(&self, task_id: &str) -> CodeforgeResult<Option<TaskRow>>;

    /// Apply a partial update and return the updated row.
    async fn update_task(&self, task_id: &str, patch: TaskPatch)
        -> CodeforgeResult<Option<TaskRow>>;

    /// Task rows owned by one owner, newest first.
    async fn list_tasks_for_owner(
        &self,
        owner_key_hash: &str,
        limit: usize,
    ) -> CodeforgeResult<Vec<TaskRow>>;

    /// All rows currently `queued`, oldest first.
    async fn list_queued_tasks(&self) -> CodeforgeResult<Vec<TaskRow>>;

    /// Crash recovery: flip every `processing` row back to `queued`.
    /// Returns the number of rows flipped.
    async fn reset_processing_to_queued(&self) -> CodeforgeResult<usize>;

    /// Append one event. Idempotent per `(task_id, event id)`.
    async fn append_event(&self, event: TaskEvent) -> CodeforgeResult<()>;

    /// Events for one task.
    async fn list_events(
        &self,
        task_id: &str,
        limit: usize,
        order: ListOrder,
    ) -> CodeforgeResult<Vec<TaskEvent>>;

    /// Append one artifact row.
    async fn add_artifact(&self, row: ArtifactRow) -> CodeforgeResult<()>;

    /// Artifacts for one task, optionally filtered by kind, deduplicated
    /// by artifact id.
    async fn list_artifacts(
        &self,
        task_id: &str,
        kind: Option<&ArtifactKind>,
        limit: usize,
        order: ListOrder,
    ) -> CodeforgeResult<Vec<ArtifactRow>>;

    /// Replace the container snapshot for a task.
    async fn save_container_snapshot(
        &self,
        task_id: &str,
        snapshot: &ContainerSnapshot,
    ) -> CodeforgeResult<()>;

    /// Fetch the container snapshot for a task.
    async fn load_container_snapshot(
        &self,
        task_id: &str,
    ) -> CodeforgeResult<Option<ContainerSnapshot>>;

    /// Upsert one task file body, enforcing the per-task caps.
    async fn save_task_file(
        &self,
        task_id: &str,
        path: &str,
        content: &FileContent,
    ) -> CodeforgeResult<()>;

    /// Delete one task file body.
    async fn delete_task_file(&self, task_id: &str, path: &str) -> CodeforgeResult<()>;

    /// All file bodies for a task.
    async fn list_task_files(
        &self,
        task_id: &str,
    ) -> CodeforgeResult<Vec<(String, FileContent)>>;

    /// Add usage to the owner's counters for the current UTC day.
    async fn record_usage(
        &self,
        owner_key_hash: &str,
        tokens_in: u64,
        tokens_out: u64,
        command_runs: u64,
    ) -> CodeforgeResult<()>;

    /// The owner's counters for the current UTC day.
    async fn usage_for_key(&self, owner_key_hash: &str) -> CodeforgeResult<DailyUsage>;

    /// Authoritative fixed-window rate-limit check. Returns
    /// `(allowed, retry_after_seconds)`.
    async fn check_rate_limit(
        &self,
        key_hash: &str,
        scope: &str,
        limit: u32,
        window_seconds: u64,
    ) -> CodeforgeResult<(bool, u64)>;

    /// Purge terminal tasks older than `ttl_days`, with their events,
    /// artifacts, snapshots, and files. Returns purged task count.
    async fn purge_expired(&self, ttl_days: u32) -> CodeforgeResult<usize>;
}
