//! Ephemeral in-memory store. Same behavior as the durable store, lost on
//! restart.

use crate::{
    ArtifactRow, ContainerSnapshot, DailyUsage, FileCaps, ListOrder, TaskStore,
};
use async_trait::async_trait;
use chrono::Utc;
use codeforge_core::{
    ArtifactKind, CodeforgeError, CodeforgeResult, FileContent, TaskEvent, TaskPatch, TaskRow,
    TaskStatus,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Default)]
struct State {
    tasks: HashMap<String, TaskRow>,
    events: HashMap<String, Vec<TaskEvent>>,
    event_ids: HashSet<(String, Uuid)>,
    artifacts: HashMap<String, Vec<ArtifactRow>>,
    snapshots: HashMap<String, ContainerSnapshot>,
    files: HashMap<String, BTreeMap<String, FileContent>>,
    usage: HashMap<(String, String), DailyUsage>,
    rate_windows: HashMap<(String, String), (u64, u32)>,
}

/// In-memory [`TaskStore`].
pub struct MemoryStore {
    state: RwLock<State>,
    caps: FileCaps,
}

impl MemoryStore {
    /// Empty store with default file caps.
    pub fn new() -> Self {
        Self::with_caps(FileCaps::default())
    }

    /// Empty store with explicit file caps.
    pub fn with_caps(caps: FileCaps) -> Self {
        Self {
            state: RwLock::new(State::default()),
            caps,
        }
    }

    fn today() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, row: TaskRow) -> CodeforgeResult<()> {
        self.state.write().tasks.insert(row.id.clone(), row);
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> CodeforgeResult<Option<TaskRow>> {
        Ok(self.state.read().tasks.get(task_id).cloned())
    }

    async fn update_task(
        &self,
        task_id: &str,
        patch: TaskPatch,
    ) -> CodeforgeResult<Option<TaskRow>> {
        let mut state = self.state.write();
        let Some(row) = state.tasks.get_mut(task_id) else {
            return Ok(None);
        };
        patch.apply(row);
        Ok(Some(row.clone()))
    }

    async fn list_tasks_for_owner(
        &self,
        owner_key_hash: &str,
        limit: usize,
    ) -> CodeforgeResult<Vec<TaskRow>> {
        let state = self.state.read();
        let mut rows: Vec<TaskRow> = state
            .tasks
            .values()
            .filter(|row| row.owner_key_hash.as_deref() == Some(owner_key_hash))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn list_queued_tasks(&self) -> CodeforgeResult<Vec<TaskRow>> {
        let state = self.state.read();
        let mut rows: Vec<TaskRow> = state
            .tasks
            .values()
            .filter(|row| row.status == TaskStatus::Queued)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn reset_processing_to_queued(&self) -> CodeforgeResult<usize> {
        let mut state = self.state.write();
        let mut flipped = 0;
        for row in state.tasks.values_mut() {
            if row.status == TaskStatus::Processing {
                row.status = TaskStatus::Queued;
                row.updated_at = Utc::now();
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn append_event(&self, event: TaskEvent) -> CodeforgeResult<()> {
        let mut state = self.state.write();
        let key = (event.task_id.clone(), event.id);
        if !state.event_ids.insert(key) {
            return Ok(());
        }
        state
            .events
            .entry(event.task_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn list_events(
        &self,
        task_id: &str,
        limit: usize,
        order: ListOrder,
    ) -> CodeforgeResult<Vec<TaskEvent>> {
        let state = self.state.read();
        let mut events = state.events.get(task_id).cloned().unwrap_or_default();
        if order == ListOrder::Desc {
            events.reverse();
        }
        events.truncate(limit);
        Ok(events)
    }

    async fn add_artifact(&self, row: ArtifactRow) -> CodeforgeResult<()> {
        self.state
            .write()
            .artifacts
            .entry(row.task_id.clone())
            .or_default()
            .push(row);
        Ok(())
    }

    async fn list_artifacts(
        &self,
        task_id: &str,
        kind: Option<&ArtifactKind>,
        limit: usize,
        order: ListOrder,
    ) -> CodeforgeResult<Vec<ArtifactRow>> {
        let state = self.state.read();
        let mut rows: Vec<ArtifactRow> = state
            .artifacts
            .get(task_id)
            .map(|rows| {
                rows.iter()
                    .filter(|row| kind.map_or(true, |k| &row.kind == k))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if order == ListOrder::Desc {
            rows.reverse();
        }
        let mut seen = HashSet::new();
        rows.retain(|row| seen.insert(row.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn save_container_snapshot(
        &self,
        task_id: &str,
        snapshot: &ContainerSnapshot,
    ) -> CodeforgeResult<()> {
        self.state
            .write()
            .snapshots
            .insert(task_id.to_string(), snapshot.clone());
        Ok(())
    }

    async fn load_container_snapshot(
        &self,
        task_id: &str,
    ) -> CodeforgeResult<Option<ContainerSnapshot>> {
        Ok(self.state.read().snapshots.get(task_id).cloned())
    }

    async fn save_task_file(
        &self,
        task_id: &str,
        path: &str,
        content: &FileContent,
    ) -> CodeforgeResult<()> {
        let mut state = self.state.write();
        let files = state.files.entry(task_id.to_string()).or_default();
        let existing = files.get(path).map(FileContent::size_bytes).unwrap_or(0);
        let total: u64 = files.values().map(FileContent::size_bytes).sum();
        if total - existing + content.size_bytes() > self.caps.max_task_bytes {
            return Err(CodeforgeError::Persistence(format!(
                "task {task_id} exceeds max_task_bytes"
            )));
        }
        if !files.contains_key(path) && files.len() as u64 >= self.caps.max_task_files {
            return Err(CodeforgeError::Persistence(format!(
                "task {task_id} exceeds max_task_files"
            )));
        }
        files.insert(path.to_string(), content.clone());
        Ok(())
    }

    async fn delete_task_file(&self, task_id: &str, path: &str) -> CodeforgeResult<()> {
        if let Some(files) = self.state.write().files.get_mut(task_id) {
            files.remove(path);
        }
        Ok(())
    }

    async fn list_task_files(
        &self,
        task_id: &str,
    ) -> CodeforgeResult<Vec<(String, FileContent)>> {
        Ok(self
            .state
            .read()
            .files
            .get(task_id)
            .map(|files| {
                files
                    .iter()
                    .map(|(path, content)| (path.clone(), content.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn record_usage(
        &self,
        owner_key_hash: &str,
        tokens_in: u64,
        tokens_out: u64,
        command_runs: u64,
    ) -> CodeforgeResult<()> {
        let mut state = self.state.write();
        let usage = state
            .usage
            .entry((owner_key_hash.to_string(), Self::today()))
            .or_default();
        usage.tokens_in += tokens_in;
        usage.tokens_out += tokens_out;
        usage.command_runs += command_runs;
        Ok(())
    }

    async fn usage_for_key(&self, owner_key_hash: &str) -> CodeforgeResult<DailyUsage> {
        Ok(self
            .state
            .read()
            .usage
            .get(&(owner_key_hash.to_string(), Self::today()))
            .copied()
            .unwrap_or_default())
    }

    async fn check_rate_limit(
        &self,
        key_hash: &str,
        scope: &str,
        limit: u32,
        window_seconds: u64,
    ) -> CodeforgeResult<(bool, u64)> {
        if limit == 0 {
            return Ok((true, 0));
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let window_start = now / window_seconds * window_seconds;
        let retry_after = (window_start + window_seconds - now).max(1);
        let mut state = self.state.write();
        let entry = state
            .rate_windows
            .entry((key_hash.to_string(), scope.to_string()))
            .or_insert((window_start, 0));
        if entry.0 != window_start {
            *entry = (window_start, 0);
        }
        if entry.1 >= limit {
            return Ok((false, retry_after));
        }
        entry.1 += 1;
        Ok((true, retry_after))
    }

    async fn purge_expired(&self, ttl_days: u32) -> CodeforgeResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(ttl_days));
        let mut state = self.state.write();
        let expired: Vec<String> = state
            .tasks
            .values()
            .filter(|row| row.status.is_terminal() && row.updated_at < cutoff)
            .map(|row| row.id.clone())
            .collect();
        for task_id in &expired {
            state.tasks.remove(task_id);
            state.events.remove(task_id);
            state.artifacts.remove(task_id);
            state.snapshots.remove(task_id);
            state.files.remove(task_id);
        }
        Ok(expired.len())
    }
}
