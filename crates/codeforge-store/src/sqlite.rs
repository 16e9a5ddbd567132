//! Durable [`TaskStore`] on SQLite.
//!
//! Rows that the engine treats as structured documents (task rows,
//! snapshots, artifacts) are stored as JSON columns; identity and filter
//! columns are materialized for indexing. All access goes through
//! `spawn_blocking` so the async runtime never blocks on the connection
//! lock.

use crate::{
    ArtifactRow, ContainerSnapshot, DailyUsage, FileCaps, ListOrder, TaskStore,
};
use async_trait::async_trait;
use chrono::Utc;
use codeforge_core::{
    ArtifactKind, CodeforgeError, CodeforgeResult, FileContent, TaskEvent, TaskPatch, TaskRow,
    TaskStatus,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id            TEXT PRIMARY KEY,
    status        TEXT NOT NULL,
    owner_key_hash TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    row_json      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_key_hash);

CREATE TABLE IF NOT EXISTS events (
    task_id    TEXT NOT NULL,
    event_id   TEXT NOT NULL,
    type       TEXT NOT NULL,
    payload    TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (task_id, event_id)
);

CREATE TABLE IF NOT EXISTS artifacts (
    id         TEXT NOT NULL,
    task_id    TEXT NOT NULL,
    type       TEXT NOT NULL,
    produced_by TEXT NOT NULL,
    payload    TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (task_id, id)
);
CREATE INDEX IF NOT EXISTS idx_artifacts_type ON artifacts(task_id, type);

CREATE TABLE IF NOT EXISTS container_state (
    task_id       TEXT PRIMARY KEY,
    snapshot_json TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_files (
    task_id      TEXT NOT NULL,
    path         TEXT NOT NULL,
    content_json TEXT NOT NULL,
    sha256       TEXT NOT NULL,
    size         INTEGER NOT NULL,
    PRIMARY KEY (task_id, path)
);

CREATE TABLE IF NOT EXISTS usage (
    owner_key_hash TEXT NOT NULL,
    day            TEXT NOT NULL,
    tokens_in      INTEGER NOT NULL DEFAULT 0,
    tokens_out     INTEGER NOT NULL DEFAULT 0,
    command_runs   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (owner_key_hash, day)
);

CREATE TABLE IF NOT EXISTS rate_limit (
    key_hash     TEXT NOT NULL,
    scope        TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    count        INTEGER NOT NULL,
    PRIMARY KEY (key_hash, scope)
);
";

/// SQLite-backed [`TaskStore`].
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    caps: FileCaps,
}

fn db_err(err: rusqlite::Error) -> CodeforgeError {
    CodeforgeError::Persistence(err.to_string())
}

fn json_err(err: serde_json::Error) -> CodeforgeError {
    CodeforgeError::Persistence(err.to_string())
}

impl SqliteStore {
    /// Open (or create) a store at `path`.
    pub fn open(path: &Path, caps: FileCaps) -> CodeforgeResult<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::from_connection(conn, caps)
    }

    /// Fresh in-memory database, for tests.
    pub fn open_in_memory(caps: FileCaps) -> CodeforgeResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn, caps)
    }

    fn from_connection(conn: Connection, caps: FileCaps) -> CodeforgeResult<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            caps,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> CodeforgeResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> CodeforgeResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|err| CodeforgeError::Persistence(format!("store worker: {err}")))?
    }

    fn today() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }
}

fn row_to_task(json: String) -> CodeforgeResult<TaskRow> {
    serde_json::from_str(&json).map_err(json_err)
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create_task(&self, row: TaskRow) -> CodeforgeResult<()> {
        self.with_conn(move |conn| {
            let json = serde_json::to_string(&row).map_err(json_err)?;
            conn.execute(
                "INSERT OR REPLACE INTO tasks (id, status, owner_key_hash, created_at, updated_at, row_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.id,
                    row.status.as_str(),
                    row.owner_key_hash,
                    row.created_at.to_rfc3339(),
                    row.updated_at.to_rfc3339(),
                    json,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn get_task(&self, task_id: &str) -> CodeforgeResult<Option<TaskRow>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT row_json FROM tasks WHERE id = ?1",
                params![task_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?
            .map(row_to_task)
            .transpose()
        })
        .await
    }

    async fn update_task(
        &self,
        task_id: &str,
        patch: TaskPatch,
    ) -> CodeforgeResult<Option<TaskRow>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let Some(json) = conn
                .query_row(
                    "SELECT row_json FROM tasks WHERE id = ?1",
                    params![task_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(db_err)?
            else {
                return Ok(None);
            };
            let mut row = row_to_task(json)?;
            patch.apply(&mut row);
            let json = serde_json::to_string(&row).map_err(json_err)?;
            conn.execute(
                "UPDATE tasks SET status = ?2, owner_key_hash = ?3, updated_at = ?4, row_json = ?5
                 WHERE id = ?1",
                params![
                    row.id,
                    row.status.as_str(),
                    row.owner_key_hash,
                    row.updated_at.to_rfc3339(),
                    json,
                ],
            )
            .map_err(db_err)?;
            Ok(Some(row))
        })
        .await
    }

    async fn list_tasks_for_owner(
        &self,
        owner_key_hash: &str,
        limit: usize,
    ) -> CodeforgeResult<Vec<TaskRow>> {
        let owner = owner_key_hash.to_string();
        self.with_conn(move |conn| {
            let mut statement = conn
                .prepare(
                    "SELECT row_json FROM tasks WHERE owner_key_hash = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = statement
                .query_map(params![owner, limit as i64], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<String>, _>>()
                .map_err(db_err)?;
            rows.into_iter().map(row_to_task).collect()
        })
        .await
    }

    async fn list_queued_tasks(&self) -> CodeforgeResult<Vec<TaskRow>> {
        self.with_conn(|conn| {
            let mut statement = conn
                .prepare(
                    "SELECT row_json FROM tasks WHERE status = 'queued' ORDER BY created_at ASC",
                )
                .map_err(db_err)?;
            let rows = statement
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<String>, _>>()
                .map_err(db_err)?;
            rows.into_iter().map(row_to_task).collect()
        })
        .await
    }

    async fn reset_processing_to_queued(&self) -> CodeforgeResult<usize> {
        self.with_conn(|conn| {
            let mut statement = conn
                .prepare("SELECT row_json FROM tasks WHERE status = 'processing'")
                .map_err(db_err)?;
            let rows = statement
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<String>, _>>()
                .map_err(db_err)?;
            let mut flipped = 0;
            for json in rows {
                let mut row = row_to_task(json)?;
                row.status = TaskStatus::Queued;
                row.updated_at = Utc::now();
                let json = serde_json::to_string(&row).map_err(json_err)?;
                conn.execute(
                    "UPDATE tasks SET status = 'queued', updated_at = ?2, row_json = ?3 WHERE id = ?1",
                    params![row.id, row.updated_at.to_rfc3339(), json],
                )
                .map_err(db_err)?;
                flipped += 1;
            }
            Ok(flipped)
        })
        .await
    }

    async fn append_event(&self, event: TaskEvent) -> CodeforgeResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO events (task_id, event_id, type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.task_id,
                    event.id.to_string(),
                    event.kind.as_str(),
                    event.payload.to_string(),
                    event.created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn list_events(
        &self,
        task_id: &str,
        limit: usize,
        order: ListOrder,
    ) -> CodeforgeResult<Vec<TaskEvent>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let sql = match order {
                ListOrder::Asc => {
                    "SELECT task_id, event_id, type, payload, created_at FROM events
                     WHERE task_id = ?1 ORDER BY rowid ASC LIMIT ?2"
                }
                ListOrder::Desc => {
                    "SELECT task_id, event_id, type, payload, created_at FROM events
                     WHERE task_id = ?1 ORDER BY rowid DESC LIMIT ?2"
                }
            };
            let mut statement = conn.prepare(sql).map_err(db_err)?;
            let rows = statement
                .query_map(params![task_id, limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows.into_iter()
                .map(|(task_id, event_id, kind, payload, created_at)| {
                    Ok(TaskEvent {
                        id: Uuid::parse_str(&event_id)
                            .map_err(|e| CodeforgeError::Persistence(e.to_string()))?,
                        task_id,
                        kind: kind.as_str().into(),
                        payload: serde_json::from_str(&payload).map_err(json_err)?,
                        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                            .map_err(|e| CodeforgeError::Persistence(e.to_string()))?
                            .with_timezone(&Utc),
                    })
                })
                .collect()
        })
        .await
    }

    async fn add_artifact(&self, row: ArtifactRow) -> CodeforgeResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO artifacts (id, task_id, type, produced_by, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.id.to_string(),
                    row.task_id,
                    row.kind.as_str(),
                    row.produced_by,
                    row.payload.to_string(),
                    row.created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn list_artifacts(
        &self,
        task_id: &str,
        kind: Option<&ArtifactKind>,
        limit: usize,
        order: ListOrder,
    ) -> CodeforgeResult<Vec<ArtifactRow>> {
        let task_id = task_id.to_string();
        let kind = kind.map(|k| k.as_str().to_string());
        self.with_conn(move |conn| {
            let direction = match order {
                ListOrder::Asc => "ASC",
                ListOrder::Desc => "DESC",
            };
            let sql = format!(
                "SELECT id, task_id, type, produced_by, payload, created_at FROM artifacts
                 WHERE task_id = ?1 AND (?2 IS NULL OR type = ?2)
                 ORDER BY rowid {direction} LIMIT ?3"
            );
            let mut statement = conn.prepare(&sql).map_err(db_err)?;
            let rows = statement
                .query_map(params![task_id, kind, limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows.into_iter()
                .map(|(id, task_id, kind, produced_by, payload, created_at)| {
                    Ok(ArtifactRow {
                        id: Uuid::parse_str(&id)
                            .map_err(|e| CodeforgeError::Persistence(e.to_string()))?,
                        task_id,
                        kind: kind.as_str().into(),
                        produced_by,
                        payload: serde_json::from_str(&payload).map_err(json_err)?,
                        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                            .map_err(|e| CodeforgeError::Persistence(e.to_string()))?
                            .with_timezone(&Utc),
                    })
                })
                .collect()
        })
        .await
    }

    async fn save_container_snapshot(
        &self,
        task_id: &str,
        snapshot: &ContainerSnapshot,
    ) -> CodeforgeResult<()> {
        let task_id = task_id.to_string();
        let json = serde_json::to_string(snapshot).map_err(json_err)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO container_state (task_id, snapshot_json, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![task_id, json, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn load_container_snapshot(
        &self,
        task_id: &str,
    ) -> CodeforgeResult<Option<ContainerSnapshot>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT snapshot_json FROM container_state WHERE task_id = ?1",
                params![task_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?
            .map(|json| serde_json::from_str(&json).map_err(json_err))
            .transpose()
        })
        .await
    }

    async fn save_task_file(
        &self,
        task_id: &str,
        path: &str,
        content: &FileContent,
    ) -> CodeforgeResult<()> {
        let task_id = task_id.to_string();
        let path = path.to_string();
        let caps = self.caps;
        let sha256 = content.sha256_hex();
        let size = content.size_bytes();
        let json = serde_json::to_string(content).map_err(json_err)?;
        self.with_conn(move |conn| {
            let (other_bytes, other_count): (i64, i64) = conn
                .query_row(
                    "SELECT COALESCE(SUM(size), 0), COUNT(*) FROM task_files
                     WHERE task_id = ?1 AND path != ?2",
                    params![task_id, path],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(db_err)?;
            if other_bytes as u64 + size > caps.max_task_bytes {
                return Err(CodeforgeError::Persistence(format!(
                    "task {task_id} exceeds max_task_bytes"
                )));
            }
            if other_count as u64 + 1 > caps.max_task_files {
                return Err(CodeforgeError::Persistence(format!(
                    "task {task_id} exceeds max_task_files"
                )));
            }
            conn.execute(
                "INSERT OR REPLACE INTO task_files (task_id, path, content_json, sha256, size)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![task_id, path, json, sha256, size as i64],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn delete_task_file(&self, task_id: &str, path: &str) -> CodeforgeResult<()> {
        let task_id = task_id.to_string();
        let path = path.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM task_files WHERE task_id = ?1 AND path = ?2",
                params![task_id, path],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn list_task_files(
        &self,
        task_id: &str,
    ) -> CodeforgeResult<Vec<(String, FileContent)>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let mut statement = conn
                .prepare(
                    "SELECT path, content_json FROM task_files WHERE task_id = ?1 ORDER BY path",
                )
                .map_err(db_err)?;
            let rows = statement
                .query_map(params![task_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows.into_iter()
                .map(|(path, json)| {
                    Ok((path, serde_json::from_str(&json).map_err(json_err)?))
                })
                .collect()
        })
        .await
    }

    async fn record_usage(
        &self,
        owner_key_hash: &str,
        tokens_in: u64,
        tokens_out: u64,
        command_runs: u64,
    ) -> CodeforgeResult<()> {
        let owner = owner_key_hash.to_string();
        let day = Self::today();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO usage (owner_key_hash, day, tokens_in, tokens_out, command_runs)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(owner_key_hash, day) DO UPDATE SET
                     tokens_in = tokens_in + excluded.tokens_in,
                     tokens_out = tokens_out + excluded.tokens_out,
                     command_runs = command_runs + excluded.command_runs",
                params![owner, day, tokens_in as i64, tokens_out as i64, command_runs as i64],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn usage_for_key(&self, owner_key_hash: &str) -> CodeforgeResult<DailyUsage> {
        let owner = owner_key_hash.to_string();
        let day = Self::today();
        self.with_conn(move |conn| {
            let usage = conn
                .query_row(
                    "SELECT tokens_in, tokens_out, command_runs FROM usage
                     WHERE owner_key_hash = ?1 AND day = ?2",
                    params![owner, day],
                    |row| {
                        Ok(DailyUsage {
                            tokens_in: row.get::<_, i64>(0)? as u64,
                            tokens_out: row.get::<_, i64>(1)? as u64,
                            command_runs: row.get::<_, i64>(2)? as u64,
                        })
                    },
                )
                .optional()
                .map_err(db_err)?;
            Ok(usage.unwrap_or_default())
        })
        .await
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
        let key = key_hash.to_string();
        let scope = scope.to_string();
        self.with_conn(move |conn| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let window_start = now / window_seconds * window_seconds;
            let retry_after = (window_start + window_seconds - now).max(1);
            let current: Option<(i64, i64)> = conn
                .query_row(
                    "SELECT window_start, count FROM rate_limit WHERE key_hash = ?1 AND scope = ?2",
                    params![key, scope],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db_err)?;
            let count = match current {
                Some((start, count)) if start as u64 == window_start => count as u32,
                _ => 0,
            };
            if count >= limit {
                return Ok((false, retry_after));
            }
            conn.execute(
                "INSERT OR REPLACE INTO rate_limit (key_hash, scope, window_start, count)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, scope, window_start as i64, (count + 1) as i64],
            )
            .map_err(db_err)?;
            Ok((true, retry_after))
        })
        .await
    }

    async fn purge_expired(&self, ttl_days: u32) -> CodeforgeResult<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(ttl_days))).to_rfc3339();
        self.with_conn(move |conn| {
            let mut statement = conn
                .prepare(
                    "SELECT id FROM tasks
                     WHERE status IN ('completed', 'failed', 'error') AND updated_at < ?1",
                )
                .map_err(db_err)?;
            let expired = statement
                .query_map(params![cutoff], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<String>, _>>()
                .map_err(db_err)?;
            for task_id in &expired {
                conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])
                    .map_err(db_err)?;
                conn.execute("DELETE FROM events WHERE task_id = ?1", params![task_id])
                    .map_err(db_err)?;
                conn.execute("DELETE FROM artifacts WHERE task_id = ?1", params![task_id])
                    .map_err(db_err)?;
                conn.execute(
                    "DELETE FROM container_state WHERE task_id = ?1",
                    params![task_id],
                )
                .map_err(db_err)?;
                conn.execute("DELETE FROM task_files WHERE task_id = ?1", params![task_id])
                    .map_err(db_err)?;
            }
            Ok(expired.len())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeforge_core::EventKind;
    use serde_json::json;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(FileCaps::default()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn task_row_roundtrip() {
        let store = store();
        let mut row = TaskRow::new("t1", "build a thing");
        row.owner_key_hash = Some("abc".into());
        store.create_task(row.clone()).await.unwrap();

        let fetched = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(fetched.description, "build a thing");

        let updated = store
            .update_task(
                "t1",
                TaskPatch {
                    status: Some(TaskStatus::Processing),
                    progress: Some(0.3),
                    ..TaskPatch::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Processing);

        let owned = store.list_tasks_for_owner("abc", 10).await.unwrap();
        assert_eq!(owned.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn events_preserve_order_and_idempotence() {
        let store = store();
        let first = TaskEvent::new("t1", EventKind::StageStarted, json!({"stage": "research"}));
        let second = TaskEvent::new("t1", EventKind::ProgressUpdate, json!({"p": 0.5}));
        store.append_event(first.clone()).await.unwrap();
        store.append_event(second).await.unwrap();
        store.append_event(first).await.unwrap();

        let asc = store.list_events("t1", 10, ListOrder::Asc).await.unwrap();
        assert_eq!(asc.len(), 2);
        assert_eq!(asc[0].kind, EventKind::StageStarted);
        for pair in asc.windows(2) {
            assert!(pair[1].created_at >= pair[0].created_at);
        }

        let desc = store.list_events("t1", 1, ListOrder::Desc).await.unwrap();
        assert_eq!(desc[0].kind, EventKind::ProgressUpdate);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn artifacts_filter_by_kind() {
        let store = store();
        for kind in [ArtifactKind::Code, ArtifactKind::ReviewReport, ArtifactKind::Code] {
            store
                .add_artifact(ArtifactRow {
                    id: Uuid::new_v4(),
                    task_id: "t1".into(),
                    kind,
                    produced_by: "coder".into(),
                    payload: json!({}),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let code = store
            .list_artifacts("t1", Some(&ArtifactKind::Code), 10, ListOrder::Asc)
            .await
            .unwrap();
        assert_eq!(code.len(), 2);
        let all = store
            .list_artifacts("t1", None, 10, ListOrder::Asc)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_caps_apply() {
        let store = SqliteStore::open_in_memory(FileCaps {
            max_task_bytes: 8,
            max_task_files: 10,
        })
        .unwrap();
        store
            .save_task_file("t1", "a.txt", &FileContent::Text("1234".into()))
            .await
            .unwrap();
        assert!(store
            .save_task_file("t1", "b.txt", &FileContent::Text("12345".into()))
            .await
            .is_err());
        let files = store.list_task_files("t1").await.unwrap();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn usage_counts_per_day() {
        let store = store();
        store.record_usage("owner", 10, 5, 1).await.unwrap();
        store.record_usage("owner", 1, 1, 0).await.unwrap();
        let usage = store.usage_for_key("owner").await.unwrap();
        assert_eq!(usage.tokens_in, 11);
        assert_eq!(usage.tokens_out, 6);
        assert_eq!(usage.command_runs, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rate_limit_window() {
        let store = store();
        for _ in 0..2 {
            assert!(store
                .check_rate_limit("k", "create_task", 2, 60)
                .await
                .unwrap()
                .0);
        }
        let (allowed, retry) = store.check_rate_limit("k", "create_task", 2, 60).await.unwrap();
        assert!(!allowed);
        assert!(retry >= 1);
    }
}
