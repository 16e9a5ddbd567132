//! Container reconstruction for resumed tasks.

use crate::{ContainerSnapshot, TaskStore};
use codeforge_core::{CodeforgeResult, Container, ProjectState};
use tracing::{info, warn};

/// Rebuild a container from its persisted snapshot and file bodies.
///
/// A missing snapshot with surviving files synthesizes a minimal container
/// already at the implementation stage, so a resumed task can still make
/// progress. Returns `None` when the store has nothing for the task.
pub async fn load_container(
    store: &dyn TaskStore,
    task_id: &str,
) -> CodeforgeResult<Option<Container>> {
    let snapshot = store.load_container_snapshot(task_id).await?;
    let files = store.list_task_files(task_id).await?;

    let mut container = match snapshot {
        Some(snapshot) => container_from_snapshot(snapshot),
        None if !files.is_empty() => {
            warn!(task_id, "no snapshot found, synthesizing a minimal container");
            let mut container = Container::new(None);
            container.update_state(ProjectState::Implementation, Some("Resumed from files"));
            container
        }
        None => return Ok(None),
    };

    // Bodies were normalized when first written; insert them directly so
    // the restored history stays byte-for-byte what was persisted.
    for (path, content) in files {
        container.files.insert(path, content);
    }

    info!(
        task_id,
        files = container.files.len(),
        state = %container.state,
        "container loaded for resume"
    );
    Ok(Some(container))
}

fn container_from_snapshot(snapshot: ContainerSnapshot) -> Container {
    let mut container = Container::new(Some(snapshot.project_id));
    container.created_at = snapshot.created_at;
    container.updated_at = snapshot.updated_at;
    container.state = snapshot.state;
    container.progress = snapshot.progress;
    container.metadata = snapshot.metadata;
    container.target_architecture = snapshot.target_architecture;
    container.current_task = snapshot.current_task;
    container.history = snapshot.history;
    container
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{build_container_snapshot, MemoryStore};
    use codeforge_core::FileContent;

    #[tokio::test]
    async fn roundtrips_snapshot_and_files() {
        let store = MemoryStore::new();
        let mut original = Container::new(Some("p1".into()));
        original.add_file("main.py", "print(1)\n").unwrap();
        original.update_state(ProjectState::Implementation, Some("working"));
        original.update_progress(0.6);

        store
            .save_container_snapshot("t1", &build_container_snapshot(&original))
            .await
            .unwrap();
        for (path, content) in &original.files {
            store.save_task_file("t1", path, content).await.unwrap();
        }

        let restored = load_container(&store, "t1").await.unwrap().unwrap();
        assert_eq!(restored.project_id, "p1");
        assert_eq!(restored.state, ProjectState::Implementation);
        assert_eq!(restored.progress, 0.6);
        assert_eq!(restored.files, original.files);
        assert_eq!(restored.history.len(), original.history.len());
    }

    #[tokio::test]
    async fn files_without_snapshot_synthesize_minimal_container() {
        let store = MemoryStore::new();
        store
            .save_task_file("t1", "kept.py", &FileContent::Text("x = 1\n".into()))
            .await
            .unwrap();
        let restored = load_container(&store, "t1").await.unwrap().unwrap();
        assert_eq!(restored.state, ProjectState::Implementation);
        assert!(restored.files.contains_key("kept.py"));
    }

    #[tokio::test]
    async fn nothing_persisted_means_none() {
        let store = MemoryStore::new();
        assert!(load_container(&store, "ghost").await.unwrap().is_none());
    }
}
