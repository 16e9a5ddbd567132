//! On-disk mirror of a container, used only by the command runner.

use codeforge_core::{
    CodeforgeError, CodeforgeResult, Container, FileContent, FileRecord, FileSink,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

const IGNORED_DIRS: [&str; 6] = [
    ".git",
    "__pycache__",
    ".pytest_cache",
    ".ruff_cache",
    ".mypy_cache",
    ".venv",
];

const IGNORED_SUFFIXES: [&str; 1] = [".pyc"];

/// Summary of one reverse sync from disk into the container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Paths added or modified on disk.
    pub changed: Vec<String>,
    /// Paths deleted on disk.
    pub removed: Vec<String>,
}

/// Per-task directory bound to a container.
#[derive(Debug, Clone)]
pub struct TaskWorkspace {
    task_id: String,
    path: PathBuf,
}

impl TaskWorkspace {
    /// Workspace at `root/<task_id>/`. The directory is created lazily.
    pub fn new(task_id: impl Into<String>, root: &Path) -> Self {
        let task_id = task_id.into();
        let path = root.join(&task_id);
        Self { task_id, path }
    }

    /// The task this workspace belongs to.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Absolute-ish workspace directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the workspace directory.
    pub fn ensure(&self) -> CodeforgeResult<()> {
        std::fs::create_dir_all(&self.path)?;
        Ok(())
    }

    fn resolve_target(&self, relative_path: &str) -> CodeforgeResult<PathBuf> {
        let normalized = codeforge_core::normalize_rel_path(relative_path)?;
        Ok(self.path.join(normalized))
    }

    fn should_ignore(relative_path: &str) -> bool {
        if relative_path
            .split('/')
            .any(|part| IGNORED_DIRS.contains(&part))
        {
            return true;
        }
        IGNORED_SUFFIXES
            .iter()
            .any(|suffix| relative_path.ends_with(suffix))
    }

    /// Write or delete one file. `None` content deletes.
    pub fn write_file(
        &self,
        relative_path: &str,
        content: Option<&FileContent>,
    ) -> CodeforgeResult<()> {
        let target = self.resolve_target(relative_path)?;
        match content {
            None => {
                if target.exists() {
                    std::fs::remove_file(target)?;
                }
            }
            Some(content) => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(target, content.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Write every container file to disk.
    pub fn materialize(&self, container: &Container) -> CodeforgeResult<()> {
        self.ensure()?;
        for (path, content) in &container.files {
            self.write_file(path, Some(content))?;
        }
        Ok(())
    }

    /// Collect the on-disk tree, skipping tool caches and VCS internals.
    pub fn collect_files(&self) -> CodeforgeResult<BTreeMap<String, FileContent>> {
        let mut files = BTreeMap::new();
        if !self.path.exists() {
            return Ok(files);
        }
        self.collect_into(&self.path, &mut files)?;
        Ok(files)
    }

    fn collect_into(
        &self,
        dir: &Path,
        files: &mut BTreeMap<String, FileContent>,
    ) -> CodeforgeResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let relative = path
                .strip_prefix(&self.path)
                .map_err(|_| CodeforgeError::UnsafePath(path.display().to_string()))?
                .to_string_lossy()
                .replace('\\', "/");
            if Self::should_ignore(&relative) {
                continue;
            }
            if path.is_dir() {
                self.collect_into(&path, files)?;
            } else if path.is_file() {
                let data = std::fs::read(&path)?;
                files.insert(relative, FileContent::from_bytes(data));
            }
        }
        Ok(())
    }

    /// Diff the on-disk tree against the container and apply additions,
    /// modifications, and deletions back to it.
    ///
    /// The container's file sink is suppressed for the duration so the
    /// changes are not echoed back onto disk.
    pub fn sync_to_container(&self, container: &mut Container) -> CodeforgeResult<SyncReport> {
        let workspace_files = self.collect_files()?;
        let existing = FileRecord::capture_all(&container.files);
        let mut report = SyncReport::default();

        container.with_sink_suppressed(|container| -> CodeforgeResult<()> {
            for (path, content) in &workspace_files {
                let next = FileRecord::capture(content);
                if existing
                    .get(path)
                    .is_some_and(|current| current.sha256 == next.sha256)
                {
                    continue;
                }
                container.add_file(path, content.clone())?;
                report.changed.push(path.clone());
            }

            let stale: Vec<String> = container
                .files
                .keys()
                .filter(|path| !workspace_files.contains_key(*path))
                .cloned()
                .collect();
            for path in stale {
                container.remove_file(&path)?;
                report.removed.push(path);
            }
            Ok(())
        })?;

        debug!(
            task_id = %self.task_id,
            changed = report.changed.len(),
            removed = report.removed.len(),
            "workspace synced back to container"
        );
        Ok(report)
    }
}

impl FileSink for TaskWorkspace {
    fn apply(&self, path: &str, content: Option<&FileContent>) {
        if let Err(err) = self.write_file(path, content) {
            warn!(path, error = %err, "workspace mirror write failed");
        }
    }
}

/// Delete task workspaces untouched for more than `ttl_days`.
pub fn cleanup_workspaces(root: &Path, ttl_days: Option<u32>) -> CodeforgeResult<usize> {
    let Some(ttl_days) = ttl_days else {
        return Ok(0);
    };
    if !root.is_dir() {
        return Ok(0);
    }
    let cutoff = Duration::from_secs(u64::from(ttl_days) * 24 * 60 * 60);
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified());
        let expired = modified
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .is_some_and(|age| age > cutoff);
        if expired {
            std::fs::remove_dir_all(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
