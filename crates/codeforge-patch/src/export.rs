//! The git export bundle: a patch plus everything needed to apply it.

use crate::diff::{PatchDiffPayload, PatchStats};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The `git_export` artifact payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitExportPayload {
    /// Bundle files by name.
    pub files: BTreeMap<String, String>,
    /// Stats copied from the patch payload.
    pub patch_stats: PatchStats,
}

/// Build the export bundle for a finished task.
pub fn build_git_export(task_id: &str, patch: &PatchDiffPayload) -> GitExportPayload {
    let changed_files_json =
        serde_json::to_string_pretty(&patch.changed_files).unwrap_or_else(|_| "[]".to_string());
    let mut files = BTreeMap::new();
    files.insert("patch.diff".to_string(), patch.diff.clone());
    files.insert("apply.sh".to_string(), apply_script());
    files.insert("README_APPLY.md".to_string(), apply_readme(task_id));
    files.insert("changed_files.json".to_string(), changed_files_json);
    GitExportPayload {
        files,
        patch_stats: patch.stats,
    }
}

fn apply_script() -> String {
    [
        "#!/usr/bin/env bash",
        "set -euo pipefail",
        "",
        "ROOT_DIR=\"$(cd \"$(dirname \"${BASH_SOURCE[0]}\")\" && pwd)\"",
        "PATCH_FILE=\"${ROOT_DIR}/patch.diff\"",
        "",
        "if ! command -v git >/dev/null 2>&1; then",
        "  echo \"git is required to apply this patch.\"",
        "  exit 1",
        "fi",
        "",
        "if ! git rev-parse --is-inside-work-tree >/dev/null 2>&1; then",
        "  echo \"Run this script from the root of a git repository.\"",
        "  exit 1",
        "fi",
        "",
        "if ! git diff --quiet || ! git diff --cached --quiet; then",
        "  echo \"Your working tree has uncommitted changes. Commit or stash them first.\"",
        "  exit 1",
        "fi",
        "",
        "git apply --index \"${PATCH_FILE}\"",
        "echo \"Patch applied. Review the result with git status.\"",
    ]
    .join("\n")
}

fn apply_readme(task_id: &str) -> String {
    [
        format!("# Git Export Bundle for task {task_id}"),
        String::new(),
        "This bundle contains a Git-friendly patch with supporting files.".to_string(),
        String::new(),
        "## Contents".to_string(),
        "- `patch.diff`: Unified diff for the task changes.".to_string(),
        "- `apply.sh`: Helper script to apply the patch safely.".to_string(),
        "- `changed_files.json`: Machine-readable list of changed files.".to_string(),
        "- `README_APPLY.md`: This guide.".to_string(),
        String::new(),
        "## Apply with the helper script".to_string(),
        "1. Ensure `git` is installed.".to_string(),
        "2. `cd` to the root of the target repository.".to_string(),
        "3. Ensure the working tree is clean (`git status`).".to_string(),
        "4. Run: `./apply.sh`".to_string(),
        String::new(),
        "## Apply manually".to_string(),
        "```bash".to_string(),
        "git apply --index patch.diff".to_string(),
        "```".to_string(),
        String::new(),
        "## Notes".to_string(),
        "- Binary files are listed in `changed_files.json` and must be handled manually."
            .to_string(),
        "- If the patch fails to apply cleanly, use `git apply --3way patch.diff`.".to_string(),
    ]
    .join("\n")
}
