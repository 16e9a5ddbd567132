//! Baseline-vs-final diffing for the patch export.

use codeforge_core::{FileContent, FileRecord};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::{BTreeMap, BTreeSet};

/// How one path changed between baseline and final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Present only in the final state.
    Added,
    /// Present in both with differing content.
    Modified,
    /// Present only in the baseline.
    Removed,
}

/// One changed path with its identities on both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedFile {
    /// File path.
    pub path: String,
    /// Change classification.
    pub change_type: ChangeType,
    /// Baseline content hash, when the file existed.
    pub sha256_before: Option<String>,
    /// Final content hash, when the file exists.
    pub sha256_after: Option<String>,
    /// Baseline size in bytes.
    pub size_before: Option<u64>,
    /// Final size in bytes.
    pub size_after: Option<u64>,
    /// Whether either side is opaque binary.
    pub is_binary: bool,
}

/// Aggregate counts over the change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchStats {
    /// All changed paths.
    pub changed_total: usize,
    /// Added paths.
    pub added: usize,
    /// Modified paths.
    pub modified: usize,
    /// Removed paths.
    pub removed: usize,
    /// Text files in the change set.
    pub text_files: usize,
    /// Binary files in the change set (paths only, no diff body).
    pub binary_files: usize,
    /// Lines in the unified diff.
    pub diff_lines: usize,
}

/// The `patch_diff` artifact payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchDiffPayload {
    /// Unified diff over all text changes.
    pub diff: String,
    /// Per-path change records.
    pub changed_files: Vec<ChangedFile>,
    /// Aggregate counts.
    pub stats: PatchStats,
}

/// Diff the baseline records against the final files.
///
/// Text changes get unified-diff blocks with `a/`/`b/` headers; binary
/// changes are recorded by path only.
pub fn build_patch_diff(
    baseline: &BTreeMap<String, FileRecord>,
    final_files: &BTreeMap<String, FileContent>,
) -> PatchDiffPayload {
    let final_records = FileRecord::capture_all(final_files);
    let all_paths: BTreeSet<&String> = baseline.keys().chain(final_records.keys()).collect();

    let mut changed_files = Vec::new();
    let mut stats = PatchStats::default();
    let mut diff_text = String::new();

    for path in all_paths {
        let before = baseline.get(path);
        let after = final_records.get(path);
        let change_type = match (before, after) {
            (None, Some(_)) => ChangeType::Added,
            (Some(_), None) => ChangeType::Removed,
            (Some(b), Some(a)) if b.sha256 != a.sha256 => ChangeType::Modified,
            _ => continue,
        };

        let is_binary = before.map(|r| r.is_binary).unwrap_or(false)
            || after.map(|r| r.is_binary).unwrap_or(false);
        changed_files.push(ChangedFile {
            path: path.clone(),
            change_type,
            sha256_before: before.map(|r| r.sha256.clone()),
            sha256_after: after.map(|r| r.sha256.clone()),
            size_before: before.map(|r| r.size_bytes),
            size_after: after.map(|r| r.size_bytes),
            is_binary,
        });
        stats.changed_total += 1;
        match change_type {
            ChangeType::Added => stats.added += 1,
            ChangeType::Modified => stats.modified += 1,
            ChangeType::Removed => stats.removed += 1,
        }

        if is_binary {
            stats.binary_files += 1;
            continue;
        }
        stats.text_files += 1;

        let before_text = before
            .and_then(|r| r.content.as_ref())
            .and_then(FileContent::as_text)
            .unwrap_or_default();
        let after_text = after
            .and_then(|r| r.content.as_ref())
            .and_then(FileContent::as_text)
            .unwrap_or_default();
        let unified = TextDiff::from_lines(before_text, after_text)
            .unified_diff()
            .header(&format!("a/{path}"), &format!("b/{path}"))
            .to_string();
        diff_text.push_str(&unified);
    }

    stats.diff_lines = diff_text.lines().count();
    PatchDiffPayload {
        diff: diff_text,
        changed_files,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline_of(entries: &[(&str, &str)]) -> BTreeMap<String, FileRecord> {
        let files: BTreeMap<String, FileContent> = entries
            .iter()
            .map(|(path, content)| ((*path).to_string(), FileContent::Text((*content).into())))
            .collect();
        FileRecord::capture_all(&files)
    }

    fn files_of(entries: &[(&str, &str)]) -> BTreeMap<String, FileContent> {
        entries
            .iter()
            .map(|(path, content)| ((*path).to_string(), FileContent::Text((*content).into())))
            .collect()
    }

    #[test]
    fn classifies_added_modified_removed() {
        let baseline = baseline_of(&[("keep.py", "same\n"), ("old.py", "gone\n"), ("edit.py", "v1\n")]);
        let final_files = files_of(&[("keep.py", "same\n"), ("edit.py", "v2\n"), ("new.py", "hi\n")]);

        let payload = build_patch_diff(&baseline, &final_files);
        assert_eq!(payload.stats.changed_total, 3);
        assert_eq!(payload.stats.added, 1);
        assert_eq!(payload.stats.modified, 1);
        assert_eq!(payload.stats.removed, 1);
        assert_eq!(payload.stats.text_files, 3);

        let by_path: BTreeMap<&str, ChangeType> = payload
            .changed_files
            .iter()
            .map(|c| (c.path.as_str(), c.change_type))
            .collect();
        assert_eq!(by_path["new.py"], ChangeType::Added);
        assert_eq!(by_path["edit.py"], ChangeType::Modified);
        assert_eq!(by_path["old.py"], ChangeType::Removed);
        assert!(!by_path.contains_key("keep.py"));
    }

    #[test]
    fn unified_diff_has_git_style_headers() {
        let baseline = baseline_of(&[("app.py", "a\nb\n")]);
        let final_files = files_of(&[("app.py", "a\nc\n")]);
        let payload = build_patch_diff(&baseline, &final_files);
        assert!(payload.diff.contains("--- a/app.py"));
        assert!(payload.diff.contains("+++ b/app.py"));
        assert!(payload.diff.contains("-b"));
        assert!(payload.diff.contains("+c"));
        assert!(payload.stats.diff_lines > 0);
    }

    #[test]
    fn binary_changes_are_paths_only() {
        let mut final_files = BTreeMap::new();
        final_files.insert(
            "logo.bin".to_string(),
            FileContent::Binary(vec![1, 2, 3, 4]),
        );
        let payload = build_patch_diff(&BTreeMap::new(), &final_files);
        assert_eq!(payload.stats.binary_files, 1);
        assert_eq!(payload.stats.text_files, 0);
        assert!(payload.diff.is_empty());
        assert!(payload.changed_files[0].is_binary);
    }

    #[test]
    fn no_changes_is_empty() {
        let baseline = baseline_of(&[("a.py", "x\n")]);
        let final_files = files_of(&[("a.py", "x\n")]);
        let payload = build_patch_diff(&baseline, &final_files);
        assert_eq!(payload.stats.changed_total, 0);
        assert!(payload.diff.is_empty());
    }
}
