//! Relative-path validation shared by the container, the workspace, and the
//! coder's allowed-paths check.

use crate::error::{CodeforgeError, CodeforgeResult};

/// Validate a container-relative POSIX path and return its normalized form.
///
/// Rejects empty paths, absolute paths, `~` expansion, `..` traversal, and
/// backslash separators. Redundant `./` segments are stripped.
pub fn normalize_rel_path(path: &str) -> CodeforgeResult<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(CodeforgeError::UnsafePath("<empty>".into()));
    }
    if trimmed.starts_with('/') || trimmed.starts_with('~') || trimmed.contains('\\') {
        return Err(CodeforgeError::UnsafePath(trimmed.to_string()));
    }
    let mut parts = Vec::new();
    for part in trimmed.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(CodeforgeError::UnsafePath(trimmed.to_string())),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(CodeforgeError::UnsafePath(trimmed.to_string()));
    }
    Ok(parts.join("/"))
}

/// Whether `path` equals `base` or sits underneath it, component-wise.
pub fn path_within(path: &str, base: &str) -> bool {
    let path_parts: Vec<&str> = path.split('/').collect();
    let base_parts: Vec<&str> = base.split('/').filter(|p| !p.is_empty()).collect();
    if base_parts.len() > path_parts.len() {
        return false;
    }
    path_parts
        .iter()
        .zip(base_parts.iter())
        .all(|(a, b)| a == b)
}

/// Enforce an `allowed_paths` restriction: when the list is non-empty, the
/// path must match one entry or sit under one entry treated as a prefix.
pub fn assert_allowed(path: &str, allowed_paths: &[String]) -> CodeforgeResult<()> {
    if allowed_paths.is_empty() {
        return Ok(());
    }
    let permitted = allowed_paths
        .iter()
        .filter(|p| !p.trim().is_empty())
        .any(|base| path_within(path, base.trim()));
    if permitted {
        Ok(())
    } else {
        Err(CodeforgeError::UnsafePath(format!(
            "{path} not within allowed paths"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_relative_paths() {
        assert_eq!(normalize_rel_path("src/main.py").unwrap(), "src/main.py");
        assert_eq!(normalize_rel_path("./a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(normalize_rel_path("a//b").unwrap(), "a/b");
    }

    #[test]
    fn rejects_absolute_and_traversal() {
        assert!(normalize_rel_path("/etc/passwd").is_err());
        assert!(normalize_rel_path("../secrets").is_err());
        assert!(normalize_rel_path("a/../../b").is_err());
        assert!(normalize_rel_path("~/x").is_err());
        assert!(normalize_rel_path("").is_err());
        assert!(normalize_rel_path("a\\b").is_err());
    }

    #[test]
    fn allowed_paths_prefix_semantics() {
        let allowed = vec!["src".to_string(), "README.md".to_string()];
        assert!(assert_allowed("src/lib.py", &allowed).is_ok());
        assert!(assert_allowed("README.md", &allowed).is_ok());
        assert!(assert_allowed("docs/guide.md", &allowed).is_err());
        // Empty list means unrestricted.
        assert!(assert_allowed("anything.txt", &[]).is_ok());
    }

    #[test]
    fn prefix_match_is_component_wise() {
        let allowed = vec!["src".to_string()];
        assert!(assert_allowed("srcfoo/lib.py", &allowed).is_err());
    }
}
