//! Starter templates: named file trees loaded into a fresh container.

use crate::artifact::FileContent;
use crate::error::{CodeforgeError, CodeforgeResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Template ids with engine-specific behavior (layout sanitization and
/// review checks).
pub const TEMPLATE_PYTHON_CLI: &str = "python_cli";
/// FastAPI root-layout template id.
pub const TEMPLATE_PYTHON_FASTAPI: &str = "python_fastapi";

const MANIFEST_FILE: &str = "template.toml";

/// Optional manifest carried next to a template's files.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TemplateManifest {
    /// Template id; defaults to the directory name.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Short description.
    #[serde(default)]
    pub description: Option<String>,
}

/// A resolved template: manifest, files, and content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateInfo {
    /// Template id.
    pub template_id: String,
    /// Hex-encoded SHA-256 over the sorted file tree.
    pub hash: String,
    /// Parsed manifest, default when the template has none.
    pub manifest: TemplateManifest,
    /// Template files by relative path.
    pub files: BTreeMap<String, FileContent>,
}

/// Read-only catalog of the templates directory.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    root: Option<PathBuf>,
}

impl TemplateCatalog {
    /// Catalog rooted at `TEMPLATES_DIR`; `None` disables templates.
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    /// Resolve one template by id, loading its files and hash.
    pub fn resolve(&self, template_id: &str) -> CodeforgeResult<Option<TemplateInfo>> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        // Template ids are directory names; keep them to a single component.
        if template_id.is_empty() || template_id.contains(['/', '\\', '.']) {
            return Err(CodeforgeError::UnsafePath(template_id.to_string()));
        }
        let dir = root.join(template_id);
        if !dir.is_dir() {
            return Ok(None);
        }
        let manifest = load_manifest(&dir)?;
        let files = collect_files(&dir)?;
        let hash = compute_tree_hash(&files);
        Ok(Some(TemplateInfo {
            template_id: manifest
                .id
                .clone()
                .unwrap_or_else(|| template_id.to_string()),
            hash,
            manifest,
            files,
        }))
    }

    /// List available template ids with their manifests.
    pub fn list(&self) -> CodeforgeResult<Vec<(String, TemplateManifest)>> {
        let Some(root) = &self.root else {
            return Ok(Vec::new());
        };
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut templates = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let manifest = load_manifest(&entry.path())?;
            templates.push((name, manifest));
        }
        templates.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(templates)
    }
}

fn load_manifest(dir: &Path) -> CodeforgeResult<TemplateManifest> {
    let path = dir.join(MANIFEST_FILE);
    if !path.is_file() {
        return Ok(TemplateManifest::default());
    }
    let raw = std::fs::read_to_string(path)?;
    toml::from_str(&raw).map_err(|e| CodeforgeError::Config(format!("template manifest: {e}")))
}

fn collect_files(dir: &Path) -> CodeforgeResult<BTreeMap<String, FileContent>> {
    let mut files = BTreeMap::new();
    collect_into(dir, dir, &mut files)?;
    Ok(files)
}

fn collect_into(
    root: &Path,
    dir: &Path,
    files: &mut BTreeMap<String, FileContent>,
) -> CodeforgeResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_into(root, &path, files)?;
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .map_err(|_| CodeforgeError::UnsafePath(path.display().to_string()))?;
        let relative = relative.to_string_lossy().replace('\\', "/");
        if relative == MANIFEST_FILE {
            continue;
        }
        let data = std::fs::read(&path)?;
        files.insert(relative, FileContent::from_bytes(data));
    }
    Ok(())
}

/// SHA-256 over `(path, sha256(content))` pairs in sorted path order.
pub fn compute_tree_hash(files: &BTreeMap<String, FileContent>) -> String {
    let mut hasher = Sha256::new();
    for (path, content) in files {
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update(content.sha256_hex().as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_template(root: &Path, id: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(dir.join("tests")).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILE),
            "id = \"python_cli\"\nname = \"Python CLI\"\n",
        )
        .unwrap();
        std::fs::write(dir.join("cli.py"), "print('hi')\n").unwrap();
        std::fs::write(dir.join("tests/test_cli.py"), "def test_ok():\n    pass\n").unwrap();
    }

    #[test]
    fn resolves_template_with_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        write_template(tmp.path(), "python_cli");
        let catalog = TemplateCatalog::new(Some(tmp.path().to_path_buf()));
        let info = catalog.resolve("python_cli").unwrap().unwrap();
        assert_eq!(info.template_id, "python_cli");
        assert_eq!(info.files.len(), 2);
        assert!(info.files.contains_key("tests/test_cli.py"));
        assert!(!info.files.contains_key(MANIFEST_FILE));
        assert_eq!(info.hash.len(), 64);
    }

    #[test]
    fn missing_template_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = TemplateCatalog::new(Some(tmp.path().to_path_buf()));
        assert!(catalog.resolve("nope").unwrap().is_none());
    }

    #[test]
    fn rejects_traversal_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = TemplateCatalog::new(Some(tmp.path().to_path_buf()));
        assert!(catalog.resolve("../etc").is_err());
    }

    #[test]
    fn tree_hash_changes_with_content() {
        let mut files: BTreeMap<String, FileContent> = BTreeMap::new();
        files.insert("a.py".into(), "one".into());
        let first = compute_tree_hash(&files);
        files.insert("a.py".into(), "two".into());
        assert_ne!(first, compute_tree_hash(&files));
    }
}
