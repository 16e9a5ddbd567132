//! Typed artifacts and file payloads stored inside a [`Container`].
//!
//! [`Container`]: crate::container::Container

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A file body: UTF-8 text or opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum FileContent {
    /// UTF-8 text content.
    Text(String),
    /// Opaque binary content, base64 in serialized form.
    Binary(#[serde(with = "b64")] Vec<u8>),
}

impl FileContent {
    /// Decode raw bytes, preferring text when they are valid UTF-8.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        match String::from_utf8(data) {
            Ok(text) => Self::Text(text),
            Err(err) => Self::Binary(err.into_bytes()),
        }
    }

    /// The text content, when this is a text file.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    /// Raw bytes of the content.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }

    /// Content size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.as_bytes().len() as u64
    }

    /// Whether the content is opaque binary.
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Hex-encoded SHA-256 of the content.
    pub fn sha256_hex(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl From<String> for FileContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for FileContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Content-addressed record of one file, used for baselines and snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Hex-encoded SHA-256 of the content.
    pub sha256: String,
    /// Content size in bytes.
    pub size_bytes: u64,
    /// The content itself; omitted for oversized or binary entries in
    /// persistence-facing snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<FileContent>,
    /// Whether the content is opaque binary.
    #[serde(default)]
    pub is_binary: bool,
}

impl FileRecord {
    /// Capture a record, keeping the content inline.
    pub fn capture(content: &FileContent) -> Self {
        Self {
            sha256: content.sha256_hex(),
            size_bytes: content.size_bytes(),
            content: Some(content.clone()),
            is_binary: content.is_binary(),
        }
    }

    /// Capture records for a whole file map.
    pub fn capture_all(files: &BTreeMap<String, FileContent>) -> BTreeMap<String, FileRecord> {
        files
            .iter()
            .map(|(path, content)| (path.clone(), Self::capture(content)))
            .collect()
    }
}

/// Kind of artifact produced by a role.
///
/// Recognized kinds are first-class variants; unknown kinds round-trip via
/// [`ArtifactKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactKind {
    /// Structured requirements from the researcher.
    Requirements,
    /// Architecture document from the designer.
    Architecture,
    /// Per-file code record from the coder.
    Code,
    /// Review report from the reviewer.
    ReviewReport,
    /// Baseline-vs-final diff payload.
    PatchDiff,
    /// Git export bundle payload.
    GitExport,
    /// Reproducibility manifest.
    ReproManifest,
    /// Per-call LLM usage report.
    UsageReport,
    /// Questions awaiting user answers.
    ClarificationQuestions,
    /// Full record of one sandboxed command run.
    CommandLog,
    /// Coder's plan notes for the iteration.
    ImplementationPlan,
    /// Coder's summary of updated files.
    CodeSummary,
    /// Researcher's summary document.
    ResearchSummary,
    /// Preserved preview of an unparseable LLM response.
    LlmInvalidJson,
    /// Any kind this build does not recognize.
    Other(String),
}

impl ArtifactKind {
    /// Wire string for the kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Requirements => "requirements",
            Self::Architecture => "architecture",
            Self::Code => "code",
            Self::ReviewReport => "review_report",
            Self::PatchDiff => "patch_diff",
            Self::GitExport => "git_export",
            Self::ReproManifest => "repro_manifest",
            Self::UsageReport => "usage_report",
            Self::ClarificationQuestions => "clarification_questions",
            Self::CommandLog => "command_log",
            Self::ImplementationPlan => "implementation_plan",
            Self::CodeSummary => "code_summary",
            Self::ResearchSummary => "research_summary",
            Self::LlmInvalidJson => "llm_invalid_json",
            Self::Other(kind) => kind,
        }
    }
}

impl From<&str> for ArtifactKind {
    fn from(value: &str) -> Self {
        match value {
            "requirements" => Self::Requirements,
            "architecture" => Self::Architecture,
            "code" => Self::Code,
            "review_report" => Self::ReviewReport,
            "patch_diff" => Self::PatchDiff,
            "git_export" => Self::GitExport,
            "repro_manifest" => Self::ReproManifest,
            "usage_report" => Self::UsageReport,
            "clarification_questions" => Self::ClarificationQuestions,
            "command_log" => Self::CommandLog,
            "implementation_plan" => Self::ImplementationPlan,
            "code_summary" => Self::CodeSummary,
            "research_summary" => Self::ResearchSummary,
            "llm_invalid_json" => Self::LlmInvalidJson,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ArtifactKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ArtifactKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KindVisitor;

        impl Visitor<'_> for KindVisitor {
            type Value = ArtifactKind;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an artifact kind string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Ok(ArtifactKind::from(value))
            }
        }

        deserializer.deserialize_str(KindVisitor)
    }
}

/// A typed, immutable document produced by a role. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Stable artifact identifier.
    pub id: Uuid,
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Structured payload.
    pub content: Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Role or subsystem that produced the artifact.
    pub created_by: String,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Artifact {
    /// Create a new artifact with a fresh id and the current timestamp.
    pub fn new(kind: ArtifactKind, content: Value, created_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            content,
            created_at: Utc::now(),
            created_by: created_by.into(),
            metadata: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_content_text_roundtrip() {
        let content = FileContent::Text("hello".into());
        let json = serde_json::to_string(&content).unwrap();
        let parsed: FileContent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, content);
        assert_eq!(content.size_bytes(), 5);
        assert!(!content.is_binary());
    }

    #[test]
    fn file_content_binary_roundtrip() {
        let content = FileContent::Binary(vec![0, 159, 146, 150]);
        let json = serde_json::to_string(&content).unwrap();
        assert!(json.contains("binary"));
        let parsed: FileContent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, content);
        assert!(content.is_binary());
    }

    #[test]
    fn from_bytes_prefers_text() {
        assert!(!FileContent::from_bytes(b"plain".to_vec()).is_binary());
        assert!(FileContent::from_bytes(vec![0xff, 0xfe]).is_binary());
    }

    #[test]
    fn artifact_kind_string_roundtrip() {
        for kind in [
            ArtifactKind::Requirements,
            ArtifactKind::ReviewReport,
            ArtifactKind::ClarificationQuestions,
            ArtifactKind::Other("future_kind".into()),
        ] {
            let back = ArtifactKind::from(kind.as_str());
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn artifact_kind_as_map_key() {
        let mut map: BTreeMap<ArtifactKind, u32> = BTreeMap::new();
        map.insert(ArtifactKind::Code, 2);
        map.insert(ArtifactKind::Other("x".into()), 1);
        let json = serde_json::to_string(&map).unwrap();
        let parsed: BTreeMap<ArtifactKind, u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, map);
    }

    #[test]
    fn file_record_captures_hash() {
        let content = FileContent::Text("abc".into());
        let record = FileRecord::capture(&content);
        assert_eq!(record.size_bytes, 3);
        assert_eq!(
            record.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
