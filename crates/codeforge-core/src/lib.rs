//! Core types for the codeforge engine.
//!
//! This crate provides the foundational types shared across all codeforge
//! crates: the error taxonomy, the per-task [`Container`] aggregate with its
//! files/artifacts/history/metadata, event and task-row projections, the
//! codex and template catalogs, and the engine configuration.
//!
//! # Main types
//!
//! - [`CodeforgeError`] / [`CodeforgeResult`] — unified error enum and alias.
//! - [`Container`] — the per-task single source of truth.
//! - [`Artifact`] / [`ArtifactKind`] — typed, append-only role output.
//! - [`TaskEvent`] / [`EventKind`] — the observable event stream.
//! - [`TaskRow`] / [`TaskStatus`] — the persistence-facing task projection.
//! - [`Codex`] — role rules and workflow parameters.
//! - [`EngineConfig`] — limits and paths resolved from the environment.

pub mod artifact;
pub mod codex;
pub mod config;
pub mod container;
pub mod docs;
pub mod error;
pub mod event;
pub mod gate;
pub mod paths;
pub mod task;
pub mod template;

pub use artifact::{Artifact, ArtifactKind, FileContent, FileRecord};
pub use codex::Codex;
pub use config::EngineConfig;
pub use container::{
    Container, ContainerMetadata, FileSink, HistoryEntry, LlmUsageRecord, LlmUsageSummary,
    LlmUsageUpdate, ProjectState, RoleKind, StageUsage,
};
pub use docs::{
    ArchitectureDoc, ClarificationQuestion, ComponentSpec, RequirementItem, RequirementsDoc,
    ReviewSummary, UsageReport,
};
pub use error::{CodeforgeError, CodeforgeResult};
pub use event::{EventKind, TaskEvent};
pub use gate::{UnlimitedGate, UsageGate};
pub use paths::{assert_allowed, normalize_rel_path, path_within};
pub use task::{missing_required_answers, Stage, TaskPatch, TaskRow, TaskStatus};
pub use template::{TemplateCatalog, TemplateInfo, TemplateManifest};

use sha2::{Digest, Sha256};

/// Hash an API key into the opaque owner identity used everywhere else.
pub fn owner_key_hash(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}
