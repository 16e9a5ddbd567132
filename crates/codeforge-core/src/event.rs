//! Append-only task events observed by persistence and stream subscribers.

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Event type. Wire strings are kept exactly as consumers know them, which
/// is why the casing is mixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A task row was created.
    TaskCreated,
    /// A pipeline stage began.
    StageStarted,
    /// An artifact was recorded.
    ArtifactAdded,
    /// Progress changed.
    ProgressUpdate,
    /// A review pass began.
    ReviewStarted,
    /// A review pass ended.
    ReviewFinished,
    /// A review report is available.
    ReviewResult,
    /// An LLM call's usage was recorded.
    LlmUsage,
    /// An LLM call failed.
    LlmError,
    /// A stage failed with a reason.
    StageFailed,
    /// The task paused waiting for user answers.
    ClarificationRequested,
    /// User answers arrived.
    ClarificationReceived,
    /// A paused task was re-enqueued.
    TaskResumed,
    /// A sandboxed command is about to run.
    CommandStarted,
    /// A sandboxed command finished (or was blocked).
    CommandFinished,
    /// The task reached a terminal success state.
    TaskCompleted,
    /// The task reached a terminal failure state.
    TaskFailed,
    /// The codex document was loaded.
    CodexLoaded,
    /// Any type this build does not recognize.
    Other(String),
}

impl EventKind {
    /// Wire string for the event type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::TaskCreated => "TaskCreated",
            Self::StageStarted => "StageStarted",
            Self::ArtifactAdded => "ArtifactAdded",
            Self::ProgressUpdate => "ProgressUpdate",
            Self::ReviewStarted => "review_started",
            Self::ReviewFinished => "review_finished",
            Self::ReviewResult => "ReviewResult",
            Self::LlmUsage => "llm_usage",
            Self::LlmError => "llm_error",
            Self::StageFailed => "stage_failed",
            Self::ClarificationRequested => "clarification_requested",
            Self::ClarificationReceived => "clarification_received",
            Self::TaskResumed => "task_resumed",
            Self::CommandStarted => "command_started",
            Self::CommandFinished => "command_finished",
            Self::TaskCompleted => "TaskCompleted",
            Self::TaskFailed => "TaskFailed",
            Self::CodexLoaded => "codex_loaded",
            Self::Other(kind) => kind,
        }
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        match value {
            "TaskCreated" => Self::TaskCreated,
            "StageStarted" => Self::StageStarted,
            "ArtifactAdded" => Self::ArtifactAdded,
            "ProgressUpdate" => Self::ProgressUpdate,
            "review_started" => Self::ReviewStarted,
            "review_finished" => Self::ReviewFinished,
            "ReviewResult" => Self::ReviewResult,
            "llm_usage" => Self::LlmUsage,
            "llm_error" => Self::LlmError,
            "stage_failed" => Self::StageFailed,
            "clarification_requested" => Self::ClarificationRequested,
            "clarification_received" => Self::ClarificationReceived,
            "task_resumed" => Self::TaskResumed,
            "command_started" => Self::CommandStarted,
            "command_finished" => Self::CommandFinished,
            "TaskCompleted" => Self::TaskCompleted,
            "TaskFailed" => Self::TaskFailed,
            "codex_loaded" => Self::CodexLoaded,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KindVisitor;

        impl Visitor<'_> for KindVisitor {
            type Value = EventKind;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an event type string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Ok(EventKind::from(value))
            }
        }

        deserializer.deserialize_str(KindVisitor)
    }
}

/// One persisted event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Event identifier; the idempotence key together with `task_id`.
    pub id: Uuid,
    /// Task the event belongs to.
    pub task_id: String,
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Structured payload.
    pub payload: Value,
    /// Append timestamp.
    pub created_at: DateTime<Utc>,
}

impl TaskEvent {
    /// Build an event with a fresh id and the current timestamp.
    pub fn new(task_id: impl Into<String>, kind: EventKind, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            kind,
            payload,
            created_at: Utc::now(),
        }
    }
}
