//! Observation interface for orchestrator progress.
//!
//! Persistence and the transport layer implement this to mirror progress
//! into task rows, events, and stream subscribers. Hooks are awaited in
//! declaration order, one at a time, so observers see the true execution
//! order.

use async_trait::async_trait;
use codeforge_core::{ClarificationQuestion, Stage};
use serde_json::Value;

/// Callbacks emitted by the orchestrator while a task runs.
///
/// Every method has a no-op default so observers implement only what they
/// consume.
#[async_trait]
pub trait OrchestratorObserver: Send + Sync {
    /// A stage began.
    async fn stage_started(&self, _stage: Stage) {}

    /// The researcher finished; payload is the requirements document.
    async fn research_complete(&self, _result: &Value) {}

    /// The designer finished; payload is the architecture document.
    async fn design_complete(&self, _result: &Value) {}

    /// One coder pass finished; payload describes the written files.
    async fn coder_finished(&self, _result: &Value) {}

    /// A review pass began. `kind` is `iteration` or `final`.
    async fn review_started(&self, _kind: &str, _iteration: Option<u64>) {}

    /// A review pass finished.
    async fn review_finished(&self, _kind: &str, _iteration: Option<u64>, _result: &Value) {}

    /// A review report is available; payload is the full report.
    async fn review_result(&self, _kind: &str, _result: &Value) {}

    /// An LLM call's usage report.
    async fn llm_usage(&self, _usage: &Value) {}

    /// An LLM call failed.
    async fn llm_error(&self, _error: &str) {}

    /// A stage failed with a terminal reason.
    async fn stage_failed(&self, _stage: Stage, _reason: &str) {}

    /// The task must pause for user answers.
    async fn clarification_requested(
        &self,
        _questions: &[ClarificationQuestion],
        _resume_from: Stage,
    ) {
    }
}

/// Observer that ignores everything.
pub struct NullObserver;

#[async_trait]
impl OrchestratorObserver for NullObserver {}
