//! Daily-quota capability handed to the roles.
//!
//! The governor implements this over the persistence layer; tests and the
//! inline CLI path use [`UnlimitedGate`].

use crate::error::CodeforgeResult;
use async_trait::async_trait;

/// Pre-flight checks and post-hoc recording for per-owner daily usage.
#[async_trait]
pub trait UsageGate: Send + Sync {
    /// Fail with `BudgetExceeded` when the owner's daily token quota is
    /// already spent. Called before each coder LLM call.
    async fn check_llm_budget(&self, owner_key_hash: Option<&str>) -> CodeforgeResult<()>;

    /// Fail with `BudgetExceeded` when the owner's daily command-run quota
    /// is already spent. Called before each sandboxed command.
    async fn check_command_budget(&self, owner_key_hash: Option<&str>) -> CodeforgeResult<()>;

    /// Record tokens consumed by one LLM call.
    async fn record_tokens(&self, owner_key_hash: Option<&str>, tokens_in: u64, tokens_out: u64);

    /// Record one sandboxed command run.
    async fn record_command_run(&self, owner_key_hash: Option<&str>);
}

/// Gate that never refuses and records nothing.
pub struct UnlimitedGate;

#[async_trait]
impl UsageGate for UnlimitedGate {
    async fn check_llm_budget(&self, _owner_key_hash: Option<&str>) -> CodeforgeResult<()> {
        Ok(())
    }

    async fn check_command_budget(&self, _owner_key_hash: Option<&str>) -> CodeforgeResult<()> {
        Ok(())
    }

    async fn record_tokens(&self, _owner_key_hash: Option<&str>, _tokens_in: u64, _tokens_out: u64) {
    }

    async fn record_command_run(&self, _owner_key_hash: Option<&str>) {}
}
