//! Daily per-owner usage quotas over the persisted counters.

use async_trait::async_trait;
use codeforge_core::{CodeforgeError, CodeforgeResult, UsageGate};
use codeforge_store::TaskStore;
use std::sync::Arc;
use tracing::warn;

/// Daily ceilings. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaLimits {
    /// Tokens (in + out) per owner per UTC day.
    pub max_tokens_per_day: u64,
    /// Sandboxed command runs per owner per UTC day.
    pub max_command_runs_per_day: u64,
}

/// [`UsageGate`] backed by the store's daily usage counters.
pub struct DailyQuotaGate {
    store: Arc<dyn TaskStore>,
    limits: QuotaLimits,
}

impl DailyQuotaGate {
    /// Gate over `store` with the given limits.
    pub fn new(store: Arc<dyn TaskStore>, limits: QuotaLimits) -> Self {
        Self { store, limits }
    }

    /// Pre-flight check used before admitting a task at all.
    pub async fn quota_exceeded(&self, owner_key_hash: Option<&str>) -> CodeforgeResult<bool> {
        let Some(owner) = owner_key_hash else {
            return Ok(false);
        };
        if self.limits.max_tokens_per_day == 0 && self.limits.max_command_runs_per_day == 0 {
            return Ok(false);
        }
        let usage = self.store.usage_for_key(owner).await?;
        if self.limits.max_tokens_per_day > 0
            && usage.tokens_in + usage.tokens_out >= self.limits.max_tokens_per_day
        {
            return Ok(true);
        }
        if self.limits.max_command_runs_per_day > 0
            && usage.command_runs >= self.limits.max_command_runs_per_day
        {
            return Ok(true);
        }
        Ok(false)
    }
}

#[async_trait]
impl UsageGate for DailyQuotaGate {
    async fn check_llm_budget(&self, owner_key_hash: Option<&str>) -> CodeforgeResult<()> {
        let Some(owner) = owner_key_hash else {
            return Ok(());
        };
        if self.limits.max_tokens_per_day == 0 {
            return Ok(());
        }
        let usage = self.store.usage_for_key(owner).await?;
        if usage.tokens_in + usage.tokens_out >= self.limits.max_tokens_per_day {
            warn!(owner, "daily token quota exhausted");
            return Err(CodeforgeError::BudgetExceeded(
                "max_tokens_per_day exceeded".into(),
            ));
        }
        Ok(())
    }

    async fn check_command_budget(&self, owner_key_hash: Option<&str>) -> CodeforgeResult<()> {
        let Some(owner) = owner_key_hash else {
            return Ok(());
        };
        if self.limits.max_command_runs_per_day == 0 {
            return Ok(());
        }
        let usage = self.store.usage_for_key(owner).await?;
        if usage.command_runs >= self.limits.max_command_runs_per_day {
            warn!(owner, "daily command-run quota exhausted");
            return Err(CodeforgeError::BudgetExceeded(
                "max_command_runs_per_day exceeded".into(),
            ));
        }
        Ok(())
    }

    async fn record_tokens(&self, owner_key_hash: Option<&str>, tokens_in: u64, tokens_out: u64) {
        let Some(owner) = owner_key_hash else {
            return;
        };
        if let Err(err) = self.store.record_usage(owner, tokens_in, tokens_out, 0).await {
            warn!(owner, error = %err, "failed to record token usage");
        }
    }

    async fn record_command_run(&self, owner_key_hash: Option<&str>) {
        let Some(owner) = owner_key_hash else {
            return;
        };
        if let Err(err) = self.store.record_usage(owner, 0, 0, 1).await {
            warn!(owner, error = %err, "failed to record command run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeforge_store::MemoryStore;

    fn gate(limits: QuotaLimits) -> DailyQuotaGate {
        DailyQuotaGate::new(Arc::new(MemoryStore::new()), limits)
    }

    #[tokio::test]
    async fn token_quota_blocks_at_ceiling() {
        let gate = gate(QuotaLimits {
            max_tokens_per_day: 100,
            max_command_runs_per_day: 0,
        });
        gate.record_tokens(Some("owner"), 60, 39).await;
        gate.check_llm_budget(Some("owner")).await.unwrap();
        gate.record_tokens(Some("owner"), 1, 0).await;
        let err = gate.check_llm_budget(Some("owner")).await.unwrap_err();
        assert!(matches!(err, CodeforgeError::BudgetExceeded(_)));
        assert!(gate.quota_exceeded(Some("owner")).await.unwrap());
    }

    #[tokio::test]
    async fn command_quota_blocks_at_ceiling() {
        let gate = gate(QuotaLimits {
            max_tokens_per_day: 0,
            max_command_runs_per_day: 2,
        });
        gate.record_command_run(Some("owner")).await;
        gate.check_command_budget(Some("owner")).await.unwrap();
        gate.record_command_run(Some("owner")).await;
        assert!(gate.check_command_budget(Some("owner")).await.is_err());
    }

    #[tokio::test]
    async fn anonymous_owners_are_not_limited() {
        let gate = gate(QuotaLimits {
            max_tokens_per_day: 1,
            max_command_runs_per_day: 1,
        });
        gate.check_llm_budget(None).await.unwrap();
        gate.check_command_budget(None).await.unwrap();
        assert!(!gate.quota_exceeded(None).await.unwrap());
    }
}
