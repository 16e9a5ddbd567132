//! Fixed-window request rate limiting per `(owner, scope)`.

use codeforge_core::{CodeforgeError, CodeforgeResult};
use codeforge_store::TaskStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Rate-limit scopes with separate limits.
pub mod scope {
    /// Task creation.
    pub const CREATE_TASK: &str = "create_task";
    /// Review re-runs.
    pub const RERUN_REVIEW: &str = "rerun_review";
    /// Archive downloads.
    pub const DOWNLOAD: &str = "download";
}

struct WindowEntry {
    window_start: u64,
    count: u32,
}

/// In-memory fixed-window limiter. Advisory: the persisted window in the
/// store is authoritative, and both must pass.
pub struct RateLimiter {
    window_seconds: u64,
    entries: Mutex<HashMap<(String, String), WindowEntry>>,
}

impl RateLimiter {
    /// Limiter with a 60-second window.
    pub fn new() -> Self {
        Self::with_window(60)
    }

    /// Limiter with an explicit window, for tests.
    pub fn with_window(window_seconds: u64) -> Self {
        Self {
            window_seconds: window_seconds.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request. Returns `(allowed, retry_after_seconds)`.
    pub fn check(&self, key_hash: &str, scope: &str, limit: u32) -> (bool, u64) {
        if limit == 0 {
            return (true, 0);
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let window_start = now / self.window_seconds * self.window_seconds;
        let retry_after = (window_start + self.window_seconds - now).max(1);

        let mut entries = self.entries.lock();
        let entry = entries
            .entry((key_hash.to_string(), scope.to_string()))
            .or_insert(WindowEntry {
                window_start,
                count: 0,
            });
        if entry.window_start != window_start {
            entry.window_start = window_start;
            entry.count = 0;
        }
        if entry.count >= limit {
            return (false, retry_after);
        }
        entry.count += 1;
        (true, retry_after)
    }

    /// Drop windows older than the current one.
    pub fn cleanup(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let window_start = now / self.window_seconds * self.window_seconds;
        self.entries
            .lock()
            .retain(|_, entry| entry.window_start >= window_start);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Enforce one request against both the advisory limiter and the store's
/// authoritative window. Fails with `RateLimited { retry_after }`.
pub async fn enforce_rate_limit(
    limiter: &RateLimiter,
    store: &dyn TaskStore,
    key_hash: &str,
    scope: &str,
    limit: u32,
) -> CodeforgeResult<()> {
    if limit == 0 {
        return Ok(());
    }
    let (mut allowed, mut retry_after) = limiter.check(key_hash, scope, limit);
    let (store_allowed, store_retry_after) =
        store.check_rate_limit(key_hash, scope, limit, 60).await?;
    if !store_allowed {
        allowed = false;
        retry_after = store_retry_after;
    }
    if allowed {
        Ok(())
    } else {
        Err(CodeforgeError::RateLimited { retry_after })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeforge_store::MemoryStore;

    #[test]
    fn window_blocks_after_limit() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            assert!(limiter.check("k", scope::CREATE_TASK, 3).0);
        }
        let (allowed, retry_after) = limiter.check("k", scope::CREATE_TASK, 3);
        assert!(!allowed);
        assert!(retry_after >= 1 && retry_after <= 60);
    }

    #[test]
    fn scopes_and_keys_are_independent() {
        let limiter = RateLimiter::new();
        assert!(limiter.check("k", scope::CREATE_TASK, 1).0);
        assert!(!limiter.check("k", scope::CREATE_TASK, 1).0);
        assert!(limiter.check("k", scope::DOWNLOAD, 1).0);
        assert!(limiter.check("other", scope::CREATE_TASK, 1).0);
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let limiter = RateLimiter::new();
        for _ in 0..100 {
            assert!(limiter.check("k", scope::CREATE_TASK, 0).0);
        }
    }

    #[tokio::test]
    async fn both_limiters_must_pass() {
        let limiter = RateLimiter::new();
        let store = MemoryStore::new();

        // First request passes both; the second is refused by both windows.
        enforce_rate_limit(&limiter, &store, "k", scope::RERUN_REVIEW, 1)
            .await
            .unwrap();
        let err = enforce_rate_limit(&limiter, &store, "k", scope::RERUN_REVIEW, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CodeforgeError::RateLimited { .. }));
    }
}
