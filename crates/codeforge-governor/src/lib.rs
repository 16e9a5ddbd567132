//! The governor: the queue, the concurrency semaphore, the request rate
//! limiter, and the daily quota gate in front of the orchestrator.

pub mod governor;
pub mod quota;
pub mod rate_limit;

pub use governor::{QueueItem, TaskGovernor, TaskRunner};
pub use quota::{DailyQuotaGate, QuotaLimits};
pub use rate_limit::{enforce_rate_limit, scope, RateLimiter};
