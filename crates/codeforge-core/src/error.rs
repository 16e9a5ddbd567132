use thiserror::Error;

/// A convenience `Result` alias using [`CodeforgeError`].
pub type CodeforgeResult<T> = Result<T, CodeforgeError>;

/// Top-level error type for the codeforge engine.
///
/// Each variant corresponds to a domain failure kind. Recoverable kinds
/// (contract violations, parse failures, truncation) are handled inside the
/// roles; terminal kinds flip the task to `failed`/`error` with the carried
/// reason.
#[derive(Error, Debug)]
pub enum CodeforgeError {
    /// A file path was absolute, escaped the project root, or was empty.
    #[error("unsafe path rejected: {0}")]
    UnsafePath(String),

    /// The LLM response failed the output contract for the task mode.
    #[error("contract violation: {}", violations.join("; "))]
    ContractViolation {
        /// Every violation collected by the validator.
        violations: Vec<String>,
    },

    /// No JSON payload could be extracted from the LLM response.
    #[error("llm_invalid_json: {message}")]
    ResponseParse {
        /// Description of the underlying parse failure.
        message: String,
        /// Response text, truncated for event payloads.
        preview: String,
    },

    /// The provider stopped at the token limit and the doubled retry
    /// also came back truncated.
    #[error("llm output truncated at max_tokens")]
    OutputTruncated,

    /// A transport or upstream error from the LLM provider.
    #[error("llm provider error: {message}")]
    Provider {
        /// Upstream or transport error description.
        message: String,
        /// Whether the gateway may retry with backoff.
        retryable: bool,
    },

    /// A per-task or per-day ceiling was hit. Terminal.
    #[error("{0}")]
    BudgetExceeded(String),

    /// A fixed-window rate limit refused the request.
    #[error("rate_limited, retry after {retry_after}s")]
    RateLimited {
        /// Seconds until the current window expires.
        retry_after: u64,
    },

    /// The owner's daily quota is exhausted. Terminal.
    #[error("quota_exceeded")]
    QuotaExceeded,

    /// An error from the persistence layer.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// An error from the orchestrator state machine.
    #[error("orchestrator error: {0}")]
    Orchestrator(String),

    /// An error in configuration parsing or validation.
    #[error("config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodeforgeError {
    /// Whether the gateway may retry this error with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider { retryable: true, .. })
    }

    /// Short machine-readable reason used for `stage_failed` payloads and
    /// the task row's `failure_reason` column.
    pub fn failure_reason(&self) -> String {
        match self {
            Self::ContractViolation { .. } | Self::ResponseParse { .. } => {
                "llm_invalid_json".to_string()
            }
            Self::BudgetExceeded(reason) | Self::Orchestrator(reason) => reason.clone(),
            Self::QuotaExceeded => "quota_exceeded".to_string(),
            other => other.to_string(),
        }
    }
}
