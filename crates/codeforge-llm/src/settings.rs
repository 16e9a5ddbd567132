//! LLM settings resolved from environment variables.

use serde::{Deserialize, Serialize};

/// Provider selection plus generation defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Provider name (`mock` or `openai`).
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Upstream API key, required for real providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Completion token ceiling.
    pub max_tokens: u32,
    /// Request timeout in seconds.
    pub timeout_seconds: f64,
    /// Sampling temperature.
    pub temperature: f32,
    /// Retry attempts for retryable transport errors.
    pub max_retries: u32,
    /// Optional base URL override for OpenAI-compatible servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            max_tokens: 1024,
            timeout_seconds: 30.0,
            temperature: 0.2,
            max_retries: 2,
            base_url: None,
        }
    }
}

impl LlmSettings {
    /// Resolve settings from `LLM_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            provider: env_str("LLM_PROVIDER")
                .map(|v| v.to_ascii_lowercase())
                .unwrap_or(defaults.provider),
            model: env_str("LLM_MODEL").unwrap_or(defaults.model),
            api_key: env_str("LLM_API_KEY"),
            max_tokens: env_parse("LLM_MAX_TOKENS").unwrap_or(defaults.max_tokens),
            timeout_seconds: env_parse("LLM_TIMEOUT_SECONDS").unwrap_or(defaults.timeout_seconds),
            temperature: env_parse("LLM_TEMPERATURE").unwrap_or(defaults.temperature),
            max_retries: env_parse("LLM_MAX_RETRIES_PER_STEP").unwrap_or(defaults.max_retries),
            base_url: env_str("LLM_BASE_URL"),
        }
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_str(name).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_mock_provider() {
        let settings = LlmSettings::default();
        assert_eq!(settings.provider, "mock");
        assert_eq!(settings.max_tokens, 1024);
        assert_eq!(settings.max_retries, 2);
    }
}
