//! The gateway wraps a provider with retry, backoff, and truncation
//! recovery, and is the only way roles reach the LLM.

use crate::mock::MockProvider;
use crate::openai::OpenAiProvider;
use crate::provider::{
    ChatMessage, ChatRequest, ChatResponse, FinishReason, LlmProvider, ResponseFormat,
};
use crate::settings::LlmSettings;
use codeforge_core::{CodeforgeError, CodeforgeResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Per-call options layered over the settings defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateOptions {
    /// Require a single JSON object from the provider.
    pub require_json: bool,
    /// Override the settings' `max_tokens` for this call.
    pub max_tokens_override: Option<u32>,
}

/// Provider plus retry policy.
#[derive(Clone)]
pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    settings: LlmSettings,
}

impl LlmGateway {
    /// Wrap an explicit provider (tests inject scripted providers here).
    pub fn new(provider: Arc<dyn LlmProvider>, settings: LlmSettings) -> Self {
        Self { provider, settings }
    }

    /// Build the provider selected by the settings: `openai` when
    /// configured, the deterministic mock otherwise.
    pub fn from_settings(settings: LlmSettings) -> CodeforgeResult<Self> {
        let provider: Arc<dyn LlmProvider> = match settings.provider.as_str() {
            "openai" => Arc::new(OpenAiProvider::new(&settings)?),
            _ => Arc::new(MockProvider),
        };
        Ok(Self { provider, settings })
    }

    /// Provider name for usage attribution.
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// The settings this gateway was built with.
    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    /// Generate with retry/backoff and one truncation recovery.
    ///
    /// Retryable provider errors back off exponentially (1 s, 2 s, ...) up
    /// to `max_retries`. When the provider stops at `max_tokens`, the call
    /// is retried once with a doubled ceiling before `OutputTruncated`.
    pub async fn generate_with_retry(
        &self,
        messages: &[ChatMessage],
        options: GenerateOptions,
    ) -> CodeforgeResult<ChatResponse> {
        let max_tokens = options
            .max_tokens_override
            .unwrap_or(self.settings.max_tokens);
        let response = self.generate_once(messages, options, max_tokens).await?;

        if response.finish_reason == FinishReason::Length {
            warn!(
                max_tokens,
                "completion truncated at max_tokens, retrying with doubled ceiling"
            );
            let doubled = max_tokens.saturating_mul(2);
            let retried = self.generate_once(messages, options, doubled).await?;
            if retried.finish_reason == FinishReason::Length {
                return Err(CodeforgeError::OutputTruncated);
            }
            return Ok(retried);
        }
        Ok(response)
    }

    async fn generate_once(
        &self,
        messages: &[ChatMessage],
        options: GenerateOptions,
        max_tokens: u32,
    ) -> CodeforgeResult<ChatResponse> {
        let request = ChatRequest {
            messages: messages.to_vec(),
            model: self.settings.model.clone(),
            temperature: self.settings.temperature,
            max_tokens,
            response_format: options.require_json.then_some(ResponseFormat::JsonObject),
        };

        let mut attempt = 0u32;
        let mut delay = Duration::from_secs(1);
        loop {
            match self.provider.generate(&request).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < self.settings.max_retries => {
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable provider error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
