//! OpenAI-compatible chat-completion client.

use crate::provider::{
    ChatRequest, ChatResponse, ChatRole, FinishReason, LlmProvider, ResponseFormat, TokenUsage,
};
use crate::settings::LlmSettings;
use async_trait::async_trait;
use codeforge_core::{CodeforgeError, CodeforgeResult};
use serde_json::json;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Chat-completions client for OpenAI-compatible servers.
pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl OpenAiProvider {
    /// Build a client from settings. Fails when no API key is configured.
    pub fn new(settings: &LlmSettings) -> CodeforgeResult<Self> {
        let api_key = settings.api_key.clone().ok_or_else(|| {
            CodeforgeError::Config("LLM_API_KEY is required for the openai provider".into())
        })?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(settings.timeout_seconds))
            .build()
            .map_err(|e| CodeforgeError::Config(format!("http client: {e}")))?;
        Ok(Self {
            api_key,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            http,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, request: &ChatRequest) -> CodeforgeResult<ChatResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));

        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        ChatRole::System => "system",
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if let Some(ResponseFormat::JsonObject) = request.response_format {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CodeforgeError::Provider {
                message: format!("request failed: {e}"),
                retryable: true,
            })?;

        // Classify by status before touching the body: error bodies are not
        // guaranteed to be JSON, and retryability comes from the code alone.
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let retryable =
                status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error();
            return Err(CodeforgeError::Provider {
                message: format!("upstream error {status}: {body}"),
                retryable,
            });
        }

        let payload: serde_json::Value =
            response.json().await.map_err(|e| CodeforgeError::Provider {
                message: format!("invalid response body: {e}"),
                retryable: true,
            })?;

        let choice = &payload["choices"][0];
        let text = choice["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let finish_reason =
            FinishReason::parse(choice["finish_reason"].as_str().unwrap_or("stop"));
        let usage = TokenUsage {
            input_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: payload["usage"]["total_tokens"].as_u64().unwrap_or(0),
        };

        Ok(ChatResponse {
            text,
            usage,
            finish_reason,
        })
    }
}
