//! Deterministic providers for tests and unconfigured environments.

use crate::provider::{ChatRequest, ChatResponse, FinishReason, LlmProvider, TokenUsage};
use async_trait::async_trait;
use codeforge_core::{CodeforgeError, CodeforgeResult};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;

/// Deterministic provider used when no upstream is configured.
///
/// It reads `Target file` and `Task` hints from the last user message and
/// returns a single-file payload, so the whole pipeline exercises the same
/// code paths as a real provider.
pub struct MockProvider;

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, request: &ChatRequest) -> CodeforgeResult<ChatResponse> {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let mut path = "generated.py".to_string();
        let mut task_line = "Implement requested changes.".to_string();
        if let Ok(payload) = serde_json::from_str::<serde_json::Value>(prompt) {
            if let Some(target) = payload["Target file"].as_str() {
                if !target.trim().is_empty() {
                    path = target.trim().to_string();
                }
            }
            if let Some(task) = payload["Task"].as_str() {
                task_line = task.trim().to_string();
            }
        } else {
            if let Some(target) = extract_between(prompt, "Target file:", "\n") {
                path = target;
            }
            if let Some(task) = extract_between(prompt, "Task:", "\n") {
                task_line = task;
            }
        }

        let content = format!(
            "\"\"\"\nAuto-generated mock implementation.\n\"\"\"\n\n# Task: {task_line}\n\n\ndef placeholder():\n    \"\"\"Mock implementation placeholder.\"\"\"\n    return \"mock-response\"\n"
        );
        let response = json!({
            "files": [{ "path": path, "content": content }],
            "artifacts": {
                "implementation_plan": "1. Review task context and requirements.\n2. Implement requested changes in the target file.\n3. Validate output and update summaries."
            }
        });
        let text = response.to_string();

        let tokens_in = prompt.split_whitespace().count().max(1) as u64;
        let tokens_out = text.split_whitespace().count().max(1) as u64;
        Ok(ChatResponse {
            text,
            usage: TokenUsage {
                input_tokens: tokens_in,
                output_tokens: tokens_out,
                total_tokens: tokens_in + tokens_out,
            },
            finish_reason: FinishReason::Stop,
        })
    }
}

fn extract_between(text: &str, start: &str, end: &str) -> Option<String> {
    let after = text.split_once(start)?.1;
    let value = after.split_once(end).map_or(after, |(head, _)| head);
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Provider that replays a fixed sequence of responses.
///
/// Tests that need exact response sequences (contract repair, budget
/// exhaustion, scripted architectures) inject this the way the engine would
/// inject any other provider. Requests are recorded for assertions.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ChatResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    /// Script a sequence of plain-text responses with zeroed usage.
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let responses = texts
            .into_iter()
            .map(|text| ChatResponse {
                text: text.into(),
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 10,
                    total_tokens: 20,
                },
                finish_reason: FinishReason::Stop,
            })
            .collect();
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Script a sequence of full responses.
    pub fn from_responses(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request the provider has served, in order.
    pub fn recorded_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    /// Number of calls served so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &ChatRequest) -> CodeforgeResult<ChatResponse> {
        self.requests.lock().push(request.clone());
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| CodeforgeError::Provider {
                message: "script exhausted".into(),
                retryable: false,
            })
    }
}
