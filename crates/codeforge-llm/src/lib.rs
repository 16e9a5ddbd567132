//! LLM gateway for the codeforge engine.
//!
//! Provides the provider abstraction ([`LlmProvider`]), an OpenAI-compatible
//! client, a deterministic mock for tests and unconfigured environments, the
//! retrying [`LlmGateway`], and robust JSON extraction from model output.

pub mod gateway;
pub mod mock;
pub mod openai;
pub mod parse;
pub mod provider;
pub mod settings;

pub use gateway::{GenerateOptions, LlmGateway};
pub use mock::{MockProvider, ScriptedProvider};
pub use openai::OpenAiProvider;
pub use parse::{
    extract_first_json_payload, parse_llm_json, strip_markdown_fences, truncate_preview,
};
pub use provider::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, FinishReason, LlmProvider, ResponseFormat,
    TokenUsage,
};
pub use settings::LlmSettings;
