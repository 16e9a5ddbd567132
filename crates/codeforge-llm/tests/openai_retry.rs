//! Upstream behavior of the OpenAI-compatible client against a stub server.

use codeforge_llm::{
    ChatMessage, GenerateOptions, LlmGateway, LlmProvider, LlmSettings, OpenAiProvider,
};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn settings(base_url: String) -> LlmSettings {
    LlmSettings {
        provider: "openai".into(),
        api_key: Some("test-key".into()),
        base_url: Some(base_url),
        max_retries: 2,
        ..LlmSettings::default()
    }
}

fn completion_body(text: &str) -> serde_json::Value {
    json!({
        "choices": [{
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 12, "completion_tokens": 7, "total_tokens": 19 }
    })
}

#[tokio::test]
async fn successful_completion_returns_text_and_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("hello")))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(&settings(server.uri())).unwrap();
    let gateway = LlmGateway::new(Arc::new(provider), settings(server.uri()));
    let response = gateway
        .generate_with_retry(&[ChatMessage::user("hi")], GenerateOptions::default())
        .await
        .unwrap();

    assert_eq!(response.text, "hello");
    assert_eq!(response.usage.input_tokens, 12);
    assert_eq!(response.usage.output_tokens, 7);
}

#[tokio::test]
async fn server_errors_are_retried_then_succeed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "overloaded"})))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("recovered")))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(&settings(server.uri())).unwrap();
    let gateway = LlmGateway::new(Arc::new(provider), settings(server.uri()));
    let response = gateway
        .generate_with_retry(&[ChatMessage::user("hi")], GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(response.text, "recovered");
}

#[tokio::test]
async fn auth_errors_do_not_retry_even_with_non_json_bodies() {
    let server = MockServer::start().await;
    // Some upstreams and proxies return plain text on auth failures; the
    // status code alone must decide retryability.
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(&settings(server.uri())).unwrap();
    let err = provider
        .generate(&codeforge_llm::ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            model: "gpt-4o-mini".into(),
            temperature: 0.2,
            max_tokens: 64,
            response_format: None,
        })
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("401"));
}

#[tokio::test]
async fn json_mode_sets_response_format() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(move |request: &Request| {
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            assert_eq!(body["response_format"]["type"], "json_object");
            ResponseTemplate::new(200).set_body_json(completion_body("{}"))
        })
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(&settings(server.uri())).unwrap();
    let gateway = LlmGateway::new(Arc::new(provider), settings(server.uri()));
    gateway
        .generate_with_retry(
            &[ChatMessage::user("hi")],
            GenerateOptions {
                require_json: true,
                max_tokens_override: None,
            },
        )
        .await
        .unwrap();
}
