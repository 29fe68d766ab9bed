//! Adapter integration tests against the fake LLM server
//!
//! Each test starts a `FakeLlmServer` with scripted replies, points a
//! provider client at it, and checks endpoint shape, auth headers,
//! response extraction, and error mapping.

mod fake_llm;

use std::time::Duration;

use fake_llm::{FakeLlmServer, ScriptBuilder};
use mailsort::prompt::RenderedPrompt;
use mailsort::provider::{
    AnthropicClient, GeminiClient, OllamaClient, OpenAiClient, ProviderError, ProviderHealth,
};
use serde_json::json;

const TIMEOUT: Duration = Duration::from_secs(5);

fn prompt() -> RenderedPrompt {
    RenderedPrompt {
        system: "pick a folder".to_string(),
        user: "Subject: Invoice #42".to_string(),
        template_id: "en/full@v2".to_string(),
        version: "v2",
    }
}

fn folders() -> Vec<String> {
    vec!["Invoices".to_string(), "Personal".to_string()]
}

fn ollama_verdict(folder: &str, confidence: f64) -> serde_json::Value {
    json!({
        "message": {
            "content": json!({"folder": folder, "confidence": confidence}).to_string()
        },
        "prompt_eval_count": 12,
        "eval_count": 4
    })
}

// ── Ollama ─────────────────────────────────────────────────────────

#[tokio::test]
async fn ollama_extracts_verdict_and_usage() {
    let server = FakeLlmServer::start(
        ScriptBuilder::new()
            .json(200, ollama_verdict("Invoices", 0.91))
            .build(),
    )
    .await;

    let client = OllamaClient::new(
        reqwest::Client::new(),
        server.endpoint(),
        "llama3".to_string(),
    );
    let reply = client
        .classify(&prompt(), &folders(), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(reply.folder, "Invoices");
    assert!((reply.confidence - 0.91).abs() < 1e-9);
    assert_eq!(reply.tokens_in, 12);
    assert_eq!(reply.tokens_out, 4);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path, "/api/chat");
    assert!(requests[0].body.contains("\"stream\":false"));
    assert!(requests[0].body.contains("Invoice #42"));
}

#[tokio::test]
async fn ollama_recovers_case_insensitive_folder() {
    let server = FakeLlmServer::start(
        ScriptBuilder::new()
            .json(200, ollama_verdict("invoices", 0.9))
            .build(),
    )
    .await;

    let client = OllamaClient::new(
        reqwest::Client::new(),
        server.endpoint(),
        "llama3".to_string(),
    );
    let reply = client
        .classify(&prompt(), &folders(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(reply.folder, "Invoices");
}

#[tokio::test]
async fn ollama_maps_status_codes() {
    let cases = [
        (500, "transient"),
        (400, "permanent"),
        (429, "rate_limited"),
    ];
    for (status, expected) in cases {
        let server =
            FakeLlmServer::start(ScriptBuilder::new().status(status).build()).await;
        let client = OllamaClient::new(
            reqwest::Client::new(),
            server.endpoint(),
            "llama3".to_string(),
        );
        let err = client
            .classify(&prompt(), &folders(), TIMEOUT)
            .await
            .unwrap_err();
        let matched = match expected {
            "transient" => matches!(err, ProviderError::Transient(_)),
            "permanent" => matches!(err, ProviderError::Permanent(_)),
            _ => matches!(err, ProviderError::RateLimitedRemote(_)),
        };
        assert!(matched, "status {status} mapped to {err:?}");
        assert_eq!(server.request_count(), 1);
    }
}

#[tokio::test]
async fn ollama_times_out() {
    let server = FakeLlmServer::start(
        ScriptBuilder::new()
            .json(200, ollama_verdict("Invoices", 0.9))
            .delay_ms(500)
            .build(),
    )
    .await;

    let client = OllamaClient::new(
        reqwest::Client::new(),
        server.endpoint(),
        "llama3".to_string(),
    );
    let err = client
        .classify(&prompt(), &folders(), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Timeout(_)), "{err:?}");
}

#[tokio::test]
async fn ollama_rejects_prose_only_content() {
    let body = json!({"message": {"content": "definitely the Invoices folder"}});
    let server = FakeLlmServer::start(ScriptBuilder::new().json(200, body).build()).await;

    let client = OllamaClient::new(
        reqwest::Client::new(),
        server.endpoint(),
        "llama3".to_string(),
    );
    let err = client
        .classify(&prompt(), &folders(), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Parse(_)));
}

#[tokio::test]
async fn ollama_health_probes_tags() {
    let server =
        FakeLlmServer::start(ScriptBuilder::new().json(200, json!({"models": []})).build())
            .await;
    let client = OllamaClient::new(
        reqwest::Client::new(),
        server.endpoint(),
        "llama3".to_string(),
    );
    assert_eq!(client.health_check().await, ProviderHealth::Ok);
    assert_eq!(server.requests()[0].path, "/api/tags");
}

#[tokio::test]
async fn unreachable_endpoint_reports_detail() {
    let server = FakeLlmServer::start(ScriptBuilder::new().status(200).build()).await;
    let endpoint = server.endpoint();
    drop(server);

    let client = OllamaClient::new(reqwest::Client::new(), endpoint, "llama3".to_string());
    assert!(matches!(
        client.health_check().await,
        ProviderHealth::Unreachable(_)
    ));
}

// ── OpenAI ─────────────────────────────────────────────────────────

#[tokio::test]
async fn openai_sends_bearer_and_parses_choices() {
    let body = json!({
        "choices": [
            {"message": {"content": "{\"folder\": \"Personal\", \"confidence\": 0.83}"}}
        ],
        "usage": {"prompt_tokens": 20, "completion_tokens": 6}
    });
    let server = FakeLlmServer::start(ScriptBuilder::new().json(200, body).build()).await;

    let client = OpenAiClient::new(
        reqwest::Client::new(),
        server.endpoint(),
        "gpt-4o-mini".to_string(),
        Some("sk-test".to_string()),
    );
    let reply = client
        .classify(&prompt(), &folders(), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(reply.folder, "Personal");
    assert_eq!(reply.tokens_in, 20);
    assert_eq!(reply.tokens_out, 6);

    let request = &server.requests()[0];
    assert_eq!(request.path, "/v1/chat/completions");
    assert_eq!(
        request.headers.get("authorization").map(String::as_str),
        Some("Bearer sk-test")
    );
    assert!(request.body.contains("json_object"));
}

#[tokio::test]
async fn openai_auth_failure_maps_to_permanent() {
    let server = FakeLlmServer::start(ScriptBuilder::new().status(401).build()).await;
    let client = OpenAiClient::new(
        reqwest::Client::new(),
        server.endpoint(),
        "gpt-4o-mini".to_string(),
        None,
    );
    let err = client
        .classify(&prompt(), &folders(), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Permanent(_)));

    assert_eq!(client.health_check().await, ProviderHealth::AuthFailed);
}

// ── Anthropic ──────────────────────────────────────────────────────

#[tokio::test]
async fn anthropic_sends_api_key_and_version() {
    let body = json!({
        "content": [{"type": "text", "text": "{\"folder\": \"Invoices\", \"confidence\": 0.88}"}],
        "usage": {"input_tokens": 30, "output_tokens": 8}
    });
    let server = FakeLlmServer::start(ScriptBuilder::new().json(200, body).build()).await;

    let client = AnthropicClient::new(
        reqwest::Client::new(),
        server.endpoint(),
        "claude-3-5-haiku-latest".to_string(),
        Some("sk-ant-test".to_string()),
    );
    let reply = client
        .classify(&prompt(), &folders(), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(reply.folder, "Invoices");
    assert_eq!(reply.tokens_in, 30);

    let request = &server.requests()[0];
    assert_eq!(request.path, "/v1/messages");
    assert_eq!(
        request.headers.get("x-api-key").map(String::as_str),
        Some("sk-ant-test")
    );
    assert_eq!(
        request.headers.get("anthropic-version").map(String::as_str),
        Some("2023-06-01")
    );
}

// ── Gemini ─────────────────────────────────────────────────────────

#[tokio::test]
async fn gemini_uses_header_auth_and_model_path() {
    let body = json!({
        "candidates": [
            {"content": {"parts": [{"text": "{\"folder\": \"Invoices\"}"}]}}
        ],
        "usageMetadata": {"promptTokenCount": 15, "candidatesTokenCount": 5}
    });
    let server = FakeLlmServer::start(ScriptBuilder::new().json(200, body).build()).await;

    let client = GeminiClient::new(
        reqwest::Client::new(),
        server.endpoint(),
        "gemini-2.0-flash".to_string(),
        Some("g-key".to_string()),
    );
    let reply = client
        .classify(&prompt(), &folders(), TIMEOUT)
        .await
        .unwrap();

    // No self-reported confidence: the calibrated constant applies.
    assert_eq!(reply.folder, "Invoices");
    assert!((reply.confidence - 0.75).abs() < 1e-9);
    assert_eq!(reply.tokens_in, 15);

    let request = &server.requests()[0];
    assert_eq!(
        request.path,
        "/v1beta/models/gemini-2.0-flash:generateContent"
    );
    assert_eq!(
        request.headers.get("x-goog-api-key").map(String::as_str),
        Some("g-key")
    );
    // The key never travels in the URL.
    assert!(!request.path.contains("g-key"));
}
