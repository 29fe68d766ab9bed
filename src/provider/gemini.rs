//! Gemini adapter (`:generateContent`, `x-goog-api-key` auth)
//!
//! The key travels in a header rather than the query string so request
//! logs on any intermediary never see it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::http;
use super::{ProviderError, ProviderHealth, ProviderReply};
use crate::prompt::RenderedPrompt;

const FALLBACK_CONFIDENCE: f64 = 0.75;

pub struct GeminiClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig<'a>,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    temperature: f64,
    response_mime_type: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: UsageMetadata,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

impl GeminiClient {
    #[must_use]
    pub const fn new(
        http: reqwest::Client,
        endpoint: String,
        model: String,
        api_key: Option<String>,
    ) -> Self {
        Self {
            http,
            endpoint,
            model,
            api_key,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        "gemini"
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("x-goog-api-key", key),
            None => request,
        }
    }

    pub async fn classify(
        &self,
        prompt: &RenderedPrompt,
        folders: &[String],
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let user = http::cap_prompt(&prompt.user);
        let request = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part {
                    text: &prompt.system,
                }],
            },
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part { text: &user }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                response_mime_type: "application/json",
            },
        };

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint.trim_end_matches('/'),
            self.model
        );
        debug!(model = %self.model, "gemini classify call");

        let call = async {
            let response = self
                .authorize(self.http.post(&url))
                .json(&request)
                .send()
                .await
                .map_err(|e| http::map_transport(&e, timeout_ms))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(http::map_status(status, &body));
            }

            response
                .json::<GenerateResponse>()
                .await
                .map_err(|e| ProviderError::Parse(e.to_string()))
        };

        let reply = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ProviderError::Timeout(timeout_ms))??;

        let content = reply
            .candidates
            .first()
            .and_then(|candidate| candidate.content.parts.first())
            .map(|part| part.text.as_str())
            .ok_or_else(|| ProviderError::Parse("response has no candidates".to_string()))?;

        let verdict = http::parse_verdict(content)?;
        Ok(ProviderReply {
            folder: http::resolve_folder(&verdict.folder, folders),
            confidence: http::resolve_confidence(verdict.confidence, FALLBACK_CONFIDENCE),
            tokens_in: reply.usage_metadata.prompt_token_count,
            tokens_out: reply.usage_metadata.candidates_token_count,
        })
    }

    pub async fn health_check(&self) -> ProviderHealth {
        let url = format!("{}/v1beta/models", self.endpoint.trim_end_matches('/'));
        match self.authorize(self.http.get(&url)).send().await {
            Ok(response) => http::health_from_status(response.status()),
            Err(e) => ProviderHealth::Unreachable(e.to_string()),
        }
    }
}
