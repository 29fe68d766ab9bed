//! OpenAI adapter (`/v1/chat/completions`, bearer auth)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::http;
use super::{ProviderError, ProviderHealth, ProviderReply};
use crate::prompt::RenderedPrompt;

const FALLBACK_CONFIDENCE: f64 = 0.75;

pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    response_format: ResponseFormat<'a>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAiClient {
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
        "openai"
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
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
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let url = format!(
            "{}/v1/chat/completions",
            self.endpoint.trim_end_matches('/')
        );
        debug!(model = %self.model, "openai classify call");

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
                .json::<ChatResponse>()
                .await
                .map_err(|e| ProviderError::Parse(e.to_string()))
        };

        let chat = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ProviderError::Timeout(timeout_ms))??;

        let content = chat
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .ok_or_else(|| ProviderError::Parse("response has no choices".to_string()))?;

        let verdict = http::parse_verdict(content)?;
        Ok(ProviderReply {
            folder: http::resolve_folder(&verdict.folder, folders),
            confidence: http::resolve_confidence(verdict.confidence, FALLBACK_CONFIDENCE),
            tokens_in: chat.usage.prompt_tokens,
            tokens_out: chat.usage.completion_tokens,
        })
    }

    pub async fn health_check(&self) -> ProviderHealth {
        let url = format!("{}/v1/models", self.endpoint.trim_end_matches('/'));
        match self.authorize(self.http.get(&url)).send().await {
            Ok(response) => http::health_from_status(response.status()),
            Err(e) => ProviderHealth::Unreachable(e.to_string()),
        }
    }
}
