//! Anthropic adapter (`/v1/messages`, `x-api-key` auth)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::http;
use super::{ProviderError, ProviderHealth, ProviderReply};
use crate::prompt::RenderedPrompt;

const FALLBACK_CONFIDENCE: f64 = 0.75;
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 256;

pub struct AnthropicClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f64,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl AnthropicClient {
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
        "anthropic"
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("anthropic-version", ANTHROPIC_VERSION);
        match &self.api_key {
            Some(key) => request.header("x-api-key", key),
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
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system: &prompt.system,
            messages: vec![Message {
                role: "user",
                content: &user,
            }],
            temperature: 0.0,
        };

        let url = format!("{}/v1/messages", self.endpoint.trim_end_matches('/'));
        debug!(model = %self.model, "anthropic classify call");

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
                .json::<MessagesResponse>()
                .await
                .map_err(|e| ProviderError::Parse(e.to_string()))
        };

        let reply = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ProviderError::Timeout(timeout_ms))??;

        let content = reply
            .content
            .first()
            .map(|block| block.text.as_str())
            .ok_or_else(|| ProviderError::Parse("response has no content".to_string()))?;

        let verdict = http::parse_verdict(content)?;
        Ok(ProviderReply {
            folder: http::resolve_folder(&verdict.folder, folders),
            confidence: http::resolve_confidence(verdict.confidence, FALLBACK_CONFIDENCE),
            tokens_in: reply.usage.input_tokens,
            tokens_out: reply.usage.output_tokens,
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
