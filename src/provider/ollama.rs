//! Ollama adapter (local runtime, `/api/chat`)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::http;
use super::{ProviderError, ProviderHealth, ProviderReply};
use crate::prompt::RenderedPrompt;

/// Ollama reports no confidence of its own.
const FALLBACK_CONFIDENCE: f64 = 0.70;

pub struct OllamaClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    format: &'a str,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f64,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl OllamaClient {
    #[must_use]
    pub const fn new(http: reqwest::Client, endpoint: String, model: String) -> Self {
        Self {
            http,
            endpoint,
            model,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        "ollama"
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model
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
            stream: false,
            format: "json",
            options: ChatOptions { temperature: 0.0 },
        };

        let url = format!("{}/api/chat", self.endpoint.trim_end_matches('/'));
        debug!(model = %self.model, "ollama classify call");

        let call = async {
            let response = self
                .http
                .post(&url)
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

        let verdict = http::parse_verdict(&chat.message.content)?;
        Ok(ProviderReply {
            folder: http::resolve_folder(&verdict.folder, folders),
            confidence: http::resolve_confidence(verdict.confidence, FALLBACK_CONFIDENCE),
            tokens_in: chat.prompt_eval_count,
            tokens_out: chat.eval_count,
        })
    }

    pub async fn health_check(&self) -> ProviderHealth {
        let url = format!("{}/api/tags", self.endpoint.trim_end_matches('/'));
        match self.http.get(&url).send().await {
            Ok(response) => http::health_from_status(response.status()),
            Err(e) => ProviderHealth::Unreachable(e.to_string()),
        }
    }
}
