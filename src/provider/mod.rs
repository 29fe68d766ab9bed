//! LLM provider adapters behind a uniform interface
//!
//! The supported providers form a closed set: adding one means adding an
//! enum variant and its adapter module, not touching a registry. The
//! orchestrator consumes providers only through [`ModelBackend`], so tests
//! can substitute scripted backends.
//!
//! Adapter obligations, uniform across variants:
//! - cap the outgoing payload even if the caller supplies more
//! - constrain the model to the supplied folder list via the system prompt
//!   AND post-hoc validation (never invent folder names)
//! - report the model's self-reported confidence, else a calibrated
//!   per-provider constant
//! - map transport errors, HTTP 5xx, and timeouts to `transient`; 4xx
//!   (except 429) to `permanent`; 429 to `rate_limited_remote`
//! - never log prompt content

mod anthropic;
mod gemini;
mod http;
mod mock;
mod ollama;
mod openai;

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;
pub use mock::MockClient;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

use std::time::Duration;

use thiserror::Error;

use crate::config::{Config, ProviderKind};
use crate::error::{Error, Result};
use crate::prompt::RenderedPrompt;
use crate::signer::SecretStore;

/// Provider-path failure taxonomy.
///
/// Only transient transport conditions, timeouts, and unparseable model
/// output count against the circuit breaker. Permanent errors signal a
/// configuration problem; remote rate limiting signals pressure, not
/// flakiness.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("permanent provider failure: {0}")]
    Permanent(String),

    #[error("provider rate limited the request: {0}")]
    RateLimitedRemote(String),

    #[error("provider call exceeded {0} ms")]
    Timeout(u64),

    #[error("unparseable model response: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Whether this failure should count toward opening the breaker.
    #[must_use]
    pub const fn is_breaker_failure(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_) | Self::Parse(_))
    }
}

/// A successful model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReply {
    pub folder: String,
    pub confidence: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Health probe outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderHealth {
    Ok,
    Unreachable(String),
    AuthFailed,
    RateLimited,
}

impl ProviderHealth {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// The seam the orchestrator (and tests) consume.
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    fn model_id(&self) -> &str;

    /// Ask the model to pick one of `folders` for the rendered prompt.
    fn classify(
        &self,
        prompt: &RenderedPrompt,
        folders: &[String],
        timeout: Duration,
    ) -> impl Future<Output = std::result::Result<ProviderReply, ProviderError>> + Send;

    fn health_check(&self) -> impl Future<Output = ProviderHealth> + Send;
}

/// The closed provider set, dispatched by match.
pub enum Provider {
    Ollama(OllamaClient),
    OpenAi(OpenAiClient),
    Anthropic(AnthropicClient),
    Gemini(GeminiClient),
    Mock(MockClient),
}

impl ModelBackend for Provider {
    fn name(&self) -> &str {
        match self {
            Self::Ollama(c) => c.name(),
            Self::OpenAi(c) => c.name(),
            Self::Anthropic(c) => c.name(),
            Self::Gemini(c) => c.name(),
            Self::Mock(c) => c.name(),
        }
    }

    fn model_id(&self) -> &str {
        match self {
            Self::Ollama(c) => c.model_id(),
            Self::OpenAi(c) => c.model_id(),
            Self::Anthropic(c) => c.model_id(),
            Self::Gemini(c) => c.model_id(),
            Self::Mock(c) => c.model_id(),
        }
    }

    async fn classify(
        &self,
        prompt: &RenderedPrompt,
        folders: &[String],
        timeout: Duration,
    ) -> std::result::Result<ProviderReply, ProviderError> {
        match self {
            Self::Ollama(c) => c.classify(prompt, folders, timeout).await,
            Self::OpenAi(c) => c.classify(prompt, folders, timeout).await,
            Self::Anthropic(c) => c.classify(prompt, folders, timeout).await,
            Self::Gemini(c) => c.classify(prompt, folders, timeout).await,
            Self::Mock(c) => c.classify(prompt, folders, timeout).await,
        }
    }

    async fn health_check(&self) -> ProviderHealth {
        match self {
            Self::Ollama(c) => c.health_check().await,
            Self::OpenAi(c) => c.health_check().await,
            Self::Anthropic(c) => c.health_check().await,
            Self::Gemini(c) => c.health_check().await,
            Self::Mock(c) => c.health_check().await,
        }
    }
}

/// Instantiate the configured provider, resolving API keys through the
/// secret store.
pub fn build(config: &Config, secrets: &dyn SecretStore) -> Result<Provider> {
    if config.provider == ProviderKind::Mock {
        let block = config.mock.clone().unwrap_or_default();
        return Ok(Provider::Mock(MockClient::new(block.folder, block.confidence)));
    }

    let block = config.provider_block()?;
    let api_key = match &block.api_key_ref {
        Some(key_ref) => Some(resolve_key(secrets, key_ref)?),
        None => None,
    };
    let http = http::client(block.timeout_ms)
        .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;

    let provider = match config.provider {
        ProviderKind::Ollama => Provider::Ollama(OllamaClient::new(
            http,
            block.endpoint.clone(),
            block.model.clone(),
        )),
        ProviderKind::Openai => Provider::OpenAi(OpenAiClient::new(
            http,
            block.endpoint.clone(),
            block.model.clone(),
            api_key,
        )),
        ProviderKind::Anthropic => Provider::Anthropic(AnthropicClient::new(
            http,
            block.endpoint.clone(),
            block.model.clone(),
            api_key,
        )),
        ProviderKind::Gemini => Provider::Gemini(GeminiClient::new(
            http,
            block.endpoint.clone(),
            block.model.clone(),
            api_key,
        )),
        ProviderKind::Mock => unreachable!("handled above"),
    };
    Ok(provider)
}

fn resolve_key(secrets: &dyn SecretStore, key_ref: &str) -> Result<String> {
    let bytes = secrets.get(key_ref)?;
    let key = String::from_utf8(bytes)
        .map_err(|_| Error::Config(format!("secret `{key_ref}` is not valid UTF-8")))?;
    Ok(key.trim().to_string())
}
