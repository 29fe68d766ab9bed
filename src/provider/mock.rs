//! Deterministic offline provider for tests and dry runs

use std::time::Duration;

use super::{ProviderError, ProviderHealth, ProviderReply};
use crate::prompt::RenderedPrompt;

pub struct MockClient {
    folder: Option<String>,
    confidence: f64,
}

impl MockClient {
    #[must_use]
    pub const fn new(folder: Option<String>, confidence: f64) -> Self {
        Self { folder, confidence }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        "mock"
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        "mock"
    }

    pub async fn classify(
        &self,
        _prompt: &RenderedPrompt,
        folders: &[String],
        _timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        let folder = self
            .folder
            .clone()
            .or_else(|| folders.first().cloned())
            .ok_or_else(|| ProviderError::Parse("no candidate folders".to_string()))?;
        Ok(ProviderReply {
            folder,
            confidence: self.confidence,
            tokens_in: 0,
            tokens_out: 0,
        })
    }

    pub async fn health_check(&self) -> ProviderHealth {
        ProviderHealth::Ok
    }
}
