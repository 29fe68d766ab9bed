//! Host configuration
//!
//! JSON, schema-validated on load. Unknown keys are rejected to prevent
//! silent drift. Startup rejection is fatal; a rejected reload leaves the
//! previous snapshot in effect.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::AnalysisMode;

/// The closed set of supported providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    Openai,
    Anthropic,
    Gemini,
    /// Deterministic offline provider for tests and dry runs.
    Mock,
}

impl ProviderKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Mock => "mock",
        }
    }
}

/// Connection settings for one remote provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderBlock {
    pub endpoint: String,
    pub model: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Opaque handle into the secret store; never the key itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_ref: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Settings for the deterministic mock provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockBlock {
    /// Folder to pick; the first candidate when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default = "default_mock_confidence")]
    pub confidence: f64,
}

impl Default for MockBlock {
    fn default() -> Self {
        Self {
            folder: None,
            confidence: default_mock_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_failures")]
    pub failures: u32,
    #[serde(default = "default_breaker_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failures: default_breaker_failures(),
            cooldown_ms: default_breaker_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_ms: default_cache_ttl_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ref: Option<String>,
}

/// Top-level host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub provider: ProviderKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ollama: Option<ProviderBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai: Option<ProviderBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic: Option<ProviderBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gemini: Option<ProviderBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock: Option<MockBlock>,

    #[serde(default)]
    pub analysis_mode: AnalysisMode,

    /// `folder → minimum confidence`, with a `default` fallback key.
    #[serde(default)]
    pub thresholds: HashMap<String, f64>,

    #[serde(default = "default_rate_limit_per_min")]
    pub rate_limit_per_min: f64,

    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default = "default_language")]
    pub default_language: String,

    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Whether repeated `folder_rejected` outcomes count against the
    /// circuit breaker.
    #[serde(default)]
    pub folder_rejected_trips_breaker: bool,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that parse but cannot run.
    pub fn validate(&self) -> Result<()> {
        for (folder, value) in &self.thresholds {
            if !(0.0..=1.0).contains(value) {
                return Err(Error::Config(format!(
                    "threshold for `{folder}` must be within [0.0, 1.0], got {value}"
                )));
            }
        }

        if self.rate_limit_per_min <= 0.0 {
            return Err(Error::Config(
                "rate_limit_per_min must be positive".to_string(),
            ));
        }
        if self.circuit_breaker.failures == 0 {
            return Err(Error::Config(
                "circuit_breaker.failures must be at least 1".to_string(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(Error::Config("cache.capacity must be at least 1".to_string()));
        }
        if self.workers == 0 || self.queue_depth == 0 {
            return Err(Error::Config(
                "workers and queue_depth must be at least 1".to_string(),
            ));
        }
        if self.signing.enabled && self.signing.key_ref.is_none() {
            return Err(Error::Config(
                "signing.enabled requires signing.key_ref".to_string(),
            ));
        }

        if self.provider != ProviderKind::Mock {
            let block = self.provider_block()?;
            if !block.enabled {
                return Err(Error::Config(format!(
                    "provider `{}` is disabled",
                    self.provider.as_str()
                )));
            }
            if block.endpoint.is_empty() || block.model.is_empty() {
                return Err(Error::Config(format!(
                    "provider `{}` needs a non-empty endpoint and model",
                    self.provider.as_str()
                )));
            }
            if block.timeout_ms == 0 {
                return Err(Error::Config("timeout_ms must be at least 1".to_string()));
            }
        }

        Ok(())
    }

    /// The configuration block of the active provider.
    pub fn provider_block(&self) -> Result<&ProviderBlock> {
        let block = match self.provider {
            ProviderKind::Ollama => self.ollama.as_ref(),
            ProviderKind::Openai => self.openai.as_ref(),
            ProviderKind::Anthropic => self.anthropic.as_ref(),
            ProviderKind::Gemini => self.gemini.as_ref(),
            ProviderKind::Mock => None,
        };
        block.ok_or_else(|| {
            Error::Config(format!(
                "no `{}` block for the selected provider",
                self.provider.as_str()
            ))
        })
    }

    /// Provider call timeout; the mock provider answers immediately.
    #[must_use]
    pub fn provider_timeout_ms(&self) -> u64 {
        self.provider_block()
            .map_or(default_timeout_ms(), |block| block.timeout_ms)
    }

    /// Token-bucket capacity derived from the per-minute budget.
    #[must_use]
    pub fn bucket_capacity(&self) -> u32 {
        let capacity = self.rate_limit_per_min.ceil();
        if capacity < 1.0 {
            1
        } else if capacity >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            capacity as u32
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_timeout_ms() -> u64 {
    30_000
}

const fn default_mock_confidence() -> f64 {
    0.99
}

const fn default_breaker_failures() -> u32 {
    3
}

const fn default_breaker_cooldown_ms() -> u64 {
    30_000
}

const fn default_cache_capacity() -> usize {
    1024
}

const fn default_cache_ttl_ms() -> u64 {
    3_600_000
}

const fn default_rate_limit_per_min() -> f64 {
    10.0
}

fn default_language() -> String {
    "en".to_string()
}

const fn default_queue_depth() -> usize {
    256
}

const fn default_workers() -> usize {
    4
}

const fn default_shutdown_grace_ms() -> u64 {
    5_000
}
