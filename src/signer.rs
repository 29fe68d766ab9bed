//! Classification-header signing and the secret store seam
//!
//! The signer computes HMAC-SHA256 over a canonical subset of the
//! decision (target folder, confidence to three decimals, provider,
//! model, message id) serialized in that fixed order, comma-separated,
//! with no whitespace.
//! Key material is reached only through the [`SecretStore`] seam and is
//! never inspected or logged.

use std::collections::HashMap;
use std::sync::RwLock;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("secret `{0}` not found")]
    NotFound(String),

    #[error("secret store denied access to `{0}`")]
    Denied(String),
}

/// Narrow adapter over whatever holds key material.
pub trait SecretStore: Send + Sync {
    fn get(&self, key_ref: &str) -> Result<Vec<u8>, SecretError>;
    fn put(&self, key_ref: &str, value: &[u8]) -> Result<(), SecretError>;
}

/// Secret store backed by environment variables (populated from `.env`
/// at startup). Refs look like `env:MAILSORT_SIGNING_KEY`. Read-only.
#[derive(Debug, Default)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get(&self, key_ref: &str) -> Result<Vec<u8>, SecretError> {
        let name = key_ref
            .strip_prefix("env:")
            .ok_or_else(|| SecretError::NotFound(key_ref.to_string()))?;
        std::env::var(name)
            .map(String::into_bytes)
            .map_err(|_| SecretError::NotFound(key_ref.to_string()))
    }

    fn put(&self, key_ref: &str, _value: &[u8]) -> Result<(), SecretError> {
        Err(SecretError::Denied(key_ref.to_string()))
    }
}

/// In-memory store for tests and ephemeral keys.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_secret(key_ref: &str, value: &[u8]) -> Self {
        let store = Self::new();
        store.put(key_ref, value).ok();
        store
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key_ref: &str) -> Result<Vec<u8>, SecretError> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key_ref)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(key_ref.to_string()))
    }

    fn put(&self, key_ref: &str, value: &[u8]) -> Result<(), SecretError> {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key_ref.to_string(), value.to_vec());
        Ok(())
    }
}

/// HMAC-SHA256 signer over the canonical decision subset.
#[derive(Clone)]
pub struct HmacSigner {
    key: Vec<u8>,
}

impl HmacSigner {
    #[must_use]
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Resolve the key through the secret store seam.
    pub fn from_store(store: &dyn SecretStore, key_ref: &str) -> Result<Self, SecretError> {
        store.get(key_ref).map(Self::new)
    }

    /// The canonical serialization: fixed field order, comma-separated,
    /// no whitespace, confidence to three decimals.
    #[must_use]
    pub fn canonical(
        target_folder: &str,
        confidence: f64,
        provider_name: &str,
        model_name: &str,
        message_id: &str,
    ) -> String {
        format!("{target_folder},{confidence:.3},{provider_name},{model_name},{message_id}")
    }

    /// Hex HMAC-SHA256 digest over the canonical serialization.
    #[must_use]
    pub fn sign(
        &self,
        target_folder: &str,
        confidence: f64,
        provider_name: &str,
        model_name: &str,
        message_id: &str,
    ) -> String {
        let canonical =
            Self::canonical(target_folder, confidence, provider_name, model_name, message_id);
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .expect("HMAC-SHA256 accepts keys of any length");
        mac.update(canonical.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for HmacSigner {
    // Key material must never reach logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner").finish_non_exhaustive()
    }
}
