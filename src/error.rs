//! Error types for mailsort

use thiserror::Error;

use crate::framing::FrameError;
use crate::provider::ProviderError;
use crate::signer::SecretError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("secret store error: {0}")]
    Secret(#[from] SecretError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("sanitization overflow: input of {0} bytes exceeds the pre-truncation limit")]
    SanitizationOverflow(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
