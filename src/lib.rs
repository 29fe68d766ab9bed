#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation
)]

//! LLM-backed mail classification native-messaging host
//!
//! A long-lived child process of a desktop mail client that classifies
//! messages into user-defined folders by consulting a pluggable LLM
//! backend. Messages are sanitized before anything leaves the host;
//! provider calls run behind a token bucket, a circuit breaker, and a
//! fingerprint cache; decisions are validated against the client's folder
//! allow-list and per-folder confidence thresholds, optionally signed,
//! and returned over length-prefixed stdio framing.

pub mod batch;
pub mod breaker;
pub mod cache;
pub mod calibrate;
pub mod config;
mod error;
pub mod framing;
pub mod host;
pub mod limiter;
pub mod orchestrator;
pub mod privacy;
pub mod prompt;
pub mod protocol;
pub mod provider;
pub mod signer;

pub use config::Config;
pub use error::{Error, Result};
pub use host::Engine;
pub use protocol::{ClassificationDecision, INBOX_FALLBACK, RationaleTag};
