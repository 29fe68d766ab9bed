//! Wire protocol frames and the classification decision model
//!
//! Every frame is a JSON object with a mandatory `type` field. Requests
//! arrive from the mail client, responses go back; each request carrying a
//! `request_id` yields exactly one response echoing it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;

/// Sentinel folder telling the client to leave the message in place.
pub const INBOX_FALLBACK: &str = "INBOX_FALLBACK";

/// How much of the message leaves the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    /// Sanitized subject, sender, and truncated body.
    #[default]
    Full,
    /// Subject and sender only; the body never enters the pipeline.
    HeadersOnly,
}

/// Real-time vs deferred handling of a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    RealTime,
    Deferred,
}

/// Attachment metadata as supplied by the client. Contents never cross
/// the wire; filenames never leave the privacy guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub sha256: String,
}

/// A `classify` request frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifyRequest {
    pub request_id: String,
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub body: String,
    pub folders: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
    #[serde(default)]
    pub mode: Option<AnalysisMode>,
    /// Client-supplied origin label; `new_mail` selects real-time handling.
    #[serde(default)]
    pub origin: Option<String>,
    /// Explicit client override of the dispatch mode.
    #[serde(default)]
    pub dispatch: Option<DispatchMode>,
}

/// One item of a `batch_start` frame: a classification without its own
/// `request_id` (results are keyed by `message_id`).
#[derive(Debug, Clone, Deserialize)]
pub struct BatchItem {
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub body: String,
    pub folders: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
    #[serde(default)]
    pub mode: Option<AnalysisMode>,
}

/// A `feedback` frame: the user's actual filing decision for a message
/// the host classified earlier.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackFrame {
    #[serde(default)]
    pub request_id: Option<String>,
    pub message_id: String,
    pub actual_folder: String,
    #[serde(default)]
    pub previous_folder: Option<String>,
}

/// All request frame shapes, dispatched by the top-level `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Classify(ClassifyRequest),
    HealthCheck {
        request_id: String,
    },
    BatchStart {
        request_id: String,
        items: Vec<BatchItem>,
    },
    BatchStatus {
        request_id: String,
        batch_id: String,
    },
    Feedback(FeedbackFrame),
    Stats {
        request_id: String,
    },
    GetConfig {
        request_id: String,
    },
    SetConfig {
        request_id: String,
        config: Config,
    },
    Ping {
        request_id: String,
    },
}

const KNOWN_TYPES: &[&str] = &[
    "classify",
    "health_check",
    "batch_start",
    "batch_status",
    "feedback",
    "stats",
    "get_config",
    "set_config",
    "ping",
];

/// Why a frame could not be turned into a [`Request`].
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("frame has no string `type` field")]
    MissingType,

    #[error("unknown frame type `{0}`")]
    UnknownType(String),

    #[error("malformed `{0}` frame: {1}")]
    Invalid(String, String),
}

impl RequestError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingType | Self::Invalid(..) => "invalid_request",
            Self::UnknownType(_) => "unknown_type",
        }
    }
}

impl Request {
    /// Parse a decoded frame into a typed request.
    ///
    /// Unknown `type` values are distinguished from shape errors so the
    /// dispatch loop can answer with the right error code.
    pub fn from_value(value: serde_json::Value) -> Result<Self, RequestError> {
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(RequestError::MissingType)?;

        if !KNOWN_TYPES.contains(&kind) {
            return Err(RequestError::UnknownType(kind.to_string()));
        }

        let kind = kind.to_string();
        serde_json::from_value(value).map_err(|e| RequestError::Invalid(kind, e.to_string()))
    }

    /// The `request_id` to echo, when the frame carries one.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Classify(c) => Some(&c.request_id),
            Self::Feedback(f) => f.request_id.as_deref(),
            Self::HealthCheck { request_id }
            | Self::BatchStart { request_id, .. }
            | Self::BatchStatus { request_id, .. }
            | Self::Stats { request_id }
            | Self::GetConfig { request_id }
            | Self::SetConfig { request_id, .. }
            | Self::Ping { request_id } => Some(request_id),
        }
    }
}

/// Machine-readable reason for the shape of a decision. The sole channel
/// by which the host explains itself to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RationaleTag {
    ModelDecided,
    ThresholdRejected,
    FolderRejected,
    ProviderFailed,
    CircuitOpen,
    RateLimited,
    CacheHit,
}

impl RationaleTag {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ModelDecided => "model_decided",
            Self::ThresholdRejected => "threshold_rejected",
            Self::FolderRejected => "folder_rejected",
            Self::ProviderFailed => "provider_failed",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::CacheHit => "cache_hit",
        }
    }
}

/// The core's output for one classification request.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationDecision {
    pub target_folder: String,
    pub confidence: f64,
    pub rationale_tag: RationaleTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub latency_ms: u64,
    pub provider_name: String,
    pub model_name: String,
}

impl ClassificationDecision {
    /// Whether this decision names a real destination folder.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.target_folder == INBOX_FALLBACK
    }

    /// Render the classification header the client attaches to the
    /// message: category, confidence to three decimals, optional hex HMAC.
    #[must_use]
    pub fn header(&self) -> String {
        let mut header = format!(
            "category={}; confidence={:.3}",
            self.target_folder, self.confidence
        );
        if let Some(sig) = &self.signature {
            header.push_str("; sig=");
            header.push_str(sig);
        }
        header
    }
}

/// A `classification` response frame.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationResponse {
    pub request_id: String,
    pub message_id: String,
    pub target_folder: String,
    pub confidence: f64,
    pub rationale_tag: RationaleTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub provider_name: String,
    pub model_name: String,
    pub latency_ms: u64,
    pub header: String,
}

impl ClassificationResponse {
    #[must_use]
    pub fn new(request_id: &str, message_id: &str, decision: ClassificationDecision) -> Self {
        let header = decision.header();
        Self {
            request_id: request_id.to_string(),
            message_id: message_id.to_string(),
            target_folder: decision.target_folder,
            confidence: decision.confidence,
            rationale_tag: decision.rationale_tag,
            signature: decision.signature,
            provider_name: decision.provider_name,
            model_name: decision.model_name,
            latency_ms: decision.latency_ms,
            header,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub request_id: String,
    pub status: HealthStatus,
    pub provider_name: String,
    pub provider_healthy: bool,
}

/// Per-item outcome inside a `batch_status` response. The tag is a plain
/// string because invalid items report `invalid_request`, which is a
/// top-level code rather than a decision rationale.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub message_id: String,
    pub target_folder: String,
    pub confidence: f64,
    pub rationale_tag: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatusResponse {
    pub request_id: String,
    pub queued: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    pub results: Vec<BatchItemResult>,
}

/// Process counters reported by the `stats` frame. Advisory only.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub request_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub uptime_ms: u64,
    pub requests_total: u64,
    pub model_decided: u64,
    pub threshold_rejected: u64,
    pub folder_rejected: u64,
    pub provider_failed: u64,
    pub circuit_open: u64,
    pub rate_limited: u64,
    pub invalid_requests: u64,
    pub cache_hits: u64,
    pub cache_entries: usize,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub provider_name: String,
    pub breaker_state: String,
    /// Advisory calibrator output; configuration stays authoritative.
    pub threshold_proposals: Vec<crate::calibrate::ThresholdProposal>,
}

/// All response frame shapes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Classification(ClassificationResponse),
    Health(HealthResponse),
    BatchAck {
        request_id: String,
        batch_id: String,
        queued: usize,
    },
    BatchStatus(BatchStatusResponse),
    Ack {
        request_id: String,
    },
    Stats(StatsResponse),
    Config {
        request_id: String,
        config: Config,
    },
    Pong {
        request_id: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Response {
    /// Build an error frame with the given wire code.
    #[must_use]
    pub fn error(request_id: Option<&str>, code: &str, message: Option<String>) -> Self {
        Self::Error {
            request_id: request_id.map(ToString::to_string),
            code: code.to_string(),
            message,
        }
    }

    /// Whether this response may be dropped under writer backpressure.
    #[must_use]
    pub const fn is_advisory(&self) -> bool {
        matches!(self, Self::Stats(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_classify_frame() {
        let value = json!({
            "type": "classify",
            "request_id": "r1",
            "message_id": "m1",
            "subject": "Invoice #42",
            "sender": "billing@example.com",
            "body": "Please find attached invoice.",
            "folders": ["Invoices", "Newsletters", "Personal"],
            "mode": "full"
        });

        let request = Request::from_value(value).unwrap();
        assert_eq!(request.request_id(), Some("r1"));
        let Request::Classify(c) = request else {
            panic!("expected classify");
        };
        assert_eq!(c.request_id, "r1");
        assert_eq!(c.folders.len(), 3);
        assert_eq!(c.mode, Some(AnalysisMode::Full));
        assert!(c.attachments.is_empty());
    }

    #[test]
    fn unknown_type_is_distinguished_from_bad_shape() {
        let unknown = json!({"type": "reticulate", "request_id": "r1"});
        let err = Request::from_value(unknown).unwrap_err();
        assert_eq!(err.code(), "unknown_type");

        let bad_shape = json!({"type": "classify", "request_id": "r1"});
        let err = Request::from_value(bad_shape).unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        let no_type = json!({"request_id": "r1"});
        let err = Request::from_value(no_type).unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn rationale_tags_serialize_snake_case() {
        let tag = serde_json::to_value(RationaleTag::ThresholdRejected).unwrap();
        assert_eq!(tag, "threshold_rejected");
        assert_eq!(RationaleTag::CacheHit.as_str(), "cache_hit");
    }

    #[test]
    fn header_renders_three_decimals_and_optional_sig() {
        let mut decision = ClassificationDecision {
            target_folder: "Invoices".to_string(),
            confidence: 0.91,
            rationale_tag: RationaleTag::ModelDecided,
            signature: None,
            latency_ms: 12,
            provider_name: "ollama".to_string(),
            model_name: "llama3".to_string(),
        };
        assert_eq!(decision.header(), "category=Invoices; confidence=0.910");

        decision.signature = Some("abcd".to_string());
        assert_eq!(
            decision.header(),
            "category=Invoices; confidence=0.910; sig=abcd"
        );
    }

    #[test]
    fn response_tag_matches_wire_names() {
        let pong = serde_json::to_value(Response::Pong {
            request_id: "r9".to_string(),
        })
        .unwrap();
        assert_eq!(pong["type"], "pong");

        let err = serde_json::to_value(Response::error(None, "unknown_type", None)).unwrap();
        assert_eq!(err["type"], "error");
        assert!(err.get("request_id").is_none());
    }

    #[test]
    fn signature_omitted_when_absent() {
        let decision = ClassificationDecision {
            target_folder: INBOX_FALLBACK.to_string(),
            confidence: 0.0,
            rationale_tag: RationaleTag::RateLimited,
            signature: None,
            latency_ms: 1,
            provider_name: "ollama".to_string(),
            model_name: "llama3".to_string(),
        };
        let value = serde_json::to_value(&decision).unwrap();
        assert!(value.get("signature").is_none());
        assert_eq!(value["target_folder"], INBOX_FALLBACK);
    }
}
