//! Shared HTTP plumbing for the remote provider adapters
//!
//! Status-code mapping, model-output parsing, and folder recovery live
//! here so the per-provider modules stay limited to endpoint shape, auth
//! header construction, and response-field extraction.

use reqwest::StatusCode;
use serde::Deserialize;

use super::ProviderError;

/// Hard cap on the user block an adapter will send, in characters.
/// The privacy guard truncates well below this; the cap holds even if a
/// caller hands the adapter more.
pub(super) const MAX_PROMPT_CHARS: usize = 8_000;

/// How much of an error body survives into diagnostics.
const DETAIL_CHARS: usize = 200;

/// The JSON object the model is instructed to emit.
#[derive(Debug, Deserialize)]
pub(super) struct ModelVerdict {
    pub folder: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

pub(super) fn client(timeout_ms: u64) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_millis(timeout_ms))
        .build()
}

/// Enforce the adapter-side payload cap.
pub(super) fn cap_prompt(user: &str) -> String {
    if user.chars().count() <= MAX_PROMPT_CHARS {
        user.to_string()
    } else {
        user.chars().take(MAX_PROMPT_CHARS).collect()
    }
}

/// Map an HTTP status to the provider failure taxonomy.
pub(super) fn map_status(status: StatusCode, body: &str) -> ProviderError {
    let detail = snippet(body);
    if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::RateLimitedRemote(detail)
    } else if status.is_server_error() {
        ProviderError::Transient(format!("HTTP {status}: {detail}"))
    } else {
        ProviderError::Permanent(format!("HTTP {status}: {detail}"))
    }
}

/// Map a reqwest transport error.
pub(super) fn map_transport(err: &reqwest::Error, timeout_ms: u64) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout_ms)
    } else {
        // The reqwest error display never contains request bodies.
        ProviderError::Transient(err.to_string())
    }
}

/// Extract the verdict object from raw model output.
///
/// Models wrap JSON in code fences or prefix prose often enough that the
/// parser scans for the outermost braces instead of trusting the whole
/// string.
pub(super) fn parse_verdict(content: &str) -> Result<ModelVerdict, ProviderError> {
    let trimmed = content.trim();
    let candidate = if trimmed.starts_with('{') && trimmed.ends_with('}') {
        trimmed
    } else {
        let start = trimmed
            .find('{')
            .ok_or_else(|| ProviderError::Parse("no JSON object in model output".to_string()))?;
        let end = trimmed
            .rfind('}')
            .ok_or_else(|| ProviderError::Parse("unterminated JSON object".to_string()))?;
        if end <= start {
            return Err(ProviderError::Parse("unterminated JSON object".to_string()));
        }
        &trimmed[start..=end]
    };

    let verdict: ModelVerdict = serde_json::from_str(candidate)
        .map_err(|e| ProviderError::Parse(e.to_string()))?;

    if verdict.folder.trim().is_empty() {
        return Err(ProviderError::Parse("empty folder in model output".to_string()));
    }
    Ok(verdict)
}

/// Post-hoc folder validation: trim decoration and recover a unique
/// case-insensitive match to its canonical candidate spelling. Anything
/// else passes through verbatim for the orchestrator to reject.
pub(super) fn resolve_folder(raw: &str, folders: &[String]) -> String {
    let cleaned = raw.trim().trim_matches(['"', '\'', '`']).trim();

    if folders.iter().any(|f| f == cleaned) {
        return cleaned.to_string();
    }

    let mut case_matches = folders
        .iter()
        .filter(|f| f.eq_ignore_ascii_case(cleaned));
    if let Some(canonical) = case_matches.next() {
        if case_matches.next().is_none() {
            return canonical.clone();
        }
    }

    cleaned.to_string()
}

/// Clamp a self-reported confidence into [0.0, 1.0], substituting the
/// adapter's calibrated constant when the model reported none.
pub(super) fn resolve_confidence(reported: Option<f64>, fallback: f64) -> f64 {
    reported.map_or(fallback, |value| value.clamp(0.0, 1.0))
}

/// Health probe mapping shared by every adapter.
pub(super) fn health_from_status(status: StatusCode) -> super::ProviderHealth {
    use super::ProviderHealth;
    if status.is_success() {
        ProviderHealth::Ok
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ProviderHealth::AuthFailed
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderHealth::RateLimited
    } else {
        ProviderHealth::Unreachable(format!("HTTP {status}"))
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(DETAIL_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_object() {
        let verdict = parse_verdict(r#"{"folder": "Invoices", "confidence": 0.91}"#).unwrap();
        assert_eq!(verdict.folder, "Invoices");
        assert_eq!(verdict.confidence, Some(0.91));
    }

    #[test]
    fn parses_fenced_object() {
        let content = "```json\n{\"folder\": \"Invoices\", \"confidence\": 0.8}\n```";
        let verdict = parse_verdict(content).unwrap();
        assert_eq!(verdict.folder, "Invoices");
    }

    #[test]
    fn parses_object_with_prose_around_it() {
        let content = "Sure! Here is my answer: {\"folder\": \"Personal\"} Hope that helps.";
        let verdict = parse_verdict(content).unwrap();
        assert_eq!(verdict.folder, "Personal");
        assert_eq!(verdict.confidence, None);
    }

    #[test]
    fn rejects_proseless_garbage() {
        assert!(parse_verdict("the folder is Invoices").is_err());
        assert!(parse_verdict("{\"confidence\": 0.5}").is_err());
        assert!(parse_verdict("{\"folder\": \"  \"}").is_err());
    }

    #[test]
    fn folder_recovery_is_conservative() {
        let folders = vec!["Invoices".to_string(), "Personal".to_string()];

        assert_eq!(resolve_folder("Invoices", &folders), "Invoices");
        assert_eq!(resolve_folder("\"Invoices\"", &folders), "Invoices");
        assert_eq!(resolve_folder("invoices", &folders), "Invoices");
        // Unknown names pass through for the orchestrator to reject.
        assert_eq!(resolve_folder("Receipts", &folders), "Receipts");

        // Ambiguous case-insensitive matches are not recovered.
        let ambiguous = vec!["inbox".to_string(), "INBOX".to_string()];
        assert_eq!(resolve_folder("Inbox", &ambiguous), "Inbox");
    }

    #[test]
    fn confidence_resolution() {
        assert!((resolve_confidence(Some(0.91), 0.7) - 0.91).abs() < f64::EPSILON);
        assert!((resolve_confidence(None, 0.7) - 0.7).abs() < f64::EPSILON);
        assert!((resolve_confidence(Some(7.0), 0.7) - 1.0).abs() < f64::EPSILON);
        assert!((resolve_confidence(Some(-1.0), 0.7)).abs() < f64::EPSILON);
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            map_status(StatusCode::INTERNAL_SERVER_ERROR, ""),
            ProviderError::Transient(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, ""),
            ProviderError::Permanent(_)
        ));
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderError::RateLimitedRemote(_)
        ));
    }

    #[test]
    fn prompt_cap_applies() {
        let long = "x".repeat(MAX_PROMPT_CHARS + 100);
        assert_eq!(cap_prompt(&long).chars().count(), MAX_PROMPT_CHARS);
        assert_eq!(cap_prompt("short"), "short");
    }
}
