//! Privacy guard: PII redaction, normalization, and truncation
//!
//! Pure functions over strings, applied before anything leaves the host:
//! control-character stripping, whitespace collapsing, regex redaction
//! (email, phone, IP literals, Luhn-validated card numbers), and body
//! truncation. Normalization runs before redaction: collapsing a
//! separator must never join digit groups into a redactable shape the
//! patterns missed. Applying the guard twice yields the same string.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};
use crate::protocol::{AnalysisMode, AttachmentMeta};

/// Body budget in UTF-8 characters, not bytes.
pub const MAX_BODY_CHARS: usize = 2000;

/// Inputs larger than this before truncation fail with
/// `sanitization_overflow`.
pub const MAX_INPUT_BYTES: usize = 1024 * 1024;

pub const EMAIL_TOKEN: &str = "<EMAIL_REDACTED>";
pub const PHONE_TOKEN: &str = "<PHONE_REDACTED>";
pub const IP_TOKEN: &str = "<IP_REDACTED>";
pub const CC_TOKEN: &str = "<CC_REDACTED>";

const ELLIPSIS: char = '\u{2026}';

// RFC-5322 conservative subset: printable local part, dotted domain with
// an alphabetic TLD.
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9][A-Za-z0-9._%+-]*@[A-Za-z0-9][A-Za-z0-9.-]*\.[A-Za-z]{2,}")
        .expect("email pattern")
});

static IPV4_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("ipv4 pattern")
});

// At least four hextet groups; shorter colon runs are too common in
// ordinary text to redact.
static IPV6_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:[0-9A-Fa-f]{1,4}:){3,7}[0-9A-Fa-f]{1,4}\b").expect("ipv6 pattern")
});

// Card-shaped digit groups, 13-19 digits with optional space/dash
// separators. Only replaced when the digits pass Luhn.
static CARD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d(?:[ -]?\d){12,18}\b").expect("card pattern")
});

// E.164 and common national forms. The match is gated on a 7-15 digit
// count so short numbers in prose stay untouched.
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\+?\(?\d{1,4}\)?(?:[ .-]?\d{2,4}){2,4}").expect("phone pattern")
});

static HORIZONTAL_WS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+").expect("whitespace pattern"));

static BLANK_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("blank-line pattern"));

/// A request after redaction and truncation. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedInput {
    pub subject: String,
    pub sender: String,
    pub body: String,
    /// MIME-category summary only; filenames never survive.
    pub attachment_hints: Vec<String>,
    /// ISO-639-1, filled in at prompt-selection time.
    pub detected_language: Option<String>,
}

/// Sanitize one request's strings in the given mode.
///
/// In [`AnalysisMode::HeadersOnly`] the body is emptied before any regex
/// runs; only subject and sender pass through the redaction pipeline.
pub fn sanitize(
    subject: &str,
    sender: &str,
    body: &str,
    attachments: &[AttachmentMeta],
    mode: AnalysisMode,
) -> Result<SanitizedInput> {
    let total = subject.len() + sender.len() + body.len();
    if total > MAX_INPUT_BYTES {
        return Err(Error::SanitizationOverflow(total));
    }

    let body = match mode {
        AnalysisMode::Full => truncate_chars(&scrub(body), MAX_BODY_CHARS),
        AnalysisMode::HeadersOnly => String::new(),
    };

    Ok(SanitizedInput {
        subject: scrub(subject),
        sender: scrub(sender),
        body,
        attachment_hints: attachment_hints(attachments),
        detected_language: None,
    })
}

/// Run the full normalization and redaction pipeline over one string.
#[must_use]
pub fn scrub(input: &str) -> String {
    let text = strip_control(input);
    let text = collapse_whitespace(&text);
    let text = EMAIL_RE.replace_all(&text, EMAIL_TOKEN);
    let text = IPV4_RE.replace_all(&text, IP_TOKEN);
    let text = IPV6_RE.replace_all(&text, IP_TOKEN);
    let text = redact_cards(&text);
    redact_phones(&text)
}

/// Replace card-shaped digit groups that pass Luhn.
fn redact_cards(input: &str) -> String {
    CARD_RE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let digits: String = caps[0].chars().filter(char::is_ascii_digit).collect();
            if luhn_valid(&digits) {
                CC_TOKEN.to_string()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Replace phone-shaped matches carrying 7-15 digits.
fn redact_phones(input: &str) -> String {
    PHONE_RE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let digits = caps[0].chars().filter(char::is_ascii_digit).count();
            if (7..=15).contains(&digits) {
                PHONE_TOKEN.to_string()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

fn luhn_valid(digits: &str) -> bool {
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .chars()
        .rev()
        .filter_map(|c| c.to_digit(10))
        .enumerate()
        .map(|(i, d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Drop control characters except newline and tab.
fn strip_control(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Collapse horizontal whitespace runs to one space and blank-line runs
/// to a single blank line.
fn collapse_whitespace(input: &str) -> String {
    let text = HORIZONTAL_WS_RE.replace_all(input, " ");
    let text = BLANK_RUN_RE.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Truncate to `max` characters, appending a single ellipsis when
/// anything was cut.
fn truncate_chars(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max).collect();
    out.push(ELLIPSIS);
    out
}

/// Summarize attachments to MIME categories with counts, never filenames.
fn attachment_hints(attachments: &[AttachmentMeta]) -> Vec<String> {
    let mut counts: std::collections::BTreeMap<&'static str, usize> =
        std::collections::BTreeMap::new();
    for meta in attachments {
        *counts.entry(mime_category(&meta.mime_type)).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(category, n)| format!("{n} {category}"))
        .collect()
}

fn mime_category(mime_type: &str) -> &'static str {
    let lowered = mime_type.to_ascii_lowercase();
    if lowered.starts_with("image/") {
        "image"
    } else if lowered.starts_with("audio/") || lowered.starts_with("video/") {
        "media"
    } else if lowered.contains("zip")
        || lowered.contains("tar")
        || lowered.contains("compress")
        || lowered.contains("rar")
    {
        "archive"
    } else if lowered.starts_with("text/")
        || lowered.contains("pdf")
        || lowered.contains("word")
        || lowered.contains("spreadsheet")
        || lowered.contains("presentation")
        || lowered.contains("opendocument")
    {
        "document"
    } else {
        "other"
    }
}
