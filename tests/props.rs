//! Property-based invariants
//!
//! Quantified checks over the pure subsystems: the privacy guard, the
//! framing codec, the token bucket, and the cache fingerprint.

use futures::executor::block_on;
use mailsort::cache;
use mailsort::framing::{read_frame, write_frame};
use mailsort::limiter::TokenBucket;
use mailsort::privacy::{self, SanitizedInput};
use mailsort::protocol::AnalysisMode;
use proptest::prelude::*;
use regex::Regex;

fn sanitized(subject: &str, sender: &str, body: &str) -> SanitizedInput {
    SanitizedInput {
        subject: subject.to_string(),
        sender: sender.to_string(),
        body: body.to_string(),
        attachment_hints: vec![],
        detected_language: None,
    }
}

proptest! {
    #[test]
    fn privacy_guard_is_idempotent(input in ".{0,400}") {
        let once = privacy::scrub(&input);
        let twice = privacy::scrub(&once);
        prop_assert_eq!(&twice, &once);
    }

    #[test]
    fn no_email_shape_survives_scrubbing(
        local in "[a-z0-9]{1,12}",
        domain in "[a-z]{1,12}",
        prefix in "[ a-zA-Z]{0,24}",
        suffix in "[ a-zA-Z]{0,24}",
    ) {
        let text = format!("{prefix}{local}@{domain}.com{suffix}");
        let out = privacy::scrub(&text);
        let email = Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap();
        prop_assert!(!email.is_match(&out), "email survived in {out:?}");
    }

    #[test]
    fn no_ipv4_literal_survives_scrubbing(
        a in 0_u8..=255, b in 0_u8..=255, c in 0_u8..=255, d in 0_u8..=255,
    ) {
        let text = format!("connect to {a}.{b}.{c}.{d} now");
        let out = privacy::scrub(&text);
        let ipv4 = Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap();
        prop_assert!(!ipv4.is_match(&out), "ip survived in {out:?}");
    }

    #[test]
    fn body_truncation_boundary(extra in 0_usize..8) {
        let body: String = "abcdefghij".chars().cycle().take(2000 + extra).collect();
        let input = privacy::sanitize("s", "f", &body, &[], AnalysisMode::Full).unwrap();

        let count = input.body.chars().count();
        let ellipsis = '\u{2026}';
        if extra == 0 {
            prop_assert_eq!(count, 2000);
            prop_assert!(!input.body.ends_with(ellipsis));
        } else {
            prop_assert_eq!(count, 2001);
            prop_assert!(input.body.ends_with(ellipsis));
        }
    }

    #[test]
    fn frames_round_trip(
        key in "[a-z_]{1,12}",
        text in "[ -~]{0,200}",
        number in any::<u32>(),
    ) {
        let mut fields = serde_json::Map::new();
        fields.insert("type".to_string(), "classify".into());
        fields.insert(key, serde_json::Value::String(text));
        fields.insert("n".to_string(), number.into());
        let frame = serde_json::Value::Object(fields);

        let mut out = std::io::Cursor::new(Vec::new());
        block_on(write_frame(&mut out, &frame)).unwrap();
        let mut cursor = std::io::Cursor::new(out.into_inner());
        let back = block_on(read_frame(&mut cursor)).unwrap();

        prop_assert_eq!(back, frame);
    }

    #[test]
    fn full_bucket_admits_exactly_capacity(capacity in 1_u32..50) {
        let bucket = TokenBucket::new(capacity, 1.0);
        let now = std::time::Instant::now();

        for _ in 0..capacity {
            prop_assert!(bucket.try_acquire_at(now).is_admitted());
        }
        prop_assert!(!bucket.try_acquire_at(now).is_admitted());
    }

    #[test]
    fn fingerprint_is_stable_and_order_insensitive(
        subject in "[ -~]{0,60}",
        sender in "[ -~]{0,40}",
        body in "[ -~]{0,120}",
        folders in proptest::collection::vec("[A-Za-z]{1,10}", 1..6),
    ) {
        let input = sanitized(&subject, &sender, &body);

        let forward = cache::fingerprint(&input, &folders, "ollama", "llama3", "v2");
        let again = cache::fingerprint(&input, &folders, "ollama", "llama3", "v2");
        prop_assert_eq!(&forward, &again);

        let mut reversed = folders.clone();
        reversed.reverse();
        let backward = cache::fingerprint(&input, &reversed, "ollama", "llama3", "v2");
        prop_assert_eq!(&forward, &backward);

        let other_model = cache::fingerprint(&input, &folders, "ollama", "other", "v2");
        prop_assert_ne!(&forward, &other_model);
    }
}
