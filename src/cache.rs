//! Decision memoization: fingerprint → decision with TTL and LRU eviction
//!
//! The fingerprint is computed over sanitized inputs only, so a cache hit
//! short-circuits the pipeline right after the privacy guard. It is
//! deterministic across processes and never includes `request_id`,
//! `message_id`, or timestamps. Fallback decisions are never stored.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::privacy::SanitizedInput;
use crate::protocol::RationaleTag;

/// Compute the cache key for one sanitized request.
///
/// Sender and subject are case-folded; the folder set is order-insensitive.
/// Every field is length-prefixed so no two inputs can collide by
/// concatenation.
#[must_use]
pub fn fingerprint(
    input: &SanitizedInput,
    folders: &[String],
    provider_name: &str,
    model_id: &str,
    template_version: &str,
) -> String {
    let mut sorted: Vec<&str> = folders.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = Sha256::new();
    feed(&mut hasher, &input.sender.to_lowercase());
    feed(&mut hasher, &input.subject.to_lowercase());
    feed(&mut hasher, &input.body);
    for folder in sorted {
        feed(&mut hasher, folder);
    }
    feed(&mut hasher, provider_name);
    feed(&mut hasher, model_id);
    feed(&mut hasher, template_version);

    hex::encode(hasher.finalize())
}

fn feed(hasher: &mut Sha256, field: &str) {
    hasher.update(u64::try_from(field.len()).unwrap_or(u64::MAX).to_le_bytes());
    hasher.update(field.as_bytes());
}

/// The memoized subset of a decision: everything except `signature` and
/// `latency_ms`, which are recomputed per response.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDecision {
    pub target_folder: String,
    pub confidence: f64,
    pub rationale_tag: RationaleTag,
    pub provider_name: String,
    pub model_name: String,
}

#[derive(Debug)]
struct CacheEntry {
    value: CachedDecision,
    expires_at: Instant,
    hit_count: u64,
}

/// Bounded LRU cache with per-entry TTL. All operations are atomic with
/// respect to one another; the lock is never held across I/O.
pub struct DecisionCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl DecisionCache {
    /// Defaults: capacity 1024 entries, TTL 1 hour.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Look up a fingerprint, refreshing its LRU position on hit.
    /// Expired entries are dropped on access.
    pub fn get(&self, key: &str) -> Option<CachedDecision> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<CachedDecision> {
        let mut entries = self.lock();
        let expired = entries.get(key).is_some_and(|e| now >= e.expires_at);
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get_mut(key).map(|entry| {
            entry.hit_count += 1;
            entry.value.clone()
        })
    }

    /// Insert a decision under its fingerprint.
    pub fn insert(&self, key: String, value: CachedDecision) {
        self.insert_at(key, value, Instant::now());
    }

    pub fn insert_at(&self, key: String, value: CachedDecision, now: Instant) {
        let entry = CacheEntry {
            value,
            expires_at: now + self.ttl,
            hit_count: 0,
        };
        self.lock().put(key, entry);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
