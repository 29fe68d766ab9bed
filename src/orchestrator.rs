//! The classification orchestrator
//!
//! One request flows through a fixed pipeline: validate, sanitize, cache
//! lookup, prompt render, rate-limiter admission, breaker gate, provider
//! call, folder validation, threshold policy, calibrator update, optional
//! signing, cache insert, emit. No stage escapes: every failure past
//! validation maps to a well-formed fallback decision with a rationale
//! tag.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::breaker::{CircuitBreaker, Gate};
use crate::cache::{self, CachedDecision, DecisionCache};
use crate::calibrate::{Calibrator, ThresholdPolicy};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::limiter::{Admission, TokenBucket};
use crate::privacy;
use crate::prompt::TemplateRegistry;
use crate::protocol::{
    AnalysisMode, AttachmentMeta, ClassificationDecision, RationaleTag, INBOX_FALLBACK,
};
use crate::provider::{self, ModelBackend, Provider};
use crate::signer::{HmacSigner, SecretStore};

/// Everything rebuilt and swapped as one unit on configuration reload.
pub struct Runtime<P> {
    pub config: Config,
    pub provider: P,
    pub limiter: TokenBucket,
    pub breaker: CircuitBreaker,
    pub templates: TemplateRegistry,
    pub thresholds: ThresholdPolicy,
    pub signer: Option<HmacSigner>,
}

impl Runtime<Provider> {
    /// Build a runtime snapshot from validated configuration.
    pub fn build(config: Config, secrets: &dyn SecretStore) -> Result<Self> {
        config.validate()?;

        let provider = provider::build(&config, secrets)?;
        let signer = match (config.signing.enabled, &config.signing.key_ref) {
            (true, Some(key_ref)) => Some(HmacSigner::from_store(secrets, key_ref)?),
            _ => None,
        };

        Ok(Self::assemble(config, provider, signer))
    }
}

impl<P: ModelBackend> Runtime<P> {
    /// Assemble a runtime around an already-built backend.
    #[must_use]
    pub fn assemble(config: Config, provider: P, signer: Option<HmacSigner>) -> Self {
        let limiter = TokenBucket::new(config.bucket_capacity(), config.rate_limit_per_min);
        let breaker = CircuitBreaker::new(
            config.circuit_breaker.failures,
            Duration::from_millis(config.circuit_breaker.cooldown_ms),
        );
        let templates = TemplateRegistry::new(config.default_language.clone());
        let thresholds = ThresholdPolicy::from_map(&config.thresholds);
        Self {
            config,
            provider,
            limiter,
            breaker,
            templates,
            thresholds,
            signer,
        }
    }
}

/// Per-tag decision counters, shared across workers.
#[derive(Debug, Default)]
pub struct Stats {
    pub requests: AtomicU64,
    pub model_decided: AtomicU64,
    pub threshold_rejected: AtomicU64,
    pub folder_rejected: AtomicU64,
    pub provider_failed: AtomicU64,
    pub circuit_open: AtomicU64,
    pub rate_limited: AtomicU64,
    pub cache_hits: AtomicU64,
    pub invalid_requests: AtomicU64,
    pub tokens_in: AtomicU64,
    pub tokens_out: AtomicU64,
}

impl Stats {
    fn record_tag(&self, tag: RationaleTag) {
        let counter = match tag {
            RationaleTag::ModelDecided => &self.model_decided,
            RationaleTag::ThresholdRejected => &self.threshold_rejected,
            RationaleTag::FolderRejected => &self.folder_rejected,
            RationaleTag::ProviderFailed => &self.provider_failed,
            RationaleTag::CircuitOpen => &self.circuit_open,
            RationaleTag::RateLimited => &self.rate_limited,
            RationaleTag::CacheHit => &self.cache_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Process-lifetime state: the decision cache, calibration windows, and
/// counters all survive configuration reloads. Cache entries can never
/// leak across a reload because the fingerprint covers provider, model,
/// and template version.
pub struct SharedState {
    pub cache: DecisionCache,
    pub calibrator: Calibrator,
    pub stats: Stats,
}

impl SharedState {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            cache: DecisionCache::new(
                config.cache.capacity,
                Duration::from_millis(config.cache.ttl_ms),
            ),
            calibrator: Calibrator::new(),
            stats: Stats::default(),
        }
    }
}

/// Rate-limiter behavior for one task. Real-time requests fail fast;
/// deferred batch work opts into waiting out the refill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWait {
    NonBlocking,
    WaitUpTo(Duration),
}

/// One unit of classification work, real-time or batch.
pub struct ClassifyTask<'a> {
    pub message_id: &'a str,
    pub subject: &'a str,
    pub sender: &'a str,
    pub body: &'a str,
    pub folders: &'a [String],
    pub attachments: &'a [AttachmentMeta],
    pub mode: Option<AnalysisMode>,
    pub wait: RateWait,
}

/// Run the full pipeline for one task.
///
/// `Err` is returned only for request-shape problems (step 1) and the
/// sanitizer's overflow guard; everything downstream resolves to a
/// decision.
pub async fn classify<P: ModelBackend>(
    runtime: &Runtime<P>,
    shared: &SharedState,
    task: ClassifyTask<'_>,
) -> Result<ClassificationDecision> {
    let started = Instant::now();
    shared.stats.requests.fetch_add(1, Ordering::Relaxed);

    // 1. Request shape.
    let folders = match validate(&task) {
        Ok(folders) => folders,
        Err(e) => {
            shared.stats.invalid_requests.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
    };

    // 2. Privacy guard.
    let mode = task.mode.unwrap_or(runtime.config.analysis_mode);
    let mut input = match privacy::sanitize(
        task.subject,
        task.sender,
        task.body,
        task.attachments,
        mode,
    ) {
        Ok(input) => input,
        Err(e) => {
            shared.stats.invalid_requests.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
    };

    // 3. Cache lookup over sanitized inputs.
    let fingerprint = cache::fingerprint(
        &input,
        &folders,
        runtime.provider.name(),
        runtime.provider.model_id(),
        crate::prompt::TEMPLATE_VERSION,
    );
    if let Some(hit) = shared.cache.get(&fingerprint) {
        debug!(message_id = %task.message_id, "cache hit");
        return Ok(seal(
            runtime,
            shared,
            started,
            task.message_id,
            hit.target_folder,
            hit.confidence,
            RationaleTag::CacheHit,
        ));
    }

    // 4. Prompt.
    input.detected_language =
        Some(runtime.templates.detect_language(&input.subject, &input.body));
    let prompt = runtime.templates.render(&input, &folders, mode);

    // 5. Admission.
    if !acquire(runtime, task.wait).await {
        return Ok(seal(
            runtime,
            shared,
            started,
            task.message_id,
            INBOX_FALLBACK.to_string(),
            0.0,
            RationaleTag::RateLimited,
        ));
    }

    // 6. Breaker gate.
    let gate = runtime.breaker.check();
    if gate == Gate::FastFail {
        return Ok(seal(
            runtime,
            shared,
            started,
            task.message_id,
            INBOX_FALLBACK.to_string(),
            0.0,
            RationaleTag::CircuitOpen,
        ));
    }

    // 7. Provider call under the configured timeout.
    let timeout = Duration::from_millis(runtime.config.provider_timeout_ms());
    let reply = match runtime.provider.classify(&prompt, &folders, timeout).await {
        Ok(reply) => reply,
        Err(e) => {
            if e.is_breaker_failure() {
                runtime.breaker.on_failure();
            } else {
                runtime.breaker.release_probe();
            }
            warn!(message_id = %task.message_id, error = %e, "provider call failed");
            return Ok(seal(
                runtime,
                shared,
                started,
                task.message_id,
                INBOX_FALLBACK.to_string(),
                0.0,
                RationaleTag::ProviderFailed,
            ));
        }
    };

    shared
        .stats
        .tokens_in
        .fetch_add(reply.tokens_in, Ordering::Relaxed);
    shared
        .stats
        .tokens_out
        .fetch_add(reply.tokens_out, Ordering::Relaxed);

    // 8. Folder allow-list, case-sensitive.
    if !folders.iter().any(|f| *f == reply.folder) {
        if runtime.config.folder_rejected_trips_breaker {
            runtime.breaker.on_failure();
        } else {
            runtime.breaker.on_success();
        }
        warn!(message_id = %task.message_id, "model returned a folder outside the allow-list");
        return Ok(seal(
            runtime,
            shared,
            started,
            task.message_id,
            INBOX_FALLBACK.to_string(),
            0.0,
            RationaleTag::FolderRejected,
        ));
    }
    runtime.breaker.on_success();

    // 9. Threshold policy.
    let threshold = runtime.thresholds.threshold_for(&reply.folder);
    if reply.confidence < threshold {
        debug!(
            message_id = %task.message_id,
            confidence = reply.confidence,
            threshold,
            "confidence below folder threshold"
        );
        return Ok(seal(
            runtime,
            shared,
            started,
            task.message_id,
            INBOX_FALLBACK.to_string(),
            reply.confidence,
            RationaleTag::ThresholdRejected,
        ));
    }

    // 10. Calibrator bookkeeping for later feedback.
    shared
        .calibrator
        .record_prediction(task.message_id, &reply.folder, runtime.provider.name());

    // 11-13. Sign, cache, emit.
    let decision = seal(
        runtime,
        shared,
        started,
        task.message_id,
        reply.folder,
        reply.confidence,
        RationaleTag::ModelDecided,
    );
    shared.cache.insert(
        fingerprint,
        CachedDecision {
            target_folder: decision.target_folder.clone(),
            confidence: decision.confidence,
            rationale_tag: decision.rationale_tag,
            provider_name: decision.provider_name.clone(),
            model_name: decision.model_name.clone(),
        },
    );
    Ok(decision)
}

/// Validate request shape; returns the deduplicated folder list.
fn validate(task: &ClassifyTask<'_>) -> Result<Vec<String>> {
    if task.folders.is_empty() {
        return Err(Error::InvalidRequest(
            "candidate folder list must not be empty".to_string(),
        ));
    }
    if task.subject.len() > 4096 {
        return Err(Error::InvalidRequest(
            "subject exceeds 4 KiB".to_string(),
        ));
    }

    let mut folders = Vec::with_capacity(task.folders.len());
    for folder in task.folders {
        if folder.is_empty() {
            return Err(Error::InvalidRequest(
                "candidate folder names must not be empty".to_string(),
            ));
        }
        if !folders.contains(folder) {
            folders.push(folder.clone());
        }
    }
    Ok(folders)
}

/// Wait for admission according to the task's rate policy.
async fn acquire<P: ModelBackend>(runtime: &Runtime<P>, wait: RateWait) -> bool {
    let budget = match wait {
        RateWait::NonBlocking => return runtime.limiter.try_acquire().is_admitted(),
        RateWait::WaitUpTo(cap) => cap,
    };

    let started = Instant::now();
    loop {
        match runtime.limiter.try_acquire() {
            Admission::Admitted => return true,
            Admission::RetryAfter(pause) => {
                if started.elapsed() + pause > budget {
                    return false;
                }
                tokio::time::sleep(pause).await;
            }
        }
    }
}

/// Finalize a decision: latency, optional signature, counter update.
fn seal<P: ModelBackend>(
    runtime: &Runtime<P>,
    shared: &SharedState,
    started: Instant,
    message_id: &str,
    target_folder: String,
    confidence: f64,
    tag: RationaleTag,
) -> ClassificationDecision {
    shared.stats.record_tag(tag);

    let provider_name = runtime.provider.name().to_string();
    let model_name = runtime.provider.model_id().to_string();

    let signature = runtime.signer.as_ref().map(|signer| {
        signer.sign(
            &target_folder,
            confidence,
            &provider_name,
            &model_name,
            message_id,
        )
    });

    ClassificationDecision {
        target_folder,
        confidence,
        rationale_tag: tag,
        signature,
        latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        provider_name,
        model_name,
    }
}
