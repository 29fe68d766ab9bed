//! Batch coordination: deferred classification of many messages
//!
//! A `batch_start` frame enqueues items to a background task that runs
//! them through the same pipeline as real-time requests, but with an
//! opt-in wait on the rate limiter instead of an immediate fallback.
//! `batch_status` reports progress and per-item results.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::orchestrator::{self, ClassifyTask, RateWait, Runtime, SharedState};
use crate::protocol::{BatchItem, BatchItemResult, DispatchMode, INBOX_FALLBACK};
use crate::provider::ModelBackend;

/// How long one batch item may wait out rate-limiter refills.
const RATE_WAIT_BUDGET: Duration = Duration::from_secs(30);

/// Pick real-time vs deferred handling for a classify frame.
///
/// The client's explicit override wins; otherwise requests labeled as
/// coming from a new-mail event (or unlabeled) run in real time and
/// everything else defers its rate budget.
#[must_use]
pub fn select_mode(origin: Option<&str>, override_mode: Option<DispatchMode>) -> DispatchMode {
    if let Some(mode) = override_mode {
        return mode;
    }
    match origin {
        None | Some("new_mail") => DispatchMode::RealTime,
        Some(_) => DispatchMode::Deferred,
    }
}

/// Progress of one batch.
#[derive(Debug, Default)]
pub struct BatchState {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    results: Mutex<Vec<BatchItemResult>>,
}

/// A `batch_status` snapshot.
#[derive(Debug, Clone)]
pub struct BatchSnapshot {
    pub queued: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    pub results: Vec<BatchItemResult>,
}

impl BatchState {
    fn new(total: usize) -> Self {
        let state = Self::default();
        state.queued.store(total, Ordering::Relaxed);
        state
    }

    fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            results: self
                .results
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone(),
        }
    }

    fn record(&self, result: BatchItemResult, failed: bool) {
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
        self.results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(result);
    }
}

/// Registry of live batches.
#[derive(Default)]
pub struct BatchCoordinator {
    batches: Mutex<HashMap<String, Arc<BatchState>>>,
}

impl BatchCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a batch and spawn its background worker. Returns the new
    /// batch id and how many items were queued.
    ///
    /// `load` yields the current runtime snapshot per item, so a
    /// configuration reload mid-batch applies to the remaining items.
    pub fn start<P, F>(
        &self,
        load: F,
        shared: Arc<SharedState>,
        items: Vec<BatchItem>,
    ) -> (String, usize)
    where
        P: ModelBackend + 'static,
        F: Fn() -> Arc<Runtime<P>> + Send + Sync + 'static,
    {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let queued = items.len();
        let state = Arc::new(BatchState::new(queued));

        self.lock().insert(batch_id.clone(), Arc::clone(&state));
        info!(batch_id = %batch_id, items = queued, "batch accepted");

        tokio::spawn(run_batch(load, shared, state, items));
        (batch_id, queued)
    }

    /// Snapshot a batch's progress.
    pub fn status(&self, batch_id: &str) -> Option<BatchSnapshot> {
        self.lock().get(batch_id).map(|state| state.snapshot())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<BatchState>>> {
        self.batches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Drain one batch sequentially under the shared resilience policies.
async fn run_batch<P, F>(
    load: F,
    shared: Arc<SharedState>,
    state: Arc<BatchState>,
    items: Vec<BatchItem>,
) where
    P: ModelBackend + 'static,
    F: Fn() -> Arc<Runtime<P>> + Send + Sync + 'static,
{
    for item in items {
        state.queued.fetch_sub(1, Ordering::Relaxed);
        state.in_flight.fetch_add(1, Ordering::Relaxed);

        let runtime = load();
        let task = ClassifyTask {
            message_id: &item.message_id,
            subject: &item.subject,
            sender: &item.sender,
            body: &item.body,
            folders: &item.folders,
            attachments: &item.attachments,
            mode: item.mode,
            wait: RateWait::WaitUpTo(RATE_WAIT_BUDGET),
        };

        match orchestrator::classify(runtime.as_ref(), &shared, task).await {
            Ok(decision) => {
                let failed = matches!(
                    decision.rationale_tag,
                    crate::protocol::RationaleTag::ProviderFailed
                        | crate::protocol::RationaleTag::CircuitOpen
                );
                state.record(
                    BatchItemResult {
                        message_id: item.message_id.clone(),
                        target_folder: decision.target_folder,
                        confidence: decision.confidence,
                        rationale_tag: decision.rationale_tag.as_str().to_string(),
                    },
                    failed,
                );
            }
            Err(e) => {
                debug!(message_id = %item.message_id, error = %e, "batch item rejected");
                state.record(
                    BatchItemResult {
                        message_id: item.message_id.clone(),
                        target_folder: INBOX_FALLBACK.to_string(),
                        confidence: 0.0,
                        rationale_tag: "invalid_request".to_string(),
                    },
                    true,
                );
            }
        }

        state.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
