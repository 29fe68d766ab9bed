//! The native-messaging host: reader, worker pool, and writer
//!
//! A single reader task feeds a bounded work queue; a small pool of
//! workers drains it and runs classification pipelines concurrently; one
//! writer task serializes every response frame onto the output stream.
//! Control frames (`get_config`, `set_config`, `feedback`, `stats`,
//! `ping`) are handled inline on the reader so a `set_config` is fully
//! applied before any subsequently-dequeued `classify` observes it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{self, BatchCoordinator};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::framing::{self, FrameError};
use crate::orchestrator::{self, ClassifyTask, RateWait, Runtime, SharedState, Stats};
use crate::protocol::{
    ClassificationResponse, ClassifyRequest, DispatchMode, HealthResponse, HealthStatus,
    Request, Response, StatsResponse,
};
use crate::provider::{ModelBackend, Provider, ProviderHealth};
use crate::signer::{EnvSecretStore, SecretStore};

/// Writer-side response channel depth.
const RESPONSE_CHANNEL: usize = 256;

/// Rate budget deferred classify frames may wait out.
const DEFERRED_RATE_WAIT: Duration = Duration::from_secs(30);

/// Process-wide engine: the swappable runtime snapshot plus everything
/// that survives a configuration reload.
pub struct Engine {
    runtime: ArcSwap<Runtime<Provider>>,
    pub shared: Arc<SharedState>,
    pub batches: BatchCoordinator,
    secrets: Arc<dyn SecretStore>,
    started_at: chrono::DateTime<chrono::Utc>,
    started: Instant,
}

impl Engine {
    /// Build the engine from startup configuration. Fails fast on
    /// invalid configuration or (when signing is on) missing key
    /// material.
    pub fn new(config: Config, secrets: Arc<dyn SecretStore>) -> Result<Self> {
        let shared = Arc::new(SharedState::new(&config));
        let runtime = Runtime::build(config, secrets.as_ref())?;
        Ok(Self {
            runtime: ArcSwap::from_pointee(runtime),
            shared,
            batches: BatchCoordinator::new(),
            secrets,
            started_at: chrono::Utc::now(),
            started: Instant::now(),
        })
    }

    /// The current runtime snapshot. Holders see a consistent view for
    /// the duration of one request.
    #[must_use]
    pub fn runtime(&self) -> Arc<Runtime<Provider>> {
        self.runtime.load_full()
    }

    /// Validate and atomically publish a new configuration. On rejection
    /// the previous snapshot stays in effect.
    pub fn reload(&self, config: Config) -> Result<()> {
        let runtime = Runtime::build(config, self.secrets.as_ref())?;
        self.runtime.store(Arc::new(runtime));
        info!("configuration reloaded");
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> Config {
        self.runtime().config.clone()
    }

    fn stats_response(&self, request_id: &str) -> StatsResponse {
        let runtime = self.runtime();
        let stats = &self.shared.stats;
        StatsResponse {
            request_id: request_id.to_string(),
            started_at: self.started_at,
            uptime_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            requests_total: Stats::load(&stats.requests),
            model_decided: Stats::load(&stats.model_decided),
            threshold_rejected: Stats::load(&stats.threshold_rejected),
            folder_rejected: Stats::load(&stats.folder_rejected),
            provider_failed: Stats::load(&stats.provider_failed),
            circuit_open: Stats::load(&stats.circuit_open),
            rate_limited: Stats::load(&stats.rate_limited),
            invalid_requests: Stats::load(&stats.invalid_requests),
            cache_hits: Stats::load(&stats.cache_hits),
            cache_entries: self.shared.cache.len(),
            tokens_in: Stats::load(&stats.tokens_in),
            tokens_out: Stats::load(&stats.tokens_out),
            provider_name: runtime.provider.name().to_string(),
            breaker_state: runtime.breaker.state().as_str().to_string(),
            threshold_proposals: self.shared.calibrator.proposals(),
        }
    }
}

/// Run the host over stdin/stdout with the env-backed secret store.
///
/// Reads `.env` first so key refs like `env:MAILSORT_SIGNING_KEY`
/// resolve the same way in development and under the mail client.
pub async fn run(config: Config) -> Result<()> {
    dotenvy::dotenv().ok();
    let secrets: Arc<dyn SecretStore> = Arc::new(EnvSecretStore);
    let engine = Arc::new(Engine::new(config, secrets)?);
    serve(engine, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Run the dispatch loop over arbitrary streams (tests drive this with
/// in-memory duplex pipes).
pub async fn serve<R, W>(engine: Arc<Engine>, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let config = engine.config();

    let (response_tx, response_rx) = mpsc::channel::<Response>(RESPONSE_CHANNEL);
    let writer = tokio::spawn(write_loop(output, response_rx));

    let (work_tx, work_rx) = mpsc::channel::<ClassifyRequest>(config.queue_depth);
    let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
    let cancel = CancellationToken::new();

    let mut workers = Vec::with_capacity(config.workers);
    for id in 0..config.workers {
        workers.push(tokio::spawn(worker_loop(
            id,
            Arc::clone(&engine),
            Arc::clone(&work_rx),
            response_tx.clone(),
            cancel.clone(),
        )));
    }

    let outcome = read_loop(&engine, input, work_tx, response_tx.clone()).await;

    // The work queue sender is gone; give workers the grace period to
    // drain what was already accepted, then cut them off.
    let grace = Duration::from_millis(engine.config().shutdown_grace_ms);
    if tokio::time::timeout(grace, join_all(&mut workers))
        .await
        .is_err()
    {
        warn!("shutdown grace period elapsed, aborting workers");
        cancel.cancel();
        for worker in &workers {
            worker.abort();
        }
    }

    drop(response_tx);
    writer.await.ok();

    outcome
}

/// Sequentially read frames, answer control frames inline, and hand
/// classification work to the queue.
async fn read_loop<R>(
    engine: &Arc<Engine>,
    mut input: R,
    work_tx: mpsc::Sender<ClassifyRequest>,
    response_tx: mpsc::Sender<Response>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let value = match framing::read_frame(&mut input).await {
            Ok(value) => value,
            Err(FrameError::Eof) => {
                info!("input stream closed, shutting down");
                return Ok(());
            }
            Err(e) if e.is_recoverable() => {
                warn!(code = e.code(), "dropping malformed frame");
                let frame = Response::error(None, e.code(), Some(e.to_string()));
                response_tx.send(frame).await.ok();
                continue;
            }
            Err(e) => {
                error!(code = e.code(), "unrecoverable framing error");
                return Err(e.into());
            }
        };

        let request_id = value
            .get("request_id")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string);

        let request = match Request::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                let frame =
                    Response::error(request_id.as_deref(), e.code(), Some(e.to_string()));
                response_tx.send(frame).await.ok();
                continue;
            }
        };

        dispatch(engine, request, &work_tx, &response_tx).await;
    }
}

/// Route one parsed request.
async fn dispatch(
    engine: &Arc<Engine>,
    request: Request,
    work_tx: &mpsc::Sender<ClassifyRequest>,
    response_tx: &mpsc::Sender<Response>,
) {
    match request {
        Request::Classify(classify) => {
            if let Err(rejected) = work_tx.try_send(classify) {
                let classify = rejected.into_inner();
                debug!(request_id = %classify.request_id, "work queue full");
                let frame = Response::error(
                    Some(&classify.request_id),
                    "busy",
                    Some("work queue is full".to_string()),
                );
                response_tx.send(frame).await.ok();
            }
        }

        Request::HealthCheck { request_id } => {
            // Provider I/O must not stall the reader.
            let engine = Arc::clone(engine);
            let response_tx = response_tx.clone();
            tokio::spawn(async move {
                let runtime = engine.runtime();
                let health = runtime.provider.health_check().await;
                let (status, healthy) = match &health {
                    ProviderHealth::Ok => (HealthStatus::Ok, true),
                    ProviderHealth::RateLimited => (HealthStatus::Degraded, false),
                    ProviderHealth::AuthFailed | ProviderHealth::Unreachable(_) => {
                        (HealthStatus::Error, false)
                    }
                };
                let frame = Response::Health(HealthResponse {
                    request_id,
                    status,
                    provider_name: runtime.provider.name().to_string(),
                    provider_healthy: healthy,
                });
                response_tx.send(frame).await.ok();
            });
        }

        Request::BatchStart { request_id, items } => {
            let loader = {
                let engine = Arc::clone(engine);
                move || engine.runtime()
            };
            let (batch_id, queued) =
                engine
                    .batches
                    .start(loader, Arc::clone(&engine.shared), items);
            let frame = Response::BatchAck {
                request_id,
                batch_id,
                queued,
            };
            response_tx.send(frame).await.ok();
        }

        Request::BatchStatus {
            request_id,
            batch_id,
        } => {
            let frame = engine.batches.status(&batch_id).map_or_else(
                || {
                    Response::error(
                        Some(&request_id),
                        "unknown_batch",
                        Some(format!("no batch `{batch_id}`")),
                    )
                },
                |snapshot| {
                    Response::BatchStatus(crate::protocol::BatchStatusResponse {
                        request_id: request_id.clone(),
                        queued: snapshot.queued,
                        in_flight: snapshot.in_flight,
                        completed: snapshot.completed,
                        failed: snapshot.failed,
                        results: snapshot.results,
                    })
                },
            );
            response_tx.send(frame).await.ok();
        }

        Request::Feedback(feedback) => {
            engine
                .shared
                .calibrator
                .record_feedback(&feedback.message_id, &feedback.actual_folder);
            if let Some(request_id) = feedback.request_id {
                response_tx.send(Response::Ack { request_id }).await.ok();
            }
        }

        Request::Stats { request_id } => {
            // Advisory: dropped rather than applying backpressure.
            let frame = Response::Stats(engine.stats_response(&request_id));
            response_tx.try_send(frame).ok();
        }

        Request::GetConfig { request_id } => {
            let frame = Response::Config {
                request_id,
                config: engine.config(),
            };
            response_tx.send(frame).await.ok();
        }

        Request::SetConfig { request_id, config } => {
            let frame = match engine.reload(config) {
                Ok(()) => Response::Config {
                    request_id,
                    config: engine.config(),
                },
                Err(e) => Response::error(
                    Some(&request_id),
                    "config_rejected",
                    Some(e.to_string()),
                ),
            };
            response_tx.send(frame).await.ok();
        }

        Request::Ping { request_id } => {
            response_tx.send(Response::Pong { request_id }).await.ok();
        }
    }
}

/// Drain the work queue, one classification pipeline at a time.
async fn worker_loop(
    id: usize,
    engine: Arc<Engine>,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ClassifyRequest>>>,
    response_tx: mpsc::Sender<Response>,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                job = rx.recv() => job,
                () = cancel.cancelled() => None,
            }
        };
        let Some(request) = job else {
            debug!(worker = id, "worker stopping");
            return;
        };

        let response = handle_classify(&engine, &request).await;
        if response_tx.send(response).await.is_err() {
            return;
        }
    }
}

/// Run one classify frame through the orchestrator.
async fn handle_classify(engine: &Arc<Engine>, request: &ClassifyRequest) -> Response {
    let runtime = engine.runtime();

    let mode = batch::select_mode(request.origin.as_deref(), request.dispatch);
    let wait = match mode {
        DispatchMode::RealTime => RateWait::NonBlocking,
        DispatchMode::Deferred => RateWait::WaitUpTo(DEFERRED_RATE_WAIT),
    };

    let task = ClassifyTask {
        message_id: &request.message_id,
        subject: &request.subject,
        sender: &request.sender,
        body: &request.body,
        folders: &request.folders,
        attachments: &request.attachments,
        mode: request.mode,
        wait,
    };

    match orchestrator::classify(runtime.as_ref(), &engine.shared, task).await {
        Ok(decision) => Response::Classification(ClassificationResponse::new(
            &request.request_id,
            &request.message_id,
            decision,
        )),
        Err(e) => {
            let code = match &e {
                Error::SanitizationOverflow(_) => "sanitization_overflow",
                _ => "invalid_request",
            };
            Response::error(Some(&request.request_id), code, Some(e.to_string()))
        }
    }
}

/// Serialize responses onto the output stream, one frame at a time.
async fn write_loop<W>(mut output: W, mut response_rx: mpsc::Receiver<Response>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = response_rx.recv().await {
        if let Err(e) = framing::write_frame(&mut output, &response).await {
            error!(error = %e, "cannot write response frame");
            return;
        }
    }
}
