//! Worker: the pull loop that turns pending rows into settled rows.
//!
//! ```text
//! Worker loop (one tokio task per worker)
//!     │
//!     ├─► observe abort requests (rows marked aborting → cancel tokens)
//!     ├─► limiter.can_proceed()?
//!     ├─► storage.next(worker_id)      atomic pending → processing claim
//!     │       └─► tokio::spawn(execute)   not awaited; the loop keeps claiming
//!     └─► sleep(poll_interval), repeat
//!
//! execute (one spawned task per claimed job)
//!     │
//!     ├─► handler.execute(input, ctx { signal, progress })
//!     └─► settle: completed | pending (retry) | failed | disabled
//! ```
//!
//! The loop itself never blocks on user code: claimed jobs run as spawned
//! tasks, and how many may be in flight at once is entirely the limiter's
//! call. All storage and limiter failures inside the loop are logged and
//! absorbed; a broken backend shows up as a stalled queue, not a dead
//! worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, JobError};
use crate::events::{JobEvent, QueueEvents};
use crate::handler::{JobContext, JobHandler, ProgressReporter};
use crate::job::{JobRecord, JobStatus};
use crate::limiter::Limiter;
use crate::storage::JobStorage;

/// Upper bound on aborting rows examined per poll.
const ABORT_SCAN_LIMIT: usize = 256;

/// Configuration for a single worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue this worker serves; stamped on every event it emits.
    pub queue_name: String,
    /// Pause between poll iterations.
    pub poll_interval: Duration,
    /// Identifier stamped on claimed rows.
    pub worker_id: String,
}

impl WorkerConfig {
    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: "default".to_string(),
            poll_interval: Duration::from_millis(100),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

/// Incremental mean of per-job processing time.
#[derive(Debug, Default)]
struct RollingAverage {
    count: u64,
    mean_ms: f64,
}

impl RollingAverage {
    fn record(&mut self, sample_ms: f64) {
        self.count += 1;
        self.mean_ms += (sample_ms - self.mean_ms) / self.count as f64;
    }
}

/// A single worker bound to one queue, one storage handle, one limiter,
/// and one handler.
pub struct Worker {
    config: WorkerConfig,
    storage: Arc<dyn JobStorage>,
    limiter: Arc<dyn Limiter>,
    handler: Arc<dyn JobHandler>,
    events: QueueEvents,
    /// Cancellation tokens for jobs this worker currently holds.
    active_aborts: RwLock<HashMap<Uuid, CancellationToken>>,
    /// In-flight execution count, for drain on stop.
    processing: AtomicUsize,
    timing: Mutex<RollingAverage>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        storage: Arc<dyn JobStorage>,
        limiter: Arc<dyn Limiter>,
        handler: Arc<dyn JobHandler>,
        events: QueueEvents,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            storage,
            limiter,
            handler,
            events,
            active_aborts: RwLock::new(HashMap::new()),
            processing: AtomicUsize::new(0),
            timing: Mutex::new(RollingAverage::default()),
            shutdown,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Number of executions currently in flight.
    pub fn processing_count(&self) -> usize {
        self.processing.load(Ordering::SeqCst)
    }

    /// Mean processing time of this worker's settled jobs, milliseconds.
    pub async fn average_processing_ms(&self) -> f64 {
        self.timing.lock().await.mean_ms
    }

    /// Run until the shutdown token fires.
    pub async fn run(self: Arc<Self>) {
        info!(
            worker_id = %self.config.worker_id,
            queue = %self.config.queue_name,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "worker starting"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            self.observe_aborts().await;

            match self.limiter.can_proceed().await {
                Ok(true) => match self.storage.next(&self.config.worker_id).await {
                    Ok(Some(job)) => {
                        debug!(
                            job_id = %job.id,
                            queue = %self.config.queue_name,
                            attempt = job.run_attempts,
                            "claimed job"
                        );
                        // Recorded here, not in the spawned task, so the
                        // next poll sees the start already accounted for.
                        if let Err(error) = self.limiter.record_job_start().await {
                            warn!(job_id = %job.id, error = %error, "limiter failed to record start");
                        }
                        self.dispatch(job);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        error!(
                            worker_id = %self.config.worker_id,
                            error = %error,
                            "failed to claim next job"
                        );
                    }
                },
                Ok(false) => {}
                Err(error) => {
                    // A broken limiter reads as backpressure, never a crash.
                    warn!(
                        worker_id = %self.config.worker_id,
                        error = %error,
                        "limiter check failed, holding off"
                    );
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    /// Stop claiming, give in-flight jobs a drain window, cancel whatever
    /// is still running, then give the cancellations time to land.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        tokio::time::sleep(self.drain_wait()).await;

        {
            let active = self.active_aborts.read().await;
            for token in active.values() {
                token.cancel();
            }
        }

        tokio::time::sleep(self.drain_wait()).await;
    }

    fn drain_wait(&self) -> Duration {
        let processing = self.processing.load(Ordering::SeqCst) as u64;
        Duration::from_millis((processing * 2).max(100))
    }

    /// Trigger cancellation for any held job whose row was marked aborting.
    async fn observe_aborts(&self) {
        let aborting = match self
            .storage
            .peek(Some(JobStatus::Aborting), ABORT_SCAN_LIMIT)
            .await
        {
            Ok(rows) => rows,
            Err(error) => {
                warn!(
                    worker_id = %self.config.worker_id,
                    error = %error,
                    "failed to poll abort requests"
                );
                return;
            }
        };
        if aborting.is_empty() {
            return;
        }

        let active = self.active_aborts.read().await;
        for row in aborting {
            if let Some(token) = active.get(&row.id) {
                if !token.is_cancelled() {
                    info!(
                        job_id = %row.id,
                        queue = %self.config.queue_name,
                        "abort requested, cancelling job"
                    );
                    self.events.emit(JobEvent::JobAborting {
                        queue: self.config.queue_name.clone(),
                        id: row.id,
                    });
                    token.cancel();
                }
            } else if row.worker_id.is_none() {
                // Aborted before any worker claimed it. Nobody will ever
                // hold this row, so settle it here; the absorbing write
                // keeps racing workers from settling it twice.
                self.events.emit(JobEvent::JobAborting {
                    queue: self.config.queue_name.clone(),
                    id: row.id,
                });
                self.settle_failed(row, &JobError::Abort).await;
            }
        }
    }

    /// Spawn a claimed job's execution without awaiting it.
    fn dispatch(self: &Arc<Self>, job: JobRecord) {
        let worker = Arc::clone(self);
        self.processing.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            worker.execute_job(job).await;
            worker.processing.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn execute_job(&self, job: JobRecord) {
        let id = job.id;
        self.run_claimed(job).await;
        self.active_aborts.write().await.remove(&id);
        if let Err(error) = self.limiter.record_job_completion().await {
            warn!(job_id = %id, error = %error, "limiter failed to record completion");
        }
    }

    async fn run_claimed(&self, job: JobRecord) {
        let id = job.id;
        let queue = self.config.queue_name.clone();
        let now = Utc::now();

        // Deadline is a pre-dispatch gate; a job already running is never
        // interrupted for it.
        if job.past_deadline(now) {
            self.settle_failed(job, &JobError::permanent("exceeded deadline"))
                .await;
            return;
        }

        // An abort can land between the claim and this point.
        match self.storage.get(id).await {
            Ok(Some(current)) if current.status == JobStatus::Aborting => {
                self.events.emit(JobEvent::JobAborting {
                    queue: queue.clone(),
                    id,
                });
                self.settle_failed(current, &JobError::Abort).await;
                return;
            }
            Ok(Some(current)) if current.is_terminal() => return,
            _ => {}
        }

        let token = CancellationToken::new();
        self.active_aborts.write().await.insert(id, token.clone());

        self.events.emit(JobEvent::JobStart {
            queue: queue.clone(),
            id,
        });

        let started = Instant::now();
        let reporter = ProgressReporter::new(
            self.storage.clone(),
            self.events.clone(),
            queue.clone(),
            id,
        );
        let ctx = JobContext::new(token.clone(), reporter);

        let result = self.handler.execute(job.input.clone(), ctx).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        // Settle against the freshest row so progress written during the
        // run survives the write-back.
        let row = match self.storage.get(id).await {
            Ok(Some(current)) => current,
            _ => job,
        };

        // Anything that finishes after an abort was signalled settles as
        // an abort, success included.
        let aborted = token.is_cancelled() || row.status == JobStatus::Aborting;
        let outcome = match result {
            _ if aborted => Err(JobError::Abort),
            other => other,
        };

        match outcome {
            Ok(output) => self.settle_completed(row, output).await,
            Err(err) if err.should_retry(row.run_attempts, row.max_retries) => {
                self.settle_retry(row, err).await;
            }
            Err(JobError::Disabled(message)) => self.settle_disabled(row, message).await,
            Err(err) => self.settle_failed(row, &err).await,
        }

        self.timing.lock().await.record(elapsed_ms);
    }

    async fn settle_completed(&self, mut row: JobRecord, output: Value) {
        let id = row.id;
        row.status = JobStatus::Completed;
        row.output = Some(output.clone());
        row.error = None;
        row.error_code = None;
        row.progress = 100.0;
        row.progress_message = String::new();
        row.progress_details = None;
        row.completed_at = Some(Utc::now());

        self.write_back(&row).await;
        debug!(job_id = %id, queue = %self.config.queue_name, "job completed");
        self.events.emit(JobEvent::JobComplete {
            queue: self.config.queue_name.clone(),
            id,
            output,
        });
    }

    async fn settle_retry(&self, mut row: JobRecord, err: JobError) {
        let JobError::Retryable { message, retry_at } = err else {
            return;
        };
        let id = row.id;

        // The error's own hint wins; otherwise ask the limiter when a
        // start is next plausible.
        let run_after = match retry_at {
            Some(at) => at,
            None => self
                .limiter
                .next_available_time()
                .await
                .unwrap_or_else(|_| Utc::now()),
        };

        row.status = JobStatus::Pending;
        row.run_after = run_after;
        row.error = Some(message.clone());
        row.error_code = Some(ErrorCode::Retryable);
        row.progress = 0.0;
        row.progress_message = String::new();
        row.progress_details = None;
        row.worker_id = None;

        self.write_back(&row).await;
        warn!(
            job_id = %id,
            queue = %self.config.queue_name,
            attempt = row.run_attempts,
            run_after = %run_after,
            error = %message,
            "job failed, retrying"
        );
        self.events.emit(JobEvent::JobRetry {
            queue: self.config.queue_name.clone(),
            id,
            run_after,
        });
    }

    async fn settle_failed(&self, mut row: JobRecord, err: &JobError) {
        let id = row.id;
        let message = err.to_string();
        let code = err.code();

        row.status = JobStatus::Failed;
        row.error = Some(message.clone());
        row.error_code = Some(code);
        row.completed_at = Some(Utc::now());

        self.write_back(&row).await;
        warn!(
            job_id = %id,
            queue = %self.config.queue_name,
            error_code = %code,
            error = %message,
            "job failed"
        );
        self.events.emit(JobEvent::JobFailed {
            queue: self.config.queue_name.clone(),
            id,
            message,
            error_code: Some(code),
        });
    }

    async fn settle_disabled(&self, mut row: JobRecord, message: String) {
        let id = row.id;
        row.status = JobStatus::Disabled;
        row.error = Some(message.clone());
        row.error_code = Some(ErrorCode::Disabled);
        row.completed_at = Some(Utc::now());

        self.write_back(&row).await;
        info!(job_id = %id, queue = %self.config.queue_name, "job disabled");
        self.events.emit(JobEvent::JobDisabled {
            queue: self.config.queue_name.clone(),
            id,
        });
    }

    async fn write_back(&self, row: &JobRecord) {
        if let Err(error) = self.storage.complete(row).await {
            error!(
                job_id = %row.id,
                queue = %self.config.queue_name,
                error = %error,
                "failed to write job settlement"
            );
        }
    }
}
