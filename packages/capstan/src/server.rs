//! Queue server: supervises a worker pool and the queue's housekeeping.
//!
//! On top of the workers it owns, a server adds three concerns:
//!
//! 1. **Startup fix-up** - rows left processing or aborting by a crashed
//!    process are swept back to pending before any worker starts, so work
//!    survives restarts.
//! 2. **Cleanup** - settled rows are deleted immediately, after a TTL, or
//!    never, per terminal status class.
//! 3. **Stats** - lifecycle events are folded into per-queue counters and
//!    re-published as stats snapshots.
//!
//! The server also carries the queue's event bus; co-located clients attach
//! to it directly and skip the storage change-stream round trip.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::events::{JobEvent, QueueEvents, QueueStats};
use crate::handler::JobHandler;
use crate::job::JobStatus;
use crate::limiter::{Limiter, NullLimiter};
use crate::storage::JobStorage;
use crate::worker::{Worker, WorkerConfig};

/// Server-creation options.
///
/// The three `delete_after_*` fields share one convention: `None` keeps
/// rows forever, `Some(Duration::ZERO)` deletes on settlement, any other
/// duration is a TTL enforced by the periodic sweep.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub queue_name: String,
    /// Initial worker pool size.
    pub worker_count: usize,
    /// Poll pause handed to each worker.
    pub poll_interval: Duration,
    pub delete_after_completion: Option<Duration>,
    pub delete_after_failure: Option<Duration>,
    pub delete_after_disabled: Option<Duration>,
    /// Cadence of the TTL sweep.
    pub cleanup_interval: Duration,
}

impl ServerConfig {
    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            queue_name: "default".to_string(),
            worker_count: 1,
            poll_interval: Duration::from_millis(100),
            delete_after_completion: None,
            delete_after_failure: None,
            delete_after_disabled: None,
            cleanup_interval: Duration::from_secs(10),
        }
    }
}

struct WorkerSlot {
    worker: Arc<Worker>,
    handle: JoinHandle<()>,
}

/// Supervisor of one queue: worker pool, fix-up, cleanup, stats.
pub struct JobServer {
    config: ServerConfig,
    storage: Arc<dyn JobStorage>,
    limiter: Arc<dyn Limiter>,
    handler: Arc<dyn JobHandler>,
    events: QueueEvents,
    workers: Arc<Mutex<Vec<WorkerSlot>>>,
    stats: Arc<Mutex<QueueStats>>,
    desired_workers: AtomicUsize,
    running: AtomicBool,
    /// Replaced on every start so start/stop/start cycles get fresh tokens.
    shutdown: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobServer {
    pub fn new(
        storage: Arc<dyn JobStorage>,
        handler: Arc<dyn JobHandler>,
        config: ServerConfig,
    ) -> Self {
        let desired = config.worker_count;
        Self {
            config,
            storage,
            limiter: Arc::new(NullLimiter),
            handler,
            events: QueueEvents::new(),
            workers: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(Mutex::new(QueueStats::default())),
            desired_workers: AtomicUsize::new(desired),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Replace the default [`NullLimiter`].
    pub fn with_limiter(mut self, limiter: Arc<dyn Limiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    /// The queue's local event bus. Attach clients here for in-process
    /// observation without storage round trips.
    pub fn events(&self) -> &QueueEvents {
        &self.events
    }

    pub fn storage(&self) -> Arc<dyn JobStorage> {
        self.storage.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current stats snapshot.
    pub async fn stats(&self) -> QueueStats {
        self.stats.lock().await.clone()
    }

    /// Current worker pool size.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Fix up orphans, then bring up housekeeping and the worker pool.
    ///
    /// Idempotent: a second start on a running server does nothing.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        *self.shutdown.lock().await = shutdown.clone();

        if let Err(error) = self.fix_up().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(error);
        }

        info!(
            queue = %self.config.queue_name,
            worker_count = self.desired_workers.load(Ordering::SeqCst),
            "queue server starting"
        );
        self.events.emit(JobEvent::QueueStart {
            queue: self.config.queue_name.clone(),
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(cleanup_loop(
            self.storage.clone(),
            self.config.clone(),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(event_loop(
            self.events.subscribe(),
            self.events.clone(),
            self.storage.clone(),
            self.stats.clone(),
            self.workers.clone(),
            self.config.clone(),
            shutdown.clone(),
        )));
        drop(tasks);

        let count = self.desired_workers.load(Ordering::SeqCst);
        let mut workers = self.workers.lock().await;
        for _ in 0..count {
            workers.push(self.spawn_worker(&shutdown));
        }

        Ok(())
    }

    /// Stop housekeeping and drain the worker pool.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(queue = %self.config.queue_name, "queue server stopping");

        let slots: Vec<WorkerSlot> = {
            let mut workers = self.workers.lock().await;
            workers.drain(..).collect()
        };

        // Workers drain in parallel; each stop cancels its own token.
        futures::future::join_all(slots.iter().map(|slot| slot.worker.stop())).await;
        for slot in slots {
            let _ = slot.handle.await;
        }

        self.shutdown.lock().await.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        self.events.emit(JobEvent::QueueStop {
            queue: self.config.queue_name.clone(),
        });
    }

    /// Grow or shrink the worker pool.
    ///
    /// New workers start immediately when the server is running; removed
    /// workers drain their in-flight jobs before going away. On a stopped
    /// server this just sets the pool size the next start will use.
    pub async fn scale_workers(&self, count: usize) {
        self.desired_workers.store(count, Ordering::SeqCst);
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let shutdown = self.shutdown.lock().await.clone();
        let mut victims = Vec::new();
        {
            let mut workers = self.workers.lock().await;
            while workers.len() < count {
                workers.push(self.spawn_worker(&shutdown));
            }
            while workers.len() > count {
                if let Some(slot) = workers.pop() {
                    victims.push(slot);
                }
            }
        }

        if !victims.is_empty() {
            info!(
                queue = %self.config.queue_name,
                removed = victims.len(),
                "scaling worker pool down"
            );
            futures::future::join_all(victims.iter().map(|slot| slot.worker.stop())).await;
            for slot in victims {
                let _ = slot.handle.await;
            }
        }
    }

    fn spawn_worker(&self, shutdown: &CancellationToken) -> WorkerSlot {
        let config = WorkerConfig {
            queue_name: self.config.queue_name.clone(),
            poll_interval: self.config.poll_interval,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        };
        let worker = Arc::new(Worker::new(
            config,
            self.storage.clone(),
            self.limiter.clone(),
            self.handler.clone(),
            self.events.clone(),
            shutdown.child_token(),
        ));
        let handle = tokio::spawn(worker.clone().run());
        WorkerSlot { worker, handle }
    }

    /// Sweep rows a dead process left mid-flight back to pending.
    ///
    /// Runs before any worker claims, so recovered rows keep their history
    /// (attempt counts survive) while becoming eligible again.
    async fn fix_up(&self) -> Result<()> {
        let mut recovered = 0usize;
        for status in [JobStatus::Processing, JobStatus::Aborting] {
            let rows = self.storage.peek(Some(status), usize::MAX).await?;
            for mut row in rows {
                row.status = JobStatus::Pending;
                row.run_after = row.last_ran_at.unwrap_or_else(Utc::now);
                row.progress = 0.0;
                row.progress_message = String::new();
                row.progress_details = None;
                row.error = Some("Server restarted".to_string());
                row.error_code = None;
                row.worker_id = None;
                self.storage.complete(&row).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(
                queue = %self.config.queue_name,
                recovered,
                "recovered orphaned jobs from previous run"
            );
        }
        Ok(())
    }
}

/// TTL classes swept by the cleanup loop and their immediate-delete hooks.
fn retention_classes(config: &ServerConfig) -> [(JobStatus, Option<Duration>); 3] {
    [
        (JobStatus::Completed, config.delete_after_completion),
        (JobStatus::Failed, config.delete_after_failure),
        (JobStatus::Disabled, config.delete_after_disabled),
    ]
}

async fn cleanup_loop(
    storage: Arc<dyn JobStorage>,
    config: ServerConfig,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.cleanup_interval) => {}
        }

        for (status, ttl) in retention_classes(&config) {
            // Zero means delete-on-settlement, handled by the event loop.
            let Some(ttl) = ttl.filter(|ttl| !ttl.is_zero()) else {
                continue;
            };
            let age = chrono::Duration::milliseconds(ttl.as_millis() as i64);
            match storage.delete_by_status_and_age(status, age).await {
                Ok(0) => {}
                Ok(swept) => {
                    debug!(queue = %config.queue_name, %status, swept, "ttl sweep");
                }
                Err(error) => {
                    warn!(queue = %config.queue_name, %status, error = %error, "ttl sweep failed");
                }
            }
        }
    }
}

/// Fold worker events into stats, apply delete-on-settlement hooks, and
/// re-publish stats snapshots.
async fn event_loop(
    mut receiver: broadcast::Receiver<JobEvent>,
    events: QueueEvents,
    storage: Arc<dyn JobStorage>,
    stats: Arc<Mutex<QueueStats>>,
    workers: Arc<Mutex<Vec<WorkerSlot>>>,
    config: ServerConfig,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = receiver.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(queue = %config.queue_name, missed, "stats fell behind the event bus");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let settled_delete = match &event {
            JobEvent::JobStart { .. } => {
                stats.lock().await.total_jobs += 1;
                None
            }
            JobEvent::JobComplete { id, .. } => {
                stats.lock().await.completed_jobs += 1;
                config.delete_after_completion.map(|ttl| (*id, ttl))
            }
            JobEvent::JobFailed { id, error_code, .. } => {
                {
                    let mut stats = stats.lock().await;
                    if *error_code == Some(ErrorCode::AbortSignal) {
                        stats.aborted_jobs += 1;
                    } else {
                        stats.failed_jobs += 1;
                    }
                }
                config.delete_after_failure.map(|ttl| (*id, ttl))
            }
            JobEvent::JobDisabled { id, .. } => {
                stats.lock().await.disabled_jobs += 1;
                config.delete_after_disabled.map(|ttl| (*id, ttl))
            }
            JobEvent::JobRetry { .. } => {
                stats.lock().await.retried_jobs += 1;
                None
            }
            JobEvent::JobAborting { .. }
            | JobEvent::JobProgress { .. }
            | JobEvent::QueueStart { .. }
            | JobEvent::QueueStop { .. }
            | JobEvent::QueueStatsUpdate { .. } => continue,
        };

        if let Some((id, ttl)) = settled_delete {
            if ttl.is_zero() {
                if let Err(error) = storage.delete(id).await {
                    warn!(job_id = %id, error = %error, "immediate delete failed");
                }
            }
        }

        let snapshot = {
            let mut stats = stats.lock().await;
            stats.average_processing_ms = pool_average(&workers).await;
            stats.last_update = Some(Utc::now());
            stats.clone()
        };
        events.emit(JobEvent::QueueStatsUpdate {
            queue: config.queue_name.clone(),
            stats: snapshot,
        });
    }
}

/// Mean of the per-worker rolling averages, ignoring workers that have not
/// settled anything yet.
async fn pool_average(workers: &Mutex<Vec<WorkerSlot>>) -> f64 {
    let workers = workers.lock().await;
    let mut sum = 0.0;
    let mut counted = 0usize;
    for slot in workers.iter() {
        let mean = slot.worker.average_processing_ms().await;
        if mean > 0.0 {
            sum += mean;
            counted += 1;
        }
    }
    if counted == 0 {
        0.0
    } else {
        sum / counted as f64
    }
}
