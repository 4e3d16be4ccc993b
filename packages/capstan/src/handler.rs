//! The contract user job code implements, and the context it runs with.
//!
//! A handler is the one piece of user code in the engine: it takes the
//! job's input and produces its output. Which [`JobError`](crate::JobError)
//! variant it returns decides how the run settles (retry, fail, abort,
//! disable). The [`JobContext`] gives it two capabilities without exposing
//! any engine internals:
//!
//! - a cancellation token that fires when the job is aborted externally
//! - a progress reporter whose updates reach both storage and the event bus

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::error::JobError;
use crate::events::{JobEvent, QueueEvents};
use crate::storage::JobStorage;

/// User job code for one queue.
///
/// Implementations must be cancel-safe: when `ctx.signal()` fires the job
/// should unwind promptly and return [`JobError::Abort`]. A handler that
/// ignores the signal still runs to completion, but its result is settled
/// as an abort failure.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, input: Value, ctx: JobContext) -> Result<Value, JobError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnJobHandler<F>(F);

impl<F> FnJobHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnJobHandler<F>
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send,
{
    async fn execute(&self, input: Value, ctx: JobContext) -> Result<Value, JobError> {
        (self.0)(input, ctx).await
    }
}

/// Execution context handed to a handler for one run.
#[derive(Clone)]
pub struct JobContext {
    signal: CancellationToken,
    progress: ProgressReporter,
}

impl JobContext {
    pub(crate) fn new(signal: CancellationToken, progress: ProgressReporter) -> Self {
        Self { signal, progress }
    }

    /// Fires when an abort was requested for this job.
    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    /// Report progress. See [`ProgressReporter::update`].
    pub async fn update_progress(&self, progress: f64, message: &str, details: Option<Value>) {
        self.progress.update(progress, message, details).await;
    }
}

/// Fans one run's progress reports out to storage and the event bus.
///
/// Values are clamped to `[0, 100]` and never decrease within a run; a
/// report lower than the last one keeps the previous value (the message
/// and details still update). Reports against a settled row are dropped
/// by storage.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<ReporterInner>,
}

struct ReporterInner {
    storage: Arc<dyn JobStorage>,
    events: QueueEvents,
    queue: String,
    id: Uuid,
    last: Mutex<f64>,
}

impl ProgressReporter {
    pub(crate) fn new(
        storage: Arc<dyn JobStorage>,
        events: QueueEvents,
        queue: String,
        id: Uuid,
    ) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                storage,
                events,
                queue,
                id,
                last: Mutex::new(0.0),
            }),
        }
    }

    /// Write a progress update and publish the matching event.
    ///
    /// Storage failures are logged and swallowed; progress is advisory and
    /// must never take down a running job.
    pub async fn update(&self, progress: f64, message: &str, details: Option<Value>) {
        let clamped = progress.clamp(0.0, 100.0);

        let effective = {
            let mut last = self.inner.last.lock().await;
            if clamped > *last {
                *last = clamped;
            }
            *last
        };

        if let Err(error) = self
            .inner
            .storage
            .save_progress(self.inner.id, effective, message, details.clone())
            .await
        {
            warn!(
                job_id = %self.inner.id,
                queue = %self.inner.queue,
                error = %error,
                "failed to persist job progress"
            );
        }

        self.inner.events.emit(JobEvent::JobProgress {
            queue: self.inner.queue.clone(),
            id: self.inner.id,
            progress: effective,
            message: message.to_string(),
            details,
        });
    }
}
