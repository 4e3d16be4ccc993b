//! Job lifecycle events and the per-queue broadcast bus.
//!
//! Events are facts about what happened to a job, not commands. Workers
//! publish them, the server aggregates them into stats and cleanup actions,
//! and attached clients consume them directly without a storage round-trip.
//! Clients connected only to storage reconstruct the same event sequence
//! from the change stream, so both observation paths speak this vocabulary.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: slow receivers may lag and miss events
//! - **In-memory only**: events are not persisted; the job row is the
//!   durable record
//! - **Causal order per job**: events for one job id arrive in the order
//!   its transitions happened

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 1024;

/// Aggregate counters for one queue, maintained by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Dispatches observed (every claim counts, including retries).
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub aborted_jobs: u64,
    pub retried_jobs: u64,
    pub disabled_jobs: u64,
    /// Mean per-job processing time across the worker pool, in milliseconds.
    pub average_processing_ms: f64,
    pub last_update: Option<DateTime<Utc>>,
}

/// Job lifecycle events for one queue.
///
/// The serialized `type` tags are part of the external vocabulary and are
/// kept stable for cross-process consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// The queue's server started accepting work.
    QueueStart { queue: String },

    /// The queue's server stopped.
    QueueStop { queue: String },

    /// A worker claimed the job and began executing it.
    JobStart { queue: String, id: Uuid },

    /// An abort request was observed; the job's cancellation was triggered.
    JobAborting { queue: String, id: Uuid },

    /// The job settled COMPLETED with this output.
    JobComplete {
        queue: String,
        id: Uuid,
        output: Value,
    },

    /// The job settled FAILED.
    #[serde(rename = "job_error")]
    JobFailed {
        queue: String,
        id: Uuid,
        message: String,
        error_code: Option<ErrorCode>,
    },

    /// The job settled DISABLED.
    JobDisabled { queue: String, id: Uuid },

    /// A retryable failure re-queued the job for `run_after`.
    JobRetry {
        queue: String,
        id: Uuid,
        run_after: DateTime<Utc>,
    },

    /// The running job reported progress.
    JobProgress {
        queue: String,
        id: Uuid,
        progress: f64,
        message: String,
        details: Option<Value>,
    },

    /// Periodic stats snapshot.
    QueueStatsUpdate { queue: String, stats: QueueStats },
}

impl JobEvent {
    /// The job id this event concerns, if it concerns a single job.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            JobEvent::JobStart { id, .. }
            | JobEvent::JobAborting { id, .. }
            | JobEvent::JobComplete { id, .. }
            | JobEvent::JobFailed { id, .. }
            | JobEvent::JobDisabled { id, .. }
            | JobEvent::JobRetry { id, .. }
            | JobEvent::JobProgress { id, .. } => Some(*id),
            JobEvent::QueueStart { .. }
            | JobEvent::QueueStop { .. }
            | JobEvent::QueueStatsUpdate { .. } => None,
        }
    }
}

/// Broadcast bus carrying [`JobEvent`]s for one queue.
///
/// Cloning shares the underlying channel, so a server and its workers can
/// all publish to the same bus.
#[derive(Clone)]
pub struct QueueEvents {
    sender: broadcast::Sender<JobEvent>,
}

impl QueueEvents {
    /// Create a bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with the given buffer capacity.
    ///
    /// The capacity bounds how far a slow receiver may fall behind before
    /// it starts lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of receivers that got the event; zero when nobody
    /// is listening, which is not an error.
    pub fn emit(&self, event: JobEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for QueueEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueueEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEvents")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
