//! Job model: the unit of persistence and the system's single source of truth.
//!
//! Every state transition a worker, server, or client makes is expressed as
//! a mutation of a [`JobRecord`] written back through the storage port. The
//! record is plain data (`Serialize`/`Deserialize`) so adapters can persist
//! it however they choose.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ErrorCode;

/// Lifecycle status of a job row.
///
/// `Completed`, `Failed`, and `Disabled` are absorbing: once a row enters
/// one of them its `output`, `error`, and `completed_at` never change.
/// `Aborting` is a request state, only meaningful while a worker holds the
/// claim; the worker observing it settles the row FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Aborting,
    Completed,
    Failed,
    Disabled,
}

impl JobStatus {
    /// Whether this status is absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Disabled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Aborting => "aborting",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// Submission-time options for a job.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Groups related jobs for batch abort.
    pub job_run_id: Option<String>,
    /// Stable hash of the input, used for output caching by input identity.
    /// Computed from the input when not supplied.
    pub fingerprint: Option<String>,
    /// Retry budget for retryable failures. A job may run `max_retries + 1`
    /// times in total.
    pub max_retries: u32,
    /// Not eligible for dispatch before this time. Defaults to now.
    pub run_after: Option<DateTime<Utc>>,
    /// Permanent failure if still undispatched past this time.
    pub deadline_at: Option<DateTime<Utc>>,
}

impl SubmitOptions {
    /// Options with the default retry budget of 3.
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            ..Default::default()
        }
    }

    pub fn job_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.job_run_id = Some(run_id.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn run_after(mut self, run_after: DateTime<Utc>) -> Self {
        self.run_after = Some(run_after);
        self
    }

    pub fn deadline_at(mut self, deadline_at: DateTime<Utc>) -> Self {
        self.deadline_at = Some(deadline_at);
        self
    }
}

/// A single job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,

    /// Namespace; every storage operation is scoped to one queue.
    pub queue: String,

    /// Groups related jobs for batch abort.
    pub job_run_id: Option<String>,

    /// Stable hash of `input`; output-cache lookups match on this.
    pub fingerprint: Option<String>,

    // Payload
    pub input: Value,
    pub output: Option<Value>,

    // State
    pub status: JobStatus,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,

    // Retry accounting. `run_attempts` is incremented on every claim.
    pub run_attempts: u32,
    pub max_retries: u32,

    // Scheduling
    pub created_at: DateTime<Utc>,
    pub run_after: DateTime<Utc>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub last_ran_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    // Progress (last reported)
    pub progress: f64,
    pub progress_message: String,
    pub progress_details: Option<Value>,

    /// Worker currently holding the claim, if any.
    pub worker_id: Option<String>,
}

impl JobRecord {
    /// Build a pending row for submission.
    pub fn new(queue: impl Into<String>, input: Value, options: SubmitOptions) -> Self {
        let now = Utc::now();
        let fingerprint = options
            .fingerprint
            .unwrap_or_else(|| fingerprint_input(&input));

        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            job_run_id: options.job_run_id,
            fingerprint: Some(fingerprint),
            input,
            output: None,
            status: JobStatus::Pending,
            error: None,
            error_code: None,
            run_attempts: 0,
            max_retries: options.max_retries,
            created_at: now,
            run_after: options.run_after.unwrap_or(now),
            deadline_at: options.deadline_at,
            last_ran_at: None,
            completed_at: None,
            progress: 0.0,
            progress_message: String::new(),
            progress_details: None,
            worker_id: None,
        }
    }

    /// Whether this row is eligible for claim at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_after <= now
    }

    /// Whether this row has settled.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the row sat past its dispatch deadline.
    pub fn past_deadline(&self, now: DateTime<Utc>) -> bool {
        matches!(self.deadline_at, Some(deadline) if now > deadline)
    }
}

/// Stable hash of a job input: SHA-256 over the canonical JSON encoding.
///
/// Two submissions with equal inputs get equal fingerprints, which is what
/// makes output-cache lookups by input identity work.
pub fn fingerprint_input(input: &Value) -> String {
    let bytes = serde_json::to_vec(input).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}
