//! Storage port: the narrow contract the engine consumes.
//!
//! Workers, servers, and clients never touch a database directly; they go
//! through [`JobStorage`]. An adapter owns representation and must provide
//! one hard guarantee: [`JobStorage::next`] is an atomic claim. If two
//! workers race for the same pending row, at most one wins. SQL-backed
//! adapters get this from `FOR UPDATE SKIP LOCKED`; backends without row
//! locking (like the in-memory reference store) serialize the scan-and-mark
//! behind a mutex.
//!
//! A handle is scoped to a single queue: every operation reads and writes
//! that queue's rows only.

mod memory;

pub use memory::InMemoryJobStorage;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{JobRecord, JobStatus};

/// What a change-stream delta did to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row delta emitted by storage adapters that support change streaming.
///
/// `old` is absent for inserts, `new` for deletes. Cross-process clients
/// translate these back into lifecycle events.
#[derive(Debug, Clone)]
pub struct JobChange {
    pub kind: ChangeKind,
    pub old: Option<JobRecord>,
    pub new: Option<JobRecord>,
}

/// Abstract atomic access to one queue's durable job table.
///
/// All methods return `anyhow::Result`; the engine logs and absorbs storage
/// errors rather than letting them halt a processing loop.
#[async_trait]
pub trait JobStorage: Send + Sync {
    /// Insert a pending row. Returns the job's id.
    async fn add(&self, job: JobRecord) -> Result<Uuid>;

    /// Fetch a row by id.
    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>>;

    /// Atomically claim the next ready job for `worker_id`.
    ///
    /// Selects one row with `status = pending` and `run_after <= now`,
    /// ordered by `run_after` ascending, and in the same step transitions
    /// it to `processing`, stamps `last_ran_at` and `worker_id`, and
    /// increments `run_attempts`. Returns the claimed row.
    async fn next(&self, worker_id: &str) -> Result<Option<JobRecord>>;

    /// Non-destructive read of up to `limit` rows, optionally filtered by
    /// status, ordered by `run_after` ascending.
    async fn peek(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<JobRecord>>;

    /// Number of rows, optionally filtered by status.
    async fn size(&self, status: Option<JobStatus>) -> Result<usize>;

    /// Write back a mutated row. Used for every state transition:
    /// settlement, retry reschedule, disable, restart fix-up.
    ///
    /// Terminal rows are absorbing: writing over a row that already
    /// settled is a no-op.
    async fn complete(&self, job: &JobRecord) -> Result<()>;

    /// Request an abort: set `status = aborting` if the row is pending or
    /// processing. Settled rows are untouched. Idempotent.
    async fn abort(&self, id: Uuid) -> Result<()>;

    /// Partial update of the progress fields. Does not transition state
    /// and is a no-op for settled rows.
    async fn save_progress(
        &self,
        id: Uuid,
        progress: f64,
        message: &str,
        details: Option<Value>,
    ) -> Result<()>;

    /// Delete one row.
    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Delete every row in the queue.
    async fn delete_all(&self) -> Result<()>;

    /// TTL sweep: delete rows with `status` whose `completed_at` is older
    /// than `age`. Returns how many rows went away.
    async fn delete_by_status_and_age(&self, status: JobStatus, age: Duration) -> Result<usize>;

    /// All rows sharing a `job_run_id`.
    async fn get_by_run_id(&self, job_run_id: &str) -> Result<Vec<JobRecord>>;

    /// Output-cache lookup: the output of a completed job whose input
    /// fingerprint matches this input's.
    async fn output_for_input(&self, input: &Value) -> Result<Option<Value>>;

    /// Subscribe to row deltas, if this adapter can stream changes.
    ///
    /// Adapters without change streaming return `None`; clients then need
    /// a co-located server to observe lifecycle events.
    fn subscribe_changes(&self) -> Option<broadcast::Receiver<JobChange>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_kind_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&ChangeKind::Insert).unwrap(),
            "\"INSERT\""
        );
        assert_eq!(
            serde_json::to_string(&ChangeKind::Update).unwrap(),
            "\"UPDATE\""
        );
        assert_eq!(
            serde_json::to_string(&ChangeKind::Delete).unwrap(),
            "\"DELETE\""
        );
    }
}
