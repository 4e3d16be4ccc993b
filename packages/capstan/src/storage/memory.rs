//! In-memory reference storage.
//!
//! The whole job table is a map behind one async mutex. That single lock is
//! what makes `next()` atomic here: the scan for the oldest ready row and
//! the pending→processing mark happen under the same critical section, so
//! two workers can never claim the same row. This is the adapter used by
//! the test suite and by single-process deployments that do not need
//! durability across restarts.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use super::{ChangeKind, JobChange, JobStorage};
use crate::job::{fingerprint_input, JobRecord, JobStatus};

/// Change-stream buffer; slow subscribers lag past this.
const CHANGE_CAPACITY: usize = 1024;

/// Map-behind-a-mutex job table with a broadcast change stream.
pub struct InMemoryJobStorage {
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
    changes: broadcast::Sender<JobChange>,
}

impl InMemoryJobStorage {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            jobs: Mutex::new(HashMap::new()),
            changes,
        }
    }

    fn emit(&self, kind: ChangeKind, old: Option<JobRecord>, new: Option<JobRecord>) {
        // Nobody listening is fine; the row is the durable record.
        let _ = self.changes.send(JobChange { kind, old, new });
    }
}

impl Default for InMemoryJobStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStorage for InMemoryJobStorage {
    async fn add(&self, job: JobRecord) -> Result<Uuid> {
        let mut jobs = self.jobs.lock().await;
        let id = job.id;
        if jobs.contains_key(&id) {
            return Err(anyhow!("duplicate job id: {id}"));
        }
        jobs.insert(id, job.clone());
        drop(jobs);
        self.emit(ChangeKind::Insert, None, Some(job));
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.get(&id).cloned())
    }

    async fn next(&self, worker_id: &str) -> Result<Option<JobRecord>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;

        // Oldest ready row; ties broken stably by creation time then id.
        let candidate = jobs
            .values()
            .filter(|job| job.is_ready(now))
            .min_by_key(|job| (job.run_after, job.created_at, job.id))
            .map(|job| job.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("job vanished during claim: {id}"))?;
        let old = job.clone();
        job.status = JobStatus::Processing;
        job.last_ran_at = Some(now);
        job.worker_id = Some(worker_id.to_string());
        job.run_attempts += 1;
        let claimed = job.clone();
        drop(jobs);

        self.emit(ChangeKind::Update, Some(old), Some(claimed.clone()));
        Ok(Some(claimed))
    }

    async fn peek(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<JobRecord>> {
        let jobs = self.jobs.lock().await;
        let mut rows: Vec<JobRecord> = jobs
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .cloned()
            .collect();
        rows.sort_by_key(|job| (job.run_after, job.created_at, job.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn size(&self, status: Option<JobStatus>) -> Result<usize> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .count())
    }

    async fn complete(&self, job: &JobRecord) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let existing = jobs
            .get_mut(&job.id)
            .ok_or_else(|| anyhow!("job not found: {}", job.id))?;

        // Settled rows are absorbing.
        if existing.is_terminal() {
            return Ok(());
        }

        let old = existing.clone();
        *existing = job.clone();
        let new = existing.clone();
        drop(jobs);

        self.emit(ChangeKind::Update, Some(old), Some(new));
        Ok(())
    }

    async fn abort(&self, id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or_else(|| anyhow!("job not found: {id}"))?;

        match job.status {
            JobStatus::Pending | JobStatus::Processing => {
                let old = job.clone();
                job.status = JobStatus::Aborting;
                let new = job.clone();
                drop(jobs);
                self.emit(ChangeKind::Update, Some(old), Some(new));
            }
            // Repeat aborts and settled rows: nothing to do.
            JobStatus::Aborting
            | JobStatus::Completed
            | JobStatus::Failed
            | JobStatus::Disabled => {}
        }
        Ok(())
    }

    async fn save_progress(
        &self,
        id: Uuid,
        progress: f64,
        message: &str,
        details: Option<Value>,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(());
        };
        if job.is_terminal() {
            return Ok(());
        }

        let old = job.clone();
        job.progress = progress;
        job.progress_message = message.to_string();
        job.progress_details = details;
        let new = job.clone();
        drop(jobs);

        self.emit(ChangeKind::Update, Some(old), Some(new));
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let removed = jobs.remove(&id);
        drop(jobs);
        if let Some(old) = removed {
            self.emit(ChangeKind::Delete, Some(old), None);
        }
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let removed: Vec<JobRecord> = jobs.drain().map(|(_, job)| job).collect();
        drop(jobs);
        for old in removed {
            self.emit(ChangeKind::Delete, Some(old), None);
        }
        Ok(())
    }

    async fn delete_by_status_and_age(&self, status: JobStatus, age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - age;
        let mut jobs = self.jobs.lock().await;
        let expired: Vec<Uuid> = jobs
            .values()
            .filter(|job| {
                job.status == status
                    && matches!(job.completed_at, Some(done) if done < cutoff)
            })
            .map(|job| job.id)
            .collect();
        let mut removed = Vec::with_capacity(expired.len());
        for id in &expired {
            if let Some(old) = jobs.remove(id) {
                removed.push(old);
            }
        }
        drop(jobs);

        let count = removed.len();
        for old in removed {
            self.emit(ChangeKind::Delete, Some(old), None);
        }
        Ok(count)
    }

    async fn get_by_run_id(&self, job_run_id: &str) -> Result<Vec<JobRecord>> {
        let jobs = self.jobs.lock().await;
        let mut rows: Vec<JobRecord> = jobs
            .values()
            .filter(|job| job.job_run_id.as_deref() == Some(job_run_id))
            .cloned()
            .collect();
        rows.sort_by_key(|job| (job.created_at, job.id));
        Ok(rows)
    }

    async fn output_for_input(&self, input: &Value) -> Result<Option<Value>> {
        let fingerprint = fingerprint_input(input);
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .find(|job| {
                job.status == JobStatus::Completed
                    && job.fingerprint.as_deref() == Some(fingerprint.as_str())
            })
            .and_then(|job| job.output.clone()))
    }

    fn subscribe_changes(&self) -> Option<broadcast::Receiver<JobChange>> {
        Some(self.changes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::job::SubmitOptions;
    use serde_json::json;

    fn job(queue: &str) -> JobRecord {
        JobRecord::new(queue, json!({"n": 1}), SubmitOptions::new())
    }

    #[tokio::test]
    async fn add_and_get_round_trip() {
        let storage = InMemoryJobStorage::new();
        let record = job("q");
        let id = storage.add(record.clone()).await.unwrap();
        assert_eq!(id, record.id);

        let fetched = storage.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.input, record.input);
        assert_eq!(fetched.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let storage = InMemoryJobStorage::new();
        let record = job("q");
        storage.add(record.clone()).await.unwrap();
        assert!(storage.add(record).await.is_err());
    }

    #[tokio::test]
    async fn claim_transitions_and_stamps() {
        let storage = InMemoryJobStorage::new();
        let id = storage.add(job("q")).await.unwrap();

        let claimed = storage.next("worker-a").await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-a"));
        assert_eq!(claimed.run_attempts, 1);
        assert!(claimed.last_ran_at.is_some());

        // Nothing left to claim.
        assert!(storage.next("worker-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_orders_by_run_after() {
        let storage = InMemoryJobStorage::new();
        let now = Utc::now();

        let late = JobRecord::new(
            "q",
            json!({"which": "late"}),
            SubmitOptions::new().run_after(now - Duration::seconds(1)),
        );
        let early = JobRecord::new(
            "q",
            json!({"which": "early"}),
            SubmitOptions::new().run_after(now - Duration::seconds(10)),
        );
        storage.add(late).await.unwrap();
        storage.add(early).await.unwrap();

        let first = storage.next("w").await.unwrap().unwrap();
        assert_eq!(first.input["which"], "early");
        let second = storage.next("w").await.unwrap().unwrap();
        assert_eq!(second.input["which"], "late");
    }

    #[tokio::test]
    async fn claim_skips_deferred_jobs() {
        let storage = InMemoryJobStorage::new();
        let deferred = JobRecord::new(
            "q",
            json!({}),
            SubmitOptions::new().run_after(Utc::now() + Duration::minutes(10)),
        );
        storage.add(deferred).await.unwrap();
        assert!(storage.next("w").await.unwrap().is_none());
        assert_eq!(storage.size(Some(JobStatus::Pending)).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_double_dispatch() {
        let storage = Arc::new(InMemoryJobStorage::new());
        for _ in 0..50 {
            storage.add(job("q")).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..8 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                let worker_id = format!("worker-{w}");
                let mut claimed = Vec::new();
                while let Some(job) = storage.next(&worker_id).await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
                total += 1;
            }
        }
        assert_eq!(total, 50);
    }

    #[tokio::test]
    async fn terminal_rows_are_absorbing() {
        let storage = InMemoryJobStorage::new();
        let id = storage.add(job("q")).await.unwrap();
        let mut claimed = storage.next("w").await.unwrap().unwrap();

        claimed.status = JobStatus::Completed;
        claimed.output = Some(json!({"y": 2}));
        claimed.completed_at = Some(Utc::now());
        storage.complete(&claimed).await.unwrap();

        // A late write against the settled row changes nothing.
        let mut stale = claimed.clone();
        stale.status = JobStatus::Failed;
        stale.output = None;
        storage.complete(&stale).await.unwrap();

        let current = storage.get(id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Completed);
        assert_eq!(current.output, Some(json!({"y": 2})));
    }

    #[tokio::test]
    async fn abort_marks_pending_and_processing_only() {
        let storage = InMemoryJobStorage::new();
        let id = storage.add(job("q")).await.unwrap();

        storage.abort(id).await.unwrap();
        assert_eq!(
            storage.get(id).await.unwrap().unwrap().status,
            JobStatus::Aborting
        );

        // Idempotent.
        storage.abort(id).await.unwrap();
        assert_eq!(
            storage.get(id).await.unwrap().unwrap().status,
            JobStatus::Aborting
        );

        // Settled rows stay settled.
        let completed_id = storage.add(job("q")).await.unwrap();
        let mut claimed = storage.next("w").await.unwrap().unwrap();
        assert_eq!(claimed.id, completed_id);
        claimed.status = JobStatus::Completed;
        claimed.completed_at = Some(Utc::now());
        storage.complete(&claimed).await.unwrap();
        storage.abort(completed_id).await.unwrap();
        assert_eq!(
            storage.get(completed_id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn progress_is_a_noop_after_settlement() {
        let storage = InMemoryJobStorage::new();
        let id = storage.add(job("q")).await.unwrap();
        let mut claimed = storage.next("w").await.unwrap().unwrap();

        storage
            .save_progress(id, 50.0, "halfway", Some(json!({"step": 2})))
            .await
            .unwrap();
        let row = storage.get(id).await.unwrap().unwrap();
        assert_eq!(row.progress, 50.0);
        assert_eq!(row.progress_message, "halfway");

        claimed.status = JobStatus::Failed;
        claimed.completed_at = Some(Utc::now());
        claimed.progress = 50.0;
        storage.complete(&claimed).await.unwrap();

        storage.save_progress(id, 99.0, "too late", None).await.unwrap();
        let row = storage.get(id).await.unwrap().unwrap();
        assert_eq!(row.progress, 50.0);
    }

    #[tokio::test]
    async fn ttl_sweep_deletes_only_old_rows_of_status() {
        let storage = InMemoryJobStorage::new();

        let fresh = storage.add(job("q")).await.unwrap();
        let mut claimed = storage.next("w").await.unwrap().unwrap();
        claimed.status = JobStatus::Completed;
        claimed.completed_at = Some(Utc::now());
        storage.complete(&claimed).await.unwrap();

        let old = storage.add(job("q")).await.unwrap();
        let mut claimed = storage.next("w").await.unwrap().unwrap();
        claimed.status = JobStatus::Completed;
        claimed.completed_at = Some(Utc::now() - Duration::hours(2));
        storage.complete(&claimed).await.unwrap();

        let swept = storage
            .delete_by_status_and_age(JobStatus::Completed, Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(swept, 1);
        assert!(storage.get(old).await.unwrap().is_none());
        assert!(storage.get(fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn output_cache_matches_by_fingerprint() {
        let storage = InMemoryJobStorage::new();
        let record = JobRecord::new("q", json!({"x": 7}), SubmitOptions::new());
        storage.add(record).await.unwrap();
        let mut claimed = storage.next("w").await.unwrap().unwrap();
        claimed.status = JobStatus::Completed;
        claimed.output = Some(json!({"y": 8}));
        claimed.completed_at = Some(Utc::now());
        storage.complete(&claimed).await.unwrap();

        let hit = storage.output_for_input(&json!({"x": 7})).await.unwrap();
        assert_eq!(hit, Some(json!({"y": 8})));

        let miss = storage.output_for_input(&json!({"x": 8})).await.unwrap();
        assert_eq!(miss, None);
    }

    #[tokio::test]
    async fn run_id_groups_jobs() {
        let storage = InMemoryJobStorage::new();
        for _ in 0..3 {
            let record = JobRecord::new(
                "q",
                json!({}),
                SubmitOptions::new().job_run_id("batch-a"),
            );
            storage.add(record).await.unwrap();
        }
        storage.add(job("q")).await.unwrap();

        let batch = storage.get_by_run_id("batch-a").await.unwrap();
        assert_eq!(batch.len(), 3);
        assert!(storage.get_by_run_id("batch-b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn change_stream_reports_row_deltas() {
        let storage = InMemoryJobStorage::new();
        let mut changes = storage.subscribe_changes().unwrap();

        let id = storage.add(job("q")).await.unwrap();
        let change = changes.recv().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Insert);
        assert!(change.old.is_none());
        assert_eq!(change.new.unwrap().id, id);

        storage.next("w").await.unwrap().unwrap();
        let change = changes.recv().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Update);
        assert_eq!(change.old.unwrap().status, JobStatus::Pending);
        assert_eq!(change.new.unwrap().status, JobStatus::Processing);

        storage.delete(id).await.unwrap();
        let change = changes.recv().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Delete);
        assert!(change.new.is_none());
    }
}
