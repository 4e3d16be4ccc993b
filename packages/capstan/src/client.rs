//! Client: submits jobs and observes their progress and outcomes.
//!
//! A client never pulls or executes jobs. It watches one of two event
//! sources, transparently to callers:
//!
//! - **Attached** to a co-located [`JobServer`]: lifecycle events arrive on
//!   the server's local bus, skipping storage entirely.
//! - **Connected** to storage: row deltas from the adapter's change stream
//!   are translated back into the same event vocabulary, which is what
//!   makes cross-process observation work.
//!
//! Both sources feed one pump task that settles `wait_for` callers through
//! a correlation table keyed by job id and fans progress out to per-job
//! subscriptions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::error::JobError;
use crate::events::JobEvent;
use crate::job::{JobRecord, JobStatus, SubmitOptions};
use crate::server::JobServer;
use crate::storage::{ChangeKind, JobChange, JobStorage};

/// One progress report observed for a job.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub message: String,
    pub details: Option<Value>,
}

type Waiter = (u64, oneshot::Sender<Result<Value, JobError>>);
type ProgressSender = (u64, mpsc::UnboundedSender<ProgressUpdate>);

struct ClientInner {
    queue: String,
    storage: Arc<dyn JobStorage>,
    /// Correlation table: outcome waiters keyed by job id.
    waiters: DashMap<Uuid, Vec<Waiter>>,
    progress_subs: DashMap<Uuid, Vec<ProgressSender>>,
    next_token: AtomicU64,
    stopped: AtomicBool,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Submitter/observer for one queue. Cloning shares the client.
#[derive(Clone)]
pub struct JobClient {
    inner: Arc<ClientInner>,
}

impl JobClient {
    /// Attach to a co-located server, observing its local event bus.
    pub fn attach(server: &JobServer) -> Self {
        let client = Self::bare(server.queue_name().to_string(), server.storage());
        let mut receiver = server.events().subscribe();
        let inner = client.inner.clone();
        let pump = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => handle_event(&inner, event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(queue = %inner.queue, missed, "client lagged behind event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        client.store_pump(pump);
        client
    }

    /// Connect through a storage change stream, for observing a queue whose
    /// server runs in another process.
    ///
    /// Fails when the adapter cannot stream changes.
    pub fn connect(storage: Arc<dyn JobStorage>, queue: impl Into<String>) -> Result<Self> {
        let queue = queue.into();
        let mut changes = storage
            .subscribe_changes()
            .context("storage adapter does not support change streaming")?;

        let client = Self::bare(queue, storage);
        let inner = client.inner.clone();
        let pump = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        if let Some(event) = translate_change(&inner.queue, change) {
                            handle_event(&inner, event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(queue = %inner.queue, missed, "client lagged behind change stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        client.store_pump(pump);
        Ok(client)
    }

    fn bare(queue: String, storage: Arc<dyn JobStorage>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                queue,
                storage,
                waiters: DashMap::new(),
                progress_subs: DashMap::new(),
                next_token: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                pump: std::sync::Mutex::new(None),
            }),
        }
    }

    fn store_pump(&self, pump: JoinHandle<()>) {
        if let Ok(mut slot) = self.inner.pump.lock() {
            *slot = Some(pump);
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue
    }

    /// Submit a job. Returns a handle for awaiting, aborting, and watching it.
    pub async fn submit(&self, input: Value, options: SubmitOptions) -> Result<JobHandle> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(anyhow!("client stopped"));
        }
        let record = JobRecord::new(self.inner.queue.clone(), input, options);
        let id = self.inner.storage.add(record).await?;
        Ok(JobHandle {
            id,
            client: self.clone(),
        })
    }

    /// Await a job's outcome.
    ///
    /// Resolves with the output on COMPLETED; rejects with the rehydrated
    /// error on FAILED. A DISABLED job rejects with [`JobError::Disabled`]
    /// (this deployment's consistent choice). Already-settled jobs resolve
    /// from the row without waiting.
    pub async fn wait_for(&self, id: Uuid) -> Result<Value, JobError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(JobError::Generic("client stopped".to_string()));
        }

        // Register before the terminal check so a settlement landing in
        // between cannot be missed.
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.waiters.entry(id).or_default().push((token, tx));

        let row = match self.inner.storage.get(id).await {
            Ok(row) => row,
            Err(error) => {
                self.unregister_waiter(id, token);
                return Err(JobError::Generic(format!("storage error: {error}")));
            }
        };

        match row {
            None => {
                self.unregister_waiter(id, token);
                Err(JobError::NotFound(id))
            }
            Some(row) if row.is_terminal() => {
                self.unregister_waiter(id, token);
                outcome_from_row(&row)
            }
            Some(_) => rx
                .await
                .unwrap_or_else(|_| Err(JobError::Generic("client stopped".to_string()))),
        }
    }

    /// Request an abort. Idempotent; settled jobs are unaffected.
    pub async fn abort(&self, id: Uuid) -> Result<()> {
        self.inner.storage.abort(id).await
    }

    /// Abort every unsettled job sharing a `job_run_id`. Returns how many
    /// abort requests were issued.
    pub async fn abort_job_run(&self, job_run_id: &str) -> Result<usize> {
        let rows = self.inner.storage.get_by_run_id(job_run_id).await?;
        let mut requested = 0;
        for row in rows {
            if matches!(row.status, JobStatus::Pending | JobStatus::Processing) {
                self.inner.storage.abort(row.id).await?;
                requested += 1;
            }
        }
        Ok(requested)
    }

    /// Subscribe to a job's progress reports. Dropping the subscription
    /// unregisters it.
    pub fn on_progress(&self, id: Uuid) -> ProgressSubscription {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.progress_subs.entry(id).or_default().push((token, tx));
        ProgressSubscription {
            client: self.clone(),
            id,
            token,
            receiver: rx,
        }
    }

    /// Output-cache lookup: the output of a completed job with an equal input.
    pub async fn output_for_input(&self, input: &Value) -> Result<Option<Value>> {
        self.inner.storage.output_for_input(input).await
    }

    /// Stop observing. Every pending `wait_for` rejects; progress
    /// subscriptions go quiet.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut slot) = self.inner.pump.lock() {
            if let Some(pump) = slot.take() {
                pump.abort();
            }
        }

        let ids: Vec<Uuid> = self.inner.waiters.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, waiters)) = self.inner.waiters.remove(&id) {
                for (_, tx) in waiters {
                    let _ = tx.send(Err(JobError::Generic("client stopped".to_string())));
                }
            }
        }
        self.inner.progress_subs.clear();
    }

    fn unregister_waiter(&self, id: Uuid, token: u64) {
        if let Some(mut entry) = self.inner.waiters.get_mut(&id) {
            entry.retain(|(t, _)| *t != token);
        }
    }
}

/// Live progress reports for one job.
///
/// Dropping this unregisters the subscription.
pub struct ProgressSubscription {
    client: JobClient,
    id: Uuid,
    token: u64,
    receiver: mpsc::UnboundedReceiver<ProgressUpdate>,
}

impl ProgressSubscription {
    /// Next progress report, or `None` once the job settles or the client
    /// stops.
    pub async fn recv(&mut self) -> Option<ProgressUpdate> {
        self.receiver.recv().await
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        if let Some(mut entry) = self.client.inner.progress_subs.get_mut(&self.id) {
            entry.retain(|(token, _)| *token != self.token);
        }
    }
}

/// Handle to one submitted job.
#[derive(Clone)]
pub struct JobHandle {
    id: Uuid,
    client: JobClient,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Await this job's outcome. See [`JobClient::wait_for`].
    pub async fn wait(&self) -> Result<Value, JobError> {
        self.client.wait_for(self.id).await
    }

    /// Request an abort of this job.
    pub async fn abort(&self) -> Result<()> {
        self.client.abort(self.id).await
    }

    /// Subscribe to this job's progress reports.
    pub fn progress(&self) -> ProgressSubscription {
        self.client.on_progress(self.id)
    }
}

/// Resolve an outcome from an already-settled row.
fn outcome_from_row(row: &JobRecord) -> Result<Value, JobError> {
    match row.status {
        JobStatus::Completed => Ok(row.output.clone().unwrap_or(Value::Null)),
        JobStatus::Failed => Err(JobError::rehydrate(
            row.error_code,
            row.error.as_deref().unwrap_or(""),
        )),
        JobStatus::Disabled => Err(JobError::Disabled(
            row.error.clone().unwrap_or_else(|| "job disabled".to_string()),
        )),
        _ => Err(JobError::Generic(format!(
            "job {} is not settled",
            row.id
        ))),
    }
}

/// Deliver one lifecycle event to waiters and progress subscribers.
fn handle_event(inner: &Arc<ClientInner>, event: JobEvent) {
    match event {
        JobEvent::JobComplete { id, output, .. } => settle(inner, id, Ok(output)),
        JobEvent::JobFailed {
            id,
            message,
            error_code,
            ..
        } => settle(inner, id, Err(JobError::rehydrate(error_code, &message))),
        JobEvent::JobDisabled { id, .. } => settle(
            inner,
            id,
            Err(JobError::Disabled("job disabled".to_string())),
        ),
        JobEvent::JobProgress {
            id,
            progress,
            message,
            details,
            ..
        } => {
            if let Some(mut subs) = inner.progress_subs.get_mut(&id) {
                subs.retain(|(_, tx)| {
                    tx.send(ProgressUpdate {
                        progress,
                        message: message.clone(),
                        details: details.clone(),
                    })
                    .is_ok()
                });
            }
        }
        JobEvent::QueueStart { .. }
        | JobEvent::QueueStop { .. }
        | JobEvent::JobStart { .. }
        | JobEvent::JobAborting { .. }
        | JobEvent::JobRetry { .. }
        | JobEvent::QueueStatsUpdate { .. } => {}
    }
}

fn settle(inner: &Arc<ClientInner>, id: Uuid, outcome: Result<Value, JobError>) {
    if let Some((_, waiters)) = inner.waiters.remove(&id) {
        for (_, tx) in waiters {
            let _ = tx.send(outcome.clone());
        }
    }
    // No more progress after settlement; receivers observe the close.
    inner.progress_subs.remove(&id);
}

/// Translate a storage row delta into the lifecycle event it implies.
///
/// This is the cross-process mirror of the server's direct event path;
/// both must yield the same sequence for the same transitions, so status
/// changes win over progress changes when one write carries both.
fn translate_change(queue: &str, change: JobChange) -> Option<JobEvent> {
    if change.kind != ChangeKind::Update {
        return None;
    }
    let new = change.new?;
    if new.queue != queue {
        return None;
    }
    let old = change.old?;

    if old.status != new.status {
        return match (old.status, new.status) {
            (JobStatus::Pending, JobStatus::Processing) => Some(JobEvent::JobStart {
                queue: new.queue,
                id: new.id,
            }),
            (_, JobStatus::Completed) => Some(JobEvent::JobComplete {
                queue: new.queue,
                id: new.id,
                output: new.output.unwrap_or(Value::Null),
            }),
            (_, JobStatus::Failed) => Some(JobEvent::JobFailed {
                queue: new.queue,
                id: new.id,
                message: new.error.unwrap_or_default(),
                error_code: new.error_code,
            }),
            (_, JobStatus::Disabled) => Some(JobEvent::JobDisabled {
                queue: new.queue,
                id: new.id,
            }),
            (JobStatus::Processing, JobStatus::Pending) => Some(JobEvent::JobRetry {
                queue: new.queue,
                id: new.id,
                run_after: new.run_after,
            }),
            // Aborting is a request, not an observable transition here;
            // the settlement that follows carries the outcome.
            _ => None,
        };
    }

    let progress_changed = old.progress != new.progress
        || old.progress_message != new.progress_message
        || old.progress_details != new.progress_details;
    if progress_changed {
        return Some(JobEvent::JobProgress {
            queue: new.queue,
            id: new.id,
            progress: new.progress,
            message: new.progress_message,
            details: new.progress_details,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::storage::InMemoryJobStorage;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn record(queue: &str) -> JobRecord {
        JobRecord::new(queue, json!({"x": 1}), SubmitOptions::new())
    }

    fn update(old: JobRecord, new: JobRecord) -> JobChange {
        JobChange {
            kind: ChangeKind::Update,
            old: Some(old),
            new: Some(new),
        }
    }

    #[test]
    fn translation_maps_status_transitions() {
        let old = record("q");

        let mut new = old.clone();
        new.status = JobStatus::Processing;
        assert!(matches!(
            translate_change("q", update(old.clone(), new)),
            Some(JobEvent::JobStart { .. })
        ));

        let mut processing = old.clone();
        processing.status = JobStatus::Processing;

        let mut new = processing.clone();
        new.status = JobStatus::Completed;
        new.output = Some(json!({"y": 2}));
        match translate_change("q", update(processing.clone(), new)) {
            Some(JobEvent::JobComplete { output, .. }) => assert_eq!(output, json!({"y": 2})),
            other => panic!("expected complete event, got {other:?}"),
        }

        let mut new = processing.clone();
        new.status = JobStatus::Failed;
        new.error = Some("boom".to_string());
        new.error_code = Some(ErrorCode::Permanent);
        match translate_change("q", update(processing.clone(), new)) {
            Some(JobEvent::JobFailed {
                message,
                error_code,
                ..
            }) => {
                assert_eq!(message, "boom");
                assert_eq!(error_code, Some(ErrorCode::Permanent));
            }
            other => panic!("expected failure event, got {other:?}"),
        }

        let retry_at = Utc::now() + chrono::Duration::seconds(30);
        let mut new = processing.clone();
        new.status = JobStatus::Pending;
        new.run_after = retry_at;
        match translate_change("q", update(processing.clone(), new)) {
            Some(JobEvent::JobRetry { run_after, .. }) => assert_eq!(run_after, retry_at),
            other => panic!("expected retry event, got {other:?}"),
        }

        let mut new = processing.clone();
        new.status = JobStatus::Disabled;
        assert!(matches!(
            translate_change("q", update(processing, new)),
            Some(JobEvent::JobDisabled { .. })
        ));
    }

    #[test]
    fn translation_emits_progress_only_without_status_change() {
        let mut old = record("q");
        old.status = JobStatus::Processing;
        let mut new = old.clone();
        new.progress = 40.0;
        new.progress_message = "working".to_string();

        match translate_change("q", update(old.clone(), new)) {
            Some(JobEvent::JobProgress {
                progress, message, ..
            }) => {
                assert_eq!(progress, 40.0);
                assert_eq!(message, "working");
            }
            other => panic!("expected progress event, got {other:?}"),
        }

        // Progress that rides along a settlement stays a settlement.
        let mut new = old.clone();
        new.status = JobStatus::Completed;
        new.progress = 100.0;
        assert!(matches!(
            translate_change("q", update(old, new)),
            Some(JobEvent::JobComplete { .. })
        ));
    }

    #[test]
    fn translation_ignores_other_queues_and_kinds() {
        let old = record("q");
        let mut new = old.clone();
        new.status = JobStatus::Processing;
        assert!(translate_change("other", update(old, new.clone())).is_none());

        assert!(translate_change(
            "q",
            JobChange {
                kind: ChangeKind::Insert,
                old: None,
                new: Some(new),
            }
        )
        .is_none());
    }

    #[tokio::test]
    async fn wait_for_resolves_from_settled_row() {
        let storage = Arc::new(InMemoryJobStorage::new());
        let client = JobClient::connect(storage.clone() as Arc<dyn JobStorage>, "q").unwrap();

        let mut row = record("q");
        row.status = JobStatus::Completed;
        row.output = Some(json!({"done": true}));
        row.completed_at = Some(Utc::now());
        let id = row.id;
        storage.add(row).await.unwrap();

        let outcome = client.wait_for(id).await.unwrap();
        assert_eq!(outcome, json!({"done": true}));

        client.stop().await;
    }

    #[tokio::test]
    async fn wait_for_unknown_job_is_not_found() {
        let storage = Arc::new(InMemoryJobStorage::new());
        let client = JobClient::connect(storage as Arc<dyn JobStorage>, "q").unwrap();

        let missing = Uuid::new_v4();
        assert_eq!(
            client.wait_for(missing).await,
            Err(JobError::NotFound(missing))
        );
        client.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connected_client_observes_progress_and_outcome() {
        let storage = Arc::new(InMemoryJobStorage::new());
        let client = JobClient::connect(storage.clone() as Arc<dyn JobStorage>, "q").unwrap();

        let handle = client
            .submit(json!({"x": 1}), SubmitOptions::new())
            .await
            .unwrap();
        let id = handle.id();
        let mut progress = handle.progress();

        // Another "process" works the job directly against storage.
        let mut claimed = storage.next("elsewhere").await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        storage
            .save_progress(id, 70.0, "well underway", None)
            .await
            .unwrap();

        let report = progress.recv().await.unwrap();
        assert_eq!(report.progress, 70.0);
        assert_eq!(report.message, "well underway");

        claimed.status = JobStatus::Completed;
        claimed.output = Some(json!({"y": 2}));
        claimed.completed_at = Some(Utc::now());
        storage.complete(&claimed).await.unwrap();

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome, json!({"y": 2}));

        // Settled: the progress stream closes.
        assert!(progress.recv().await.is_none());

        client.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connected_client_rehydrates_failures() {
        let storage = Arc::new(InMemoryJobStorage::new());
        let client = JobClient::connect(storage.clone() as Arc<dyn JobStorage>, "q").unwrap();

        let handle = client
            .submit(json!({}), SubmitOptions::new())
            .await
            .unwrap();

        let wait = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait().await })
        };
        // Give the waiter a moment to register.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut claimed = storage.next("elsewhere").await.unwrap().unwrap();
        claimed.status = JobStatus::Failed;
        claimed.error = Some("job aborted".to_string());
        claimed.error_code = Some(ErrorCode::AbortSignal);
        claimed.completed_at = Some(Utc::now());
        storage.complete(&claimed).await.unwrap();

        assert_eq!(wait.await.unwrap(), Err(JobError::Abort));
        client.stop().await;
    }

    #[tokio::test]
    async fn stop_rejects_pending_waiters() {
        let storage = Arc::new(InMemoryJobStorage::new());
        let client = JobClient::connect(storage.clone() as Arc<dyn JobStorage>, "q").unwrap();

        let handle = client
            .submit(json!({}), SubmitOptions::new())
            .await
            .unwrap();

        let wait = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        client.stop().await;

        let outcome = wait.await.unwrap();
        assert_eq!(
            outcome,
            Err(JobError::Generic("client stopped".to_string()))
        );

        // A stopped client refuses new submissions.
        assert!(client.submit(json!({}), SubmitOptions::new()).await.is_err());
    }
}
