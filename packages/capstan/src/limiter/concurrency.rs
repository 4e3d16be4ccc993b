//! Concurrency cap with minimum spacing between starts.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::Limiter;

/// Caps in-flight jobs at `max_concurrent` and spaces starts at least
/// `time_slice` apart.
///
/// The two constraints compose: a pool that allows eight concurrent jobs
/// can still be kept from launching all eight in the same millisecond.
pub struct ConcurrencyLimiter {
    max_concurrent: usize,
    time_slice: chrono::Duration,
    state: Mutex<State>,
}

struct State {
    running: usize,
    next_allowed_start: DateTime<Utc>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize, time_slice: Duration) -> Self {
        Self {
            max_concurrent,
            time_slice: chrono::Duration::milliseconds(time_slice.as_millis() as i64),
            state: Mutex::new(State {
                running: 0,
                next_allowed_start: Utc::now(),
            }),
        }
    }

    /// Current in-flight count.
    pub async fn running(&self) -> usize {
        self.state.lock().await.running
    }
}

#[async_trait]
impl Limiter for ConcurrencyLimiter {
    async fn can_proceed(&self) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.running < self.max_concurrent && Utc::now() >= state.next_allowed_start)
    }

    async fn record_job_start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.running += 1;
        state.next_allowed_start = Utc::now() + self.time_slice;
        Ok(())
    }

    async fn record_job_completion(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.running = state.running.saturating_sub(1);
        Ok(())
    }

    async fn next_available_time(&self) -> Result<DateTime<Utc>> {
        let state = self.state.lock().await;
        Ok(state.next_allowed_start.max(Utc::now()))
    }

    async fn set_next_available_time(&self, t: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.next_allowed_start = state.next_allowed_start.max(t);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.running = 0;
        state.next_allowed_start = Utc::now();
        Ok(())
    }
}
