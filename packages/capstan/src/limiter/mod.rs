//! Admission control: may a worker start another job right now?
//!
//! A limiter is a pluggable policy consulted before every claim. The
//! engine treats a limiter error as "cannot proceed", so a flaky durable
//! limiter degrades to backpressure instead of crashing the worker loop.
//!
//! `set_next_available_time` is monotonic everywhere: later times override
//! earlier ones, never the reverse. External hints (a 429 Retry-After, a
//! provider outage window) can only push availability out; `clear()` is
//! the one explicit reset.

mod concurrency;
mod rate;

pub use concurrency::ConcurrencyLimiter;
pub use rate::{RateLimiter, RateLimiterConfig, SpacedRateLimiter};

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Admission-control policy consulted before every claim.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// May a new job start now?
    async fn can_proceed(&self) -> Result<bool>;

    /// Account for a job that just started.
    async fn record_job_start(&self) -> Result<()>;

    /// Account for a job that just finished.
    async fn record_job_completion(&self) -> Result<()>;

    /// Earliest time `can_proceed` is expected to return true.
    async fn next_available_time(&self) -> Result<DateTime<Utc>>;

    /// External availability hint. Monotonic: `max(stored, t)`.
    async fn set_next_available_time(&self, t: DateTime<Utc>) -> Result<()>;

    /// Reset all limiter state.
    async fn clear(&self) -> Result<()>;
}

/// Limiter that never limits. The default when a caller just wants the
/// queue to run as fast as storage allows.
pub struct NullLimiter;

#[async_trait]
impl Limiter for NullLimiter {
    async fn can_proceed(&self) -> Result<bool> {
        Ok(true)
    }

    async fn record_job_start(&self) -> Result<()> {
        Ok(())
    }

    async fn record_job_completion(&self) -> Result<()> {
        Ok(())
    }

    async fn next_available_time(&self) -> Result<DateTime<Utc>> {
        Ok(Utc::now())
    }

    async fn set_next_available_time(&self, _t: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}

/// Logical AND over several limiters.
///
/// Proceeds only when every child does; the next available time is the
/// latest across children; bookkeeping fans out to all of them.
pub struct CompositeLimiter {
    limiters: Vec<Arc<dyn Limiter>>,
}

impl CompositeLimiter {
    pub fn new(limiters: Vec<Arc<dyn Limiter>>) -> Self {
        Self { limiters }
    }
}

#[async_trait]
impl Limiter for CompositeLimiter {
    async fn can_proceed(&self) -> Result<bool> {
        for limiter in &self.limiters {
            if !limiter.can_proceed().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn record_job_start(&self) -> Result<()> {
        for limiter in &self.limiters {
            limiter.record_job_start().await?;
        }
        Ok(())
    }

    async fn record_job_completion(&self) -> Result<()> {
        for limiter in &self.limiters {
            limiter.record_job_completion().await?;
        }
        Ok(())
    }

    async fn next_available_time(&self) -> Result<DateTime<Utc>> {
        let mut latest = Utc::now();
        for limiter in &self.limiters {
            latest = latest.max(limiter.next_available_time().await?);
        }
        Ok(latest)
    }

    async fn set_next_available_time(&self, t: DateTime<Utc>) -> Result<()> {
        for limiter in &self.limiters {
            limiter.set_next_available_time(t).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        for limiter in &self.limiters {
            limiter.clear().await?;
        }
        Ok(())
    }
}
