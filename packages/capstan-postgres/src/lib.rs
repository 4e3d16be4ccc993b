//! PostgreSQL implementation of the capstan rate limiter.
//!
//! The in-memory [`RateLimiter`](capstan::RateLimiter) lives and dies with
//! its process. This crate keeps the same sliding-window policy in two
//! queue-scoped side tables instead, so every worker process sharing the
//! database shares one admission budget.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE limiter_executions (
//!     queue       TEXT NOT NULL,
//!     executed_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE INDEX idx_limiter_executions
//!     ON limiter_executions (queue, executed_at);
//!
//! CREATE TABLE limiter_next_available (
//!     queue             TEXT PRIMARY KEY,
//!     next_available_at TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! Availability updates use `GREATEST(stored, new)`: concurrent processes
//! can only push the shared next-available time forward, never walk it
//! back, so a Retry-After hint from one worker binds all of them.
//!
//! # Usage
//!
//! ```rust,ignore
//! use capstan_postgres::PgRateLimiter;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let limiter = PgRateLimiter::new(pool, "emails", 100, Duration::from_secs(60));
//! limiter.migrate().await?;
//!
//! let server = JobServer::new(storage, handler, config)
//!     .with_limiter(Arc::new(limiter));
//! ```

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use capstan::Limiter;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

/// Full jitter: somewhere in `[backoff, 2 * backoff)`.
fn jitter(backoff: chrono::Duration) -> chrono::Duration {
    let millis = backoff.num_milliseconds().max(0);
    backoff + chrono::Duration::milliseconds(fastrand::i64(0..=millis))
}

/// Sliding-window rate limiter backed by PostgreSQL.
///
/// Window state (execution timestamps, next-available time) is shared
/// through the database; the adaptive backoff is process-local, which is
/// fine because it only shapes how aggressively this process re-asks.
pub struct PgRateLimiter {
    pool: PgPool,
    queue: String,
    max_executions: i64,
    window: chrono::Duration,
    initial_backoff: chrono::Duration,
    backoff_multiplier: f64,
    max_backoff: chrono::Duration,
    backoff: Mutex<chrono::Duration>,
}

impl PgRateLimiter {
    /// Limiter with default backoff tuning (1s initial, doubling, 1h cap).
    pub fn new(
        pool: PgPool,
        queue: impl Into<String>,
        max_executions: i64,
        window: Duration,
    ) -> Self {
        let initial = to_chrono(Duration::from_secs(1));
        Self {
            pool,
            queue: queue.into(),
            max_executions,
            window: to_chrono(window),
            initial_backoff: initial,
            backoff_multiplier: 2.0,
            max_backoff: to_chrono(Duration::from_secs(3600)),
            backoff: Mutex::new(initial),
        }
    }

    /// Override the backoff tuning.
    pub fn with_backoff(
        mut self,
        initial: Duration,
        multiplier: f64,
        max: Duration,
    ) -> Self {
        self.initial_backoff = to_chrono(initial);
        self.backoff_multiplier = multiplier;
        self.max_backoff = to_chrono(max);
        self.backoff = Mutex::new(self.initial_backoff);
        self
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the side tables if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS limiter_executions (
                queue       TEXT NOT NULL,
                executed_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_limiter_executions
                ON limiter_executions (queue, executed_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS limiter_next_available (
                queue             TEXT PRIMARY KEY,
                next_available_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn window_count(&self, now: DateTime<Utc>) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM limiter_executions
            WHERE queue = $1 AND executed_at > $2
            "#,
        )
        .bind(&self.queue)
        .bind(now - self.window)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn stored_next_available(&self) -> Result<Option<DateTime<Utc>>> {
        let next = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT next_available_at
            FROM limiter_next_available
            WHERE queue = $1
            "#,
        )
        .bind(&self.queue)
        .fetch_optional(&self.pool)
        .await?;

        Ok(next)
    }

    async fn push_next_available(&self, t: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO limiter_next_available (queue, next_available_at)
            VALUES ($1, $2)
            ON CONFLICT (queue) DO UPDATE
            SET next_available_at = GREATEST(
                limiter_next_available.next_available_at,
                EXCLUDED.next_available_at
            )
            "#,
        )
        .bind(&self.queue)
        .bind(t)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Limiter for PgRateLimiter {
    async fn can_proceed(&self) -> Result<bool> {
        let now = Utc::now();
        let count = self.window_count(now).await?;
        let next = self.stored_next_available().await?;

        let mut backoff = self.backoff.lock().await;
        if count < self.max_executions && next.is_none_or(|next| now >= next) {
            *backoff = self.initial_backoff;
            Ok(true)
        } else {
            let grown = chrono::Duration::milliseconds(
                (backoff.num_milliseconds() as f64 * self.backoff_multiplier) as i64,
            );
            *backoff = grown.min(self.max_backoff);
            Ok(false)
        }
    }

    async fn record_job_start(&self) -> Result<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO limiter_executions (queue, executed_at)
            VALUES ($1, $2)
            "#,
        )
        .bind(&self.queue)
        .bind(now)
        .execute(&self.pool)
        .await?;

        // Rows outside the window never count again; drop them here so the
        // table stays bounded without a separate maintenance job.
        sqlx::query(
            r#"
            DELETE FROM limiter_executions
            WHERE queue = $1 AND executed_at < $2
            "#,
        )
        .bind(&self.queue)
        .bind(now - self.window)
        .execute(&self.pool)
        .await?;

        if self.window_count(now).await? >= self.max_executions {
            let backoff = *self.backoff.lock().await;
            self.push_next_available(now + jitter(backoff)).await?;
        }

        Ok(())
    }

    async fn record_job_completion(&self) -> Result<()> {
        Ok(())
    }

    async fn next_available_time(&self) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let stored = self.stored_next_available().await?.unwrap_or(now);

        if self.window_count(now).await? < self.max_executions {
            return Ok(stored.max(now));
        }

        // Saturated: the window drains when its oldest start ages out.
        let oldest = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            r#"
            SELECT MIN(executed_at)
            FROM limiter_executions
            WHERE queue = $1 AND executed_at > $2
            "#,
        )
        .bind(&self.queue)
        .bind(now - self.window)
        .fetch_one(&self.pool)
        .await?;

        let drained = oldest.map(|oldest| oldest + self.window).unwrap_or(now);
        Ok(stored.max(drained))
    }

    async fn set_next_available_time(&self, t: DateTime<Utc>) -> Result<()> {
        self.push_next_available(t).await
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM limiter_executions WHERE queue = $1")
            .bind(&self.queue)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM limiter_next_available WHERE queue = $1")
            .bind(&self.queue)
            .execute(&self.pool)
            .await?;

        let mut backoff = self.backoff.lock().await;
        *backoff = self.initial_backoff;
        Ok(())
    }
}
