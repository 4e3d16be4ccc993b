//! Rate limiting over a sliding window, with adaptive full-jitter backoff.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::Limiter;

/// Tuning for [`RateLimiter`] backoff behavior.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum starts inside the sliding window.
    pub max_executions: usize,
    /// Window size.
    pub window: Duration,
    /// Backoff applied the first time the window saturates.
    pub initial_backoff: Duration,
    /// Growth factor on repeated refusals. Must be > 1.
    pub backoff_multiplier: f64,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl RateLimiterConfig {
    pub fn new(max_executions: usize, window: Duration) -> Self {
        Self {
            max_executions,
            window,
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(3600),
        }
    }
}

/// Full jitter: somewhere in `[backoff, 2 * backoff)`.
///
/// Spreads the retry herd out instead of synchronizing every refused
/// worker onto the same wall-clock instant.
fn jitter(backoff: chrono::Duration) -> chrono::Duration {
    let millis = backoff.num_milliseconds().max(0);
    backoff + chrono::Duration::milliseconds(fastrand::i64(0..=millis))
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

struct RateState {
    /// Start timestamps inside the window, oldest first.
    starts: VecDeque<DateTime<Utc>>,
    next_available: DateTime<Utc>,
    current_backoff: chrono::Duration,
}

impl RateState {
    fn prune(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        let cutoff = now - window;
        while matches!(self.starts.front(), Some(start) if *start < cutoff) {
            self.starts.pop_front();
        }
    }
}

/// Sliding-window rate cap.
///
/// Proceeds while fewer than `max_executions` starts happened inside the
/// window and no backoff is in force. Each refusal grows the backoff
/// multiplicatively (capped); each grant resets it. When a start saturates
/// the window, availability is pushed out by a jittered backoff so a
/// thundering herd of refused workers does not reconverge.
pub struct RateLimiter {
    config: RateLimiterConfig,
    window: chrono::Duration,
    state: Mutex<RateState>,
}

impl RateLimiter {
    pub fn new(max_executions: usize, window: Duration) -> Self {
        Self::with_config(RateLimiterConfig::new(max_executions, window))
    }

    pub fn with_config(config: RateLimiterConfig) -> Self {
        let window = to_chrono(config.window);
        let initial = to_chrono(config.initial_backoff);
        Self {
            config,
            window,
            state: Mutex::new(RateState {
                starts: VecDeque::new(),
                next_available: DateTime::<Utc>::MIN_UTC,
                current_backoff: initial,
            }),
        }
    }

    #[cfg(test)]
    async fn current_backoff(&self) -> chrono::Duration {
        self.state.lock().await.current_backoff
    }
}

#[async_trait]
impl Limiter for RateLimiter {
    async fn can_proceed(&self) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.prune(now, self.window);

        if state.starts.len() < self.config.max_executions && now >= state.next_available {
            state.current_backoff = to_chrono(self.config.initial_backoff);
            Ok(true)
        } else {
            let grown = chrono::Duration::milliseconds(
                (state.current_backoff.num_milliseconds() as f64 * self.config.backoff_multiplier)
                    as i64,
            );
            state.current_backoff = grown.min(to_chrono(self.config.max_backoff));
            Ok(false)
        }
    }

    async fn record_job_start(&self) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.prune(now, self.window);
        state.starts.push_back(now);

        if state.starts.len() >= self.config.max_executions {
            let pushed = now + jitter(state.current_backoff);
            state.next_available = state.next_available.max(pushed);
        }
        Ok(())
    }

    async fn record_job_completion(&self) -> Result<()> {
        Ok(())
    }

    async fn next_available_time(&self) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.prune(now, self.window);

        if state.starts.len() < self.config.max_executions {
            Ok(state.next_available.max(now))
        } else {
            // The window drains when its oldest start ages out.
            let oldest = state.starts.front().copied().unwrap_or(now);
            Ok(state.next_available.max(oldest + self.window))
        }
    }

    async fn set_next_available_time(&self, t: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.next_available = state.next_available.max(t);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.starts.clear();
        state.next_available = DateTime::<Utc>::MIN_UTC;
        state.current_backoff = to_chrono(self.config.initial_backoff);
        Ok(())
    }
}

struct SpacedState {
    next_available: DateTime<Utc>,
    /// Rolling average of execution duration, milliseconds.
    avg_duration_ms: f64,
    /// Start times of in-flight jobs, oldest first.
    in_flight: VecDeque<DateTime<Utc>>,
}

/// Evenly-spaced rate cap.
///
/// Instead of bursting up to the window limit and then stalling, this
/// variant targets one start per `window / max_executions` and credits the
/// rolling average execution time against the gap, so slow jobs do not pay
/// the spacing twice.
pub struct SpacedRateLimiter {
    ideal_interval: chrono::Duration,
    state: Mutex<SpacedState>,
}

impl SpacedRateLimiter {
    pub fn new(max_executions: usize, window: Duration) -> Self {
        let window = to_chrono(window);
        let ideal_interval = window / max_executions.max(1) as i32;
        Self {
            ideal_interval,
            state: Mutex::new(SpacedState {
                next_available: DateTime::<Utc>::MIN_UTC,
                avg_duration_ms: 0.0,
                in_flight: VecDeque::new(),
            }),
        }
    }
}

#[async_trait]
impl Limiter for SpacedRateLimiter {
    async fn can_proceed(&self) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(Utc::now() >= state.next_available)
    }

    async fn record_job_start(&self) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.in_flight.push_back(now);

        let gap = self.ideal_interval
            - chrono::Duration::milliseconds(state.avg_duration_ms as i64);
        let gap = gap.max(chrono::Duration::zero());
        state.next_available = state.next_available.max(now + gap);
        Ok(())
    }

    async fn record_job_completion(&self) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if let Some(started) = state.in_flight.pop_front() {
            let duration_ms = (now - started).num_milliseconds().max(0) as f64;
            state.avg_duration_ms = if state.avg_duration_ms == 0.0 {
                duration_ms
            } else {
                state.avg_duration_ms * 0.8 + duration_ms * 0.2
            };
        }
        Ok(())
    }

    async fn next_available_time(&self) -> Result<DateTime<Utc>> {
        let state = self.state.lock().await;
        Ok(state.next_available.max(Utc::now()))
    }

    async fn set_next_available_time(&self, t: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.next_available = state.next_available.max(t);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.next_available = DateTime::<Utc>::MIN_UTC;
        state.avg_duration_ms = 0.0;
        state.in_flight.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_window_capacity() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));

        for _ in 0..3 {
            assert!(limiter.can_proceed().await.unwrap());
            limiter.record_job_start().await.unwrap();
        }
        assert!(!limiter.can_proceed().await.unwrap());
    }

    #[tokio::test]
    async fn saturation_pushes_next_available_past_window_drain() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        limiter.record_job_start().await.unwrap();
        limiter.record_job_start().await.unwrap();

        let next = limiter.next_available_time().await.unwrap();
        // Saturated: not available before the oldest start ages out.
        assert!(next > Utc::now() + chrono::Duration::seconds(8));
    }

    #[tokio::test]
    async fn backoff_grows_on_refusal_and_resets_on_grant() {
        let limiter = RateLimiter::with_config(RateLimiterConfig {
            max_executions: 1,
            window: Duration::from_millis(20),
            initial_backoff: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_millis(80),
        });

        limiter.record_job_start().await.unwrap();
        assert!(!limiter.can_proceed().await.unwrap());
        assert_eq!(limiter.current_backoff().await.num_milliseconds(), 20);
        assert!(!limiter.can_proceed().await.unwrap());
        assert_eq!(limiter.current_backoff().await.num_milliseconds(), 40);
        assert!(!limiter.can_proceed().await.unwrap());
        assert!(!limiter.can_proceed().await.unwrap());
        // Capped at max_backoff.
        assert_eq!(limiter.current_backoff().await.num_milliseconds(), 80);

        limiter.clear().await.unwrap();
        assert!(limiter.can_proceed().await.unwrap());
        assert_eq!(limiter.current_backoff().await.num_milliseconds(), 10);
    }

    #[tokio::test]
    async fn jitter_stays_within_one_extra_backoff() {
        for _ in 0..100 {
            let base = chrono::Duration::milliseconds(50);
            let jittered = jitter(base);
            assert!(jittered >= base);
            assert!(jittered <= base * 2);
        }
    }

    #[tokio::test]
    async fn external_hint_is_monotonic() {
        let limiter = RateLimiter::new(10, Duration::from_secs(1));
        let far = Utc::now() + chrono::Duration::minutes(10);
        limiter.set_next_available_time(far).await.unwrap();
        limiter
            .set_next_available_time(Utc::now())
            .await
            .unwrap();

        assert!(!limiter.can_proceed().await.unwrap());
        assert!(limiter.next_available_time().await.unwrap() >= far);
    }

    #[tokio::test]
    async fn clear_reopens_the_window() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.record_job_start().await.unwrap();
        assert!(!limiter.can_proceed().await.unwrap());

        limiter.clear().await.unwrap();
        assert!(limiter.can_proceed().await.unwrap());
    }

    #[tokio::test]
    async fn spaced_limiter_spreads_starts() {
        // 2 per second => 500ms ideal gap.
        let limiter = SpacedRateLimiter::new(2, Duration::from_secs(1));
        assert!(limiter.can_proceed().await.unwrap());

        limiter.record_job_start().await.unwrap();
        assert!(!limiter.can_proceed().await.unwrap());

        let next = limiter.next_available_time().await.unwrap();
        let gap = next - Utc::now();
        assert!(gap > chrono::Duration::milliseconds(300));
        assert!(gap <= chrono::Duration::milliseconds(500));
    }

    #[tokio::test]
    async fn spaced_limiter_credits_execution_time() {
        let limiter = SpacedRateLimiter::new(1, Duration::from_millis(100));

        // First completion seeds the rolling average with ~40ms.
        limiter.record_job_start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        limiter.record_job_completion().await.unwrap();

        // The next start's gap is the 100ms ideal minus the ~40ms average.
        limiter.record_job_start().await.unwrap();
        let next = limiter.next_available_time().await.unwrap();
        let gap = next - Utc::now();
        assert!(gap <= chrono::Duration::milliseconds(70));
    }
}
