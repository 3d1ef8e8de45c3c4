//! Delay strategies for provider pacing
//!
//! All waits in the pipeline (retry backoff, geocoding throttle, inter-topic
//! pacing) go through a [`Sleeper`] so tests can observe the requested delays
//! without spending wall-clock time. Retry delays are computed by a
//! [`BackoffPolicy`].

use async_trait::async_trait;
use rand::Rng;
use std::sync::Mutex;
use std::time::Duration;

/// Suspends the current flow for a duration
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Sleeper that returns immediately and records every requested delay
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in order
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Sum of all requested delays
    pub fn total(&self) -> Duration {
        self.delays().into_iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(duration);
        }
    }
}

/// Computes how long to wait before the next attempt.
///
/// `attempt` is the 0-based index of the attempt that just failed.
pub trait BackoffPolicy: Send + Sync {
    /// Delay after the provider answered 429
    fn rate_limited_delay(&self, attempt: u32) -> Duration;

    /// Delay after a timeout or transport failure
    fn transient_delay(&self, attempt: u32) -> Duration;
}

/// `2^attempt` seconds, plus uniform jitter for rate-limit responses
#[derive(Debug, Clone)]
pub struct ExponentialJitterBackoff {
    base: Duration,
    jitter_min: Duration,
    jitter_max: Duration,
}

impl ExponentialJitterBackoff {
    pub fn new(base: Duration, jitter_min: Duration, jitter_max: Duration) -> Self {
        Self {
            base,
            jitter_min: jitter_min.min(jitter_max),
            jitter_max: jitter_max.max(jitter_min),
        }
    }

    fn exponential(&self, attempt: u32) -> Duration {
        // Cap the exponent so a misconfigured attempt count cannot overflow
        self.base.saturating_mul(1u32 << attempt.min(16))
    }

    fn jitter(&self) -> Duration {
        if self.jitter_min == self.jitter_max {
            return self.jitter_min;
        }
        let secs = rand::thread_rng()
            .gen_range(self.jitter_min.as_secs_f64()..self.jitter_max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

impl Default for ExponentialJitterBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_millis(500),
            Duration::from_millis(1500),
        )
    }
}

impl BackoffPolicy for ExponentialJitterBackoff {
    fn rate_limited_delay(&self, attempt: u32) -> Duration {
        self.exponential(attempt) + self.jitter()
    }

    fn transient_delay(&self, attempt: u32) -> Duration {
        self.exponential(attempt)
    }
}
