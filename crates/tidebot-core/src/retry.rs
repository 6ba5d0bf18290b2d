//! Retry with exponential backoff and jitter.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Wraps a fallible async operation in an exponential-backoff retry loop.
///
/// The attempt counter is per logical call; nothing is shared between
/// calls and nothing is cached. Errors the classifier marks non-retryable
/// propagate immediately, as does the final error once the budget is
/// spent.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// `None` retries forever.
    max_retries: Option<u32>,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(5),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    pub fn new(
        max_retries: Option<u32>,
        base_delay: Duration,
        max_delay: Duration,
        jitter: Duration,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Delay before the retry following `attempt` (0-based), with the
    /// given jitter sample already chosen:
    /// `min(max_delay, base * 2^attempt + jitter)`.
    pub fn delay_for(&self, attempt: u32, jitter: Duration) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .saturating_add(jitter);
        exponential.min(self.max_delay)
    }

    fn sample_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let max = self.jitter.as_secs_f64();
        Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..max))
    }

    /// Run `op`, retrying errors for which `is_retryable` returns true.
    pub async fn run_with<T, E, F, Fut, C>(&self, mut op: F, is_retryable: C) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        C: Fn(&E) -> bool,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !is_retryable(&err) {
                        return Err(err);
                    }
                    if let Some(max) = self.max_retries {
                        if attempt >= max {
                            return Err(err);
                        }
                    }
                    let delay = self.delay_for(attempt, self.sample_jitter());
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "operation failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Run `op`, retrying every error.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_with(op, |_| true).await
    }
}
