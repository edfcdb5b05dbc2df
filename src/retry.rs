//! Bounded exponential backoff for fallible async operations.
//!
//! [`Retrier`] is the single place that decides whether a failure is retried
//! or surfaced. Callers either rely on the [`Retryable`] classification of
//! their error type ([`Retrier::execute`]) or pass their own predicate
//! ([`Retrier::execute_with`]). The last error is always returned unchanged.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Classifies an error for the default retry predicate.
pub trait Retryable {
    /// Whether another attempt could plausibly succeed.
    fn is_retryable(&self) -> bool;

    /// Server-suggested wait before the next attempt (e.g. `Retry-After`).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Source of timed waits, injectable so tests never sleep for real.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Backoff parameters shared by every retrying component.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of invocations, including the first one. Must be >= 1.
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Adds a uniform random delay in `[0, min_delay)` to each wait.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered wait after the failure of `attempt` (0-based):
    /// `min(max_delay, min_delay * backoff_factor^attempt)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw_ms = self.min_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;
        Duration::from_millis(raw_ms.min(max_ms).round() as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let spread = self.min_delay.as_millis() as u64;
        if !self.jitter || spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..spread))
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Retrier<S = TokioSleeper> {
    policy: RetryPolicy,
    sleeper: S,
}

impl Retrier<TokioSleeper> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_sleeper(policy, TokioSleeper)
    }
}

impl<S: Sleeper> Retrier<S> {
    pub fn with_sleeper(policy: RetryPolicy, sleeper: S) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retries according to the error's own [`Retryable`] classification,
    /// honouring any server-suggested delay and logging each retry.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        self.run(
            operation,
            |err: &E| err.is_retryable(),
            |err: &E| err.retry_after(),
            |err: &E, attempt| {
                warn!(attempt, max_attempts = self.policy.max_attempts, error = %err, "operation failed, retrying");
            },
        )
        .await
    }

    /// Retries while `should_retry` holds, calling `on_retry(error, attempt)`
    /// before every wait.
    pub async fn execute_with<T, E, F, Fut, P, N>(
        &self,
        operation: F,
        should_retry: P,
        on_retry: N,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        N: FnMut(&E, u32),
    {
        self.run(operation, should_retry, |_: &E| None, on_retry).await
    }

    async fn run<T, E, F, Fut, P, H, N>(
        &self,
        mut operation: F,
        mut should_retry: P,
        suggested_delay: H,
        mut on_retry: N,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        H: Fn(&E) -> Option<Duration>,
        N: FnMut(&E, u32),
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt + 1 >= max_attempts || !should_retry(&err) {
                        return Err(err);
                    }
                    let mut delay = self.policy.jittered(self.policy.delay_for_attempt(attempt));
                    if let Some(hint) = suggested_delay(&err) {
                        delay = delay.max(hint);
                    }
                    on_retry(&err, attempt);
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
