//! Bounded retries with exponential backoff and jitter
//!
//! The delays are handed out by a [`backoff::backoff::Backoff`] schedule, see
//! <https://docs.rs/backoff/latest/backoff/>. An attempt is only started once the delay before it
//! has fully elapsed.
use std::{future::Future, sync::Arc, time::Duration};

use backoff::backoff::Backoff as _;

use anyhow::anyhow;
use rand::Rng as _;
use tokio_util::sync::CancellationToken;

use crate::{config::RetryProfile, errors::ImportError};

const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
/// Jitter adds up to this share of the computed delay
const MAX_JITTER: f64 = 0.2;

/// Retry policy wrapping fallible async operations.
///
/// An operation is attempted at most `max_retries + 1` times. The delay before retry `n`
/// (zero based) is `min(base_delay * backoff_factor^n, max_delay)`, increased by up to 20% when
/// jitter is enabled.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    max_retries: u32,
    base_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    jitter: bool,
    attempt_timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
}

impl RetryStrategy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
            attempt_timeout: None,
            cancellation: None,
        }
    }

    /// A short, flat policy for work that already follows a failure, such as partial import
    /// recovery: 2 retries starting at half a second, growing by 1.5.
    pub fn gentle() -> Self {
        Self::new(2, Duration::from_millis(500)).with_backoff_factor(1.5)
    }

    #[must_use]
    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Fails an attempt that takes longer than `timeout`; the timeout counts as a failed attempt
    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Aborts attempts and backoff waits as soon as the token is cancelled
    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the retry following failed attempt `attempt` (zero based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = (self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent))
            .min(self.max_delay.as_secs_f64())
            .max(0.0);

        let delay = if self.jitter {
            delay * (1.0 + rand::thread_rng().gen_range(0.0..=MAX_JITTER))
        } else {
            delay
        };
        Duration::try_from_secs_f64(delay).unwrap_or(self.max_delay)
    }

    /// Runs `operation`, retrying on any error.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::RetryExhausted`] carrying the last failure once all attempts
    /// failed, or [`ImportError::Cancelled`] when the cancellation token fires first.
    pub async fn execute<T, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T, ImportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute_if(operation_name, |_| true, operation).await
    }

    /// Runs `operation`, retrying only errors accepted by `should_retry`.
    ///
    /// A rejected error ends the attempts immediately and is reported as exhausted with the
    /// attempts made so far.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::RetryExhausted`] or [`ImportError::Cancelled`], see
    /// [`RetryStrategy::execute`].
    #[tracing::instrument(skip_all, fields(operation = operation_name), err)]
    pub async fn execute_if<T, F, Fut, P>(
        &self,
        operation_name: &str,
        should_retry: P,
        mut operation: F,
    ) -> Result<T, ImportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        P: Fn(&anyhow::Error) -> bool,
    {
        let timeout = self.attempt_timeout;
        let mut schedule = Schedule::new(self);

        let retry = async {
            let mut attempts = 0;
            loop {
                attempts += 1;
                let attempt = operation();
                let result = match timeout {
                    Some(timeout) => tokio::time::timeout(timeout, attempt)
                        .await
                        .unwrap_or_else(|_| Err(anyhow!("attempt timed out after {timeout:?}"))),
                    None => attempt.await,
                };

                let err = match result {
                    Ok(value) => return Ok(value),
                    Err(err) => err,
                };
                if !should_retry(&err) {
                    return Err((err, attempts));
                }
                let Some(delay) = schedule.next_backoff() else {
                    return Err((err, attempts));
                };

                tracing::warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max_retries = self.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = ?err,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        };

        let outcome = match &self.cancellation {
            Some(token) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        tracing::info!(operation = operation_name, "Cancelled while retrying");
                        return Err(ImportError::Cancelled);
                    }
                    outcome = retry => outcome,
                }
            }
            None => retry.await,
        };

        outcome.map_err(|(last_error, attempts)| ImportError::RetryExhausted {
            operation: operation_name.to_string(),
            max_retries: self.max_retries,
            attempts,
            last_error,
        })
    }

    /// Runs a blocking `operation` on tokio's blocking pool for every attempt, keeping the
    /// calling task free to observe cancellation.
    ///
    /// # Errors
    ///
    /// See [`RetryStrategy::execute`].
    pub async fn execute_blocking<T, F>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<T, ImportError>
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let operation = Arc::new(operation);
        self.execute(operation_name, || {
            let operation = Arc::clone(&operation);
            async move { tokio::task::spawn_blocking(move || operation()).await? }
        })
        .await
    }
}

impl From<&RetryProfile> for RetryStrategy {
    fn from(profile: &RetryProfile) -> Self {
        RetryStrategy::new(
            profile.max_retries,
            Duration::try_from_secs_f64(profile.retry_delay_secs).unwrap_or_default(),
        )
        .with_attempt_timeout(Duration::from_secs(profile.timeout_secs))
    }
}

/// Hands out exactly `max_retries` delays, then `None`
struct Schedule<'a> {
    strategy: &'a RetryStrategy,
    retries: u32,
}

impl<'a> Schedule<'a> {
    fn new(strategy: &'a RetryStrategy) -> Self {
        Self {
            strategy,
            retries: 0,
        }
    }
}

impl backoff::backoff::Backoff for Schedule<'_> {
    fn reset(&mut self) {
        self.retries = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries >= self.strategy.max_retries {
            return None;
        }
        let delay = self.strategy.calculate_delay(self.retries);
        self.retries += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn without_jitter(max_retries: u32) -> RetryStrategy {
        RetryStrategy::new(max_retries, Duration::from_millis(100)).with_jitter(false)
    }

    #[test]
    fn test_delay_grows_exponentially_up_to_max() {
        let strategy = without_jitter(10).with_max_delay(Duration::from_secs(1));

        assert_eq!(strategy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(strategy.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(strategy.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(strategy.calculate_delay(4), Duration::from_secs(1));
        assert_eq!(strategy.calculate_delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_without_jitter_is_monotonic_and_bounded() {
        let max_delay = Duration::from_secs(5);
        let strategy = without_jitter(10).with_max_delay(max_delay);

        let delays: Vec<_> = (0..64).map(|n| strategy.calculate_delay(n)).collect();
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays.iter().all(|delay| *delay <= max_delay));
    }

    #[test]
    fn test_jitter_adds_at_most_a_fifth() {
        let strategy = RetryStrategy::new(3, Duration::from_secs(1));

        for _ in 0..100 {
            let delay = strategy.calculate_delay(1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_millis(2400));
        }
    }

    #[test]
    fn test_gentle_strategy() {
        let strategy = RetryStrategy::gentle().with_jitter(false);
        assert_eq!(strategy.max_retries(), 2);
        assert_eq!(strategy.calculate_delay(0), Duration::from_millis(500));
        assert_eq!(strategy.calculate_delay(1), Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = without_jitter(3)
            .execute("flaky", || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 2 {
                        anyhow::bail!("transient failure {call}")
                    }
                    Ok(call)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_always_failing_operation_is_attempted_max_retries_plus_one_times() {
        let calls = AtomicUsize::new(0);
        let err = without_jitter(4)
            .execute("doomed", || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(anyhow!("failure {call}")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let ImportError::RetryExhausted {
            operation,
            max_retries,
            attempts,
            last_error,
        } = err
        else {
            panic!("expected retry exhaustion, got {err:?}");
        };
        assert_eq!(operation, "doomed");
        assert_eq!(max_retries, 4);
        assert_eq!(attempts, 5);
        assert_eq!(last_error.to_string(), "failure 4");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let err = without_jitter(5)
            .execute_if(
                "permanent",
                |err| !err.to_string().contains("permanent"),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(anyhow!("permanent failure")) }
                },
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ImportError::RetryExhausted { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_start_after_the_delay() {
        let start = tokio::time::Instant::now();
        let started = std::sync::Mutex::new(Vec::new());

        let err = RetryStrategy::new(2, Duration::from_secs(10))
            .with_jitter(false)
            .execute("spaced", || {
                started.lock().unwrap().push(start.elapsed());
                async { Err::<(), _>(anyhow!("failure")) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ImportError::RetryExhausted { attempts: 3, .. }));
        assert_eq!(
            *started.lock().unwrap(),
            vec![
                Duration::ZERO,
                Duration::from_secs(10),
                Duration::from_secs(30)
            ]
        );
    }

    #[test]
    fn test_huge_max_delay_does_not_overflow() {
        let strategy = RetryStrategy::new(3, Duration::MAX).with_max_delay(Duration::MAX);
        assert!(strategy.calculate_delay(10) > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_the_backoff_wait() {
        let token = CancellationToken::new();
        let strategy = RetryStrategy::new(5, Duration::from_secs(30))
            .with_jitter(false)
            .with_cancellation_token(token.clone());

        let calls = AtomicUsize::new(0);
        let cancel = token.clone();
        let err = strategy
            .execute("cancelled", || {
                calls.fetch_add(1, Ordering::SeqCst);
                let cancel = cancel.clone();
                async move {
                    cancel.cancel();
                    Err::<(), _>(anyhow!("failure"))
                }
            })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_token_wins_over_the_operation() {
        let token = CancellationToken::new();
        token.cancel();

        let err = without_jitter(1)
            .with_cancellation_token(token)
            .execute("never", || async { Ok(()) })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempts_time_out() {
        let err = without_jitter(1)
            .with_attempt_timeout(Duration::from_secs(1))
            .execute("slow", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        let ImportError::RetryExhausted { last_error, attempts, .. } = err else {
            panic!("expected retry exhaustion");
        };
        assert_eq!(attempts, 2);
        assert!(last_error.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_blocking_operations_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let value = without_jitter(2)
            .execute_blocking("blocking", move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("first call fails");
                }
                Ok("done")
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
