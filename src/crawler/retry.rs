use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::browser::{SessionHandle, SessionId, SessionPool};
use crate::cli::config::RetrySettings;
use crate::error::ErrorKind;
use crate::utils::metrics::MetricsCollector;

/// Retry budget and backoff shape
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts for retryable failures
    pub retry_count: u32,
    /// Delay unit, multiplied by the attempt number
    pub base_delay: Duration,
    /// Relative jitter applied to each delay, 0.5 means ±50%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            base_delay: Duration::from_secs(2),
            jitter: 0.5,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            retry_count: settings.retry_count,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            jitter: settings.jitter.clamp(0.0, 1.0),
        }
    }
}

/// Terminal outcome of a retried operation
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub kind: ErrorKind,
    pub attempts: u32,
    pub error: E,
}

/// Runs fallible session operations under a uniform retry policy.
///
/// `Transient` failures are retried with backoff. `SessionLost` swaps the
/// session through the pool once and retries. Anything else fails immediately.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    metrics: MetricsCollector,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, metrics: MetricsCollector) -> Self {
        Self { policy, metrics }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.policy.base_delay.as_secs_f64() * attempt as f64;
        let jitter = if self.policy.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.policy.jitter..=self.policy.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64((base * (1.0 + jitter)).max(0.0))
    }

    /// Run `op` against the lease until it succeeds, fails permanently, or the
    /// budget is spent. `classify` decides the kind of every failure.
    pub async fn execute<T, E, Op, Fut, Cl>(
        &self,
        label: &str,
        lease: &mut SessionHandle,
        pool: &SessionPool,
        mut op: Op,
        classify: Cl,
    ) -> Result<T, RetryFailure<E>>
    where
        Op: FnMut(SessionId) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Cl: Fn(&E) -> ErrorKind,
        E: Display,
    {
        let max_attempts = self.policy.retry_count.max(1);
        let mut attempt = 0;
        let mut replaced = false;

        loop {
            attempt += 1;
            lease.touch();

            let error = match op(lease.id().clone()).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let kind = classify(&error);
            let retryable = match kind {
                ErrorKind::Transient => true,
                ErrorKind::SessionLost => !replaced,
                _ => false,
            };

            if !retryable {
                debug!("{} failed with non-retryable {} error: {}", label, kind, error);
                return Err(RetryFailure { kind, attempts: attempt, error });
            }
            if attempt >= max_attempts {
                warn!("{} exhausted {} attempt(s), last error: {}", label, attempt, error);
                return Err(RetryFailure { kind, attempts: attempt, error });
            }

            if kind == ErrorKind::SessionLost {
                replaced = true;
                if let Err(pool_error) = pool.replace(lease).await {
                    error!("{} could not replace lost session: {}", label, pool_error);
                    return Err(RetryFailure { kind, attempts: attempt, error });
                }
            }

            let delay = self.backoff_delay(attempt);
            warn!(
                "{} failed ({}): {}. Retrying {}/{} in {:?}",
                label,
                kind,
                error,
                attempt + 1,
                max_attempts,
                delay
            );
            self.metrics.record_retry(kind).await;
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserError, BrowserKind, SessionSpec};
    use crate::testing::FakeBrowser;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn executor(retry_count: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryPolicy {
                retry_count,
                base_delay: Duration::from_millis(1),
                jitter: 0.5,
            },
            MetricsCollector::new(),
        )
    }

    async fn lease() -> (Arc<FakeBrowser>, SessionPool, SessionHandle) {
        let browser = Arc::new(FakeBrowser::new());
        let pool = SessionPool::new(browser.clone(), 1);
        let spec = SessionSpec {
            kind: BrowserKind::Chrome,
            headless: true,
        };
        let handle = pool.acquire(spec, Duration::from_millis(50)).await.unwrap();
        (browser, pool, handle)
    }

    #[tokio::test]
    async fn transient_failures_use_exactly_the_budget() {
        let (_browser, pool, mut handle) = lease().await;
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor(3)
            .execute(
                "navigate",
                &mut handle,
                &pool,
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BrowserError::Timeout("page load".into()))
                },
                BrowserError::kind,
            )
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.kind, ErrorKind::Transient);
        pool.release(handle).await;
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let (_browser, pool, mut handle) = lease().await;
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor(3)
            .execute(
                "extract",
                &mut handle,
                &pool,
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BrowserError::ElementMissing("#main".into()))
                },
                BrowserError::kind,
            )
            .await;

        tokio_test::assert_err!(&result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().kind, ErrorKind::Permanent);
        pool.release(handle).await;
    }

    #[tokio::test]
    async fn recovers_after_a_transient_failure() {
        let (_browser, pool, mut handle) = lease().await;
        let calls = AtomicU32::new(0);

        let result = executor(3)
            .execute(
                "wait",
                &mut handle,
                &pool,
                |_| async {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(BrowserError::Transport("connection reset".into()))
                    } else {
                        Ok("ready")
                    }
                },
                BrowserError::kind,
            )
            .await;

        assert_eq!(tokio_test::assert_ok!(result), "ready");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        pool.release(handle).await;
    }

    #[tokio::test]
    async fn session_lost_replaces_the_session_once() {
        let (browser, pool, mut handle) = lease().await;
        let original = handle.id().clone();
        let seen = std::sync::Mutex::new(Vec::new());

        let result = executor(3)
            .execute(
                "navigate",
                &mut handle,
                &pool,
                |id| {
                    let first = seen.lock().unwrap().is_empty();
                    seen.lock().unwrap().push(id);
                    async move {
                        if first {
                            Err(BrowserError::SessionLost("invalid session id".into()))
                        } else {
                            Ok(())
                        }
                    }
                },
                BrowserError::kind,
            )
            .await;

        assert!(result.is_ok());
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], original);
        assert_ne!(seen[1], original);
        assert_eq!(browser.opened(), 2);
        pool.release(handle).await;
    }

    #[tokio::test]
    async fn a_second_session_loss_is_terminal() {
        let (_browser, pool, mut handle) = lease().await;
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor(5)
            .execute(
                "navigate",
                &mut handle,
                &pool,
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BrowserError::SessionLost("gone".into()))
                },
                BrowserError::kind,
            )
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(failure.kind, ErrorKind::SessionLost);
        assert_eq!(failure.attempts, 2);
        pool.release(handle).await;
    }

    #[test]
    fn backoff_scales_with_attempt_and_stays_within_jitter() {
        let executor = RetryExecutor::new(
            RetryPolicy {
                retry_count: 3,
                base_delay: Duration::from_millis(100),
                jitter: 0.5,
            },
            MetricsCollector::new(),
        );

        for _ in 0..50 {
            let delay = executor.backoff_delay(2);
            assert!(delay >= Duration::from_millis(100), "{:?}", delay);
            assert!(delay <= Duration::from_millis(300), "{:?}", delay);
        }

        let steady = RetryExecutor::new(
            RetryPolicy {
                retry_count: 3,
                base_delay: Duration::from_millis(100),
                jitter: 0.0,
            },
            MetricsCollector::new(),
        );
        assert_eq!(steady.backoff_delay(3), Duration::from_millis(300));
    }
}
