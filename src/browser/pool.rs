use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

use crate::browser::{BrowserControl, BrowserError, BrowserKind, SessionId, SessionSpec};
use crate::error::ErrorKind;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No browser session available after {waited_ms}ms (capacity {capacity})")]
    Exhausted { capacity: usize, waited_ms: u128 },

    #[error("Failed to open browser session: {0}")]
    Open(#[source] BrowserError),

    #[error("Session pool is shut down")]
    ShutDown,
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Exhausted { .. } => ErrorKind::PoolExhausted,
            PoolError::Open(e) => e.kind(),
            PoolError::ShutDown => ErrorKind::Permanent,
        }
    }
}

/// Shared health flag of a lease
#[derive(Debug, Clone)]
pub struct SessionHealth(Arc<AtomicBool>);

impl Default for SessionHealth {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

impl SessionHealth {
    pub fn is_healthy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn mark_unhealthy(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Idle session waiting to be leased again
struct IdleSession {
    id: SessionId,
    spec: SessionSpec,
    created_at: DateTime<Utc>,
}

/// Exclusive lease on one remote browser session.
///
/// Holding the handle holds one unit of pool capacity. Dropping it without
/// [`SessionPool::release`] closes the session in the background.
pub struct SessionHandle {
    id: SessionId,
    spec: SessionSpec,
    created_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
    health: SessionHealth,
    closed: bool,
    browser: Arc<dyn BrowserControl>,
    _permit: OwnedSemaphorePermit,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn kind(&self) -> BrowserKind {
        self.spec.kind
    }

    pub fn spec(&self) -> SessionSpec {
        self.spec
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.last_used
    }

    pub fn health(&self) -> SessionHealth {
        self.health.clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    pub fn mark_unhealthy(&self) {
        self.health.mark_unhealthy();
    }

    pub fn touch(&mut self) {
        self.last_used = Utc::now();
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("healthy", &self.health.is_healthy())
            .finish()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let browser = Arc::clone(&self.browser);
        let id = self.id.clone();
        // Spawn a task to close the abandoned session
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = browser.close_session(&id).await {
                    error!("Error closing abandoned session {}: {}", id, e);
                } else {
                    debug!("Abandoned session {} closed", id);
                }
            });
        }
    }
}

/// Capacity-bounded pool of remote browser sessions
pub struct SessionPool {
    browser: Arc<dyn BrowserControl>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleSession>>,
    capacity: usize,
    shut_down: AtomicBool,
}

impl SessionPool {
    /// Create a pool that keeps at most `capacity` sessions alive
    pub fn new(browser: Arc<dyn BrowserControl>, capacity: usize) -> Self {
        info!("Starting session pool with capacity {}", capacity);
        Self {
            browser,
            permits: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(Vec::new()),
            capacity,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sessions neither leased nor idle-reserved
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Lease a session, waiting up to `timeout` for capacity
    pub async fn acquire(&self, spec: SessionSpec, timeout: Duration) -> Result<SessionHandle, PoolError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }

        let permit = match tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::ShutDown),
            Err(_) => {
                return Err(PoolError::Exhausted {
                    capacity: self.capacity,
                    waited_ms: timeout.as_millis(),
                })
            }
        };

        let (reused, evicted) = {
            let mut idle = self.idle.lock().await;
            let reused = idle.iter().position(|s| s.spec == spec).map(|i| idle.remove(i));
            let mut evicted = Vec::new();
            if reused.is_none() {
                // Idle sessions must fit into the remaining capacity before opening a new one
                while idle.len() > self.permits.available_permits() {
                    evicted.push(idle.remove(0));
                }
            }
            (reused, evicted)
        };

        for stale in evicted {
            debug!("Evicting idle {} session {}", stale.spec.kind, stale.id);
            if let Err(e) = self.browser.close_session(&stale.id).await {
                error!("Error closing evicted session {}: {}", stale.id, e);
            }
        }

        let now = Utc::now();
        if let Some(session) = reused {
            debug!("Reusing {} session {}", spec.kind, session.id);
            return Ok(self.lease(session.id, spec, session.created_at, permit));
        }

        let id = self.browser.open_session(&spec).await.map_err(PoolError::Open)?;
        debug!("Opened {} session {}", spec.kind, id);
        Ok(self.lease(id, spec, now, permit))
    }

    fn lease(&self, id: SessionId, spec: SessionSpec, created_at: DateTime<Utc>, permit: OwnedSemaphorePermit) -> SessionHandle {
        SessionHandle {
            id,
            spec,
            created_at,
            last_used: Utc::now(),
            health: SessionHealth::default(),
            closed: false,
            browser: Arc::clone(&self.browser),
            _permit: permit,
        }
    }

    /// Return a lease. Healthy sessions go back to the idle list, others are closed.
    pub async fn release(&self, mut handle: SessionHandle) {
        handle.closed = true;

        if handle.is_healthy() && !self.shut_down.load(Ordering::SeqCst) {
            debug!("Session {} returned to pool", handle.id);
            self.idle.lock().await.push(IdleSession {
                id: handle.id.clone(),
                spec: handle.spec,
                created_at: handle.created_at,
            });
        } else {
            debug!("Closing unhealthy session {}", handle.id);
            if let Err(e) = self.browser.close_session(&handle.id).await {
                error!("Error closing session {}: {}", handle.id, e);
            }
        }
        // The permit is released when the handle drops here
    }

    /// Close the session behind a lease and open a fresh one in its slot
    pub async fn replace(&self, handle: &mut SessionHandle) -> Result<(), PoolError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }

        info!("Replacing lost session {}", handle.id);
        if let Err(e) = self.browser.close_session(&handle.id).await {
            debug!("Closing lost session {} failed: {}", handle.id, e);
        }
        handle.mark_unhealthy();
        handle.closed = true;

        let id = self.browser.open_session(&handle.spec).await.map_err(PoolError::Open)?;
        let now = Utc::now();
        handle.id = id;
        handle.created_at = now;
        handle.last_used = now;
        handle.closed = false;
        handle.health.reset();

        Ok(())
    }

    /// Stop leasing and close all idle sessions
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();

        let idle: Vec<IdleSession> = std::mem::take(&mut *self.idle.lock().await);
        info!("Shutting down session pool, closing {} idle session(s)", idle.len());
        for session in idle {
            if let Err(e) = self.browser.close_session(&session.id).await {
                error!("Error closing session {}: {}", session.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::MockBrowserControl;
    use crate::testing::FakeBrowser;
    use mockall::predicate::always;

    fn chrome() -> SessionSpec {
        SessionSpec {
            kind: BrowserKind::Chrome,
            headless: true,
        }
    }

    #[tokio::test]
    async fn released_healthy_sessions_are_reused() {
        let browser = Arc::new(FakeBrowser::new());
        let pool = SessionPool::new(browser.clone(), 2);

        let first = pool.acquire(chrome(), Duration::from_millis(50)).await.unwrap();
        let first_id = first.id().clone();
        pool.release(first).await;

        let second = pool.acquire(chrome(), Duration::from_millis(50)).await.unwrap();
        assert_eq!(second.id(), &first_id);
        assert_eq!(browser.opened(), 1);
        pool.release(second).await;
    }

    #[tokio::test]
    async fn unhealthy_sessions_are_closed_not_reused() {
        let browser = Arc::new(FakeBrowser::new());
        let pool = SessionPool::new(browser.clone(), 1);

        let handle = pool.acquire(chrome(), Duration::from_millis(50)).await.unwrap();
        let old_id = handle.id().clone();
        handle.mark_unhealthy();
        pool.release(handle).await;
        assert_eq!(browser.closed(), 1);
        assert_eq!(pool.idle_count().await, 0);

        let fresh = pool.acquire(chrome(), Duration::from_millis(50)).await.unwrap();
        assert_ne!(fresh.id(), &old_id);
        assert_eq!(browser.opened(), 2);
        pool.release(fresh).await;
    }

    #[tokio::test]
    async fn acquire_beyond_capacity_times_out_as_exhausted() {
        let mut mock = MockBrowserControl::new();
        mock.expect_open_session()
            .with(always())
            .times(1)
            .returning(|_| Ok(SessionId::new("only")));
        let pool = SessionPool::new(Arc::new(mock), 1);

        let held = pool.acquire(chrome(), Duration::from_millis(20)).await.unwrap();
        let err = pool.acquire(chrome(), Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { capacity: 1, .. }));
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);

        // keep the lease alive until here so the second acquire had to wait
        assert_eq!(held.id().as_str(), "only");
        std::mem::forget(held);
    }

    #[tokio::test]
    async fn waiting_acquire_resumes_when_a_lease_is_released() {
        let browser = Arc::new(FakeBrowser::new());
        let pool = Arc::new(SessionPool::new(browser.clone(), 1));

        let held = pool.acquire(chrome(), Duration::from_millis(50)).await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(chrome(), Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(held).await;

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(browser.opened(), 1);
        pool.release(handle).await;
    }

    #[tokio::test]
    async fn idle_sessions_of_other_kinds_are_evicted_at_capacity() {
        let browser = Arc::new(FakeBrowser::new());
        let pool = SessionPool::new(browser.clone(), 1);

        let chrome_lease = pool.acquire(chrome(), Duration::from_millis(50)).await.unwrap();
        pool.release(chrome_lease).await;

        let firefox = SessionSpec {
            kind: BrowserKind::Firefox,
            headless: true,
        };
        let firefox_lease = pool.acquire(firefox, Duration::from_millis(50)).await.unwrap();
        assert_eq!(firefox_lease.kind(), BrowserKind::Firefox);
        assert_eq!(browser.closed(), 1);
        assert_eq!(browser.live_sessions(), 1);
        pool.release(firefox_lease).await;
    }

    #[tokio::test]
    async fn replace_swaps_the_session_under_the_same_lease() {
        let browser = Arc::new(FakeBrowser::new());
        let pool = SessionPool::new(browser.clone(), 1);

        let mut handle = pool.acquire(chrome(), Duration::from_millis(50)).await.unwrap();
        let old_id = handle.id().clone();
        handle.mark_unhealthy();

        pool.replace(&mut handle).await.unwrap();
        assert_ne!(handle.id(), &old_id);
        assert!(handle.is_healthy());
        assert_eq!(pool.available(), 0);
        pool.release(handle).await;
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_idle_sessions_and_rejects_acquire() {
        let browser = Arc::new(FakeBrowser::new());
        let pool = SessionPool::new(browser.clone(), 2);

        let handle = pool.acquire(chrome(), Duration::from_millis(50)).await.unwrap();
        pool.release(handle).await;
        pool.shutdown().await;

        assert_eq!(browser.live_sessions(), 0);
        let err = pool.acquire(chrome(), Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, PoolError::ShutDown));
    }
}
