//! Bounded session pool owned by a cached server entry.

use std::{
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use log::debug;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::session::{Connector, Session, SessionError};

pub const DEFAULT_POOL_SIZE: usize = 4;

/// Possible errors returned by [`Pool::get`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool has been closed")]
    Closed,
    #[error(transparent)]
    Connect(#[from] SessionError),
}

/// Decrements the open-session gauge when the session is finally dropped.
struct SessionState {
    open: Arc<AtomicUsize>,
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::Relaxed);
    }
}

struct IdleSession {
    session: Box<dyn Session>,
    _state: SessionState,
}

struct PoolInner {
    dsn: String,
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<IdleSession>>,
    semaphore: Arc<Semaphore>,
    open: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl PoolInner {
    fn return_session(&self, idle: IdleSession) {
        if self.closed.load(Ordering::Acquire) || idle.session.is_closed() {
            return;
        }
        self.idle.lock().push(idle);
    }
}

/// Session checked out of a [`Pool`]. Returned to the pool when dropped.
pub struct PooledSession {
    inner: Option<IdleSession>,
    pool: Weak<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(idle) = self.inner.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.return_session(idle);
            }
        }
    }
}

impl Deref for PooledSession {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        // inner is only taken in drop
        match &self.inner {
            Some(idle) => idle.session.as_ref(),
            None => unreachable!("pooled session used after release"),
        }
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession").finish_non_exhaustive()
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub open: usize,
    pub idle: usize,
}

/// Connection pool for one connection-string identity.
///
/// Cloning is cheap and shares state.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
    max_size: usize,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("status", &self.status()).finish()
    }
}

impl Pool {
    pub fn new(dsn: &str, connector: Arc<dyn Connector>, max_size: usize) -> Pool {
        let max_size = max_size.max(1);
        Pool {
            inner: Arc::new(PoolInner {
                dsn: dsn.to_string(),
                connector,
                idle: Mutex::new(Vec::with_capacity(max_size)),
                semaphore: Arc::new(Semaphore::new(max_size)),
                open: Arc::new(AtomicUsize::new(0)),
                closed: AtomicBool::new(false),
            }),
            max_size,
        }
    }

    /// Checks out a session, reusing an idle one or connecting a new one.
    /// Waits while `max_size` sessions are in use.
    pub async fn get(&self) -> Result<PooledSession, PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        loop {
            let candidate = self.inner.idle.lock().pop();
            match candidate {
                Some(idle) if idle.session.is_closed() => {
                    debug!("Discarding closed idle session");
                }
                Some(idle) => return Ok(self.wrap(idle, permit)),
                None => break,
            }
        }

        let session = self.inner.connector.connect(&self.inner.dsn).await?;
        self.inner.open.fetch_add(1, Ordering::Relaxed);
        let idle = IdleSession {
            session,
            _state: SessionState {
                open: Arc::clone(&self.inner.open),
            },
        };
        Ok(self.wrap(idle, permit))
    }

    fn wrap(&self, idle: IdleSession, permit: OwnedSemaphorePermit) -> PooledSession {
        PooledSession {
            inner: Some(idle),
            pool: Arc::downgrade(&self.inner),
            _permit: permit,
        }
    }

    /// Drops idle sessions and refuses further check-outs. Sessions still
    /// checked out are dropped when returned. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.semaphore.close();
        self.inner.idle.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            max_size: self.max_size,
            open: self.inner.open.load(Ordering::Relaxed),
            idle: self.inner.idle.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::FakeConnector;

    #[tokio::test]
    async fn test_session_is_reused_after_release() {
        let connector = Arc::new(FakeConnector::new());
        let pool = Pool::new("host=db", connector.clone(), 2);

        let session = pool.get().await.unwrap();
        drop(session);
        let _session = pool.get().await.unwrap();

        assert_eq!(connector.connects(), 1);
        assert_eq!(pool.status().open, 1);
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_open_separate_sessions() {
        let connector = Arc::new(FakeConnector::new());
        let pool = Pool::new("host=db", connector.clone(), 2);

        let first = pool.get().await.unwrap();
        let second = pool.get().await.unwrap();
        assert_eq!(connector.connects(), 2);
        drop(first);
        drop(second);
        assert_eq!(pool.status().idle, 2);
    }

    #[tokio::test]
    async fn test_close_releases_idle_and_returned_sessions() {
        let connector = Arc::new(FakeConnector::new());
        let pool = Pool::new("host=db", connector.clone(), 2);

        let held = pool.get().await.unwrap();
        drop(pool.get().await.unwrap());
        assert_eq!(connector.open_sessions(), 2);

        pool.close();
        assert_eq!(connector.open_sessions(), 1);
        drop(held);
        assert_eq!(connector.open_sessions(), 0);
        assert!(matches!(pool.get().await, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let connector = Arc::new(FakeConnector::new().fail_connect_to("host=down"));
        let pool = Pool::new("host=down", connector, 1);
        assert!(matches!(pool.get().await, Err(PoolError::Connect(_))));
        // the permit is returned on failure
        assert!(matches!(pool.get().await, Err(PoolError::Connect(_))));
    }
}
