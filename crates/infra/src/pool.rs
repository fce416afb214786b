//! Bounded, reconnecting pool of storage connections.
//!
//! The pool holds at most `max_size` connections. A semaphore permit is taken
//! for every connection handed out and released when the [`PooledConnection`]
//! is dropped, which also returns the connection to the idle list.
//!
//! Idle connections are checked with [`StorageConnector::is_valid`] before
//! reuse; dead ones are dropped and a fresh connection is opened in their
//! place, retrying with exponential backoff until the acquire deadline.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, warn};

use crate::error::ConnectionError;
use crate::store::StorageConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

struct PoolInner<C: StorageConnector> {
    connector: C,
    idle: Mutex<Vec<C::Connection>>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
    closed: AtomicBool,
}

impl<C: StorageConnector> PoolInner<C> {
    fn pop_idle(&self) -> Option<C::Connection> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop())
    }

    fn push_idle(&self, conn: C::Connection) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }
}

/// Cloneable handle to a shared connection pool.
pub struct ConnectionPool<C: StorageConnector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: StorageConnector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: StorageConnector> ConnectionPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let max_size = config.max_size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                idle: Mutex::new(Vec::with_capacity(max_size)),
                permits: Arc::new(Semaphore::new(max_size)),
                config: PoolConfig { max_size, ..config },
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Connections parked and ready for reuse.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Connections currently handed out.
    pub fn in_use(&self) -> usize {
        self.inner.config.max_size - self.inner.permits.available_permits()
    }

    /// Wait for a free connection, up to the configured acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection<C>, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let wait = self.inner.config.acquire_timeout;
        let deadline = Instant::now() + wait;

        let permit = match timeout_at(deadline, Arc::clone(&self.inner.permits).acquire_owned()).await
        {
            Err(_) => return Err(ConnectionError::Timeout(wait)),
            Ok(Err(_)) => return Err(ConnectionError::Closed),
            Ok(Ok(permit)) => permit,
        };
        // close() may have started while we were queued.
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        while let Some(mut conn) = self.inner.pop_idle() {
            match timeout_at(deadline, self.inner.connector.is_valid(&mut conn)).await {
                Ok(true) => {
                    return Ok(PooledConnection::new(conn, Arc::clone(&self.inner), permit));
                }
                Ok(false) => warn!("dropping dead pooled connection"),
                Err(_) => {
                    warn!("liveness check outlived the acquire timeout; dropping connection");
                    return Err(ConnectionError::Timeout(wait));
                }
            }
        }

        let conn = self.connect_with_backoff(deadline).await?;
        Ok(PooledConnection::new(conn, Arc::clone(&self.inner), permit))
    }

    async fn connect_with_backoff(&self, deadline: Instant) -> Result<C::Connection, ConnectionError> {
        let config = &self.inner.config;
        let mut backoff = config.initial_backoff;
        let mut attempt = 1u32;
        loop {
            let result = match timeout_at(deadline, self.inner.connector.connect()).await {
                Ok(result) => result,
                Err(_) => return Err(ConnectionError::Timeout(config.acquire_timeout)),
            };
            match result {
                Ok(conn) => {
                    debug!(attempt, "opened storage connection");
                    return Ok(conn);
                }
                Err(e) => {
                    if Instant::now() + backoff >= deadline {
                        warn!(attempt, error = %e, "giving up opening storage connection");
                        return Err(e);
                    }
                    warn!(attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "storage connect failed; retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(config.max_backoff);
                    attempt += 1;
                }
            }
        }
    }

    /// Stop handing out connections and wait for outstanding ones to return.
    ///
    /// Every later `acquire()` fails with [`ConnectionError::Closed`]. Returns
    /// `Timeout` if holders did not give their connections back in time; the
    /// pool is closed either way.
    pub async fn close(&self, wait: Duration) -> Result<(), ConnectionError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let all = u32::try_from(self.inner.config.max_size).unwrap_or(u32::MAX);
        let drained = timeout(wait, self.inner.permits.acquire_many(all)).await;
        self.inner.permits.close();
        if let Ok(mut idle) = self.inner.idle.lock() {
            idle.clear();
        }
        match drained {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(in_use = self.in_use(), "pool closed with connections still checked out");
                Err(ConnectionError::Timeout(wait))
            }
        }
    }
}

/// A connection checked out of the pool; returned to it on drop.
pub struct PooledConnection<C: StorageConnector> {
    conn: Option<C::Connection>,
    pool: Arc<PoolInner<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: StorageConnector> PooledConnection<C> {
    fn new(conn: C::Connection, pool: Arc<PoolInner<C>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            pool,
            _permit: permit,
        }
    }

    /// Drop the underlying connection instead of returning it to the pool.
    pub fn discard(mut self) {
        self.conn = None;
    }
}

impl<C: StorageConnector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after discard"),
        }
    }
}

impl<C: StorageConnector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after discard"),
        }
    }
}

impl<C: StorageConnector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.push_idle(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CountStorage, InMemoryConnector, InMemoryStorage};

    fn test_config(max_size: usize, acquire_ms: u64) -> PoolConfig {
        PoolConfig {
            max_size,
            acquire_timeout: Duration::from_millis(acquire_ms),
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    fn test_pool(max_size: usize, acquire_ms: u64) -> (InMemoryStorage, ConnectionPool<InMemoryConnector>) {
        let storage = InMemoryStorage::new();
        let pool = ConnectionPool::new(storage.connector(), test_config(max_size, acquire_ms));
        (storage, pool)
    }

    #[tokio::test]
    async fn connections_are_reused() {
        let (storage, pool) = test_pool(2, 200);
        {
            let mut conn = pool.acquire().await.unwrap();
            conn.list_sessions().await.unwrap();
            assert_eq!(pool.in_use(), 1);
        }
        assert_eq!(pool.idle_count(), 1);
        let _again = pool.acquire().await.unwrap();
        assert_eq!(storage.connects_opened(), 1);
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let (_storage, pool) = test_pool(1, 50);
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err, ConnectionError::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn slow_liveness_check_is_bounded_by_acquire_timeout() {
        let (storage, pool) = test_pool(1, 50);
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.idle_count(), 1);

        storage.set_validation_latency(Duration::from_secs(2));
        let started = Instant::now();
        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err, ConnectionError::Timeout(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn dead_idle_connections_are_replaced() {
        let (storage, pool) = test_pool(1, 200);
        drop(pool.acquire().await.unwrap());
        storage.kill_connections();
        let mut conn = pool.acquire().await.unwrap();
        conn.list_sessions().await.unwrap();
        assert_eq!(storage.connects_opened(), 2);
    }

    #[tokio::test]
    async fn refused_connects_are_retried_with_backoff() {
        let (storage, pool) = test_pool(1, 500);
        storage.refuse_connects(3);
        let _conn = pool.acquire().await.unwrap();
        assert_eq!(storage.connects_opened(), 1);
    }

    #[tokio::test]
    async fn persistent_connect_failure_surfaces() {
        let (storage, pool) = test_pool(1, 40);
        storage.refuse_connects(usize::MAX);
        match pool.acquire().await {
            Err(ConnectionError::Connect(_)) | Err(ConnectionError::Timeout(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected connection failure"),
        }
    }

    #[tokio::test]
    async fn close_waits_for_checked_out_connections() {
        let (_storage, pool) = test_pool(2, 200);
        let held = pool.acquire().await.unwrap();

        let closer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!closer.is_finished());
        assert_eq!(pool.acquire().await.err(), Some(ConnectionError::Closed));

        drop(held);
        closer.await.unwrap().unwrap();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.acquire().await.err(), Some(ConnectionError::Closed));
    }
}
