//! Connection pool for NNTP sessions using deadpool
//!
//! The pool has a fixed capacity. Sessions are created and connected lazily on
//! first use, recycled across downloads while their socket is alive and handed
//! to waiters in FIFO order. [`ConnectionPool::end`] closes the pool: idle
//! sessions are sent QUIT and every pending or later `acquire` fails with
//! [`NntpError::PoolClosed`].

use super::connection::{tls_connector, NntpConnection, NntpSession};
use crate::config::UsenetConfig;
use crate::error::{Error, NntpError, Result};
use deadpool::managed::{Manager, Metrics, Object, Pool, PoolError, RecycleError, RecycleResult};
use std::sync::Arc;

/// Creates unconnected sessions for the pool
pub type SessionFactory = Arc<dyn Fn() -> Box<dyn NntpSession> + Send + Sync>;

/// Session manager for deadpool
pub struct SessionManager {
    factory: SessionFactory,
}

impl Manager for SessionManager {
    type Type = Box<dyn NntpSession>;
    type Error = Error;

    async fn create(&self) -> Result<Box<dyn NntpSession>> {
        let mut session = (self.factory)();
        if !session.is_connected() {
            session.connect().await.map_err(|e| {
                tracing::error!("Failed to create NNTP connection: {}", e);
                e
            })?;
        }
        Ok(session)
    }

    async fn recycle(
        &self,
        session: &mut Box<dyn NntpSession>,
        _metrics: &Metrics,
    ) -> RecycleResult<Error> {
        // A session whose socket was destroyed is replaced by a fresh one
        if session.is_connected() {
            Ok(())
        } else {
            Err(RecycleError::Backend(NntpError::NotConnected.into()))
        }
    }
}

/// A session checked out of the pool; dropping it releases it
pub type PooledConnection = Object<SessionManager>;

/// Bounded pool of NNTP sessions
#[derive(Clone)]
pub struct ConnectionPool {
    pool: Pool<SessionManager>,
}

impl ConnectionPool {
    /// Create a pool of `capacity` sessions built by `factory`
    pub fn new<F>(capacity: usize, factory: F) -> Result<Self>
    where
        F: Fn() -> Box<dyn NntpSession> + Send + Sync + 'static,
    {
        let manager = SessionManager {
            factory: Arc::new(factory),
        };
        let pool = Pool::builder(manager)
            .max_size(capacity.max(1))
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .map_err(|e| NntpError::ConnectionFailed {
                server: "pool".to_string(),
                port: 0,
                source: std::io::Error::other(e),
            })?;
        Ok(Self { pool })
    }

    /// Create a pool of real NNTP connections to the configured server
    pub fn from_config(config: &UsenetConfig) -> Result<Self> {
        let shared = Arc::new(config.clone());
        let connector = if config.ssl {
            Some(Arc::new(tls_connector(config)?))
        } else {
            None
        };

        Self::new(config.connections as usize, move || {
            Box::new(NntpConnection::new(shared.clone(), connector.clone()))
        })
    }

    /// Check out a session, waiting in line when all of them are busy
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.pool.get().await.map_err(|e| match e {
            PoolError::Backend(e) => e,
            PoolError::Closed => NntpError::PoolClosed.into(),
            other => {
                tracing::error!("Failed to get connection from pool: {}", other);
                NntpError::ConnectionFailed {
                    server: "pool".to_string(),
                    port: 0,
                    source: std::io::Error::other(other.to_string()),
                }
                .into()
            }
        })
    }

    /// Give a session back; the oldest waiter, if any, receives it
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Number of idle sessions
    pub fn available(&self) -> usize {
        self.pool.status().available
    }

    /// Capacity of the pool
    pub fn total(&self) -> usize {
        self.pool.status().max_size
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close the pool and say goodbye on every idle session
    ///
    /// Sessions still checked out are dropped when they come back.
    pub async fn end(&self) {
        let idle = self.pool.retain(|_, _| false);
        self.pool.close();

        for mut session in idle.removed {
            if session.is_connected() {
                if let Err(e) = session.end().await {
                    tracing::warn!("Error while closing connection: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServer;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_acquire_waits_for_release() {
        let server = FakeServer::new();
        let pool = server.pool(1);
        assert_eq!(pool.total(), 1);

        let first = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.release(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // the released session was handed over, never recreated
        assert_eq!(server.connects(), 1);
    }

    #[tokio::test]
    async fn test_sessions_are_recycled() {
        let server = FakeServer::new();
        let pool = server.pool(2);

        for _ in 0..5 {
            let conn = pool.acquire().await.unwrap();
            drop(conn);
        }
        assert_eq!(server.connects(), 1);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_end_closes_idle_sessions_and_rejects_waiters() {
        let server = FakeServer::new();
        let pool = server.pool(1);

        let conn = pool.acquire().await.unwrap();
        pool.release(conn);

        let busy = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.end().await;
        let err = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Nntp(NntpError::PoolClosed)));
        drop(busy);

        assert!(pool.is_closed());
        assert!(matches!(
            pool.acquire().await,
            Err(Error::Nntp(NntpError::PoolClosed))
        ));
    }

    #[tokio::test]
    async fn test_end_sends_quit_to_idle_sessions() {
        let server = FakeServer::new();
        let pool = server.pool(2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);

        pool.end().await;
        assert_eq!(server.quits(), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_frees_the_slot() {
        let server = FakeServer::new();
        server.fail_next_connects(1);
        let pool = server.pool(1);

        assert!(pool.acquire().await.is_err());
        assert!(pool.acquire().await.is_ok());
        assert_eq!(server.connects(), 2);
    }
}
