use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("no connection available: {0}")]
    Acquire(#[from] r2d2::Error),
    #[error("blocking task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Bounded r2d2 pool of SQLite connections, driven from async code.
///
/// Every connection runs with WAL journaling and foreign keys enforced.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Pool<SqliteConnectionManager>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_connections", &self.inner.max_size())
            .field("state", &self.inner.state())
            .finish()
    }
}

impl ConnectionPool {
    /// `acquire_timeout` bounds the wait for a free connection and is also
    /// the SQLite busy timeout for each connection.
    pub fn new<P: AsRef<Path>>(
        path: P,
        max_connections: usize,
        acquire_timeout: Duration,
    ) -> Result<Self, PoolError> {
        let max_size = u32::try_from(max_connections.max(1)).unwrap_or(u32::MAX);
        let manager = SqliteConnectionManager::file(path.as_ref())
            .with_init(move |conn| configure(conn, acquire_timeout));
        // Connections open lazily, so building never touches the file.
        let inner = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(0))
            .connection_timeout(acquire_timeout)
            .build(manager)?;
        Ok(Self { inner })
    }

    pub fn max_connections(&self) -> usize {
        self.inner.max_size() as usize
    }

    /// Runs `f` on a pooled connection in a blocking task. `timeout` bounds
    /// the work as a whole, including the wait for a connection.
    pub async fn with_connection<T, F>(&self, timeout: Duration, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.inner.clone();
        let task = tokio::task::spawn_blocking(move || -> Result<T, PoolError> {
            let mut conn = pool.get()?;
            Ok(f(&mut *conn)?)
        });

        match tokio::time::timeout(timeout, task).await {
            Err(_) => Err(PoolError::Timeout(timeout)),
            Ok(Err(join_err)) => Err(PoolError::Task(join_err.to_string())),
            Ok(Ok(result)) => result,
        }
    }
}

fn configure(conn: &mut Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    // journal_mode answers with a row, so it goes through query_row.
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    conn.pragma_update(None, "foreign_keys", true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrency_never_exceeds_bound() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(dir.path().join("pool.db"), 2, Duration::from_secs(5)).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                pool.with_connection(Duration::from_secs(5), move |_conn| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(pool.inner.state().connections <= 2);
    }

    #[tokio::test]
    async fn test_exhausted_pool_fails_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(dir.path().join("pool.db"), 1, Duration::from_millis(50)).unwrap();
        let held = pool.inner.get().unwrap();

        let err = pool
            .with_connection(Duration::from_secs(5), |_conn| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Acquire(_)));
        drop(held);
    }

    #[tokio::test]
    async fn test_slow_work_surfaces_as_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(dir.path().join("pool.db"), 1, Duration::from_secs(5)).unwrap();
        let err = pool
            .with_connection(Duration::from_millis(20), |_conn| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_connections_enforce_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(dir.path().join("pool.db"), 1, Duration::from_secs(5)).unwrap();
        let enabled: i64 = pool
            .with_connection(Duration::from_secs(5), |conn| {
                conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            })
            .await
            .unwrap();
        assert_eq!(enabled, 1);
    }
}
