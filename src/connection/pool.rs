use super::config::ShardPoolConfig;
use crate::core::{DbError, Result};
use sqlx::{AnyConnection, Connection as _};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Connection pool for one shard URL.
///
/// Connections are opened lazily on checkout. A background sweep evicts
/// idle connections past `min_evictable_idle` and reclaims checkouts held
/// past `abandoned_timeout`; a reclaimed connection no longer counts
/// against `max_active` and is closed when its guard is finally dropped.
pub struct ShardPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: ShardPoolConfig,
    state: Mutex<PoolState>,
    /// Idle plus leased (not yet reclaimed) connections
    total_connections: AtomicUsize,
    next_lease: AtomicU64,
    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<PooledConnection>,
    /// Lease id -> checkout time
    leases: HashMap<u64, Instant>,
}

/// An idle connection waiting in the pool
struct PooledConnection {
    connection: AnyConnection,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn is_idle_too_long(&self, idle_timeout: Duration) -> bool {
        self.last_used.elapsed() > idle_timeout
    }
}

impl ShardPool {
    /// Creates the pool without opening any connection.
    ///
    /// The eviction sweeper is only started when called from inside a tokio
    /// runtime; outside one, idle connections are still pruned on checkout.
    pub fn new(config: ShardPoolConfig) -> Result<Self> {
        config.validate().map_err(DbError::ConfigError)?;
        sqlx::any::install_default_drivers();

        let inner = Arc::new(PoolInner {
            config,
            state: Mutex::new(PoolState::default()),
            total_connections: AtomicUsize::new(0),
            next_lease: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&inner);
            let interval = inner.config.eviction_interval;
            let task = handle.spawn(run_sweeper(weak, interval));
            *inner.sweeper.lock()? = Some(task);
        } else {
            debug!(url = %inner.config.redacted_url(), "no runtime, eviction sweeper not started");
        }

        Ok(Self { inner })
    }

    pub fn config(&self) -> &ShardPoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Checks a connection out, opening a new one if needed.
    pub async fn get_connection(&self) -> Result<PoolGuard> {
        let start = Instant::now();

        loop {
            self.ensure_open()?;

            if let Some(pooled) = self.try_get_available()? {
                if let Some(connection) = self.validate(pooled.connection).await {
                    return self.lease(connection, pooled.created_at);
                }
                continue;
            }

            if let Some(connection) = self.try_create_connection().await? {
                return self.lease(connection, Instant::now());
            }

            if start.elapsed() > self.inner.config.connect_timeout {
                return Err(DbError::PoolTimeout(format!(
                    "no connection available for {} within {:?}",
                    self.inner.config.redacted_url(),
                    self.inner.config.connect_timeout
                )));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DbError::ConnectionError(format!(
                "pool for {} is closed",
                self.inner.config.redacted_url()
            )));
        }
        Ok(())
    }

    /// Pops an idle connection, dropping any that sat idle too long.
    fn try_get_available(&self) -> Result<Option<PooledConnection>> {
        let mut state = self.inner.state.lock()?;
        let idle_timeout = self.inner.config.min_evictable_idle;

        while let Some(pooled) = state.idle.pop_back() {
            if pooled.is_idle_too_long(idle_timeout) {
                self.inner.total_connections.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            return Ok(Some(pooled));
        }
        Ok(None)
    }

    async fn try_create_connection(&self) -> Result<Option<AnyConnection>> {
        let max_active = self.inner.config.max_active;
        let reserved = self
            .inner
            .total_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < max_active).then_some(total + 1)
            })
            .is_ok();
        if !reserved {
            return Ok(None);
        }

        match AnyConnection::connect(&self.inner.config.url).await {
            Ok(connection) => {
                debug!(url = %self.inner.config.redacted_url(), "opened shard connection");
                Ok(Some(connection))
            }
            Err(err) => {
                self.inner.total_connections.fetch_sub(1, Ordering::SeqCst);
                Err(DbError::ConnectionError(format!(
                    "cannot connect to {}: {}",
                    self.inner.config.redacted_url(),
                    err
                )))
            }
        }
    }

    /// Runs the validation query, if any. A connection that fails it is
    /// discarded.
    async fn validate(&self, mut connection: AnyConnection) -> Option<AnyConnection> {
        let Some(query) = self.inner.config.validation_query.as_deref() else {
            return Some(connection);
        };

        match sqlx::query(query)
            .persistent(false)
            .execute(&mut connection)
            .await
        {
            Ok(_) => Some(connection),
            Err(err) => {
                warn!(
                    url = %self.inner.config.redacted_url(),
                    error = %err,
                    "validation query failed, discarding connection"
                );
                self.inner.total_connections.fetch_sub(1, Ordering::SeqCst);
                None
            }
        }
    }

    fn lease(&self, connection: AnyConnection, created_at: Instant) -> Result<PoolGuard> {
        let lease_id = self.inner.next_lease.fetch_add(1, Ordering::SeqCst);
        self.inner
            .state
            .lock()?
            .leases
            .insert(lease_id, Instant::now());

        Ok(PoolGuard {
            connection: Some(connection),
            lease_id,
            created_at,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Runs one eviction pass immediately.
    pub fn evict(&self) -> Result<()> {
        self.inner.sweep()
    }

    /// Closes idle connections and refuses further checkouts. Leased
    /// connections are closed as their guards are dropped.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(task) = self.inner.sweeper.lock()?.take() {
            task.abort();
        }

        let mut state = self.inner.state.lock()?;
        let dropped = state.idle.len();
        state.idle.clear();
        self.inner
            .total_connections
            .fetch_sub(dropped, Ordering::SeqCst);

        debug!(url = %self.inner.config.redacted_url(), dropped, "shard pool closed");
        Ok(())
    }

    pub fn stats(&self) -> Result<PoolStats> {
        let state = self.inner.state.lock()?;
        Ok(PoolStats {
            total_connections: self.inner.total_connections.load(Ordering::SeqCst),
            idle_connections: state.idle.len(),
            active_connections: state.leases.len(),
            max_active: self.inner.config.max_active,
            max_idle: self.inner.config.max_idle,
        })
    }
}

impl Drop for ShardPool {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.inner.sweeper.lock() {
            if let Some(task) = sweeper.take() {
                task.abort();
            }
        }
    }
}

impl PoolInner {
    fn sweep(&self) -> Result<()> {
        let mut state = self.state.lock()?;

        let before = state.idle.len();
        let idle_timeout = self.config.min_evictable_idle;
        state
            .idle
            .retain(|pooled| !pooled.is_idle_too_long(idle_timeout));
        let evicted = before - state.idle.len();
        if evicted > 0 {
            self.total_connections.fetch_sub(evicted, Ordering::SeqCst);
            debug!(url = %self.config.redacted_url(), evicted, "evicted idle connections");
        }

        let abandoned_timeout = self.config.abandoned_timeout;
        let abandoned: Vec<(u64, Duration)> = state
            .leases
            .iter()
            .map(|(lease, checked_out)| (*lease, checked_out.elapsed()))
            .filter(|(_, held)| *held > abandoned_timeout)
            .collect();
        for (lease, held) in abandoned {
            state.leases.remove(&lease);
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            warn!(
                url = %self.config.redacted_url(),
                lease,
                held_secs = held.as_secs(),
                "reclaimed abandoned connection"
            );
        }

        Ok(())
    }

    fn release(&self, lease_id: u64, connection: AnyConnection, created_at: Instant) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        if state.leases.remove(&lease_id).is_none() {
            // Reclaimed as abandoned; already uncounted.
            return;
        }

        if self.closed.load(Ordering::SeqCst) || state.idle.len() >= self.config.max_idle {
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        state.idle.push_back(PooledConnection {
            connection,
            created_at,
            last_used: Instant::now(),
        });
    }
}

async fn run_sweeper(pool: Weak<PoolInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        if let Err(err) = inner.sweep() {
            warn!(error = %err, "eviction sweep failed");
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub idle_connections: usize,
    pub active_connections: usize,
    pub max_active: usize,
    pub max_idle: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} idle (max {}), {} total",
            self.active_connections,
            self.max_active,
            self.idle_connections,
            self.max_idle,
            self.total_connections
        )
    }
}

/// RAII guard for a checked-out connection
///
/// Returns the connection to the pool when dropped, unless the pool has
/// closed, is already holding `max_idle` idle connections, or reclaimed the
/// lease as abandoned.
pub struct PoolGuard {
    connection: Option<AnyConnection>,
    lease_id: u64,
    created_at: Instant,
    pool: Weak<PoolInner>,
}

impl PoolGuard {
    pub fn connection(&mut self) -> Result<&mut AnyConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| DbError::ConnectionError("connection already returned to pool".into()))
    }

    pub fn lease_id(&self) -> u64 {
        self.lease_id
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.release(self.lease_id, connection, self.created_at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sqlite_config(dir: &tempfile::TempDir, name: &str) -> ShardPoolConfig {
        ShardPoolConfig::new(format!(
            "sqlite://{}?mode=rwc",
            dir.path().join(name).display()
        ))
    }

    #[tokio::test]
    async fn test_pool_is_lazy() {
        let dir = tempdir().unwrap();
        let pool = ShardPool::new(sqlite_config(&dir, "lazy.db")).unwrap();
        let stats = pool.stats().unwrap();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.idle_connections, 0);
    }

    #[tokio::test]
    async fn test_connection_return_to_pool() {
        let dir = tempdir().unwrap();
        let pool = ShardPool::new(sqlite_config(&dir, "reuse.db").max_idle(2)).unwrap();

        {
            let _guard = pool.get_connection().await.unwrap();
            let stats = pool.stats().unwrap();
            assert_eq!(stats.active_connections, 1);
            assert_eq!(stats.idle_connections, 0);
        }

        let stats = pool.stats().unwrap();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.total_connections, 1);
    }

    #[tokio::test]
    async fn test_max_idle_bounds_retained_connections() {
        let dir = tempdir().unwrap();
        let pool = ShardPool::new(sqlite_config(&dir, "idle.db").max_idle(1).max_active(3)).unwrap();

        let first = pool.get_connection().await.unwrap();
        let second = pool.get_connection().await.unwrap();
        drop(first);
        drop(second);

        let stats = pool.stats().unwrap();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.total_connections, 1);
    }

    #[tokio::test]
    async fn test_max_active_limit_times_out() {
        let dir = tempdir().unwrap();
        let pool = ShardPool::new(
            sqlite_config(&dir, "limit.db")
                .max_idle(1)
                .max_active(1)
                .connect_timeout(Duration::from_millis(100)),
        )
        .unwrap();

        let _held = pool.get_connection().await.unwrap();
        let result = pool.get_connection().await;
        assert!(matches!(result, Err(DbError::PoolTimeout(_))));
    }

    #[tokio::test]
    async fn test_abandoned_lease_is_reclaimed() {
        let dir = tempdir().unwrap();
        let pool = ShardPool::new(
            sqlite_config(&dir, "abandoned.db")
                .max_idle(1)
                .max_active(1)
                .abandoned_timeout(Duration::from_millis(20)),
        )
        .unwrap();

        let held = pool.get_connection().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.evict().unwrap();

        let stats = pool.stats().unwrap();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_connections, 0);

        // Capacity is available again even though the old guard is alive.
        let _fresh = pool.get_connection().await.unwrap();
        drop(held);
        let stats = pool.stats().unwrap();
        assert_eq!(stats.idle_connections, 0);
        assert_eq!(stats.active_connections, 1);
    }

    #[tokio::test]
    async fn test_idle_eviction() {
        let dir = tempdir().unwrap();
        let pool = ShardPool::new(
            sqlite_config(&dir, "evict.db").min_evictable_idle(Duration::from_millis(20)),
        )
        .unwrap();

        drop(pool.get_connection().await.unwrap());
        assert_eq!(pool.stats().unwrap().idle_connections, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.evict().unwrap();
        let stats = pool.stats().unwrap();
        assert_eq!(stats.idle_connections, 0);
        assert_eq!(stats.total_connections, 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_checkout() {
        let dir = tempdir().unwrap();
        let pool = ShardPool::new(sqlite_config(&dir, "closed.db")).unwrap();
        drop(pool.get_connection().await.unwrap());

        pool.close().unwrap();
        assert!(pool.is_closed());
        assert_eq!(pool.stats().unwrap().total_connections, 0);
        assert!(matches!(
            pool.get_connection().await,
            Err(DbError::ConnectionError(_))
        ));
    }

    #[tokio::test]
    async fn test_validation_query_runs_on_checkout() {
        let dir = tempdir().unwrap();
        let pool = ShardPool::new(sqlite_config(&dir, "validate.db").validation_query("select 1"))
            .unwrap();
        drop(pool.get_connection().await.unwrap());
        let _again = pool.get_connection().await.unwrap();
        assert_eq!(pool.stats().unwrap().total_connections, 1);
    }
}
