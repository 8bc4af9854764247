pub mod config;
pub mod pool;

use crate::core::Result;
use config::ShardPoolConfig;
use pool::ShardPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub use config::redact_url;
pub use pool::{PoolGuard, PoolStats};

/// Process-wide cache of connection pools keyed by resolved shard URL.
///
/// Several virtual shards usually resolve to the same URL; they share one
/// pool. Pools are created on first request and live until removed.
#[derive(Default)]
pub struct ConnectionPoolRegistry {
    pools: Mutex<HashMap<String, Arc<ShardPool>>>,
}

impl ConnectionPoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pool for `config.url`, creating it if absent.
    ///
    /// Lookup and insert happen under one lock, so concurrent callers for the
    /// same URL always receive the same pool. When the pool already exists the
    /// rest of `config` is ignored.
    pub fn get_or_create(&self, config: &ShardPoolConfig) -> Result<Arc<ShardPool>> {
        let mut pools = self.pools.lock()?;

        if let Some(pool) = pools.get(&config.url) {
            return Ok(Arc::clone(pool));
        }

        let pool = Arc::new(ShardPool::new(config.clone())?);
        pools.insert(config.url.clone(), Arc::clone(&pool));
        debug!(url = %config.redacted_url(), "created shard pool");

        Ok(pool)
    }

    pub fn get(&self, url: &str) -> Result<Option<Arc<ShardPool>>> {
        Ok(self.pools.lock()?.get(url).cloned())
    }

    /// Forgets the pool for `url` and closes it.
    pub fn remove(&self, url: &str) -> Result<bool> {
        let removed = self.pools.lock()?.remove(url);
        match removed {
            Some(pool) => {
                pool.close()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn len(&self) -> usize {
        self.pools.lock().map(|pools| pools.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_same_url_shares_one_pool() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("a.db").display());
        let registry = ConnectionPoolRegistry::new();

        let first = registry.get_or_create(&ShardPoolConfig::new(&url)).unwrap();
        let second = registry
            .get_or_create(&ShardPoolConfig::new(&url).max_active(2).max_idle(1))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(second.config().max_active, 16);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("b.db").display());
        let registry = Arc::new(ConnectionPoolRegistry::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let url = url.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create(&ShardPoolConfig::new(url)).unwrap()
            }));
        }

        let mut pools = Vec::new();
        for handle in handles {
            pools.push(handle.await.unwrap());
        }
        assert!(pools.iter().all(|pool| Arc::ptr_eq(pool, &pools[0])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_closes_pool() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("c.db").display());
        let registry = ConnectionPoolRegistry::new();

        let pool = registry.get_or_create(&ShardPoolConfig::new(&url)).unwrap();
        assert!(registry.remove(&url).unwrap());
        assert!(pool.is_closed());
        assert!(registry.is_empty());
        assert!(!registry.remove(&url).unwrap());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let registry = ConnectionPoolRegistry::new();
        assert!(registry.get_or_create(&ShardPoolConfig::new("")).is_err());
        assert!(registry.is_empty());
    }
}
