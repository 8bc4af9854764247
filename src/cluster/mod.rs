//! Lazily materialized shard executors.
//!
//! Each virtual shard resolves its connection URL from a template by
//! substituting `__VIRTUAL__` and `__PHYSICAL__`. Shards that resolve to the
//! same URL share one pool through the [`ConnectionPoolRegistry`].

pub mod executor;

use crate::config::ClusterConfig;
use crate::connection::ConnectionPoolRegistry;
use crate::connection::config::ShardPoolConfig;
use crate::core::{DbError, Result};
use crate::shard::{HashShardResolver, ShardResolver, validate_resolver};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub use executor::{NamedShardExecutor, RowHandler, ShardExecutor};

pub const VIRTUAL_MARKER: &str = "__VIRTUAL__";
pub const PHYSICAL_MARKER: &str = "__PHYSICAL__";

/// The executor pair serving one virtual shard.
pub struct DbShard {
    shard_id: u32,
    physical_index: u32,
    url: String,
    executor: ShardExecutor,
    named_executor: NamedShardExecutor,
}

impl DbShard {
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn physical_index(&self) -> u32 {
        self.physical_index
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn executor(&self) -> &ShardExecutor {
        &self.executor
    }

    pub fn named_executor(&self) -> &NamedShardExecutor {
        &self.named_executor
    }

    fn pool_url_redacted(&self) -> String {
        self.executor.pool().config().redacted_url()
    }
}

pub struct ShardCluster {
    resolver: Arc<dyn ShardResolver>,
    pool_template: ShardPoolConfig,
    registry: Arc<ConnectionPoolRegistry>,
    shards: Mutex<HashMap<u32, Arc<DbShard>>>,
    closed: AtomicBool,
}

impl ShardCluster {
    /// `pool_template.url` is the URL template; the remaining pool settings
    /// apply to every shard pool.
    pub fn new(
        resolver: Arc<dyn ShardResolver>,
        pool_template: ShardPoolConfig,
        registry: Arc<ConnectionPoolRegistry>,
    ) -> Result<Self> {
        validate_resolver(resolver.as_ref())?;
        pool_template.validate().map_err(DbError::ConfigError)?;

        info!(
            virtual_shards = resolver.virtual_size(),
            physical_shards = resolver.physical_size(),
            url_template = %pool_template.redacted_url(),
            "shard cluster configured"
        );

        Ok(Self {
            resolver,
            pool_template,
            registry,
            shards: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Hash-routed cluster with a private pool registry.
    pub fn with_hash_resolver(
        virtual_shards: u32,
        physical_shards: u32,
        pool_template: ShardPoolConfig,
    ) -> Result<Self> {
        Self::new(
            Arc::new(HashShardResolver::new(virtual_shards, physical_shards)),
            pool_template,
            Arc::new(ConnectionPoolRegistry::new()),
        )
    }

    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        config.validate()?;
        Self::with_hash_resolver(
            config.virtual_shards,
            config.physical_shards,
            config.pool_config(),
        )
    }

    pub fn resolver(&self) -> &dyn ShardResolver {
        self.resolver.as_ref()
    }

    pub fn registry(&self) -> &Arc<ConnectionPoolRegistry> {
        &self.registry
    }

    pub fn virtual_size(&self) -> u32 {
        self.resolver.virtual_size()
    }

    pub fn physical_size(&self) -> u32 {
        self.resolver.physical_size()
    }

    pub fn shard_for_id(&self, id: &str) -> u32 {
        self.resolver.shard_id(id)
    }

    /// Fully substituted connection URL of `shard`.
    pub fn shard_url(&self, shard_id: u32) -> Result<String> {
        self.check_range(shard_id)?;
        let physical = self.resolver.physical_index(shard_id);
        Ok(self
            .pool_template
            .url
            .replace(VIRTUAL_MARKER, &shard_id.to_string())
            .replace(PHYSICAL_MARKER, &physical.to_string()))
    }

    /// Returns the executor pair of `shard`, creating it on first touch.
    pub fn shard(&self, shard_id: u32) -> Result<Arc<DbShard>> {
        self.check_open()?;
        self.check_range(shard_id)?;

        let mut shards = self.shards.lock()?;
        // Re-check under the lock so a concurrent close wins.
        self.check_open()?;

        if let Some(shard) = shards.get(&shard_id) {
            return Ok(Arc::clone(shard));
        }

        let url = self.shard_url(shard_id)?;
        let pool = self
            .registry
            .get_or_create(&self.pool_template.for_url(url.clone()))?;
        let executor = ShardExecutor::new(shard_id, pool);
        let shard = Arc::new(DbShard {
            shard_id,
            physical_index: self.resolver.physical_index(shard_id),
            url,
            named_executor: NamedShardExecutor::new(executor.clone()),
            executor,
        });
        debug!(shard = shard_id, url = %shard.pool_url_redacted(), "shard initialized");

        shards.insert(shard_id, Arc::clone(&shard));
        Ok(shard)
    }

    pub fn executor(&self, shard_id: u32) -> Result<ShardExecutor> {
        Ok(self.shard(shard_id)?.executor.clone())
    }

    pub fn named_executor(&self, shard_id: u32) -> Result<NamedShardExecutor> {
        Ok(self.shard(shard_id)?.named_executor.clone())
    }

    /// Number of shards touched so far.
    pub fn initialized_shards(&self) -> usize {
        self.shards.lock().map(|shards| shards.len()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes every shard pool and forgets them. The cluster cannot be
    /// reopened; later calls fail with `ClusterClosed`.
    pub fn close(&self) -> Result<()> {
        let mut shards = self.shards.lock()?;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let urls: BTreeSet<String> = shards.values().map(|shard| shard.url.clone()).collect();
        for url in &urls {
            self.registry.remove(url)?;
        }
        let closed_shards = shards.len();
        shards.clear();

        info!(shards = closed_shards, pools = urls.len(), "shard cluster closed");
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DbError::ClusterClosed);
        }
        Ok(())
    }

    fn check_range(&self, shard_id: u32) -> Result<()> {
        let virtual_size = self.resolver.virtual_size();
        if shard_id >= virtual_size {
            return Err(DbError::InvalidShardConfig(format!(
                "shard {} out of range 0..{}",
                shard_id, virtual_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn template(dir: &tempfile::TempDir) -> ShardPoolConfig {
        ShardPoolConfig::new(format!(
            "sqlite://{}/db___PHYSICAL___v__VIRTUAL__.db?mode=rwc",
            dir.path().display()
        ))
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let result = ShardCluster::with_hash_resolver(10, 4, ShardPoolConfig::new("sqlite://x.db"));
        assert!(matches!(result, Err(DbError::InvalidShardConfig(_))));
    }

    #[test]
    fn test_shard_url_substitution() {
        let dir = tempdir().unwrap();
        let cluster = ShardCluster::with_hash_resolver(8, 2, template(&dir)).unwrap();

        let url = cluster.shard_url(5).unwrap();
        assert!(url.ends_with("/db_1_v5.db?mode=rwc"), "{}", url);
        let url = cluster.shard_url(3).unwrap();
        assert!(url.ends_with("/db_0_v3.db?mode=rwc"), "{}", url);

        assert!(matches!(
            cluster.shard_url(8),
            Err(DbError::InvalidShardConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_shards_are_created_lazily_and_cached() {
        let dir = tempdir().unwrap();
        let cluster = ShardCluster::with_hash_resolver(4, 1, template(&dir)).unwrap();
        assert_eq!(cluster.initialized_shards(), 0);

        let first = cluster.shard(2).unwrap();
        let again = cluster.shard(2).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(cluster.initialized_shards(), 1);
        assert_eq!(first.physical_index(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_touch_creates_one_shard() {
        let dir = tempdir().unwrap();
        let cluster = Arc::new(ShardCluster::with_hash_resolver(4, 2, template(&dir)).unwrap());
        let start = Arc::new(tokio::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cluster = Arc::clone(&cluster);
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    cluster.shard(3)
                })
            })
            .collect();

        let mut shards = Vec::new();
        for handle in handles {
            shards.push(handle.await.unwrap().unwrap());
        }
        assert!(shards.iter().all(|shard| Arc::ptr_eq(shard, &shards[0])));
        assert_eq!(cluster.initialized_shards(), 1);
        assert_eq!(cluster.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_single_url_template_shares_pool() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}/all.db?mode=rwc", dir.path().display());
        let cluster = ShardCluster::with_hash_resolver(4, 2, ShardPoolConfig::new(url)).unwrap();

        for shard in 0..4 {
            cluster.shard(shard).unwrap();
        }
        assert_eq!(cluster.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let dir = tempdir().unwrap();
        let cluster = ShardCluster::with_hash_resolver(4, 1, template(&dir)).unwrap();
        let executor = cluster.executor(1).unwrap();
        executor.execute("create table t (id varchar(64))").await.unwrap();

        cluster.close().unwrap();
        assert!(cluster.is_closed());
        assert!(cluster.registry().is_empty());
        assert!(matches!(cluster.shard(1), Err(DbError::ClusterClosed)));
        assert!(executor.query("select * from t", &[]).await.is_err());
    }
}
