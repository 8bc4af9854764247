use crate::connection::config::ShardPoolConfig;
use crate::core::{DbError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Deployment settings for one sharded cluster, usually read from JSON.
///
/// ```json
/// {
///   "url_template": "mysql://app:secret@db__PHYSICAL__/shard___VIRTUAL__",
///   "virtual_shards": 16,
///   "physical_shards": 4,
///   "pool": { "max_idle": 4, "max_active": 8 },
///   "thread_pool_size": 8,
///   "table_names": { "Account": "accounts" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClusterConfig {
    pub url_template: String,
    pub virtual_shards: u32,
    pub physical_shards: u32,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,
    /// Entity type name -> table name
    #[serde(default)]
    pub table_names: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_idle: usize,
    pub max_active: usize,
    pub connect_timeout_ms: u64,
    pub validation_query: Option<String>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle: 8,
            max_active: 16,
            connect_timeout_ms: 30_000,
            validation_query: None,
        }
    }
}

fn default_thread_pool_size() -> usize {
    8
}

impl ClusterConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| DbError::ConfigError(format!("invalid cluster config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| {
            DbError::ConfigError(format!("cannot read {}: {}", path.display(), err))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.virtual_shards == 0 || self.physical_shards == 0 {
            return Err(DbError::InvalidShardConfig(
                "shard counts must be > 0".into(),
            ));
        }
        if self.virtual_shards % self.physical_shards != 0 {
            return Err(DbError::InvalidShardConfig(format!(
                "virtual_shards {} is not a multiple of physical_shards {}",
                self.virtual_shards, self.physical_shards
            )));
        }
        if self.thread_pool_size == 0 {
            return Err(DbError::ConfigError("thread_pool_size must be > 0".into()));
        }
        self.pool_config().validate().map_err(DbError::ConfigError)
    }

    /// Pool settings with the URL template as `url`.
    pub fn pool_config(&self) -> ShardPoolConfig {
        let config = ShardPoolConfig::new(self.url_template.clone())
            .max_idle(self.pool.max_idle)
            .max_active(self.pool.max_active)
            .connect_timeout(Duration::from_millis(self.pool.connect_timeout_ms));
        match &self.pool.validation_query {
            Some(query) => config.validation_query(query.clone()),
            None => config,
        }
    }

    /// Configured table for an entity type, if overridden.
    pub fn table_name_for(&self, type_name: &str) -> Option<&str> {
        self.table_names.get(type_name).map(String::as_str)
    }
}
