// ============================================================================
// rustshard
// ============================================================================
//
// A single logical entity store over many independent SQL shards. Every
// operation is routed by a deterministic function of the entity id; work
// that touches several shards fans out over a bounded task pool.

extern crate self as rustshard;

pub mod cluster;
pub mod config;
pub mod connection;
pub mod core;
pub mod orm;
pub mod shard;
pub mod sql;
pub mod store;
pub mod task;

// Re-export main types for convenience
pub use crate::core::{DbError, QueryResult, Result, Row, Value};

pub use cluster::{DbShard, NamedShardExecutor, RowHandler, ShardCluster, ShardExecutor};
pub use config::{ClusterConfig, PoolSettings};
pub use connection::{
    ConnectionPoolRegistry, PoolGuard, PoolStats, config::ShardPoolConfig, pool::ShardPool,
};
pub use orm::{
    Entity, EntityDescriptor, EntityMapper, FieldDescriptor, FieldKind, FieldValue,
    mapper::WhereMap,
};
pub use shard::{
    HashShardResolver, ModuloShardResolver, RangeShardResolver, ShardResolver, stable_shard_for,
};
pub use sql::{Dialect, NamedParams, Param};
pub use store::{EntityCallback, ObjectDumper, ShardedEntityStore};
pub use task::{ParallelTaskGroup, ShardTaskExecutor};

// Derive macros share names with the traits they implement.
pub use rustshard_derive::{Entity, EntityEnum};
