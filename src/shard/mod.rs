pub mod resolver;

pub use resolver::{
    HashShardResolver, ModuloShardResolver, RangeShardResolver, ShardResolver, fnv1a_64,
    stable_shard_for, validate_resolver,
};
