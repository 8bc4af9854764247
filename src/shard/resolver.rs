use crate::core::{DbError, Result};

/// Maps an entity id onto a virtual shard.
///
/// Implementations must be pure: the same id always resolves to the same
/// shard for a given resolver configuration, with no hidden mutable state.
/// `virtual_size` must be an exact multiple of `physical_size`; the cluster
/// refuses to start otherwise (see [`validate_resolver`]).
pub trait ShardResolver: Send + Sync {
    fn shard_id(&self, id: &str) -> u32;

    fn virtual_size(&self) -> u32;

    fn physical_size(&self) -> u32;

    /// Number of virtual shards hosted by one physical server.
    fn virtual_per_physical(&self) -> u32 {
        (self.virtual_size() / self.physical_size().max(1)).max(1)
    }

    /// Physical server index hosting `shard_id`.
    fn physical_index(&self, shard_id: u32) -> u32 {
        shard_id / self.virtual_per_physical()
    }
}

/// Checks the sizing invariants every resolver must satisfy.
pub fn validate_resolver(resolver: &dyn ShardResolver) -> Result<()> {
    let virtual_size = resolver.virtual_size();
    let physical_size = resolver.physical_size();

    if virtual_size == 0 {
        return Err(DbError::InvalidShardConfig(
            "virtual shard count must be > 0".into(),
        ));
    }
    if physical_size == 0 {
        return Err(DbError::InvalidShardConfig(
            "physical shard count must be > 0".into(),
        ));
    }
    if virtual_size % physical_size != 0 {
        return Err(DbError::InvalidShardConfig(format!(
            "virtual shard count {} is not a multiple of physical shard count {}",
            virtual_size, physical_size
        )));
    }
    Ok(())
}

/// 64-bit FNV-1a over the id bytes. Stable across processes and platforms.
pub fn fnv1a_64(id: &str) -> u64 {
    let mut hash = 14695981039346656037u64;
    for byte in id.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash
}

/// Computes a stable shard for an id given a fixed shard count.
pub fn stable_shard_for(id: &str, shard_count: u32) -> u32 {
    if shard_count == 0 {
        return 0;
    }
    (fnv1a_64(id) % shard_count as u64) as u32
}

/// Hash-based resolver; the default strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashShardResolver {
    virtual_size: u32,
    physical_size: u32,
}

impl HashShardResolver {
    pub fn new(virtual_size: u32, physical_size: u32) -> Self {
        Self {
            virtual_size,
            physical_size,
        }
    }
}

impl ShardResolver for HashShardResolver {
    fn shard_id(&self, id: &str) -> u32 {
        stable_shard_for(id, self.virtual_size)
    }

    fn virtual_size(&self) -> u32 {
        self.virtual_size
    }

    fn physical_size(&self) -> u32 {
        self.physical_size
    }
}

/// Resolver for numeric ids: `id % virtual_size`.
///
/// Ids that do not parse as unsigned integers fall back to the FNV-1a hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuloShardResolver {
    virtual_size: u32,
    physical_size: u32,
}

impl ModuloShardResolver {
    pub fn new(virtual_size: u32, physical_size: u32) -> Self {
        Self {
            virtual_size,
            physical_size,
        }
    }
}

impl ShardResolver for ModuloShardResolver {
    fn shard_id(&self, id: &str) -> u32 {
        if self.virtual_size == 0 {
            return 0;
        }
        match id.trim().parse::<u64>() {
            Ok(numeric) => (numeric % self.virtual_size as u64) as u32,
            Err(_) => stable_shard_for(id, self.virtual_size),
        }
    }

    fn virtual_size(&self) -> u32 {
        self.virtual_size
    }

    fn physical_size(&self) -> u32 {
        self.physical_size
    }
}

/// Ranged resolver over sorted lexical split points.
///
/// With split points `["g", "p"]`, ids below `"g"` land on shard 0, ids in
/// `["g", "p")` on shard 1, the rest on shard 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeShardResolver {
    splits: Vec<String>,
    physical_size: u32,
}

impl RangeShardResolver {
    pub fn new(mut splits: Vec<String>, physical_size: u32) -> Self {
        splits.sort();
        splits.dedup();
        Self {
            splits,
            physical_size,
        }
    }

    pub fn splits(&self) -> &[String] {
        &self.splits
    }
}

impl ShardResolver for RangeShardResolver {
    fn shard_id(&self, id: &str) -> u32 {
        self.splits.partition_point(|split| split.as_str() <= id) as u32
    }

    fn virtual_size(&self) -> u32 {
        self.splits.len() as u32 + 1
    }

    fn physical_size(&self) -> u32 {
        self.physical_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_resolver_is_stable_and_in_range() {
        let resolver = HashShardResolver::new(16, 4);
        for i in 0..500 {
            let id = format!("entity-{}", i);
            let first = resolver.shard_id(&id);
            assert_eq!(first, resolver.shard_id(&id));
            assert!(first < 16);
        }
    }

    #[test]
    fn test_hash_resolver_matches_known_values() {
        // FNV-1a of the empty string is the offset basis.
        assert_eq!(fnv1a_64(""), 14695981039346656037);
        assert_eq!(fnv1a_64("a"), 0xaf63dc4c8601ec8c);
        assert_eq!(
            stable_shard_for("a", 7),
            (0xaf63dc4c8601ec8cu64 % 7) as u32
        );
    }

    #[test]
    fn test_physical_index_stays_in_range() {
        let resolver = HashShardResolver::new(12, 3);
        for shard in 0..12 {
            let physical = resolver.physical_index(shard);
            assert!(physical < 3, "shard {} mapped to {}", shard, physical);
            assert_eq!(physical, shard / 4);
        }
    }

    #[test]
    fn test_validate_rejects_bad_ratio() {
        assert!(validate_resolver(&HashShardResolver::new(8, 2)).is_ok());
        assert!(matches!(
            validate_resolver(&HashShardResolver::new(10, 4)),
            Err(DbError::InvalidShardConfig(_))
        ));
        assert!(validate_resolver(&HashShardResolver::new(0, 1)).is_err());
        assert!(validate_resolver(&HashShardResolver::new(4, 0)).is_err());
    }

    #[test]
    fn test_modulo_resolver() {
        let resolver = ModuloShardResolver::new(4, 2);
        assert_eq!(resolver.shard_id("10"), 2);
        assert_eq!(resolver.shard_id("7"), 3);
        let fallback = resolver.shard_id("abc");
        assert_eq!(fallback, stable_shard_for("abc", 4));
    }

    #[test]
    fn test_range_resolver() {
        let resolver = RangeShardResolver::new(vec!["p".into(), "g".into()], 1);
        assert_eq!(resolver.virtual_size(), 3);
        assert_eq!(resolver.shard_id("alpha"), 0);
        assert_eq!(resolver.shard_id("g"), 1);
        assert_eq!(resolver.shard_id("kilo"), 1);
        assert_eq!(resolver.shard_id("zulu"), 2);
    }
}
