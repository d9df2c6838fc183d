//! Shard map lookup cache
//!
//! The cache is never authoritative: entries are filled after successful
//! store reads and dropped whenever a mutation or a failed precondition
//! shows them to be stale.

pub mod cache;

pub use cache::{NullCache, ShardMapCache};

use shardmap_common::{Mapping, ShardKey, ShardMap};

/// Cache of shard maps and key lookups
pub trait MappingCache: Send + Sync {
    /// Cached shard map by name (case-insensitive)
    fn lookup_shard_map(&self, name: &str) -> Option<ShardMap>;

    /// Add or refresh a shard map entry
    fn add_shard_map(&self, map: &ShardMap);

    /// Cached mapping containing `key`
    fn lookup_mapping(&self, map: &ShardMap, key: &ShardKey) -> Option<Mapping>;

    /// Cache a mapping read from the store
    ///
    /// Replaces the entry of the same mapping whatever its version, since
    /// the store is authoritative and versions can go back on undo.
    fn add_or_update_mapping(&self, map: &ShardMap, mapping: &Mapping);

    /// Drop the entry of one mapping
    fn invalidate_mapping(&self, map: &ShardMap, mapping: &Mapping);

    /// Drop a shard map and all of its mappings
    fn invalidate_shard_map(&self, map: &ShardMap);

    /// Drop the mappings of a shard map, keeping the map entry
    fn invalidate_shard_map_mappings(&self, map: &ShardMap);

    /// Drop everything
    fn clear(&self);

    fn lookup_hit_count(&self) -> u64;

    fn lookup_miss_count(&self) -> u64;

    fn eviction_count(&self) -> u64;
}
