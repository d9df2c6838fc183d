//! In-memory mapping cache
//!
//! Range maps are indexed by the low key of each mapping in an ordered map,
//! so the mapping containing a key is the entry with the greatest low key
//! not above it. List maps are indexed by point in a hash map.

use crate::MappingCache;
use parking_lot::RwLock;
use shardmap_common::{Mapping, ShardKey, ShardMap, ShardMapId, ShardMapKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Lookup and eviction counters
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    fn record_lookup(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_evictions(&self, count: u64) {
        if count > 0 {
            self.evictions.fetch_add(count, Ordering::Relaxed);
        }
    }
}

/// Mappings of one shard map
enum MappingIndex {
    List(HashMap<ShardKey, Mapping>),
    Range(BTreeMap<ShardKey, Mapping>),
}

impl MappingIndex {
    fn new(kind: ShardMapKind) -> Self {
        match kind {
            ShardMapKind::List => Self::List(HashMap::new()),
            ShardMapKind::Range => Self::Range(BTreeMap::new()),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::List(points) => points.len(),
            Self::Range(ranges) => ranges.len(),
        }
    }

    fn find(&self, key: &ShardKey) -> Option<&Mapping> {
        match self {
            Self::List(points) => points.get(key),
            Self::Range(ranges) => ranges
                .range::<ShardKey, _>(..=key)
                .next_back()
                .map(|(_, mapping)| mapping)
                .filter(|mapping| mapping.contains(key)),
        }
    }

    /// Insert a mapping, replacing any entry of the same id whatever its
    /// version; returns the number of other entries displaced
    fn upsert(&mut self, mapping: &Mapping) -> u64 {
        let low = mapping.range.low();
        match self {
            Self::List(points) => {
                let displaced = points
                    .insert(low.clone(), mapping.clone())
                    .filter(|old| old.id != mapping.id);
                u64::from(displaced.is_some())
            }
            Self::Range(ranges) => {
                let stale: Vec<ShardKey> = ranges
                    .range::<ShardKey, _>(..mapping.range.high())
                    .filter(|(_, cached)| {
                        cached.id != mapping.id && cached.range.intersects(&mapping.range)
                    })
                    .map(|(low, _)| low.clone())
                    .collect();
                for low in &stale {
                    ranges.remove(low);
                }
                ranges.insert(low.clone(), mapping.clone());
                stale.len() as u64
            }
        }
    }

    fn remove(&mut self, mapping: &Mapping) -> bool {
        let low = mapping.range.low();
        match self {
            Self::List(points) => {
                if points.get(low).is_some_and(|m| m.id == mapping.id) {
                    return points.remove(low).is_some();
                }
                false
            }
            Self::Range(ranges) => {
                if ranges.get(low).is_some_and(|m| m.id == mapping.id) {
                    return ranges.remove(low).is_some();
                }
                false
            }
        }
    }
}

struct CachedShardMap {
    map: ShardMap,
    mappings: MappingIndex,
}

impl CachedShardMap {
    fn new(map: &ShardMap) -> Self {
        Self {
            map: map.clone(),
            mappings: MappingIndex::new(map.kind),
        }
    }
}

#[derive(Default)]
struct CacheState {
    /// Lowercased name to id
    names: HashMap<String, ShardMapId>,
    maps: HashMap<ShardMapId, CachedShardMap>,
}

impl CacheState {
    fn entry(&mut self, map: &ShardMap) -> &mut CachedShardMap {
        self.names.insert(map.name.to_lowercase(), map.id);
        self.maps
            .entry(map.id)
            .or_insert_with(|| CachedShardMap::new(map))
    }

    /// Remove a shard map entry; returns the number of dropped entries
    fn remove(&mut self, id: ShardMapId) -> u64 {
        let Some(cached) = self.maps.remove(&id) else {
            return 0;
        };
        self.names.retain(|_, mapped| *mapped != id);
        1 + cached.mappings.len() as u64
    }
}

/// Cache of shard maps and their mappings
#[derive(Default)]
pub struct ShardMapCache {
    state: RwLock<CacheState>,
    stats: CacheStats,
}

impl ShardMapCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached mappings across all shard maps
    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.state
            .read()
            .maps
            .values()
            .map(|cached| cached.mappings.len())
            .sum()
    }
}

impl MappingCache for ShardMapCache {
    fn lookup_shard_map(&self, name: &str) -> Option<ShardMap> {
        let found = {
            let state = self.state.read();
            state
                .names
                .get(&name.to_lowercase())
                .and_then(|id| state.maps.get(id))
                .map(|cached| cached.map.clone())
        };
        self.stats.record_lookup(found.is_some());
        found
    }

    fn add_shard_map(&self, map: &ShardMap) {
        let mut state = self.state.write();
        let renamed = state
            .names
            .get(&map.name.to_lowercase())
            .copied()
            .filter(|id| *id != map.id);
        if let Some(old) = renamed {
            let dropped = state.remove(old);
            self.stats.record_evictions(dropped);
        }
        let entry = state.entry(map);
        if entry.map.kind == map.kind && entry.map.key_type == map.key_type {
            entry.map = map.clone();
        } else {
            *entry = CachedShardMap::new(map);
        }
    }

    fn lookup_mapping(&self, map: &ShardMap, key: &ShardKey) -> Option<Mapping> {
        let found = self
            .state
            .read()
            .maps
            .get(&map.id)
            .and_then(|cached| cached.mappings.find(key).cloned());
        self.stats.record_lookup(found.is_some());
        found
    }

    fn add_or_update_mapping(&self, map: &ShardMap, mapping: &Mapping) {
        let mut state = self.state.write();
        let entry = state.entry(map);
        let displaced = entry.mappings.upsert(mapping);
        self.stats.record_evictions(displaced);
    }

    fn invalidate_mapping(&self, map: &ShardMap, mapping: &Mapping) {
        let removed = self
            .state
            .write()
            .maps
            .get_mut(&map.id)
            .is_some_and(|cached| cached.mappings.remove(mapping));
        if removed {
            trace!(shard_map = %map.name, mapping_id = %mapping.id, "invalidated mapping");
            self.stats.record_evictions(1);
        }
    }

    fn invalidate_shard_map(&self, map: &ShardMap) {
        let dropped = self.state.write().remove(map.id);
        trace!(shard_map = %map.name, dropped, "invalidated shard map");
        self.stats.record_evictions(dropped);
    }

    fn invalidate_shard_map_mappings(&self, map: &ShardMap) {
        let mut state = self.state.write();
        if let Some(cached) = state.maps.get_mut(&map.id) {
            let dropped = cached.mappings.len() as u64;
            cached.mappings = MappingIndex::new(cached.map.kind);
            trace!(shard_map = %map.name, dropped, "invalidated shard map mappings");
            self.stats.record_evictions(dropped);
        }
    }

    fn clear(&self) {
        let mut state = self.state.write();
        let dropped = state
            .maps
            .values()
            .map(|cached| 1 + cached.mappings.len() as u64)
            .sum();
        *state = CacheState::default();
        self.stats.record_evictions(dropped);
    }

    fn lookup_hit_count(&self) -> u64 {
        self.stats.hits.load(Ordering::Relaxed)
    }

    fn lookup_miss_count(&self) -> u64 {
        self.stats.misses.load(Ordering::Relaxed)
    }

    fn eviction_count(&self) -> u64 {
        self.stats.evictions.load(Ordering::Relaxed)
    }
}

/// Cache that stores nothing; every lookup misses
#[derive(Debug, Default)]
pub struct NullCache {
    misses: AtomicU64,
}

impl MappingCache for NullCache {
    fn lookup_shard_map(&self, _name: &str) -> Option<ShardMap> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn add_shard_map(&self, _map: &ShardMap) {}

    fn lookup_mapping(&self, _map: &ShardMap, _key: &ShardKey) -> Option<Mapping> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn add_or_update_mapping(&self, _map: &ShardMap, _mapping: &Mapping) {}

    fn invalidate_mapping(&self, _map: &ShardMap, _mapping: &Mapping) {}

    fn invalidate_shard_map(&self, _map: &ShardMap) {}

    fn invalidate_shard_map_mappings(&self, _map: &ShardMap) {}

    fn clear(&self) {}

    fn lookup_hit_count(&self) -> u64 {
        0
    }

    fn lookup_miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn eviction_count(&self) -> u64 {
        0
    }
}
