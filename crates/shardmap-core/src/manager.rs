//! Shard map manager
//!
//! The public entry point. Every mutation runs through the operation
//! engine; reads go to the global store and fill the cache. The cache is
//! dropped selectively whenever a store answer shows it to be stale.

use crate::client::StoreClient;
use crate::executor::{OperationExecutor, global_min_version};
use crate::operation::{MappingUpdate, Mutation, OperationFactory};
use crate::recovery::{MappingDifferences, RecoveryManager, RecoveryReport};
use crate::retry::RetryPolicy;
use crate::schema_info::SchemaInfoCollection;
use crate::upgrade::UpgradeCoordinator;
use shardmap_cache::{MappingCache, NullCache, ShardMapCache};
use shardmap_common::{
    Error, ErrorCode, Mapping, MappingId, MappingLockToken, MappingStatus, Result, Shard,
    ShardKey, ShardKeyType, ShardLocation, ShardMap, ShardMapConfig, ShardMapKind, ShardRange,
    StoreVersion,
};
use shardmap_store::schema::BASE_VERSION;
use shardmap_store::{
    BuiltinScripts, LockScope, OperationKind, RedbStoreFactory, ScriptProvider,
    StoreConnectionFactory, StoreRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// What `create` does with an already deployed global store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CreateMode {
    /// Keep existing data, upgrading the schema up to the target
    #[default]
    KeepExisting,
    /// Drop the existing schema and deploy a fresh store
    ReplaceExisting,
}

/// Where key lookups are answered from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LookupOptions {
    pub in_cache: bool,
    pub in_store: bool,
}

impl LookupOptions {
    /// Read the global store and refresh the cache
    pub const STORE_ONLY: Self = Self {
        in_cache: false,
        in_store: true,
    };

    /// Answer from the cache, falling back to the global store on a miss
    pub const CACHE_THEN_STORE: Self = Self {
        in_cache: true,
        in_store: true,
    };

    /// Answer from the cache only
    pub const CACHE_ONLY: Self = Self {
        in_cache: true,
        in_store: false,
    };
}

impl Default for LookupOptions {
    fn default() -> Self {
        Self::STORE_ONLY
    }
}

/// Redb store factory laid out under the configured data directory
#[must_use]
pub fn redb_stores(config: &ShardMapConfig) -> Arc<RedbStoreFactory> {
    Arc::new(RedbStoreFactory::new(
        config.store.data_dir.clone(),
        config.store.command_timeout(),
    ))
}

/// Manages shard maps, shards and mappings across the global and local stores
pub struct ShardMapManager {
    client: StoreClient,
    cache: Arc<dyn MappingCache>,
    scripts: Arc<dyn ScriptProvider>,
    config: ShardMapConfig,
}

impl ShardMapManager {
    fn new(
        stores: Arc<dyn StoreConnectionFactory>,
        config: ShardMapConfig,
        scripts: Arc<dyn ScriptProvider>,
    ) -> Self {
        let cache: Arc<dyn MappingCache> = if config.cache.enabled {
            Arc::new(ShardMapCache::new())
        } else {
            Arc::new(NullCache::default())
        };
        Self {
            client: StoreClient::new(stores, RetryPolicy::from_config(&config.retry)),
            cache,
            scripts,
            config,
        }
    }

    /// Deploy (or upgrade) the global store and return a manager over it
    pub fn create(
        stores: Arc<dyn StoreConnectionFactory>,
        config: ShardMapConfig,
        mode: CreateMode,
        target: Option<StoreVersion>,
    ) -> Result<Self> {
        Self::create_with_scripts(stores, config, Arc::new(BuiltinScripts), mode, target)
    }

    /// Like [`create`](Self::create) with a custom schema history
    pub fn create_with_scripts(
        stores: Arc<dyn StoreConnectionFactory>,
        config: ShardMapConfig,
        scripts: Arc<dyn ScriptProvider>,
        mode: CreateMode,
        target: Option<StoreVersion>,
    ) -> Result<Self> {
        let manager = Self::new(stores, config, scripts);
        let upgrades = manager.upgrades();
        if mode == CreateMode::ReplaceExisting {
            upgrades.reset_global()?;
        }
        let version = upgrades.upgrade_global(target)?;
        info!(%version, ?mode, "shard map manager created");
        Ok(manager)
    }

    /// Open a manager over an existing, compatible global store
    ///
    /// Pending operations are recovered first when `recovery.on_startup`
    /// is set.
    pub fn open(stores: Arc<dyn StoreConnectionFactory>, config: ShardMapConfig) -> Result<Self> {
        let manager = Self::new(stores, config, Arc::new(BuiltinScripts));
        let version = manager
            .client
            .global("open global store", BASE_VERSION, StoreRequest::GetVersion)?
            .version();
        debug!(?version, "opened global store");
        if manager.config.recovery.on_startup {
            manager.recover_pending_operations()?;
        }
        Ok(manager)
    }

    /// Replace the cache, e.g. to share one between managers
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn MappingCache>) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<dyn MappingCache> {
        &self.cache
    }

    #[must_use]
    pub const fn config(&self) -> &ShardMapConfig {
        &self.config
    }

    fn upgrades(&self) -> UpgradeCoordinator<'_> {
        UpgradeCoordinator::new(&self.client, self.scripts.as_ref())
    }

    fn recovery(&self) -> RecoveryManager<'_> {
        RecoveryManager::new(
            &self.client,
            Duration::from_millis(self.config.recovery.min_operation_age_ms),
        )
    }

    fn execute(&self, map: &ShardMap, mutation: Mutation) -> Result<()> {
        OperationExecutor::new(&self.client).execute(OperationFactory::create(map, mutation))
    }

    /// Drop cache entries a failed call showed to be stale
    fn observe<T>(&self, map: &ShardMap, touched: &[&Mapping], result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            match err.code() {
                ErrorCode::ShardMapDoesNotExist => self.cache.invalidate_shard_map(map),
                ErrorCode::MappingDoesNotExist
                | ErrorCode::MappingVersionMismatch
                | ErrorCode::MappingLockOwnerIdDoesNotMatch => {
                    for mapping in touched {
                        self.cache.invalidate_mapping(map, mapping);
                    }
                }
                _ => {}
            }
        }
        result
    }

    // ---- Shard maps ----

    pub fn create_list_shard_map(
        &self,
        name: impl Into<String>,
        key_type: ShardKeyType,
    ) -> Result<ShardMap> {
        self.create_shard_map(ShardMap::new(name, ShardMapKind::List, key_type)?)
    }

    pub fn create_range_shard_map(
        &self,
        name: impl Into<String>,
        key_type: ShardKeyType,
    ) -> Result<ShardMap> {
        self.create_shard_map(ShardMap::new(name, ShardMapKind::Range, key_type)?)
    }

    fn create_shard_map(&self, map: ShardMap) -> Result<ShardMap> {
        self.client.global(
            "add shard map",
            global_min_version(OperationKind::AddShardMap),
            StoreRequest::AddShardMap { map: map.clone() },
        )?;
        info!(shard_map = %map.name, kind = %map.kind, key_type = %map.key_type, "created shard map");
        Ok(map)
    }

    /// Shard map by name, failing with `ShardMapLookupFailure` when absent
    pub fn get_shard_map(&self, name: &str) -> Result<ShardMap> {
        self.try_get_shard_map(name)?.ok_or_else(|| {
            Error::new(
                ErrorCode::ShardMapLookupFailure,
                format!("shard map '{name}' does not exist"),
            )
        })
    }

    pub fn try_get_shard_map(&self, name: &str) -> Result<Option<ShardMap>> {
        let found = self
            .client
            .global(
                "find shard map",
                BASE_VERSION,
                StoreRequest::FindShardMapByName {
                    name: name.to_string(),
                },
            )?
            .into_shard_maps()
            .into_iter()
            .next();
        if let Some(map) = &found {
            self.cache.add_shard_map(map);
        }
        Ok(found)
    }

    /// Shard map by name, answered from the cache when possible
    pub fn get_or_load_shard_map(&self, name: &str) -> Result<ShardMap> {
        match self.cache.lookup_shard_map(name) {
            Some(map) => Ok(map),
            None => self.get_shard_map(name),
        }
    }

    pub fn get_shard_maps(&self) -> Result<Vec<ShardMap>> {
        Ok(self
            .client
            .global("list shard maps", BASE_VERSION, StoreRequest::GetShardMaps)?
            .into_shard_maps())
    }

    /// Delete a shard map; it must not have shards
    pub fn delete_shard_map(&self, map: &ShardMap) -> Result<()> {
        let result = self.client.global(
            "remove shard map",
            global_min_version(OperationKind::RemoveShardMap),
            StoreRequest::RemoveShardMap { map: map.clone() },
        );
        self.observe(map, &[], result)?;
        self.cache.invalidate_shard_map(map);
        info!(shard_map = %map.name, "deleted shard map");
        Ok(())
    }

    // ---- Shards ----

    /// Register a shard, deploying its local store when needed
    pub fn create_shard(&self, map: &ShardMap, location: &ShardLocation) -> Result<Shard> {
        self.upgrades().ensure_local_deployed(location)?;
        let shard = Shard::new(map.id, location.clone());
        let result = self.execute(
            map,
            Mutation::AddShard {
                shard: shard.clone(),
            },
        );
        self.observe(map, &[], result)?;
        self.cache.invalidate_shard_map_mappings(map);
        info!(shard_map = %map.name, %location, "created shard");
        Ok(shard)
    }

    /// Shard at a location, failing with `ShardDoesNotExist` when absent
    pub fn get_shard(&self, map: &ShardMap, location: &ShardLocation) -> Result<Shard> {
        self.try_get_shard(map, location)?.ok_or_else(|| {
            Error::new(
                ErrorCode::ShardDoesNotExist,
                format!(
                    "shard {location} does not exist in shard map '{}'",
                    map.name
                ),
            )
        })
    }

    pub fn try_get_shard(&self, map: &ShardMap, location: &ShardLocation) -> Result<Option<Shard>> {
        let result = self.client.global(
            "find shard",
            BASE_VERSION,
            StoreRequest::FindShardByLocation {
                map: map.id,
                location: location.clone(),
            },
        );
        Ok(self
            .observe(map, &[], result)?
            .into_shards()
            .into_iter()
            .next())
    }

    pub fn get_shards(&self, map: &ShardMap) -> Result<Vec<Shard>> {
        let result = self.client.global(
            "list shards",
            BASE_VERSION,
            StoreRequest::GetShards { map: map.id },
        );
        Ok(self.observe(map, &[], result)?.into_shards())
    }

    /// Remove a shard; it must not have mappings
    pub fn delete_shard(&self, map: &ShardMap, shard: &Shard) -> Result<()> {
        let result = self.execute(
            map,
            Mutation::RemoveShard {
                shard: shard.clone(),
            },
        );
        self.observe(map, &[], result)?;
        self.cache.invalidate_shard_map_mappings(map);
        info!(shard_map = %map.name, location = %shard.location, "deleted shard");
        Ok(())
    }

    // ---- Mappings ----

    /// Map a single key of a list shard map to a shard
    pub fn create_point_mapping(
        &self,
        map: &ShardMap,
        key: &ShardKey,
        shard: &Shard,
    ) -> Result<Mapping> {
        require_kind(map, ShardMapKind::List)?;
        require_key_type(map, key.key_type())?;
        require_member(map, shard)?;
        let mapping = Mapping::point(shard, key, MappingStatus::Online)?;
        self.add_mapping(map, mapping)
    }

    /// Map a key range of a range shard map to a shard
    pub fn create_range_mapping(
        &self,
        map: &ShardMap,
        range: ShardRange,
        shard: &Shard,
    ) -> Result<Mapping> {
        require_kind(map, ShardMapKind::Range)?;
        require_key_type(map, range.key_type())?;
        require_member(map, shard)?;
        let mapping = Mapping::range(shard, range, MappingStatus::Online);
        self.add_mapping(map, mapping)
    }

    fn add_mapping(&self, map: &ShardMap, mapping: Mapping) -> Result<Mapping> {
        let result = self.execute(
            map,
            Mutation::AddMapping {
                mapping: mapping.clone(),
            },
        );
        self.observe(map, &[], result)?;
        debug!(shard_map = %map.name, mapping_id = %mapping.id, range = %mapping.range, "created mapping");
        Ok(mapping)
    }

    /// Mapping containing `key`, failing with `MappingNotFoundForKey`
    pub fn get_mapping_for_key(
        &self,
        map: &ShardMap,
        key: &ShardKey,
        options: LookupOptions,
    ) -> Result<Mapping> {
        self.try_get_mapping_for_key(map, key, options)?
            .ok_or_else(|| {
                Error::new(
                    ErrorCode::MappingNotFoundForKey,
                    format!("no mapping for key {key} in shard map '{}'", map.name),
                )
            })
    }

    pub fn try_get_mapping_for_key(
        &self,
        map: &ShardMap,
        key: &ShardKey,
        options: LookupOptions,
    ) -> Result<Option<Mapping>> {
        require_key_type(map, key.key_type())?;
        if options.in_cache
            && let Some(mapping) = self.cache.lookup_mapping(map, key)
        {
            return Ok(Some(mapping));
        }
        if !options.in_store {
            return Ok(None);
        }
        let result = self.client.global(
            "find mapping by key",
            BASE_VERSION,
            StoreRequest::FindMappingByKey {
                map: map.id,
                key: key.clone(),
            },
        );
        let response = self.observe(map, &[], result)?;
        let in_flight = response.in_flight;
        let found = response.into_mappings().into_iter().next();
        // Rows of an unfinished operation may still be undone
        match &found {
            Some(mapping) if in_flight => self.cache.invalidate_mapping(map, mapping),
            Some(mapping) => self.cache.add_or_update_mapping(map, mapping),
            None => {}
        }
        Ok(found)
    }

    /// Mapping containing `key`, answered from the cache when possible
    pub fn get_or_load_mapping(&self, map: &ShardMap, key: &ShardKey) -> Result<Mapping> {
        self.get_mapping_for_key(map, key, LookupOptions::CACHE_THEN_STORE)
    }

    /// Mapping by id, failing with `MappingDoesNotExist`
    pub fn get_mapping(&self, map: &ShardMap, id: MappingId) -> Result<Mapping> {
        let result = self.client.global(
            "find mapping",
            BASE_VERSION,
            StoreRequest::FindMappingById { map: map.id, id },
        );
        self.observe(map, &[], result)?
            .into_mappings()
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::new(
                    ErrorCode::MappingDoesNotExist,
                    format!("mapping {id} does not exist in shard map '{}'", map.name),
                )
            })
    }

    /// Mappings intersecting `range` and/or pointing at `shard`, ordered by key
    pub fn get_mappings(
        &self,
        map: &ShardMap,
        range: Option<&ShardRange>,
        shard: Option<&Shard>,
    ) -> Result<Vec<Mapping>> {
        if let Some(range) = range {
            require_key_type(map, range.key_type())?;
        }
        let result = self.client.global(
            "list mappings",
            BASE_VERSION,
            StoreRequest::GetMappings {
                map: map.id,
                range: range.cloned(),
                shard: shard.map(|s| s.id),
            },
        );
        Ok(self.observe(map, &[], result)?.into_mappings())
    }

    /// Change status and/or shard of a mapping
    ///
    /// Moving a mapping to another shard requires it to be offline. Returns
    /// the updated mapping with its new version.
    pub fn update_mapping(
        &self,
        map: &ShardMap,
        mapping: &Mapping,
        update: &MappingUpdate,
        token: MappingLockToken,
    ) -> Result<Mapping> {
        require_owned(map, mapping)?;
        if let Some(shard) = &update.shard {
            require_member(map, shard)?;
        }
        let updated = update.apply_to(mapping, token);
        let result = self.execute(
            map,
            Mutation::UpdateMapping {
                current: mapping.clone(),
                updated: updated.clone(),
                token,
            },
        );
        self.observe(map, &[mapping], result)?;
        self.cache.invalidate_mapping(map, mapping);
        debug!(shard_map = %map.name, mapping_id = %mapping.id, version = %updated.version, "updated mapping");
        Ok(updated)
    }

    pub fn mark_mapping_offline(
        &self,
        map: &ShardMap,
        mapping: &Mapping,
        token: MappingLockToken,
    ) -> Result<Mapping> {
        self.update_mapping(
            map,
            mapping,
            &MappingUpdate::status(MappingStatus::Offline),
            token,
        )
    }

    pub fn mark_mapping_online(
        &self,
        map: &ShardMap,
        mapping: &Mapping,
        token: MappingLockToken,
    ) -> Result<Mapping> {
        self.update_mapping(
            map,
            mapping,
            &MappingUpdate::status(MappingStatus::Online),
            token,
        )
    }

    /// Delete an offline mapping
    pub fn delete_mapping(
        &self,
        map: &ShardMap,
        mapping: &Mapping,
        token: MappingLockToken,
    ) -> Result<()> {
        require_owned(map, mapping)?;
        let result = self.execute(
            map,
            Mutation::RemoveMapping {
                mapping: mapping.clone(),
                token,
            },
        );
        self.observe(map, &[mapping], result)?;
        self.cache.invalidate_mapping(map, mapping);
        debug!(shard_map = %map.name, mapping_id = %mapping.id, "deleted mapping");
        Ok(())
    }

    /// Split a range mapping at `at`; returns the lower and upper halves
    pub fn split_mapping(
        &self,
        map: &ShardMap,
        mapping: &Mapping,
        at: &ShardKey,
        token: MappingLockToken,
    ) -> Result<(Mapping, Mapping)> {
        require_owned(map, mapping)?;
        let mutation = Mutation::split(map, mapping, at, token)?;
        let Mutation::SplitMapping { left, right, .. } = &mutation else {
            return Err(Error::illegal_state("split produced another mutation"));
        };
        let halves = (left.clone(), right.clone());
        let result = self.execute(map, mutation);
        self.observe(map, &[mapping], result)?;
        self.cache.invalidate_mapping(map, mapping);
        debug!(shard_map = %map.name, mapping_id = %mapping.id, at = %at, "split mapping");
        Ok(halves)
    }

    /// Merge two adjacent range mappings of the same shard into one
    pub fn merge_mappings(
        &self,
        map: &ShardMap,
        left: &Mapping,
        right: &Mapping,
        token: MappingLockToken,
    ) -> Result<Mapping> {
        require_owned(map, left)?;
        require_owned(map, right)?;
        let mutation = Mutation::merge(map, left, right, token)?;
        let Mutation::MergeMappings { merged, .. } = &mutation else {
            return Err(Error::illegal_state("merge produced another mutation"));
        };
        let merged = merged.clone();
        let result = self.execute(map, mutation);
        self.observe(map, &[left, right], result)?;
        self.cache.invalidate_mapping(map, left);
        self.cache.invalidate_mapping(map, right);
        debug!(shard_map = %map.name, mapping_id = %merged.id, range = %merged.range, "merged mappings");
        Ok(merged)
    }

    // ---- Locking ----

    fn lock_request(
        &self,
        what: &str,
        map: &ShardMap,
        touched: &[&Mapping],
        scope: LockScope,
        token: MappingLockToken,
    ) -> Result<u64> {
        let kind = match scope {
            LockScope::Lock(_) => OperationKind::LockMapping,
            _ => OperationKind::UnlockMapping,
        };
        let result = self.client.global(
            what,
            global_min_version(kind),
            StoreRequest::LockMappings {
                map: map.id,
                scope,
                token,
            },
        );
        let affected = self.observe(map, touched, result)?.affected;
        Ok(affected)
    }

    /// Lock a mapping for `token`; locking it again with the same token is a no-op
    pub fn lock_mapping(
        &self,
        map: &ShardMap,
        mapping: &Mapping,
        token: MappingLockToken,
    ) -> Result<()> {
        require_owned(map, mapping)?;
        if token.is_no_lock() {
            return Err(Error::invalid_argument("cannot lock a mapping with the empty token"));
        }
        self.lock_request(
            "lock mapping",
            map,
            &[mapping],
            LockScope::Lock(mapping.id),
            token,
        )?;
        self.cache.invalidate_mapping(map, mapping);
        Ok(())
    }

    /// Unlock a mapping owned by `token`
    pub fn unlock_mapping(
        &self,
        map: &ShardMap,
        mapping: &Mapping,
        token: MappingLockToken,
    ) -> Result<()> {
        require_owned(map, mapping)?;
        self.lock_request(
            "unlock mapping",
            map,
            &[mapping],
            LockScope::Unlock(mapping.id),
            token,
        )?;
        self.cache.invalidate_mapping(map, mapping);
        Ok(())
    }

    /// Current lock owner of a mapping, `NO_LOCK` when unlocked
    pub fn get_mapping_lock_owner(
        &self,
        map: &ShardMap,
        mapping: &Mapping,
    ) -> Result<MappingLockToken> {
        let result = self.client.global(
            "read mapping lock owner",
            global_min_version(OperationKind::LockMapping),
            StoreRequest::FindMappingById {
                map: map.id,
                id: mapping.id,
            },
        );
        self.observe(map, &[mapping], result)?
            .into_mappings()
            .into_iter()
            .next()
            .map(|m| m.lock_owner)
            .ok_or_else(|| {
                Error::new(
                    ErrorCode::MappingDoesNotExist,
                    format!(
                        "mapping {} does not exist in shard map '{}'",
                        mapping.id, map.name
                    ),
                )
            })
    }

    /// Unlock every mapping of the map owned by `token`; others' locks stay
    pub fn unlock_all_mappings(&self, map: &ShardMap, token: MappingLockToken) -> Result<u64> {
        if token.is_no_lock() {
            return Err(Error::invalid_argument("cannot unlock with the empty token"));
        }
        let unlocked =
            self.lock_request("unlock mappings", map, &[], LockScope::UnlockAllOwnedBy, token)?;
        self.cache.invalidate_shard_map_mappings(map);
        debug!(shard_map = %map.name, unlocked, "unlocked mappings");
        Ok(unlocked)
    }

    /// Unlock every mapping of the map regardless of owner
    pub fn force_unlock_all_mappings(&self, map: &ShardMap) -> Result<u64> {
        let unlocked = self.lock_request(
            "force unlock mappings",
            map,
            &[],
            LockScope::ForceUnlockAll,
            MappingLockToken::NO_LOCK,
        )?;
        self.cache.invalidate_shard_map_mappings(map);
        info!(shard_map = %map.name, unlocked, "force unlocked mappings");
        Ok(unlocked)
    }

    // ---- Store versions and recovery ----

    pub fn global_store_version(&self) -> Result<Option<StoreVersion>> {
        self.upgrades().global_version()
    }

    pub fn local_store_version(&self, location: &ShardLocation) -> Result<Option<StoreVersion>> {
        self.upgrades().local_version(location)
    }

    /// Upgrade the global store to `target` (latest when `None`)
    pub fn upgrade_global_store(&self, target: Option<StoreVersion>) -> Result<StoreVersion> {
        self.upgrades().upgrade_global(target)
    }

    /// Deploy or upgrade the local store at `location`
    pub fn upgrade_local_store(
        &self,
        location: &ShardLocation,
        target: Option<StoreVersion>,
    ) -> Result<StoreVersion> {
        self.upgrades().upgrade_local(location, target)
    }

    /// Resolve operations left behind by interrupted runs
    pub fn recover_pending_operations(&self) -> Result<RecoveryReport> {
        let report = self.recovery().recover_pending_operations()?;
        if report.resolved() > 0 {
            self.cache.clear();
        }
        Ok(report)
    }

    pub fn detect_mapping_differences(
        &self,
        location: &ShardLocation,
    ) -> Result<Vec<MappingDifferences>> {
        self.recovery().detect_mapping_differences(location)
    }

    pub fn rebuild_local_mappings(&self, location: &ShardLocation) -> Result<u64> {
        self.recovery().rebuild_local_mappings(location)
    }

    /// Named schema info documents
    #[must_use]
    pub const fn schema_info(&self) -> SchemaInfoCollection<'_> {
        SchemaInfoCollection::new(&self.client)
    }
}

fn require_kind(map: &ShardMap, kind: ShardMapKind) -> Result<()> {
    if map.kind == kind {
        return Ok(());
    }
    Err(Error::new(
        ErrorCode::ShardMapKindMismatch,
        format!("shard map '{}' is a {} shard map, not {kind}", map.name, map.kind),
    ))
}

fn require_key_type(map: &ShardMap, key_type: ShardKeyType) -> Result<()> {
    if map.key_type == key_type {
        return Ok(());
    }
    Err(Error::new(
        ErrorCode::KeyTypeMismatch,
        format!(
            "key type {key_type} does not match shard map '{}' key type {}",
            map.name, map.key_type
        ),
    ))
}

fn require_member(map: &ShardMap, shard: &Shard) -> Result<()> {
    if shard.shard_map_id == map.id {
        return Ok(());
    }
    Err(Error::invalid_argument(format!(
        "shard {} does not belong to shard map '{}'",
        shard.location, map.name
    )))
}

fn require_owned(map: &ShardMap, mapping: &Mapping) -> Result<()> {
    if mapping.shard_map_id == map.id {
        return Ok(());
    }
    Err(Error::invalid_argument(format!(
        "mapping {} does not belong to shard map '{}'",
        mapping.id, map.name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_info::{ReferenceTableInfo, SchemaInfo, ShardedTableInfo};
    use crate::testing::{CountingCache, FaultMode, FaultyStores, Target};
    use shardmap_store::schema::{GLOBAL_LOCKING_VERSION, GLOBAL_STORE_VERSION};
    use std::sync::atomic::Ordering;

    fn test_config() -> ShardMapConfig {
        let mut config = ShardMapConfig::default();
        config.retry.max_attempts = 3;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config.recovery.min_operation_age_ms = 0;
        config
    }

    struct Env {
        _dir: tempfile::TempDir,
        stores: Arc<FaultyStores>,
        manager: ShardMapManager,
    }

    fn env() -> Env {
        env_at(None)
    }

    fn env_at(target: Option<StoreVersion>) -> Env {
        let dir = tempfile::tempdir().unwrap();
        let stores = Arc::new(FaultyStores::new(dir.path()));
        let manager = ShardMapManager::create(
            Arc::clone(&stores) as Arc<dyn StoreConnectionFactory>,
            test_config(),
            CreateMode::KeepExisting,
            target,
        )
        .unwrap();
        Env {
            _dir: dir,
            stores,
            manager,
        }
    }

    fn location(db: &str) -> ShardLocation {
        ShardLocation::new("srv", db).unwrap()
    }

    fn range(low: i32, high: i32) -> ShardRange {
        ShardRange::new(ShardKey::from(low), ShardKey::from(high)).unwrap()
    }

    fn lookup_counts(cache: &CountingCache) -> (u64, u64, u64) {
        (
            cache.hits.load(Ordering::Relaxed),
            cache.misses.load(Ordering::Relaxed),
            cache.invalidations.load(Ordering::Relaxed),
        )
    }

    #[test]
    fn test_undone_update_is_not_served_from_cache() {
        let Env {
            _dir, manager, ..
        } = env();
        let map = manager
            .create_list_shard_map("customers", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, &location("shard0")).unwrap();
        let key = ShardKey::from(1);
        let mapping = manager.create_point_mapping(&map, &key, &shard).unwrap();
        manager.get_or_load_mapping(&map, &key).unwrap();

        // Take an update offline as far as the global store, then stop
        let token = MappingLockToken::NO_LOCK;
        let record = OperationFactory::create(
            &map,
            Mutation::UpdateMapping {
                current: mapping.clone(),
                updated: MappingUpdate::status(MappingStatus::Offline).apply_to(&mapping, token),
                token,
            },
        );
        let logged = manager
            .client
            .global("log", BASE_VERSION, StoreRequest::LogOperation { record })
            .unwrap()
            .into_operations()
            .remove(0);
        manager
            .client
            .global(
                "apply",
                BASE_VERSION,
                StoreRequest::ApplyGlobal {
                    record: logged.clone(),
                },
            )
            .unwrap();

        let in_flight = manager
            .get_mapping_for_key(&map, &key, LookupOptions::STORE_ONLY)
            .unwrap();
        assert_eq!(in_flight.status, MappingStatus::Offline);
        assert!(manager.cache().lookup_mapping(&map, &key).is_none());

        manager
            .client
            .global("undo", BASE_VERSION, StoreRequest::UndoGlobal { record: logged })
            .unwrap();

        let cached = manager.get_or_load_mapping(&map, &key).unwrap();
        assert_eq!(cached.status, MappingStatus::Online);
        assert_eq!(cached.version, mapping.version);
        assert_eq!(
            manager
                .get_mapping_for_key(&map, &key, LookupOptions::STORE_ONLY)
                .unwrap(),
            cached
        );
    }

    #[test]
    fn test_duplicate_point_mapping_leaves_cache_untouched() {
        let Env {
            _dir, manager, ..
        } = env();
        let counting = Arc::new(CountingCache::new(Arc::new(ShardMapCache::new())));
        let manager = manager.with_cache(Arc::clone(&counting) as Arc<dyn MappingCache>);

        let map = manager
            .create_list_shard_map("customers", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, &location("shard0")).unwrap();
        manager
            .create_point_mapping(&map, &ShardKey::from(1), &shard)
            .unwrap();

        let before = lookup_counts(&counting);
        let err = manager
            .create_point_mapping(&map, &ShardKey::from(1), &shard)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MappingPointAlreadyMapped);
        assert_eq!(lookup_counts(&counting), before);
    }

    #[test]
    fn test_delete_requires_offline() {
        let Env { _dir, manager, .. } = env();
        let map = manager
            .create_list_shard_map("customers", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, &location("shard0")).unwrap();
        let key = ShardKey::from(5);
        let mapping = manager.create_point_mapping(&map, &key, &shard).unwrap();

        let err = manager
            .delete_mapping(&map, &mapping, MappingLockToken::NO_LOCK)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MappingIsNotOffline);

        let offline = manager
            .mark_mapping_offline(&map, &mapping, MappingLockToken::NO_LOCK)
            .unwrap();
        assert_eq!(offline.status, MappingStatus::Offline);
        assert_eq!(offline.version, mapping.version.next());
        manager
            .delete_mapping(&map, &offline, MappingLockToken::NO_LOCK)
            .unwrap();

        let err = manager
            .get_mapping_for_key(&map, &key, LookupOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MappingNotFoundForKey);

        let err = manager
            .delete_mapping(&map, &offline, MappingLockToken::NO_LOCK)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MappingDoesNotExist);
    }

    #[test]
    fn test_stale_mapping_version_rejected() {
        let Env { _dir, manager, .. } = env();
        let counting = Arc::new(CountingCache::new(Arc::new(ShardMapCache::new())));
        let manager = manager.with_cache(Arc::clone(&counting) as Arc<dyn MappingCache>);
        let map = manager
            .create_list_shard_map("customers", ShardKeyType::Int64)
            .unwrap();
        let shard = manager.create_shard(&map, &location("shard0")).unwrap();
        let key = ShardKey::from(42_i64);
        let mapping = manager.create_point_mapping(&map, &key, &shard).unwrap();
        manager
            .mark_mapping_offline(&map, &mapping, MappingLockToken::NO_LOCK)
            .unwrap();

        let invalidations = counting.invalidations.load(Ordering::Relaxed);
        let err = manager
            .mark_mapping_online(&map, &mapping, MappingLockToken::NO_LOCK)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MappingVersionMismatch);
        assert!(!err.is_retryable());
        assert_eq!(
            counting.invalidations.load(Ordering::Relaxed),
            invalidations + 1
        );
    }

    #[test]
    fn test_cache_first_lookup() {
        let Env { _dir, manager, .. } = env();
        let counting = Arc::new(CountingCache::new(Arc::new(ShardMapCache::new())));
        let manager = manager.with_cache(Arc::clone(&counting) as Arc<dyn MappingCache>);
        let map = manager
            .create_range_shard_map("orders", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, &location("shard0")).unwrap();
        let mapping = manager
            .create_range_mapping(&map, range(0, 100), &shard)
            .unwrap();

        let key = ShardKey::from(7);
        assert_eq!(manager.get_or_load_mapping(&map, &key).unwrap().id, mapping.id);
        assert_eq!(manager.get_or_load_mapping(&map, &key).unwrap().id, mapping.id);
        assert_eq!(counting.misses.load(Ordering::Relaxed), 1);
        assert_eq!(counting.hits.load(Ordering::Relaxed), 1);

        let offline = manager
            .mark_mapping_offline(&map, &mapping, MappingLockToken::NO_LOCK)
            .unwrap();
        let reloaded = manager.get_or_load_mapping(&map, &key).unwrap();
        assert_eq!(reloaded.version, offline.version);
        assert_eq!(counting.misses.load(Ordering::Relaxed), 2);

        assert_eq!(
            manager
                .get_or_load_shard_map("ORDERS")
                .unwrap()
                .id,
            map.id
        );
        let err = manager
            .get_mapping_for_key(&map, &ShardKey::from(7_i64), LookupOptions::CACHE_ONLY)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyTypeMismatch);
    }

    #[test]
    fn test_token_scoped_unlock() {
        let Env { _dir, manager, .. } = env();
        let map = manager
            .create_range_shard_map("orders", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, &location("shard0")).unwrap();
        let a = manager.create_range_mapping(&map, range(0, 10), &shard).unwrap();
        let b = manager.create_range_mapping(&map, range(10, 20), &shard).unwrap();
        let c = manager.create_range_mapping(&map, range(20, 30), &shard).unwrap();

        let t1 = MappingLockToken::new();
        let t2 = MappingLockToken::new();
        manager.lock_mapping(&map, &a, t1).unwrap();
        manager.lock_mapping(&map, &b, t1).unwrap();
        manager.lock_mapping(&map, &c, t2).unwrap();

        let err = manager.lock_mapping(&map, &c, t1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MappingIsAlreadyLocked);
        let err = manager.unlock_mapping(&map, &c, t1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MappingLockOwnerIdDoesNotMatch);
        let err = manager
            .mark_mapping_offline(&map, &c, MappingLockToken::NO_LOCK)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MappingLockOwnerIdDoesNotMatch);
        // The owner may change its own mapping
        let c = manager.mark_mapping_offline(&map, &c, t2).unwrap();

        assert_eq!(manager.unlock_all_mappings(&map, t1).unwrap(), 2);
        assert_eq!(
            manager.get_mapping_lock_owner(&map, &a).unwrap(),
            MappingLockToken::NO_LOCK
        );
        assert_eq!(
            manager.get_mapping_lock_owner(&map, &b).unwrap(),
            MappingLockToken::NO_LOCK
        );
        assert_eq!(manager.get_mapping_lock_owner(&map, &c).unwrap(), t2);

        assert_eq!(manager.force_unlock_all_mappings(&map).unwrap(), 1);
        assert!(
            manager
                .get_mapping_lock_owner(&map, &c)
                .unwrap()
                .is_no_lock()
        );
    }

    #[test]
    fn test_deleted_shard_map_seen_by_second_manager() {
        let Env {
            _dir,
            stores,
            manager,
        } = env();
        let map = manager
            .create_list_shard_map("customers", ShardKeyType::Int32)
            .unwrap();

        let other = ShardMapManager::open(
            Arc::clone(&stores) as Arc<dyn StoreConnectionFactory>,
            test_config(),
        )
        .unwrap();
        let seen = other.get_or_load_shard_map("customers").unwrap();
        assert!(other.cache().lookup_shard_map("customers").is_some());

        manager.delete_shard_map(&map).unwrap();

        let err = other
            .get_mapping_for_key(&seen, &ShardKey::from(1), LookupOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShardMapDoesNotExist);
        assert!(other.cache().lookup_shard_map("customers").is_none());

        let err = other.get_shard_map("customers").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShardMapLookupFailure);
    }

    #[test]
    fn test_global_store_version_gate() {
        let Env { _dir, manager, .. } = env_at(Some(BASE_VERSION));
        assert_eq!(manager.global_store_version().unwrap(), Some(BASE_VERSION));
        let map = manager
            .create_range_shard_map("orders", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, &location("shard0")).unwrap();
        let mapping = manager
            .create_range_mapping(&map, range(0, 10), &shard)
            .unwrap();

        let token = MappingLockToken::new();
        let err = manager.lock_mapping(&map, &mapping, token).unwrap_err();
        assert_eq!(err.code(), ErrorCode::GlobalStoreVersionMismatch);

        assert_eq!(
            manager.upgrade_global_store(Some(GLOBAL_LOCKING_VERSION)).unwrap(),
            GLOBAL_LOCKING_VERSION
        );
        manager.lock_mapping(&map, &mapping, token).unwrap();

        let err = manager
            .schema_info()
            .add("orders", &SchemaInfo::new())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::GlobalStoreVersionMismatch);
        assert_eq!(
            manager.upgrade_global_store(None).unwrap(),
            GLOBAL_STORE_VERSION
        );
        manager.schema_info().add("orders", &SchemaInfo::new()).unwrap();
    }

    #[test]
    fn test_transient_faults_apply_once() {
        let Env {
            _dir,
            stores,
            manager,
        } = env();
        let map = manager
            .create_list_shard_map("customers", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, &location("shard0")).unwrap();

        stores.inject(
            Target::Global,
            |r| matches!(r, StoreRequest::ApplyGlobal { .. }),
            FaultMode::Unavailable,
            1,
        );
        stores.inject(
            Target::Local(shard.location.clone()),
            |r| matches!(r, StoreRequest::ApplyLocal { .. }),
            FaultMode::LostAcknowledgement,
            1,
        );
        stores.inject(
            Target::Global,
            |r| matches!(r, StoreRequest::CompleteOperation { .. }),
            FaultMode::LostAcknowledgement,
            1,
        );
        manager
            .create_point_mapping(&map, &ShardKey::from(1), &shard)
            .unwrap();

        assert_eq!(manager.get_mappings(&map, None, None).unwrap().len(), 1);
        assert_eq!(
            manager.recover_pending_operations().unwrap(),
            RecoveryReport::default()
        );
        assert!(
            manager
                .detect_mapping_differences(&shard.location)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_retry_budget_exhaustion() {
        let Env {
            _dir,
            stores,
            manager,
        } = env();
        stores.inject(
            Target::Global,
            |r| matches!(r, StoreRequest::GetShardMaps),
            FaultMode::Unavailable,
            10,
        );
        let calls = stores.calls();
        let err = manager.get_shard_maps().unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreUnreachable);
        assert!(err.message().contains("gave up after 3 attempts"));
        assert_eq!(stores.calls(), calls + 3);
    }

    #[test]
    fn test_permanent_local_failure_undoes_global_change() {
        let Env {
            _dir,
            stores,
            manager,
        } = env();
        let map = manager
            .create_list_shard_map("customers", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, &location("shard0")).unwrap();

        stores.inject(
            Target::Local(shard.location.clone()),
            |r| matches!(r, StoreRequest::ApplyLocal { .. }),
            FaultMode::Broken,
            1,
        );
        let key = ShardKey::from(3);
        let err = manager
            .create_point_mapping(&map, &key, &shard)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageFailure);

        let err = manager
            .get_mapping_for_key(&map, &key, LookupOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MappingNotFoundForKey);
        assert_eq!(
            manager.recover_pending_operations().unwrap(),
            RecoveryReport::default()
        );

        // Nothing is left behind that blocks a second attempt
        manager.create_point_mapping(&map, &key, &shard).unwrap();
    }

    #[test]
    fn test_split_and_merge_preserve_coverage() {
        let Env { _dir, manager, .. } = env();
        let map = manager
            .create_range_shard_map("orders", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, &location("shard0")).unwrap();
        let whole = manager
            .create_range_mapping(&map, range(0, 100), &shard)
            .unwrap();

        let token = MappingLockToken::NO_LOCK;
        let (low, high) = manager
            .split_mapping(&map, &whole, &ShardKey::from(40), token)
            .unwrap();
        for (key, expected) in [(0, low.id), (39, low.id), (40, high.id), (99, high.id)] {
            let found = manager
                .get_mapping_for_key(&map, &ShardKey::from(key), LookupOptions::default())
                .unwrap();
            assert_eq!(found.id, expected);
        }
        assert_eq!(manager.get_mappings(&map, None, None).unwrap().len(), 2);
        let err = manager.get_mapping(&map, whole.id).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MappingDoesNotExist);

        let merged = manager.merge_mappings(&map, &high, &low, token).unwrap();
        assert_eq!(merged.range, range(0, 100));
        let all = manager.get_mappings(&map, None, None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, merged.id);
        assert!(
            manager
                .detect_mapping_differences(&shard.location)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_move_mapping_between_shards() {
        let Env { _dir, manager, .. } = env();
        let map = manager
            .create_range_shard_map("orders", ShardKeyType::Int32)
            .unwrap();
        let source = manager.create_shard(&map, &location("shard0")).unwrap();
        let target = manager.create_shard(&map, &location("shard1")).unwrap();
        let mapping = manager
            .create_range_mapping(&map, range(0, 10), &source)
            .unwrap();

        let token = MappingLockToken::NO_LOCK;
        let err = manager
            .update_mapping(&map, &mapping, &MappingUpdate::shard(target.clone()), token)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MappingIsNotOffline);

        let offline = manager.mark_mapping_offline(&map, &mapping, token).unwrap();
        let moved = manager
            .update_mapping(&map, &offline, &MappingUpdate::shard(target.clone()), token)
            .unwrap();
        assert_eq!(moved.shard.id, target.id);
        assert!(
            manager
                .get_mappings(&map, None, Some(&source))
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            manager.get_mappings(&map, None, Some(&target)).unwrap()[0].id,
            mapping.id
        );
        for location in [&source.location, &target.location] {
            assert!(
                manager
                    .detect_mapping_differences(location)
                    .unwrap()
                    .is_empty()
            );
        }
    }

    #[test]
    fn test_shard_and_shard_map_removal_rules() {
        let Env { _dir, manager, .. } = env();
        let map = manager
            .create_list_shard_map("customers", ShardKeyType::Guid)
            .unwrap();
        let location = location("shard0");
        let shard = manager.create_shard(&map, &location).unwrap();
        let err = manager.create_shard(&map, &location).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShardLocationAlreadyExists);

        let key = ShardKey::from(uuid::Uuid::new_v4());
        let mapping = manager.create_point_mapping(&map, &key, &shard).unwrap();

        let err = manager.delete_shard_map(&map).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShardMapHasShards);
        let err = manager.delete_shard(&map, &shard).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShardHasMappings);

        let offline = manager
            .mark_mapping_offline(&map, &mapping, MappingLockToken::NO_LOCK)
            .unwrap();
        manager
            .delete_mapping(&map, &offline, MappingLockToken::NO_LOCK)
            .unwrap();
        manager.delete_shard(&map, &shard).unwrap();
        let err = manager.get_shard(&map, &location).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShardDoesNotExist);

        manager.delete_shard_map(&map).unwrap();
        assert!(manager.get_shard_maps().unwrap().is_empty());
        let err = manager.create_range_mapping(&map, ShardRange::full(ShardKeyType::Guid), &shard);
        assert_eq!(err.unwrap_err().code(), ErrorCode::ShardMapKindMismatch);
    }

    #[test]
    fn test_schema_info_collection() {
        let Env { _dir, manager, .. } = env();
        let mut info = SchemaInfo::new();
        info.add_sharded_table(ShardedTableInfo::new("dbo", "orders", "customer_id").unwrap())
            .unwrap();
        let schemas = manager.schema_info();
        schemas.add("orders", &info).unwrap();
        let err = schemas.add("orders", &info).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaInfoNameConflict);
        assert_eq!(schemas.get("orders").unwrap(), info);

        info.add_reference_table(ReferenceTableInfo::new("dbo", "regions").unwrap())
            .unwrap();
        schemas.replace("orders", &info).unwrap();
        let listed = schemas.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1.reference_tables().len(), 1);

        schemas.remove("orders").unwrap();
        assert!(schemas.try_get("orders").unwrap().is_none());
        let err = schemas.get("orders").unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaInfoNameDoesNotExist);
    }

    #[test]
    fn test_create_modes_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Arc::new(FaultyStores::new(dir.path()));
        let err = ShardMapManager::open(
            Arc::clone(&stores) as Arc<dyn StoreConnectionFactory>,
            test_config(),
        )
        .err()
        .unwrap();
        assert_eq!(err.code(), ErrorCode::GlobalStoreNotDeployed);

        let manager = ShardMapManager::create(
            Arc::clone(&stores) as Arc<dyn StoreConnectionFactory>,
            test_config(),
            CreateMode::KeepExisting,
            None,
        )
        .unwrap();
        manager
            .create_list_shard_map("customers", ShardKeyType::Int32)
            .unwrap();

        let kept = ShardMapManager::create(
            Arc::clone(&stores) as Arc<dyn StoreConnectionFactory>,
            test_config(),
            CreateMode::KeepExisting,
            None,
        )
        .unwrap();
        assert_eq!(kept.get_shard_maps().unwrap().len(), 1);

        let replaced = ShardMapManager::create(
            Arc::clone(&stores) as Arc<dyn StoreConnectionFactory>,
            test_config(),
            CreateMode::ReplaceExisting,
            None,
        )
        .unwrap();
        assert!(replaced.get_shard_maps().unwrap().is_empty());
    }

    #[test]
    fn test_disabled_cache_caches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.cache.enabled = false;
        let manager = ShardMapManager::create(
            Arc::new(FaultyStores::new(dir.path())),
            config,
            CreateMode::KeepExisting,
            None,
        )
        .unwrap();
        let map = manager
            .create_list_shard_map("customers", ShardKeyType::Int32)
            .unwrap();
        manager.get_or_load_shard_map("customers").unwrap();
        assert!(manager.cache().lookup_shard_map("customers").is_none());
        assert_eq!(manager.cache().lookup_hit_count(), 0);
        assert_eq!(manager.get_or_load_shard_map("customers").unwrap(), map);
    }
}
