//! Test doubles: a fault-injecting store factory, a counting cache and a
//! fixture for interrupted operations

use crate::client::StoreClient;
use crate::executor::{OperationExecutor, local_min_version};
use crate::operation::{Mutation, OperationFactory};
use crate::recovery::RecoveryManager;
use crate::retry::RetryPolicy;
use crate::upgrade::UpgradeCoordinator;
use parking_lot::Mutex;
use shardmap_cache::MappingCache;
use shardmap_common::config::RetryConfig;
use shardmap_common::{
    Mapping, MappingStatus, Shard, ShardKey, ShardKeyType, ShardLocation, ShardMap, ShardMapKind,
};
use shardmap_store::schema::{BASE_VERSION, LOCAL_MAPPINGS_VERSION};
use shardmap_store::{
    BuiltinScripts, OperationRecord, OperationState, RedbStoreFactory, StoreConnection,
    StoreConnectionFactory, StoreError, StoreRequest, StoreResponse, StoreResult,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Retry policy with millisecond backoff
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::from_config(&RetryConfig {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 2,
        max_elapsed_ms: 5_000,
    })
}

/// Client over fault-injecting stores rooted at `root`
pub fn faulty_client(root: &Path) -> (Arc<FaultyStores>, StoreClient) {
    let stores = Arc::new(FaultyStores::new(root));
    let client = StoreClient::new(stores.clone(), fast_retry());
    (stores, client)
}

/// Which store a fault applies to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Global,
    Local(ShardLocation),
}

/// How an injected fault behaves
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultMode {
    /// Fail transiently without running the transaction
    Unavailable,
    /// Run and commit the transaction, then report a transient failure
    LostAcknowledgement,
    /// Fail with a non-transient infrastructure error
    Broken,
}

struct Fault {
    target: Target,
    matches: fn(&StoreRequest) -> bool,
    mode: FaultMode,
    remaining: u32,
}

/// Store factory whose connections fail on demand
pub struct FaultyStores {
    inner: RedbStoreFactory,
    faults: Arc<Mutex<Vec<Fault>>>,
    calls: Arc<AtomicU64>,
}

impl FaultyStores {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: RedbStoreFactory::new(root, Duration::from_secs(30)),
            faults: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Fail the next `times` transactions on `target` containing a matching request
    pub fn inject(
        &self,
        target: Target,
        matches: fn(&StoreRequest) -> bool,
        mode: FaultMode,
        times: u32,
    ) {
        self.faults.lock().push(Fault {
            target,
            matches,
            mode,
            remaining: times,
        });
    }

    /// Transactions started through this factory
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn wrap(&self, target: Target, inner: Arc<dyn StoreConnection>) -> Arc<dyn StoreConnection> {
        Arc::new(FaultyConnection {
            target,
            inner,
            faults: Arc::clone(&self.faults),
            calls: Arc::clone(&self.calls),
        })
    }
}

impl StoreConnectionFactory for FaultyStores {
    fn global(&self) -> StoreResult<Arc<dyn StoreConnection>> {
        Ok(self.wrap(Target::Global, self.inner.global()?))
    }

    fn local(&self, location: &ShardLocation) -> StoreResult<Arc<dyn StoreConnection>> {
        Ok(self.wrap(
            Target::Local(location.clone()),
            self.inner.local(location)?,
        ))
    }
}

struct FaultyConnection {
    target: Target,
    inner: Arc<dyn StoreConnection>,
    faults: Arc<Mutex<Vec<Fault>>>,
    calls: Arc<AtomicU64>,
}

impl FaultyConnection {
    fn take_fault(&self, requests: &[StoreRequest]) -> Option<FaultMode> {
        let mut faults = self.faults.lock();
        let fault = faults.iter_mut().find(|f| {
            f.remaining > 0 && f.target == self.target && requests.iter().any(|r| (f.matches)(r))
        })?;
        fault.remaining -= 1;
        Some(fault.mode)
    }
}

impl StoreConnection for FaultyConnection {
    fn execute_in_transaction(&self, requests: &[StoreRequest]) -> StoreResult<Vec<StoreResponse>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.take_fault(requests) {
            None => self.inner.execute_in_transaction(requests),
            Some(FaultMode::Unavailable) => Err(StoreError::Unavailable("injected fault".into())),
            Some(FaultMode::LostAcknowledgement) => {
                self.inner.execute_in_transaction(requests)?;
                Err(StoreError::Unavailable("injected lost acknowledgement".into()))
            }
            Some(FaultMode::Broken) => Err(StoreError::Io(std::io::Error::other("injected failure"))),
        }
    }
}

/// Cache decorator counting lookups and invalidations
pub struct CountingCache {
    inner: Arc<dyn MappingCache>,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub invalidations: AtomicU64,
}

impl CountingCache {
    pub fn new(inner: Arc<dyn MappingCache>) -> Self {
        Self {
            inner,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    fn count<T>(&self, found: Option<T>) -> Option<T> {
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    fn invalidated(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}

impl MappingCache for CountingCache {
    fn lookup_shard_map(&self, name: &str) -> Option<ShardMap> {
        self.count(self.inner.lookup_shard_map(name))
    }

    fn add_shard_map(&self, map: &ShardMap) {
        self.inner.add_shard_map(map);
    }

    fn lookup_mapping(&self, map: &ShardMap, key: &ShardKey) -> Option<Mapping> {
        self.count(self.inner.lookup_mapping(map, key))
    }

    fn add_or_update_mapping(&self, map: &ShardMap, mapping: &Mapping) {
        self.inner.add_or_update_mapping(map, mapping);
    }

    fn invalidate_mapping(&self, map: &ShardMap, mapping: &Mapping) {
        self.invalidated();
        self.inner.invalidate_mapping(map, mapping);
    }

    fn invalidate_shard_map(&self, map: &ShardMap) {
        self.invalidated();
        self.inner.invalidate_shard_map(map);
    }

    fn invalidate_shard_map_mappings(&self, map: &ShardMap) {
        self.invalidated();
        self.inner.invalidate_shard_map_mappings(map);
    }

    fn clear(&self) {
        self.inner.clear();
    }

    fn lookup_hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    fn lookup_miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn eviction_count(&self) -> u64 {
        self.inner.eviction_count()
    }
}

/// A list shard map with one deployed shard, for running operations by hand
pub struct OperationFixture {
    _dir: tempfile::TempDir,
    pub stores: Arc<FaultyStores>,
    pub client: StoreClient,
    pub map: ShardMap,
    pub shard: Shard,
}

impl OperationFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (stores, client) = faulty_client(dir.path());
        let map = ShardMap::new("customers", ShardMapKind::List, ShardKeyType::Int32).unwrap();
        let shard = Shard::new(map.id, ShardLocation::new("srv", "shard0").unwrap());
        {
            let upgrades = UpgradeCoordinator::new(&client, &BuiltinScripts);
            upgrades.upgrade_global(None).unwrap();
            upgrades.ensure_local_deployed(&shard.location).unwrap();
            client
                .global(
                    "add shard map",
                    BASE_VERSION,
                    StoreRequest::AddShardMap { map: map.clone() },
                )
                .unwrap();
            OperationExecutor::new(&client)
                .execute(OperationFactory::create(
                    &map,
                    Mutation::AddShard {
                        shard: shard.clone(),
                    },
                ))
                .unwrap();
        }
        Self {
            _dir: dir,
            stores,
            client,
            map,
            shard,
        }
    }

    pub fn add_point(&self, key: i32) -> OperationRecord {
        let mapping =
            Mapping::point(&self.shard, &ShardKey::from(key), MappingStatus::Online).unwrap();
        OperationFactory::create(&self.map, Mutation::AddMapping { mapping })
    }

    /// Run an operation up to `state` and stop as if the process died
    ///
    /// Returns the record as it is now logged.
    pub fn crash_at(&self, record: OperationRecord, state: OperationState) -> OperationRecord {
        let logged = self
            .client
            .global("log", BASE_VERSION, StoreRequest::LogOperation { record })
            .unwrap()
            .into_operations()
            .remove(0);
        if state == OperationState::LoggedGlobal {
            return logged;
        }
        self.client
            .global(
                "apply",
                BASE_VERSION,
                StoreRequest::ApplyGlobal {
                    record: logged.clone(),
                },
            )
            .unwrap();
        if let OperationState::AppliedLocal(applied) = state {
            for step in logged.local_steps.iter().take(usize::try_from(applied).unwrap()) {
                self.client
                    .local(
                        "apply local",
                        &step.location,
                        local_min_version(&step.apply),
                        StoreRequest::ApplyLocal {
                            change: step.apply.clone(),
                        },
                    )
                    .unwrap();
            }
        }
        if state != OperationState::AppliedGlobal {
            self.client
                .global(
                    "set state",
                    BASE_VERSION,
                    StoreRequest::SetOperationState {
                        id: logged.id,
                        state,
                    },
                )
                .unwrap();
        }
        self.logged()
            .into_iter()
            .find(|r| r.id == logged.id)
            .unwrap()
    }

    pub fn lookup(&self, key: i32) -> Vec<Mapping> {
        self.client
            .global(
                "find",
                BASE_VERSION,
                StoreRequest::FindMappingByKey {
                    map: self.map.id,
                    key: ShardKey::from(key),
                },
            )
            .unwrap()
            .into_mappings()
    }

    /// Local mirror of the shard's mappings
    pub fn local_mappings(&self) -> Vec<Mapping> {
        self.client
            .local(
                "local mappings",
                &self.shard.location,
                LOCAL_MAPPINGS_VERSION,
                StoreRequest::GetLocalMappings {
                    map: self.map.id,
                    shard: self.shard.id,
                },
            )
            .unwrap()
            .into_mappings()
    }

    pub fn logged(&self) -> Vec<OperationRecord> {
        self.client
            .global("list", BASE_VERSION, StoreRequest::GetOperations)
            .unwrap()
            .into_operations()
    }

    pub fn pending(&self) -> usize {
        self.logged().len()
    }

    pub fn recovery(&self) -> RecoveryManager<'_> {
        RecoveryManager::new(&self.client, Duration::ZERO)
    }
}
