//! Store connection boundary.
//!
//! The engine only talks to stores through [`StoreConnection`]; the
//! [`StoreConnectionFactory`] hands out the global connection and one
//! connection per shard location.

use crate::error::StoreResult;
use crate::request::{StoreRequest, StoreResponse};
use crate::schema::StoreKind;
use crate::store::RedbStore;
use parking_lot::Mutex;
use shardmap_common::ShardLocation;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// A transactional request channel to one store
pub trait StoreConnection: Send + Sync {
    /// Execute requests in order inside one transaction
    ///
    /// Returns the responses up to and including the first failed one. A
    /// failed response means the transaction was rolled back; otherwise it
    /// committed. `Err` means the transaction's outcome is not committed.
    fn execute_in_transaction(&self, requests: &[StoreRequest]) -> StoreResult<Vec<StoreResponse>>;
}

/// Hands out store connections
pub trait StoreConnectionFactory: Send + Sync {
    /// Connection to the global store
    fn global(&self) -> StoreResult<Arc<dyn StoreConnection>>;

    /// Connection to the local store at a shard location
    fn local(&self, location: &ShardLocation) -> StoreResult<Arc<dyn StoreConnection>>;
}

/// Factory for redb-backed stores under one root directory
///
/// The global store lives in `global.redb`; each shard location gets its
/// own file under `shards/`. A redb file can only be opened once per
/// process, so opened stores are shared and a factory should be shared by
/// every manager of the process.
pub struct RedbStoreFactory {
    root: PathBuf,
    command_timeout: Duration,
    stores: Mutex<HashMap<PathBuf, Arc<RedbStore>>>,
}

impl RedbStoreFactory {
    pub fn new(root: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            command_timeout,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory of all store files
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing the local store of a location
    #[must_use]
    pub fn local_path(&self, location: &ShardLocation) -> PathBuf {
        self.root
            .join("shards")
            .join(format!("{}.redb", hex::encode(location.normalized())))
    }

    fn open(&self, path: PathBuf, kind: StoreKind) -> StoreResult<Arc<RedbStore>> {
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(&path) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(RedbStore::open(&path, kind, self.command_timeout)?);
        stores.insert(path, Arc::clone(&store));
        Ok(store)
    }
}

impl StoreConnectionFactory for RedbStoreFactory {
    fn global(&self) -> StoreResult<Arc<dyn StoreConnection>> {
        let store = self.open(self.root.join("global.redb"), StoreKind::Global)?;
        Ok(store)
    }

    fn local(&self, location: &ShardLocation) -> StoreResult<Arc<dyn StoreConnection>> {
        let store = self.open(self.local_path(location), StoreKind::Local)?;
        Ok(store)
    }
}
