//! Shard map store backed by redb.
//!
//! Every batch of requests runs in one redb write transaction. Requests
//! execute in order; the first failed response aborts the transaction and
//! ends the batch, otherwise the transaction commits. A batch that outlives
//! the command timeout is aborted before commit.

use crate::connection::StoreConnection;
use crate::error::{StoreError, StoreResult};
use crate::request::{StoreRequest, StoreResponse, StoreRows};
use crate::schema::StoreKind;
use crate::tables;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use shardmap_common::{ErrorCode, StoreVersion};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Global or local store persisted in a single redb file.
pub struct RedbStore {
    db: Database,
    kind: StoreKind,
    path: PathBuf,
    command_timeout: Duration,
}

impl RedbStore {
    /// Open (or create) the redb database at the given path.
    ///
    /// Tables are not created here; deployment creates them.
    pub fn open(
        path: impl AsRef<Path>,
        kind: StoreKind,
        command_timeout: Duration,
    ) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        debug!(path = %path.display(), ?kind, "opened store");
        Ok(Self {
            db,
            kind,
            path: path.to_path_buf(),
            command_timeout,
        })
    }

    /// Tier of this store
    #[must_use]
    pub const fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Location of the database file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StoreConnection for RedbStore {
    fn execute_in_transaction(&self, requests: &[StoreRequest]) -> StoreResult<Vec<StoreResponse>> {
        let started = Instant::now();
        let write_txn = self.db.begin_write()?;
        let mut responses = Vec::with_capacity(requests.len());
        let mut failed = false;
        {
            let txn = Txn {
                txn: &write_txn,
                kind: self.kind,
            };
            for request in requests {
                let response = txn.execute(request)?;
                failed = !response.is_success();
                if failed {
                    debug!(
                        code = ?response.code,
                        message = %response.message,
                        "request failed, aborting transaction"
                    );
                }
                responses.push(response);
                if failed {
                    break;
                }
            }
        }
        if failed {
            write_txn.abort()?;
            return Ok(responses);
        }

        let elapsed = started.elapsed();
        if elapsed > self.command_timeout {
            warn!(
                path = %self.path.display(),
                elapsed_ms = elapsed.as_millis(),
                "transaction exceeded command timeout, aborting"
            );
            write_txn.abort()?;
            return Err(StoreError::Timeout {
                elapsed,
                limit: self.command_timeout,
            });
        }
        write_txn.commit()?;
        Ok(responses)
    }
}

/// Request execution context inside one write transaction
pub(crate) struct Txn<'a> {
    pub(crate) txn: &'a WriteTransaction,
    pub(crate) kind: StoreKind,
}

impl Txn<'_> {
    fn execute(&self, request: &StoreRequest) -> StoreResult<StoreResponse> {
        match request {
            StoreRequest::CheckVersion { min } => self.check_version(*min),
            StoreRequest::GetVersion => Ok(StoreResponse::rows(StoreRows::Version(
                self.version()?,
            ))),
            StoreRequest::Upgrade { from, to, actions } => self.upgrade(*from, *to, actions),
            StoreRequest::Reset { actions } => self.reset(actions),
            _ => match self.kind {
                StoreKind::Global => self.execute_global(request),
                StoreKind::Local => self.execute_local(request),
            },
        }
    }

    // ---- Versioning ----

    /// Deployed schema version, `None` when not deployed
    pub(crate) fn version(&self) -> StoreResult<Option<StoreVersion>> {
        self.get(tables::STORE_VERSION, tables::VERSION_KEY)
    }

    fn version_codes(&self) -> (ErrorCode, ErrorCode) {
        match self.kind {
            StoreKind::Global => (
                ErrorCode::GlobalStoreNotDeployed,
                ErrorCode::GlobalStoreVersionMismatch,
            ),
            StoreKind::Local => (
                ErrorCode::LocalStoreNotDeployed,
                ErrorCode::LocalStoreVersionMismatch,
            ),
        }
    }

    fn tier(&self) -> &'static str {
        match self.kind {
            StoreKind::Global => "global",
            StoreKind::Local => "local",
        }
    }

    fn check_version(&self, min: StoreVersion) -> StoreResult<StoreResponse> {
        let (not_deployed, mismatch) = self.version_codes();
        let library = self.kind.library_version();
        let Some(deployed) = self.version()? else {
            return Ok(StoreResponse::failure(
                not_deployed,
                format!("{} store is not deployed", self.tier()),
            ));
        };
        if deployed.major != library.major {
            return Ok(StoreResponse::failure(
                mismatch,
                format!(
                    "{} store version {deployed} is incompatible with library version {library}",
                    self.tier()
                ),
            ));
        }
        if deployed < min {
            return Ok(StoreResponse::failure(
                mismatch,
                format!(
                    "{} store version {deployed} is below the required {min}; upgrade the store",
                    self.tier()
                ),
            ));
        }
        Ok(StoreResponse::rows(StoreRows::Version(Some(deployed))))
    }

    fn upgrade(
        &self,
        from: Option<StoreVersion>,
        to: StoreVersion,
        actions: &[crate::schema::SchemaAction],
    ) -> StoreResult<StoreResponse> {
        let current = self.version()?;
        if let Some(current) = current
            && current >= to
        {
            return Ok(StoreResponse::affected(0));
        }
        if current != from {
            let (not_deployed, mismatch) = self.version_codes();
            let code = if current.is_none() {
                not_deployed
            } else {
                mismatch
            };
            return Ok(StoreResponse::failure(
                code,
                format!(
                    "{} store is at {}, step {} -> {to} does not apply",
                    self.tier(),
                    current.map_or_else(|| "undeployed".to_string(), |v| v.to_string()),
                    from.map_or_else(|| "undeployed".to_string(), |v| v.to_string()),
                ),
            ));
        }
        for action in actions {
            action.apply(self.txn)?;
        }
        self.put(tables::STORE_VERSION, tables::VERSION_KEY, &to)?;
        Ok(StoreResponse::affected(1))
    }

    fn reset(&self, actions: &[crate::schema::SchemaAction]) -> StoreResult<StoreResponse> {
        for action in actions {
            action.apply(self.txn)?;
        }
        Ok(StoreResponse::affected(1))
    }

    pub(crate) fn unsupported(&self, request: &StoreRequest) -> StoreResponse {
        StoreResponse::failure(
            ErrorCode::IllegalState,
            format!("{} store cannot execute {request:?}", self.tier()),
        )
    }

    // ---- Generic helpers ----

    pub(crate) fn get<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StoreResult<Option<T>> {
        let table = self.txn.open_table(table_def)?;
        let value = match table.get(key)? {
            Some(val) => Some(bincode::deserialize(val.value())?),
            None => None,
        };
        Ok(value)
    }

    pub(crate) fn put<T: Serialize>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StoreResult<()> {
        let bytes = bincode::serialize(value)?;
        let mut table = self.txn.open_table(table_def)?;
        table.insert(key, bytes.as_slice())?;
        Ok(())
    }

    pub(crate) fn remove(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StoreResult<bool> {
        let mut table = self.txn.open_table(table_def)?;
        let existed = table.remove(key)?.is_some();
        Ok(existed)
    }

    /// Decode every row whose key starts with `prefix`
    pub(crate) fn scan<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StoreResult<Vec<(String, T)>> {
        let table = self.txn.open_table(table_def)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value();
            if key.starts_with(prefix) {
                result.push((key.to_string(), bincode::deserialize(entry.1.value())?));
            }
        }
        Ok(result)
    }
}

/// Current time as unix milliseconds
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
