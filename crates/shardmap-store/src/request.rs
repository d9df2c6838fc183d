//! Requests executed by a store connection and their responses.

use crate::schema::SchemaAction;
use crate::types::{LocalChange, OperationRecord, OperationState};
use shardmap_common::{
    Error, ErrorCode, Mapping, MappingId, MappingLockToken, OperationId, Result, Shard, ShardId,
    ShardKey, ShardLocation, ShardMap, ShardMapId, ShardRange, StoreVersion,
};

/// Which mappings a lock request touches
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockScope {
    /// Lock one mapping for the token
    Lock(MappingId),
    /// Unlock one mapping owned by the token
    Unlock(MappingId),
    /// Unlock every mapping of the map owned by the token
    UnlockAllOwnedBy,
    /// Unlock every mapping of the map regardless of owner
    ForceUnlockAll,
}

/// One request inside a store transaction
#[derive(Clone, Debug)]
pub enum StoreRequest {
    // ---- Versioning ----
    /// Fail unless the deployed major matches the library and the deployed
    /// version is at least `min`
    CheckVersion {
        min: StoreVersion,
    },
    GetVersion,
    /// Apply a schema step if the store is exactly at `from`
    Upgrade {
        from: Option<StoreVersion>,
        to: StoreVersion,
        actions: Vec<SchemaAction>,
    },
    /// Drop the schema entirely
    Reset {
        actions: Vec<SchemaAction>,
    },

    // ---- Shard maps ----
    GetShardMaps,
    FindShardMapByName {
        name: String,
    },
    FindShardMapById {
        id: ShardMapId,
    },
    AddShardMap {
        map: ShardMap,
    },
    RemoveShardMap {
        map: ShardMap,
    },

    // ---- Shards ----
    GetShards {
        map: ShardMapId,
    },
    FindShardByLocation {
        map: ShardMapId,
        location: ShardLocation,
    },

    // ---- Mappings ----
    GetMappings {
        map: ShardMapId,
        range: Option<ShardRange>,
        shard: Option<ShardId>,
    },
    FindMappingByKey {
        map: ShardMapId,
        key: ShardKey,
    },
    FindMappingById {
        map: ShardMapId,
        id: MappingId,
    },
    LockMappings {
        map: ShardMapId,
        scope: LockScope,
        token: MappingLockToken,
    },

    // ---- Operation log ----
    GetOperations,
    LogOperation {
        record: OperationRecord,
    },
    ApplyGlobal {
        record: OperationRecord,
    },
    SetOperationState {
        id: OperationId,
        state: OperationState,
    },
    CompleteOperation {
        record: OperationRecord,
    },
    UndoGlobal {
        record: OperationRecord,
    },
    RemoveOperation {
        id: OperationId,
    },

    // ---- Schema info ----
    GetSchemaInfos,
    FindSchemaInfo {
        name: String,
    },
    AddSchemaInfo {
        name: String,
        xml: String,
    },
    ReplaceSchemaInfo {
        name: String,
        xml: String,
    },
    RemoveSchemaInfo {
        name: String,
    },

    // ---- Local store ----
    ApplyLocal {
        change: LocalChange,
    },
    IsLocalApplied {
        change: LocalChange,
    },
    GetLocalShards,
    GetLocalMappings {
        map: ShardMapId,
        shard: ShardId,
    },
    /// Replace the local mirror of a shard's mappings wholesale
    RebuildLocalMappings {
        shard_map: ShardMap,
        shard: Shard,
        mappings: Vec<Mapping>,
    },
}

/// Outcome code of one request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreResultCode {
    Success,
    Failure(ErrorCode),
}

/// Typed rows returned by a request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StoreRows {
    #[default]
    None,
    Version(Option<StoreVersion>),
    ShardMaps(Vec<ShardMap>),
    Shards(Vec<Shard>),
    Mappings(Vec<Mapping>),
    Operations(Vec<OperationRecord>),
    SchemaInfos(Vec<(String, String)>),
    Applied(bool),
}

/// Result of one request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreResponse {
    pub code: StoreResultCode,
    pub rows: StoreRows,
    pub affected: u64,
    pub message: String,
    /// A returned row is held by an operation that has not completed
    pub in_flight: bool,
}

impl StoreResponse {
    /// Successful response carrying rows
    #[must_use]
    pub fn rows(rows: StoreRows) -> Self {
        Self {
            code: StoreResultCode::Success,
            rows,
            affected: 0,
            message: String::new(),
            in_flight: false,
        }
    }

    /// Successful response reporting affected rows
    #[must_use]
    pub fn affected(affected: u64) -> Self {
        Self {
            code: StoreResultCode::Success,
            rows: StoreRows::None,
            affected,
            message: String::new(),
            in_flight: false,
        }
    }

    /// Failed response; aborts the enclosing transaction
    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: StoreResultCode::Failure(code),
            rows: StoreRows::None,
            affected: 0,
            message: message.into(),
            in_flight: false,
        }
    }

    #[must_use]
    pub fn with_in_flight(mut self, in_flight: bool) -> Self {
        self.in_flight = in_flight;
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == StoreResultCode::Success
    }

    /// Convert a failed response into a categorized error
    pub fn into_result(self) -> Result<Self> {
        match self.code {
            StoreResultCode::Success => Ok(self),
            StoreResultCode::Failure(code) => Err(Error::new(code, self.message)),
        }
    }

    pub fn into_shard_maps(self) -> Vec<ShardMap> {
        match self.rows {
            StoreRows::ShardMaps(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn into_shards(self) -> Vec<Shard> {
        match self.rows {
            StoreRows::Shards(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn into_mappings(self) -> Vec<Mapping> {
        match self.rows {
            StoreRows::Mappings(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn into_operations(self) -> Vec<OperationRecord> {
        match self.rows {
            StoreRows::Operations(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn into_schema_infos(self) -> Vec<(String, String)> {
        match self.rows {
            StoreRows::SchemaInfos(rows) => rows,
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub const fn version(&self) -> Option<StoreVersion> {
        match self.rows {
            StoreRows::Version(version) => version,
            _ => None,
        }
    }

    #[must_use]
    pub const fn applied(&self) -> bool {
        matches!(self.rows, StoreRows::Applied(true))
    }
}
