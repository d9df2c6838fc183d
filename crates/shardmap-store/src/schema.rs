//! Store schema versions and the deployment/upgrade steps that reach them.
//!
//! The store applies a step's actions without interpreting their purpose;
//! which tables exist at which version is decided by the [`ScriptProvider`].

use crate::tables;
use redb::WriteTransaction;
use serde::{Deserialize, Serialize};
use shardmap_common::StoreVersion;

/// Global store schema version this library is built against
pub const GLOBAL_STORE_VERSION: StoreVersion = StoreVersion::new(1, 2);

/// Local store schema version this library is built against
pub const LOCAL_STORE_VERSION: StoreVersion = StoreVersion::new(1, 1);

/// Global store version that introduced mapping lock owners
pub const GLOBAL_LOCKING_VERSION: StoreVersion = StoreVersion::new(1, 1);

/// Global store version that introduced schema info
pub const GLOBAL_SCHEMA_INFO_VERSION: StoreVersion = StoreVersion::new(1, 2);

/// Local store version that introduced the mapping mirror
pub const LOCAL_MAPPINGS_VERSION: StoreVersion = StoreVersion::new(1, 1);

/// Minimum deployed version for ordinary operations
pub const BASE_VERSION: StoreVersion = StoreVersion::new(1, 0);

/// Which tier a store belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKind {
    Global,
    Local,
}

impl StoreKind {
    /// Schema version this library expects for the tier
    #[must_use]
    pub const fn library_version(self) -> StoreVersion {
        match self {
            Self::Global => GLOBAL_STORE_VERSION,
            Self::Local => LOCAL_STORE_VERSION,
        }
    }
}

/// Table created by a schema action
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableId {
    StoreVersion,
    Counters,
    ShardMaps,
    Shards,
    Mappings,
    Operations,
    MappingLocks,
    SchemaInfo,
    LocalShardMaps,
    LocalShards,
    LocalMappings,
}

/// Opaque schema change applied inside a store transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaAction {
    CreateTable(TableId),
    DropTable(TableId),
}

impl SchemaAction {
    pub(crate) fn apply(self, txn: &WriteTransaction) -> Result<(), redb::TableError> {
        match self {
            Self::CreateTable(table) => create_table(txn, table),
            Self::DropTable(table) => drop_table(txn, table),
        }
    }
}

fn create_table(txn: &WriteTransaction, table: TableId) -> Result<(), redb::TableError> {
    match table {
        TableId::StoreVersion => txn.open_table(tables::STORE_VERSION).map(drop),
        TableId::Counters => txn.open_table(tables::COUNTERS).map(drop),
        TableId::ShardMaps => txn.open_table(tables::SHARD_MAPS).map(drop),
        TableId::Shards => txn.open_table(tables::SHARDS).map(drop),
        TableId::Mappings => txn.open_table(tables::MAPPINGS).map(drop),
        TableId::Operations => txn.open_table(tables::OPERATIONS).map(drop),
        TableId::MappingLocks => txn.open_table(tables::MAPPING_LOCKS).map(drop),
        TableId::SchemaInfo => txn.open_table(tables::SCHEMA_INFO).map(drop),
        TableId::LocalShardMaps => txn.open_table(tables::LOCAL_SHARD_MAPS).map(drop),
        TableId::LocalShards => txn.open_table(tables::LOCAL_SHARDS).map(drop),
        TableId::LocalMappings => txn.open_table(tables::LOCAL_MAPPINGS).map(drop),
    }
}

fn drop_table(txn: &WriteTransaction, table: TableId) -> Result<(), redb::TableError> {
    match table {
        TableId::StoreVersion => txn.delete_table(tables::STORE_VERSION).map(drop),
        TableId::Counters => txn.delete_table(tables::COUNTERS).map(drop),
        TableId::ShardMaps => txn.delete_table(tables::SHARD_MAPS).map(drop),
        TableId::Shards => txn.delete_table(tables::SHARDS).map(drop),
        TableId::Mappings => txn.delete_table(tables::MAPPINGS).map(drop),
        TableId::Operations => txn.delete_table(tables::OPERATIONS).map(drop),
        TableId::MappingLocks => txn.delete_table(tables::MAPPING_LOCKS).map(drop),
        TableId::SchemaInfo => txn.delete_table(tables::SCHEMA_INFO).map(drop),
        TableId::LocalShardMaps => txn.delete_table(tables::LOCAL_SHARD_MAPS).map(drop),
        TableId::LocalShards => txn.delete_table(tables::LOCAL_SHARDS).map(drop),
        TableId::LocalMappings => txn.delete_table(tables::LOCAL_MAPPINGS).map(drop),
    }
}

/// One deployment or upgrade step
///
/// `from: None` deploys an empty store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeStep {
    pub from: Option<StoreVersion>,
    pub to: StoreVersion,
    pub actions: Vec<SchemaAction>,
}

/// Supplies the ordered schema steps for both store tiers
pub trait ScriptProvider: Send + Sync {
    /// Ordered global store steps, starting with deployment
    fn global_steps(&self) -> Vec<UpgradeStep>;

    /// Ordered local store steps, starting with deployment
    fn local_steps(&self) -> Vec<UpgradeStep>;

    /// Actions removing every table of a tier
    fn drop_actions(&self, kind: StoreKind) -> Vec<SchemaAction> {
        let steps = match kind {
            StoreKind::Global => self.global_steps(),
            StoreKind::Local => self.local_steps(),
        };
        steps
            .iter()
            .flat_map(|step| step.actions.iter())
            .filter_map(|action| match action {
                SchemaAction::CreateTable(table) => Some(SchemaAction::DropTable(*table)),
                SchemaAction::DropTable(_) => None,
            })
            .collect()
    }
}

/// Schema history shipped with this library
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinScripts;

impl ScriptProvider for BuiltinScripts {
    fn global_steps(&self) -> Vec<UpgradeStep> {
        use SchemaAction::CreateTable;
        vec![
            UpgradeStep {
                from: None,
                to: BASE_VERSION,
                actions: vec![
                    CreateTable(TableId::StoreVersion),
                    CreateTable(TableId::Counters),
                    CreateTable(TableId::ShardMaps),
                    CreateTable(TableId::Shards),
                    CreateTable(TableId::Mappings),
                    CreateTable(TableId::Operations),
                ],
            },
            UpgradeStep {
                from: Some(BASE_VERSION),
                to: GLOBAL_LOCKING_VERSION,
                actions: vec![CreateTable(TableId::MappingLocks)],
            },
            UpgradeStep {
                from: Some(GLOBAL_LOCKING_VERSION),
                to: GLOBAL_SCHEMA_INFO_VERSION,
                actions: vec![CreateTable(TableId::SchemaInfo)],
            },
        ]
    }

    fn local_steps(&self) -> Vec<UpgradeStep> {
        use SchemaAction::CreateTable;
        vec![
            UpgradeStep {
                from: None,
                to: BASE_VERSION,
                actions: vec![
                    CreateTable(TableId::StoreVersion),
                    CreateTable(TableId::LocalShardMaps),
                    CreateTable(TableId::LocalShards),
                ],
            },
            UpgradeStep {
                from: Some(BASE_VERSION),
                to: LOCAL_MAPPINGS_VERSION,
                actions: vec![CreateTable(TableId::LocalMappings)],
            },
        ]
    }
}
