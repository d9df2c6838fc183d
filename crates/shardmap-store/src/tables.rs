//! Redb table definitions for the global and local stores.

use redb::TableDefinition;

// Shared
// Key: "version", Value: bincode-encoded StoreVersion
pub const STORE_VERSION: TableDefinition<&str, &[u8]> = TableDefinition::new("store_version");

// Global store 1.0
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
pub const SHARD_MAPS: TableDefinition<&str, &[u8]> = TableDefinition::new("shard_maps");
// Key: "map_id/shard_id", Value: bincode-encoded StoredShard
pub const SHARDS: TableDefinition<&str, &[u8]> = TableDefinition::new("shards");
// Key: "map_id/mapping_id", Value: bincode-encoded StoredMapping
pub const MAPPINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("mappings");
// Key: operation id, Value: bincode-encoded OperationRecord
pub const OPERATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("operations");

// Global store 1.1
// Key: "map_id/mapping_id", Value: lock owner token
pub const MAPPING_LOCKS: TableDefinition<&str, u128> = TableDefinition::new("mapping_locks");

// Global store 1.2
// Key: schema info name, Value: XML document
pub const SCHEMA_INFO: TableDefinition<&str, &str> = TableDefinition::new("schema_info");

// Local store 1.0
pub const LOCAL_SHARD_MAPS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("local_shard_maps");
// Key: "map_id/shard_id"
pub const LOCAL_SHARDS: TableDefinition<&str, &[u8]> = TableDefinition::new("local_shards");

// Local store 1.1
// Key: "map_id/mapping_id"
pub const LOCAL_MAPPINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("local_mappings");

/// Operation sequence counter key in [`COUNTERS`]
pub const OPERATION_SEQUENCE: &str = "operation_sequence";

/// Version key in [`STORE_VERSION`]
pub const VERSION_KEY: &str = "version";

/// Composite key of a row owned by a shard map
pub fn child_key(parent: impl std::fmt::Display, child: impl std::fmt::Display) -> String {
    format!("{parent}/{child}")
}

/// Prefix matching every row owned by a shard map
pub fn child_prefix(parent: impl std::fmt::Display) -> String {
    format!("{parent}/")
}
