//! Shard map management
//!
//! [`ShardMapManager`] keeps shard maps, shards and key mappings in a
//! global store and mirrors each shard's mappings into that shard's local
//! store. Changes spanning several stores run as logged operations that
//! either complete everywhere or are undone; anything an interrupted run
//! leaves behind is resolved by recovery.

pub mod client;
pub mod executor;
pub mod manager;
pub mod operation;
pub mod recovery;
pub mod retry;
pub mod schema_info;
pub mod upgrade;

#[cfg(test)]
mod testing;

pub use client::StoreClient;
pub use manager::{CreateMode, LookupOptions, ShardMapManager, redb_stores};
pub use operation::MappingUpdate;
pub use recovery::{MappingDifferences, RecoveryReport};
pub use retry::RetryPolicy;
pub use schema_info::{ReferenceTableInfo, SchemaInfo, SchemaInfoCollection, ShardedTableInfo};
pub use upgrade::UpgradeCoordinator;
