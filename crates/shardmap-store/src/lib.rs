//! Shard map store - transactional persistence boundary
//!
//! This crate defines the request/response interface the engine uses to
//! reach the global store and the per-shard local stores, and ships a
//! redb-backed implementation of it.

pub mod connection;
pub mod error;
mod global;
mod local;
pub mod request;
pub mod schema;
pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use connection::{RedbStoreFactory, StoreConnection, StoreConnectionFactory};
pub use error::{StoreError, StoreResult};
pub use request::{LockScope, StoreRequest, StoreResponse, StoreResultCode, StoreRows};
pub use schema::{BuiltinScripts, SchemaAction, ScriptProvider, StoreKind, TableId, UpgradeStep};
pub use store::RedbStore;
pub use types::{
    GlobalChange, LocalChange, LocalStep, OperationKind, OperationRecord, OperationState,
    PendingMarker,
};
