//! Shard map common types
//!
//! Error definitions, configuration, the typed shard key codec and the
//! records shared by the store, the cache and the manager.

pub mod config;
pub mod error;
pub mod key;
pub mod range;
pub mod types;

pub use config::ShardMapConfig;
pub use error::{Error, ErrorCategory, ErrorCode, Result};
pub use key::{MAX_BINARY_KEY_SIZE, ShardKey, ShardKeyType, ShardKeyValue};
pub use range::ShardRange;
pub use types::*;
