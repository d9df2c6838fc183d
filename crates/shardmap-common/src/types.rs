//! Core type definitions for shard map management
//!
//! Identifiers, shard locations and the shard map / shard / mapping records
//! shared by the store, the cache and the manager.

use crate::error::{Error, Result};
use crate::key::{ShardKey, ShardKeyType};
use crate::range::ShardRange;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Maximum length of a shard location server or database name
pub const MAX_LOCATION_PART_LEN: usize = 128;

/// Maximum length of a shard map name
pub const MAX_SHARD_MAP_NAME_LEN: usize = 50;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the underlying UUID
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a shard map
    ShardMapId
);
uuid_id!(
    /// Unique identifier for a shard
    ShardId
);
uuid_id!(
    /// Unique identifier for a point or range mapping
    MappingId
);
uuid_id!(
    /// Unique identifier for a logged store operation
    OperationId
);

/// Owner token for mapping locks
///
/// Generated by the caller; [`MappingLockToken::NO_LOCK`] marks an unlocked
/// mapping.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into, Display)]
#[display("{_0}")]
pub struct MappingLockToken(Uuid);

impl MappingLockToken {
    /// Token of an unlocked mapping
    pub const NO_LOCK: Self = Self(Uuid::nil());

    /// Generate a new random lock owner token
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub fn is_no_lock(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for MappingLockToken {
    fn default() -> Self {
        Self::NO_LOCK
    }
}

impl fmt::Debug for MappingLockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_no_lock() {
            write!(f, "MappingLockToken(NO_LOCK)")
        } else {
            write!(f, "MappingLockToken({})", self.0)
        }
    }
}

/// Content version of a shard or mapping; starts at 1
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct Version(u64);

impl Version {
    /// Version of a newly created record
    pub const INITIAL: Self = Self(1);

    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Version after one more content mutation
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::INITIAL
    }
}

/// Schema version of a global or local store
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("{major}.{minor}")]
pub struct StoreVersion {
    pub major: u32,
    pub minor: u32,
}

impl StoreVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

/// Physical database holding a shard
///
/// Identity is case-insensitive on both parts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardLocation {
    server: String,
    database: String,
}

impl ShardLocation {
    /// Create a location, validating both parts
    pub fn new(server: impl Into<String>, database: impl Into<String>) -> Result<Self> {
        let server = server.into();
        let database = database.into();
        Self::validate_part("server", &server)?;
        Self::validate_part("database", &database)?;
        Ok(Self { server, database })
    }

    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Normalized identity, used to key per-location state
    #[must_use]
    pub fn normalized(&self) -> String {
        format!(
            "{}/{}",
            self.server.to_lowercase(),
            self.database.to_lowercase()
        )
    }

    fn validate_part(what: &str, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(Error::invalid_argument(format!(
                "shard location {what} name cannot be empty"
            )));
        }
        if value.chars().count() > MAX_LOCATION_PART_LEN {
            return Err(Error::invalid_argument(format!(
                "shard location {what} name '{value}' exceeds {MAX_LOCATION_PART_LEN} characters"
            )));
        }
        Ok(())
    }
}

impl PartialEq for ShardLocation {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for ShardLocation {}

impl Hash for ShardLocation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for ShardLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server, self.database)
    }
}

/// Kind of a shard map
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ShardMapKind {
    /// Point mappings
    List,
    /// Range mappings
    Range,
}

/// A named collection of shards and mappings over one key type
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMap {
    pub id: ShardMapId,
    pub name: String,
    pub kind: ShardMapKind,
    pub key_type: ShardKeyType,
}

impl ShardMap {
    /// Create a new shard map record with a fresh id
    pub fn new(name: impl Into<String>, kind: ShardMapKind, key_type: ShardKeyType) -> Result<Self> {
        let name = name.into();
        validate_shard_map_name(&name)?;
        Ok(Self {
            id: ShardMapId::new(),
            name,
            kind,
            key_type,
        })
    }
}

/// Validate a shard map name
pub fn validate_shard_map_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::invalid_argument("shard map name cannot be empty"));
    }
    if name.chars().count() > MAX_SHARD_MAP_NAME_LEN {
        return Err(Error::invalid_argument(format!(
            "shard map name '{name}' exceeds {MAX_SHARD_MAP_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// A shard: one physical location registered in a shard map
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub shard_map_id: ShardMapId,
    pub location: ShardLocation,
    pub version: Version,
}

impl Shard {
    #[must_use]
    pub fn new(shard_map_id: ShardMapId, location: ShardLocation) -> Self {
        Self {
            id: ShardId::new(),
            shard_map_id,
            location,
            version: Version::INITIAL,
        }
    }
}

/// Mapping status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum MappingStatus {
    #[default]
    Online,
    Offline,
}

/// A point or range mapping
///
/// Point mappings are held as the single-key range `[key, key.next())` so
/// overlap rules are uniform across both kinds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: MappingId,
    pub shard_map_id: ShardMapId,
    pub kind: ShardMapKind,
    pub range: ShardRange,
    pub shard: Shard,
    pub status: MappingStatus,
    pub version: Version,
    pub lock_owner: MappingLockToken,
}

impl Mapping {
    /// Create a point mapping record
    pub fn point(shard: &Shard, key: &ShardKey, status: MappingStatus) -> Result<Self> {
        Ok(Self::with_range(
            shard,
            ShardMapKind::List,
            ShardRange::point(key)?,
            status,
        ))
    }

    /// Create a range mapping record
    #[must_use]
    pub fn range(shard: &Shard, range: ShardRange, status: MappingStatus) -> Self {
        Self::with_range(shard, ShardMapKind::Range, range, status)
    }

    fn with_range(
        shard: &Shard,
        kind: ShardMapKind,
        range: ShardRange,
        status: MappingStatus,
    ) -> Self {
        Self {
            id: MappingId::new(),
            shard_map_id: shard.shard_map_id,
            kind,
            range,
            shard: shard.clone(),
            status,
            version: Version::INITIAL,
            lock_owner: MappingLockToken::NO_LOCK,
        }
    }

    /// Point key of a point mapping, low bound of a range mapping
    #[must_use]
    pub const fn key(&self) -> &ShardKey {
        self.range.low()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status == MappingStatus::Online
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        !self.lock_owner.is_no_lock()
    }

    /// Whether the mapping covers the given key
    #[must_use]
    pub fn contains(&self, key: &ShardKey) -> bool {
        self.range.contains(key)
    }
}
