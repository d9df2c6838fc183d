//! Stored types for shard map persistence.
//!
//! These types are serialized to redb via bincode. Rows touched by an
//! in-flight operation carry a [`PendingMarker`] until the operation
//! completes or is undone.

use serde::{Deserialize, Serialize};
use shardmap_common::{
    Mapping, MappingId, MappingLockToken, OperationId, Shard, ShardLocation, ShardMap,
};
use std::fmt;

/// Marks a row touched by an in-flight operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMarker {
    pub operation_id: OperationId,
    /// Row is removed once the operation completes
    pub removal: bool,
}

/// Shard row in the global store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredShard {
    pub shard: Shard,
    pub pending: Option<PendingMarker>,
}

/// Mapping row in the global store (lock owner lives in its own table)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMapping {
    pub mapping: Mapping,
    pub pending: Option<PendingMarker>,
}

/// Whether a marked row is still visible to readers
pub(crate) fn is_live(pending: Option<&PendingMarker>) -> bool {
    !pending.is_some_and(|p| p.removal)
}

/// Whether a row is held by an operation other than `operation_id`
pub(crate) fn is_held_by_other(pending: Option<&PendingMarker>, operation_id: OperationId) -> bool {
    pending.is_some_and(|p| p.operation_id != operation_id)
}

/// Kind of mutation an operation performs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    AddShardMap,
    RemoveShardMap,
    AddShard,
    RemoveShard,
    AddPointMapping,
    AddRangeMapping,
    RemoveMapping,
    UpdateMapping,
    SplitMapping,
    MergeMappings,
    LockMapping,
    UnlockMapping,
    AddSchemaInfo,
    ReplaceSchemaInfo,
    RemoveSchemaInfo,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Progress of an operation
///
/// `Created` is the state of a record not yet logged. The terminal states
/// `Completed` and `UndoneCompleted` are normally reached by deleting the
/// log entry; a stored record in either state is finished by completing or
/// undoing it again, which also clears its pending markers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    Created,
    LoggedGlobal,
    AppliedGlobal,
    /// The first `n` local steps are applied
    AppliedLocal(u32),
    Undoing,
    Completed,
    UndoneCompleted,
    /// An undo failed; recovery finishes it
    FailedPermanently,
}

impl OperationState {
    /// Whether the global change has been applied and not rolled back
    #[must_use]
    pub const fn is_global_applied(self) -> bool {
        matches!(
            self,
            Self::AppliedGlobal | Self::AppliedLocal(_) | Self::Completed
        )
    }

    /// Whether the operation is being rolled back
    #[must_use]
    pub const fn is_undoing(self) -> bool {
        matches!(
            self,
            Self::Undoing | Self::UndoneCompleted | Self::FailedPermanently
        )
    }

    /// Number of local steps recorded as applied
    #[must_use]
    pub const fn applied_local_steps(self) -> u32 {
        match self {
            Self::AppliedLocal(n) => n,
            _ => 0,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AppliedLocal(n) => write!(f, "AppliedLocal({n})"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Change applied to the global store, with full images for undo
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalChange {
    AddShard {
        shard: Shard,
    },
    RemoveShard {
        shard: Shard,
    },
    /// Remove mappings (pre-images) and add mappings (post-images)
    ///
    /// Update, split and merge are all expressed this way. A mapping id
    /// present on both sides is rewritten in place.
    ReplaceMappings {
        remove: Vec<Mapping>,
        add: Vec<Mapping>,
        lock_token: MappingLockToken,
        /// Removed mappings must be offline
        require_offline: bool,
    },
}

impl GlobalChange {
    /// Ids of mappings removed and not re-added
    #[must_use]
    pub fn removed_mapping_ids(&self) -> Vec<MappingId> {
        match self {
            Self::ReplaceMappings { remove, add, .. } => remove
                .iter()
                .filter(|r| !add.iter().any(|a| a.id == r.id))
                .map(|r| r.id)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Change applied to a single local store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalChange {
    AddShard {
        shard_map: ShardMap,
        shard: Shard,
    },
    RemoveShard {
        shard_map: ShardMap,
        shard: Shard,
    },
    ReplaceMappings {
        shard_map: ShardMap,
        shard: Shard,
        remove: Vec<Mapping>,
        add: Vec<Mapping>,
    },
}

impl LocalChange {
    /// Change that reverts this one
    #[must_use]
    pub fn inverse(&self) -> Self {
        match self {
            Self::AddShard { shard_map, shard } => Self::RemoveShard {
                shard_map: shard_map.clone(),
                shard: shard.clone(),
            },
            Self::RemoveShard { shard_map, shard } => Self::AddShard {
                shard_map: shard_map.clone(),
                shard: shard.clone(),
            },
            Self::ReplaceMappings {
                shard_map,
                shard,
                remove,
                add,
            } => Self::ReplaceMappings {
                shard_map: shard_map.clone(),
                shard: shard.clone(),
                remove: add.clone(),
                add: remove.clone(),
            },
        }
    }

    /// Whether applying this change needs the local mapping mirror
    #[must_use]
    pub const fn touches_mappings(&self) -> bool {
        matches!(self, Self::ReplaceMappings { .. })
    }
}

/// One local store step of an operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStep {
    pub location: ShardLocation,
    pub apply: LocalChange,
    pub undo: LocalChange,
}

impl LocalStep {
    #[must_use]
    pub fn new(location: ShardLocation, apply: LocalChange) -> Self {
        let undo = apply.inverse();
        Self {
            location,
            apply,
            undo,
        }
    }
}

/// Durable log entry describing one in-flight mutation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    /// Assigned by the store when logged
    pub sequence: u64,
    pub kind: OperationKind,
    pub shard_map: ShardMap,
    pub global: GlobalChange,
    /// Ordered source first, then target
    pub local_steps: Vec<LocalStep>,
    pub state: OperationState,
    /// Unix milliseconds, assigned by the store when logged
    pub logged_at_ms: u64,
}

impl OperationRecord {
    /// Create an unlogged record with a fresh id
    #[must_use]
    pub fn new(
        kind: OperationKind,
        shard_map: ShardMap,
        global: GlobalChange,
        local_steps: Vec<LocalStep>,
    ) -> Self {
        Self {
            id: OperationId::new(),
            sequence: 0,
            kind,
            shard_map,
            global,
            local_steps,
            state: OperationState::Created,
            logged_at_ms: 0,
        }
    }
}
