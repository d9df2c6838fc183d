//! Operation factory
//!
//! Turns a requested mutation into a logged operation record: the global
//! change with full before/after images and the ordered local steps, source
//! shard first, then target shard.

use shardmap_common::{
    Error, ErrorCode, Mapping, MappingId, MappingLockToken, MappingStatus, Result, Shard,
    ShardKey, ShardMap, ShardMapKind, ShardRange, Version,
};
use shardmap_store::{GlobalChange, LocalChange, LocalStep, OperationKind, OperationRecord};

/// A mutation that runs through the operation log
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    AddShard {
        shard: Shard,
    },
    RemoveShard {
        shard: Shard,
    },
    AddMapping {
        mapping: Mapping,
    },
    RemoveMapping {
        mapping: Mapping,
        token: MappingLockToken,
    },
    UpdateMapping {
        current: Mapping,
        updated: Mapping,
        token: MappingLockToken,
    },
    SplitMapping {
        current: Mapping,
        left: Mapping,
        right: Mapping,
        token: MappingLockToken,
    },
    MergeMappings {
        left: Mapping,
        right: Mapping,
        merged: Mapping,
        token: MappingLockToken,
    },
}

impl Mutation {
    /// Operation kind recorded in the log
    #[must_use]
    pub const fn kind(&self, map_kind: ShardMapKind) -> OperationKind {
        match self {
            Self::AddShard { .. } => OperationKind::AddShard,
            Self::RemoveShard { .. } => OperationKind::RemoveShard,
            Self::AddMapping { .. } => match map_kind {
                ShardMapKind::List => OperationKind::AddPointMapping,
                ShardMapKind::Range => OperationKind::AddRangeMapping,
            },
            Self::RemoveMapping { .. } => OperationKind::RemoveMapping,
            Self::UpdateMapping { .. } => OperationKind::UpdateMapping,
            Self::SplitMapping { .. } => OperationKind::SplitMapping,
            Self::MergeMappings { .. } => OperationKind::MergeMappings,
        }
    }

    /// Split a range mapping in two at `at`
    ///
    /// Both halves get new ids, keep shard and status, and are owned by
    /// `token`.
    pub fn split(
        map: &ShardMap,
        current: &Mapping,
        at: &ShardKey,
        token: MappingLockToken,
    ) -> Result<Self> {
        require_range_map(map)?;
        if at.key_type() != map.key_type {
            return Err(Error::new(
                ErrorCode::KeyTypeMismatch,
                format!(
                    "split key type {} does not match shard map '{}' key type {}",
                    at.key_type(),
                    map.name,
                    map.key_type
                ),
            ));
        }
        if !current.contains(at) || at == current.range.low() {
            return Err(Error::invalid_argument(format!(
                "split key {at} is not strictly inside {} of mapping {}",
                current.range, current.id
            )));
        }
        let left = ShardRange::new(current.range.low().clone(), at.clone())?;
        let right = ShardRange::new(at.clone(), current.range.high().clone())?;
        Ok(Self::SplitMapping {
            current: current.clone(),
            left: derived(current, left, current.status, token),
            right: derived(current, right, current.status, token),
            token,
        })
    }

    /// Merge two adjacent range mappings of the same shard and status
    pub fn merge(
        map: &ShardMap,
        left: &Mapping,
        right: &Mapping,
        token: MappingLockToken,
    ) -> Result<Self> {
        require_range_map(map)?;
        let (left, right) = if left.range.low() <= right.range.low() {
            (left, right)
        } else {
            (right, left)
        };
        if left.range.high() != right.range.low() {
            return Err(Error::invalid_argument(format!(
                "mappings {} {} and {} {} are not adjacent",
                left.id, left.range, right.id, right.range
            )));
        }
        if left.shard.id != right.shard.id {
            return Err(Error::invalid_argument(format!(
                "mappings {} and {} point to different shards {} and {}",
                left.id, right.id, left.shard.location, right.shard.location
            )));
        }
        if left.status != right.status {
            return Err(Error::invalid_argument(format!(
                "mappings {} and {} have different status",
                left.id, right.id
            )));
        }
        let range = ShardRange::new(left.range.low().clone(), right.range.high().clone())?;
        Ok(Self::MergeMappings {
            left: left.clone(),
            right: right.clone(),
            merged: derived(left, range, left.status, token),
            token,
        })
    }
}

/// Changes requested by an update
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MappingUpdate {
    pub status: Option<MappingStatus>,
    pub shard: Option<Shard>,
}

impl MappingUpdate {
    #[must_use]
    pub fn status(status: MappingStatus) -> Self {
        Self {
            status: Some(status),
            shard: None,
        }
    }

    #[must_use]
    pub fn shard(shard: Shard) -> Self {
        Self {
            status: None,
            shard: Some(shard),
        }
    }

    /// Post-image of `current` after this update
    #[must_use]
    pub fn apply_to(&self, current: &Mapping, token: MappingLockToken) -> Mapping {
        Mapping {
            status: self.status.unwrap_or(current.status),
            shard: self.shard.clone().unwrap_or_else(|| current.shard.clone()),
            version: current.version.next(),
            lock_owner: token,
            ..current.clone()
        }
    }
}

fn require_range_map(map: &ShardMap) -> Result<()> {
    if map.kind == ShardMapKind::Range {
        return Ok(());
    }
    Err(Error::new(
        ErrorCode::ShardMapKindMismatch,
        format!("shard map '{}' is not a range shard map", map.name),
    ))
}

/// New mapping covering `range`, inheriting shard and map from `source`
fn derived(
    source: &Mapping,
    range: ShardRange,
    status: MappingStatus,
    token: MappingLockToken,
) -> Mapping {
    Mapping {
        id: MappingId::new(),
        range,
        status,
        version: Version::INITIAL,
        lock_owner: token,
        ..source.clone()
    }
}

/// Builds operation records keyed on mutation kind
pub struct OperationFactory;

impl OperationFactory {
    #[must_use]
    pub fn create(map: &ShardMap, mutation: Mutation) -> OperationRecord {
        let kind = mutation.kind(map.kind);
        let (global, local_steps) = match mutation {
            Mutation::AddShard { shard } => (
                GlobalChange::AddShard {
                    shard: shard.clone(),
                },
                vec![LocalStep::new(
                    shard.location.clone(),
                    LocalChange::AddShard {
                        shard_map: map.clone(),
                        shard,
                    },
                )],
            ),
            Mutation::RemoveShard { shard } => (
                GlobalChange::RemoveShard {
                    shard: shard.clone(),
                },
                vec![LocalStep::new(
                    shard.location.clone(),
                    LocalChange::RemoveShard {
                        shard_map: map.clone(),
                        shard,
                    },
                )],
            ),
            Mutation::AddMapping { mapping } => (
                replace(vec![], vec![mapping.clone()], MappingLockToken::NO_LOCK, false),
                vec![local_replace(map, &mapping.shard.clone(), vec![], vec![mapping])],
            ),
            Mutation::RemoveMapping { mapping, token } => (
                replace(vec![mapping.clone()], vec![], token, true),
                vec![local_replace(map, &mapping.shard.clone(), vec![mapping], vec![])],
            ),
            Mutation::UpdateMapping {
                current,
                updated,
                token,
            } => {
                let moved = current.shard.id != updated.shard.id;
                let steps = if moved {
                    vec![
                        local_replace(map, &current.shard, vec![current.clone()], vec![]),
                        local_replace(map, &updated.shard, vec![], vec![updated.clone()]),
                    ]
                } else {
                    vec![local_replace(
                        map,
                        &current.shard,
                        vec![current.clone()],
                        vec![updated.clone()],
                    )]
                };
                (replace(vec![current], vec![updated], token, moved), steps)
            }
            Mutation::SplitMapping {
                current,
                left,
                right,
                token,
            } => {
                let add = vec![left, right];
                (
                    replace(vec![current.clone()], add.clone(), token, false),
                    vec![local_replace(map, &current.shard.clone(), vec![current], add)],
                )
            }
            Mutation::MergeMappings {
                left,
                right,
                merged,
                token,
            } => {
                let remove = vec![left, right];
                (
                    replace(remove.clone(), vec![merged.clone()], token, false),
                    vec![local_replace(map, &merged.shard.clone(), remove, vec![merged])],
                )
            }
        };
        OperationRecord::new(kind, map.clone(), global, local_steps)
    }
}

fn replace(
    remove: Vec<Mapping>,
    add: Vec<Mapping>,
    lock_token: MappingLockToken,
    require_offline: bool,
) -> GlobalChange {
    GlobalChange::ReplaceMappings {
        remove,
        add,
        lock_token,
        require_offline,
    }
}

fn local_replace(map: &ShardMap, shard: &Shard, remove: Vec<Mapping>, add: Vec<Mapping>) -> LocalStep {
    LocalStep::new(
        shard.location.clone(),
        LocalChange::ReplaceMappings {
            shard_map: map.clone(),
            shard: shard.clone(),
            remove,
            add,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardmap_common::{ShardKeyType, ShardLocation};

    fn fixture() -> (ShardMap, Shard, Shard) {
        let map = ShardMap::new("ranges", ShardMapKind::Range, ShardKeyType::Int32).unwrap();
        let a = Shard::new(map.id, ShardLocation::new("srv", "a").unwrap());
        let b = Shard::new(map.id, ShardLocation::new("srv", "b").unwrap());
        (map, a, b)
    }

    fn mapping(shard: &Shard, low: i32, high: i32) -> Mapping {
        let range = ShardRange::new(ShardKey::from(low), ShardKey::from(high)).unwrap();
        Mapping::range(shard, range, MappingStatus::Online)
    }

    #[test]
    fn test_move_touches_source_then_target() {
        let (map, a, b) = fixture();
        let current = mapping(&a, 0, 10);
        let token = MappingLockToken::new();
        let updated = MappingUpdate::shard(b.clone()).apply_to(&current, token);
        assert_eq!(updated.version, current.version.next());
        assert_eq!(updated.id, current.id);

        let record = OperationFactory::create(
            &map,
            Mutation::UpdateMapping {
                current,
                updated,
                token,
            },
        );
        assert_eq!(record.kind, OperationKind::UpdateMapping);
        let locations: Vec<_> = record.local_steps.iter().map(|s| s.location.clone()).collect();
        assert_eq!(locations, vec![a.location, b.location]);
        let GlobalChange::ReplaceMappings {
            require_offline, ..
        } = record.global
        else {
            panic!("expected a mapping change");
        };
        assert!(require_offline);
    }

    #[test]
    fn test_split_results_inherit_token() {
        let (map, a, _) = fixture();
        let current = mapping(&a, 0, 10);
        let token = MappingLockToken::new();
        let Mutation::SplitMapping { left, right, .. } =
            Mutation::split(&map, &current, &ShardKey::from(4), token).unwrap()
        else {
            panic!("expected a split");
        };
        assert_eq!(left.range.high(), &ShardKey::from(4));
        assert_eq!(right.range.low(), &ShardKey::from(4));
        assert_eq!(right.range.high(), current.range.high());
        assert_eq!(left.lock_owner, token);
        assert_eq!(right.lock_owner, token);
        assert_ne!(left.id, current.id);
        assert_eq!(left.version, Version::INITIAL);
    }

    #[test]
    fn test_split_point_must_be_inside() {
        let (map, a, _) = fixture();
        let current = mapping(&a, 0, 10);
        let token = MappingLockToken::NO_LOCK;
        for at in [0, 10, 12] {
            let err = Mutation::split(&map, &current, &ShardKey::from(at), token).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidArgument);
        }
        let err = Mutation::split(&map, &current, &ShardKey::from(5_i64), token).unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyTypeMismatch);
    }

    #[test]
    fn test_merge_rules() {
        let (map, a, b) = fixture();
        let token = MappingLockToken::NO_LOCK;
        let left = mapping(&a, 0, 10);
        let right = mapping(&a, 10, 20);

        // Argument order does not matter
        let Mutation::MergeMappings { merged, .. } =
            Mutation::merge(&map, &right, &left, token).unwrap()
        else {
            panic!("expected a merge");
        };
        assert_eq!(merged.range.low(), &ShardKey::from(0));
        assert_eq!(merged.range.high(), &ShardKey::from(20));

        let gap = mapping(&a, 11, 20);
        assert!(Mutation::merge(&map, &left, &gap, token).is_err());
        let elsewhere = mapping(&b, 10, 20);
        assert!(Mutation::merge(&map, &left, &elsewhere, token).is_err());

        let list = ShardMap::new("points", ShardMapKind::List, ShardKeyType::Int32).unwrap();
        let err = Mutation::merge(&list, &left, &right, token).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShardMapKindMismatch);
    }
}
