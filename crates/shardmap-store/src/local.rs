//! Local store procedures.
//!
//! A local store mirrors the shard map, shard and mapping records of the
//! shards it hosts. Every change is idempotent: deletes run before upserts
//! and re-applying a change leaves the same rows.

use crate::error::StoreResult;
use crate::request::{StoreRequest, StoreResponse, StoreRows};
use crate::store::Txn;
use crate::tables::{self, child_key, child_prefix};
use crate::types::LocalChange;
use shardmap_common::{Mapping, MappingLockToken, Shard, ShardId, ShardMap, ShardMapId};

/// Local rows never carry lock owners
fn mirrored(mapping: &Mapping) -> Mapping {
    Mapping {
        lock_owner: MappingLockToken::NO_LOCK,
        ..mapping.clone()
    }
}

impl Txn<'_> {
    pub(crate) fn execute_local(&self, request: &StoreRequest) -> StoreResult<StoreResponse> {
        match request {
            StoreRequest::ApplyLocal { change } => self.apply_local(change),
            StoreRequest::IsLocalApplied { change } => Ok(StoreResponse::rows(
                StoreRows::Applied(self.local_applied(change)?),
            )),
            StoreRequest::GetLocalShards => {
                let shards = self
                    .scan::<Shard>(tables::LOCAL_SHARDS, "")?
                    .into_iter()
                    .map(|(_, shard)| shard)
                    .collect();
                Ok(StoreResponse::rows(StoreRows::Shards(shards)))
            }
            StoreRequest::GetLocalMappings { map, shard } => Ok(StoreResponse::rows(
                StoreRows::Mappings(self.local_mappings(*map, *shard)?),
            )),
            StoreRequest::RebuildLocalMappings {
                shard_map,
                shard,
                mappings,
            } => {
                self.upsert_local_shard(shard_map, shard)?;
                for existing in self.local_mappings(shard_map.id, shard.id)? {
                    self.remove(
                        tables::LOCAL_MAPPINGS,
                        &child_key(shard_map.id, existing.id),
                    )?;
                }
                for mapping in mappings {
                    self.put_local_mapping(mapping)?;
                }
                Ok(StoreResponse::affected(mappings.len() as u64))
            }
            _ => Ok(self.unsupported(request)),
        }
    }

    fn local_mappings(&self, map: ShardMapId, shard: ShardId) -> StoreResult<Vec<Mapping>> {
        let mut mappings: Vec<Mapping> = self
            .scan::<Mapping>(tables::LOCAL_MAPPINGS, &child_prefix(map))?
            .into_iter()
            .map(|(_, mapping)| mapping)
            .filter(|mapping| mapping.shard.id == shard)
            .collect();
        mappings.sort_by(|a, b| a.range.low().cmp(b.range.low()));
        Ok(mappings)
    }

    fn upsert_local_shard(&self, shard_map: &ShardMap, shard: &Shard) -> StoreResult<()> {
        self.put(
            tables::LOCAL_SHARD_MAPS,
            &shard_map.id.to_string(),
            shard_map,
        )?;
        self.put(
            tables::LOCAL_SHARDS,
            &child_key(shard_map.id, shard.id),
            shard,
        )
    }

    fn put_local_mapping(&self, mapping: &Mapping) -> StoreResult<()> {
        self.put(
            tables::LOCAL_MAPPINGS,
            &child_key(mapping.shard_map_id, mapping.id),
            &mirrored(mapping),
        )
    }

    fn apply_local(&self, change: &LocalChange) -> StoreResult<StoreResponse> {
        match change {
            LocalChange::AddShard { shard_map, shard } => {
                self.upsert_local_shard(shard_map, shard)?;
            }
            LocalChange::RemoveShard { shard_map, shard } => {
                self.remove(tables::LOCAL_SHARDS, &child_key(shard_map.id, shard.id))?;
                let remaining = self
                    .scan::<Shard>(tables::LOCAL_SHARDS, &child_prefix(shard_map.id))?
                    .len();
                if remaining == 0 {
                    self.remove(tables::LOCAL_SHARD_MAPS, &shard_map.id.to_string())?;
                }
            }
            LocalChange::ReplaceMappings {
                shard_map,
                shard,
                remove,
                add,
            } => {
                self.upsert_local_shard(shard_map, shard)?;
                for mapping in remove {
                    self.remove(
                        tables::LOCAL_MAPPINGS,
                        &child_key(shard_map.id, mapping.id),
                    )?;
                }
                for mapping in add {
                    self.put_local_mapping(mapping)?;
                }
            }
        }
        Ok(StoreResponse::affected(1))
    }

    /// Whether the end state of a change already holds
    fn local_applied(&self, change: &LocalChange) -> StoreResult<bool> {
        match change {
            LocalChange::AddShard { shard_map, shard } => Ok(self
                .get::<Shard>(tables::LOCAL_SHARDS, &child_key(shard_map.id, shard.id))?
                .is_some_and(|stored| &stored == shard)),
            LocalChange::RemoveShard { shard_map, shard } => Ok(self
                .get::<Shard>(tables::LOCAL_SHARDS, &child_key(shard_map.id, shard.id))?
                .is_none()),
            LocalChange::ReplaceMappings {
                shard_map,
                remove,
                add,
                ..
            } => {
                for mapping in remove.iter().filter(|r| !add.iter().any(|a| a.id == r.id)) {
                    let key = child_key(shard_map.id, mapping.id);
                    if self.get::<Mapping>(tables::LOCAL_MAPPINGS, &key)?.is_some() {
                        return Ok(false);
                    }
                }
                for mapping in add {
                    let key = child_key(shard_map.id, mapping.id);
                    let stored = self.get::<Mapping>(tables::LOCAL_MAPPINGS, &key)?;
                    if stored.as_ref() != Some(&mirrored(mapping)) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::request::StoreRequest;
    use crate::schema::{LOCAL_STORE_VERSION, StoreKind};
    use crate::store::test_support::{deploy, open_store, run};
    use crate::types::LocalChange;
    use shardmap_common::{
        Mapping, MappingLockToken, MappingStatus, Shard, ShardKey, ShardKeyType, ShardLocation,
        ShardMap, ShardMapKind,
    };

    #[test]
    fn test_local_changes_are_idempotent_and_reversible() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), StoreKind::Local);
        deploy(&store, LOCAL_STORE_VERSION);

        let map = ShardMap::new("m", ShardMapKind::List, ShardKeyType::Int32).unwrap();
        let shard = Shard::new(map.id, ShardLocation::new("srv", "db").unwrap());
        let mut mapping =
            Mapping::point(&shard, &ShardKey::from(3), MappingStatus::Online).unwrap();
        mapping.lock_owner = MappingLockToken::new();
        let change = LocalChange::ReplaceMappings {
            shard_map: map.clone(),
            shard: shard.clone(),
            remove: vec![],
            add: vec![mapping.clone()],
        };

        let applied = |change: &LocalChange| {
            run(
                &store,
                StoreRequest::IsLocalApplied {
                    change: change.clone(),
                },
            )
            .applied()
        };
        assert!(!applied(&change));
        for _ in 0..2 {
            let response = run(
                &store,
                StoreRequest::ApplyLocal {
                    change: change.clone(),
                },
            );
            assert!(response.is_success());
            assert!(applied(&change));
        }

        let mirrored = run(
            &store,
            StoreRequest::GetLocalMappings {
                map: map.id,
                shard: shard.id,
            },
        )
        .into_mappings();
        assert_eq!(mirrored.len(), 1);
        assert!(!mirrored[0].is_locked());

        let undo = change.inverse();
        run(&store, StoreRequest::ApplyLocal { change: undo.clone() });
        assert!(applied(&undo));
        assert!(!applied(&change));
    }

    #[test]
    fn test_remove_last_shard_drops_map_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), StoreKind::Local);
        deploy(&store, LOCAL_STORE_VERSION);

        let map = ShardMap::new("m", ShardMapKind::Range, ShardKeyType::Int64).unwrap();
        let shard = Shard::new(map.id, ShardLocation::new("srv", "db").unwrap());
        let add = LocalChange::AddShard {
            shard_map: map.clone(),
            shard: shard.clone(),
        };
        run(&store, StoreRequest::ApplyLocal { change: add.clone() });
        assert_eq!(
            run(&store, StoreRequest::GetLocalShards).into_shards(),
            vec![shard.clone()]
        );

        run(&store, StoreRequest::ApplyLocal { change: add.inverse() });
        assert!(
            run(&store, StoreRequest::GetLocalShards)
                .into_shards()
                .is_empty()
        );
    }

    #[test]
    fn test_global_requests_rejected_by_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), StoreKind::Local);
        deploy(&store, LOCAL_STORE_VERSION);
        let response = run(&store, StoreRequest::GetShardMaps);
        assert!(!response.is_success());
    }
}
