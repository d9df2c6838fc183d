//! Global store procedures.
//!
//! Rule checks run inside the caller's transaction and report violations as
//! failed responses, which roll the whole batch back.

use crate::error::StoreResult;
use crate::request::{LockScope, StoreRequest, StoreResponse, StoreRows};
use crate::schema::GLOBAL_LOCKING_VERSION;
use crate::store::{Txn, now_ms};
use crate::tables::{self, child_key, child_prefix};
use crate::types::{
    GlobalChange, OperationRecord, OperationState, PendingMarker, StoredMapping, StoredShard,
    is_held_by_other, is_live,
};
use redb::ReadableTable;
use shardmap_common::{
    ErrorCode, MappingId, MappingLockToken, OperationId, ShardId, ShardKey, ShardLocation,
    ShardMap, ShardMapId, ShardMapKind, ShardRange,
};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

impl Txn<'_> {
    pub(crate) fn execute_global(&self, request: &StoreRequest) -> StoreResult<StoreResponse> {
        match request {
            StoreRequest::GetShardMaps => Ok(StoreResponse::rows(StoreRows::ShardMaps(
                self.shard_maps()?,
            ))),
            StoreRequest::FindShardMapByName { name } => {
                let found = self
                    .shard_maps()?
                    .into_iter()
                    .filter(|m| m.name.eq_ignore_ascii_case(name))
                    .collect();
                Ok(StoreResponse::rows(StoreRows::ShardMaps(found)))
            }
            StoreRequest::FindShardMapById { id } => {
                let found = self.shard_map(*id)?.into_iter().collect();
                Ok(StoreResponse::rows(StoreRows::ShardMaps(found)))
            }
            StoreRequest::AddShardMap { map } => self.add_shard_map(map),
            StoreRequest::RemoveShardMap { map } => self.remove_shard_map(map),
            StoreRequest::GetShards { map } => self.get_shards(*map, None),
            StoreRequest::FindShardByLocation { map, location } => {
                self.get_shards(*map, Some(location))
            }
            StoreRequest::GetMappings { map, range, shard } => {
                self.get_mappings(*map, range.as_ref(), *shard)
            }
            StoreRequest::FindMappingByKey { map, key } => self.find_mapping_by_key(*map, key),
            StoreRequest::FindMappingById { map, id } => {
                if let Some(failure) = self.missing_map(*map)? {
                    return Ok(failure);
                }
                let found = self
                    .stored_mapping(*map, *id)?
                    .filter(|row| is_live(row.pending.as_ref()));
                let in_flight = found.as_ref().is_some_and(|row| row.pending.is_some());
                let found = found.map(|row| row.mapping).into_iter().collect();
                Ok(StoreResponse::rows(StoreRows::Mappings(found)).with_in_flight(in_flight))
            }
            StoreRequest::LockMappings { map, scope, token } => {
                self.lock_mappings(*map, *scope, *token)
            }
            StoreRequest::GetOperations => {
                let mut records: Vec<OperationRecord> = self
                    .scan(tables::OPERATIONS, "")?
                    .into_iter()
                    .map(|(_, record)| record)
                    .collect();
                records.sort_by_key(|r| r.sequence);
                Ok(StoreResponse::rows(StoreRows::Operations(records)))
            }
            StoreRequest::LogOperation { record } => self.log_operation(record),
            StoreRequest::ApplyGlobal { record } => self.apply_global(record),
            StoreRequest::SetOperationState { id, state } => self.set_operation_state(*id, *state),
            StoreRequest::CompleteOperation { record } => self.complete_operation(record),
            StoreRequest::UndoGlobal { record } => self.undo_global(record),
            StoreRequest::RemoveOperation { id } => {
                let existed = self.remove(tables::OPERATIONS, &id.to_string())?;
                Ok(StoreResponse::affected(u64::from(existed)))
            }
            StoreRequest::GetSchemaInfos => self.schema_infos(None),
            StoreRequest::FindSchemaInfo { name } => self.schema_infos(Some(name)),
            StoreRequest::AddSchemaInfo { name, xml } => self.put_schema_info(name, xml, false),
            StoreRequest::ReplaceSchemaInfo { name, xml } => {
                self.put_schema_info(name, xml, true)
            }
            StoreRequest::RemoveSchemaInfo { name } => self.remove_schema_info(name),
            _ => Ok(self.unsupported(request)),
        }
    }

    // ---- Shard maps ----

    fn shard_maps(&self) -> StoreResult<Vec<ShardMap>> {
        let mut maps: Vec<ShardMap> = self
            .scan(tables::SHARD_MAPS, "")?
            .into_iter()
            .map(|(_, map)| map)
            .collect();
        maps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(maps)
    }

    fn shard_map(&self, id: ShardMapId) -> StoreResult<Option<ShardMap>> {
        self.get(tables::SHARD_MAPS, &id.to_string())
    }

    /// Failure response when the shard map is absent
    fn missing_map(&self, id: ShardMapId) -> StoreResult<Option<StoreResponse>> {
        Ok(self.shard_map(id)?.is_none().then(|| {
            StoreResponse::failure(
                ErrorCode::ShardMapDoesNotExist,
                format!("shard map {id} does not exist"),
            )
        }))
    }

    fn add_shard_map(&self, map: &ShardMap) -> StoreResult<StoreResponse> {
        let exists = self
            .shard_maps()?
            .iter()
            .any(|m| m.id == map.id || m.name.eq_ignore_ascii_case(&map.name));
        if exists {
            return Ok(StoreResponse::failure(
                ErrorCode::ShardMapAlreadyExists,
                format!("shard map '{}' already exists", map.name),
            ));
        }
        self.put(tables::SHARD_MAPS, &map.id.to_string(), map)?;
        Ok(StoreResponse::affected(1))
    }

    fn remove_shard_map(&self, map: &ShardMap) -> StoreResult<StoreResponse> {
        if self.shard_map(map.id)?.is_none() {
            return Ok(StoreResponse::failure(
                ErrorCode::ShardMapDoesNotExist,
                format!("shard map '{}' does not exist", map.name),
            ));
        }
        if !self.stored_shards(map.id)?.is_empty() {
            return Ok(StoreResponse::failure(
                ErrorCode::ShardMapHasShards,
                format!("shard map '{}' still has shards", map.name),
            ));
        }
        self.remove(tables::SHARD_MAPS, &map.id.to_string())?;
        Ok(StoreResponse::affected(1))
    }

    // ---- Shards ----

    fn stored_shards(&self, map: ShardMapId) -> StoreResult<Vec<StoredShard>> {
        Ok(self
            .scan(tables::SHARDS, &child_prefix(map))?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    fn get_shards(
        &self,
        map: ShardMapId,
        location: Option<&ShardLocation>,
    ) -> StoreResult<StoreResponse> {
        if let Some(failure) = self.missing_map(map)? {
            return Ok(failure);
        }
        let shards = self
            .stored_shards(map)?
            .into_iter()
            .filter(|row| is_live(row.pending.as_ref()))
            .map(|row| row.shard)
            .filter(|shard| location.is_none_or(|l| &shard.location == l))
            .collect();
        Ok(StoreResponse::rows(StoreRows::Shards(shards)))
    }

    // ---- Mappings ----

    fn locking_supported(&self) -> StoreResult<bool> {
        Ok(self
            .version()?
            .is_some_and(|v| v >= GLOBAL_LOCKING_VERSION))
    }

    /// Mapping rows of a shard map with lock owners filled in
    fn stored_mappings(&self, map: ShardMapId) -> StoreResult<Vec<StoredMapping>> {
        let mut rows: Vec<StoredMapping> = self
            .scan(tables::MAPPINGS, &child_prefix(map))?
            .into_iter()
            .map(|(_, row)| row)
            .collect();
        if self.locking_supported()? {
            let locks = self.txn.open_table(tables::MAPPING_LOCKS)?;
            for row in &mut rows {
                let key = child_key(map, row.mapping.id);
                if let Some(owner) = locks.get(key.as_str())? {
                    row.mapping.lock_owner = MappingLockToken::from_uuid(Uuid::from_u128(owner.value()));
                }
            }
        }
        rows.sort_by(|a, b| a.mapping.range.low().cmp(b.mapping.range.low()));
        Ok(rows)
    }

    fn stored_mapping(&self, map: ShardMapId, id: MappingId) -> StoreResult<Option<StoredMapping>> {
        let key = child_key(map, id);
        let Some(mut row) = self.get::<StoredMapping>(tables::MAPPINGS, &key)? else {
            return Ok(None);
        };
        if self.locking_supported()? {
            let locks = self.txn.open_table(tables::MAPPING_LOCKS)?;
            if let Some(owner) = locks.get(key.as_str())? {
                row.mapping.lock_owner = MappingLockToken::from_uuid(Uuid::from_u128(owner.value()));
            }
        }
        Ok(Some(row))
    }

    /// Write a mapping row; its lock owner goes to the lock table
    fn put_mapping(&self, row: &StoredMapping) -> StoreResult<()> {
        let key = child_key(row.mapping.shard_map_id, row.mapping.id);
        let mut stored = row.clone();
        let owner = std::mem::take(&mut stored.mapping.lock_owner);
        self.put(tables::MAPPINGS, &key, &stored)?;
        self.set_lock_owner(&key, owner)
    }

    fn delete_mapping(&self, map: ShardMapId, id: MappingId) -> StoreResult<()> {
        let key = child_key(map, id);
        self.remove(tables::MAPPINGS, &key)?;
        self.set_lock_owner(&key, MappingLockToken::NO_LOCK)
    }

    fn set_lock_owner(&self, key: &str, owner: MappingLockToken) -> StoreResult<()> {
        if !self.locking_supported()? {
            return Ok(());
        }
        let mut locks = self.txn.open_table(tables::MAPPING_LOCKS)?;
        if owner.is_no_lock() {
            locks.remove(key)?;
        } else {
            locks.insert(key, Uuid::from(owner).as_u128())?;
        }
        Ok(())
    }

    fn get_mappings(
        &self,
        map: ShardMapId,
        range: Option<&ShardRange>,
        shard: Option<ShardId>,
    ) -> StoreResult<StoreResponse> {
        if let Some(failure) = self.missing_map(map)? {
            return Ok(failure);
        }
        let mappings = self
            .stored_mappings(map)?
            .into_iter()
            .filter(|row| is_live(row.pending.as_ref()))
            .map(|row| row.mapping)
            .filter(|m| range.is_none_or(|r| m.range.intersects(r)))
            .filter(|m| shard.is_none_or(|s| m.shard.id == s))
            .collect();
        Ok(StoreResponse::rows(StoreRows::Mappings(mappings)))
    }

    fn find_mapping_by_key(&self, map: ShardMapId, key: &ShardKey) -> StoreResult<StoreResponse> {
        let Some(shard_map) = self.shard_map(map)? else {
            return Ok(StoreResponse::failure(
                ErrorCode::ShardMapDoesNotExist,
                format!("shard map {map} does not exist"),
            ));
        };
        if shard_map.key_type != key.key_type() {
            return Ok(StoreResponse::failure(
                ErrorCode::KeyTypeMismatch,
                format!(
                    "key type {} does not match shard map '{}' key type {}",
                    key.key_type(),
                    shard_map.name,
                    shard_map.key_type
                ),
            ));
        }
        let found = self
            .stored_mappings(map)?
            .into_iter()
            .filter(|row| is_live(row.pending.as_ref()))
            .find(|row| row.mapping.contains(key));
        let in_flight = found.as_ref().is_some_and(|row| row.pending.is_some());
        let found = found.map(|row| row.mapping).into_iter().collect();
        Ok(StoreResponse::rows(StoreRows::Mappings(found)).with_in_flight(in_flight))
    }

    // ---- Locking ----

    fn lock_mappings(
        &self,
        map: ShardMapId,
        scope: LockScope,
        token: MappingLockToken,
    ) -> StoreResult<StoreResponse> {
        if let Some(failure) = self.missing_map(map)? {
            return Ok(failure);
        }
        match scope {
            LockScope::Lock(id) | LockScope::Unlock(id) => {
                let Some(row) = self
                    .stored_mapping(map, id)?
                    .filter(|row| is_live(row.pending.as_ref()))
                else {
                    return Ok(StoreResponse::failure(
                        ErrorCode::MappingDoesNotExist,
                        format!("mapping {id} does not exist in shard map {map}"),
                    ));
                };
                if row.pending.is_some() {
                    return Ok(StoreResponse::failure(
                        ErrorCode::PendingOperation,
                        format!("mapping {id} is being changed by another operation"),
                    ));
                }
                let owner = row.mapping.lock_owner;
                let key = child_key(map, id);
                if matches!(scope, LockScope::Lock(_)) {
                    if owner == token {
                        return Ok(StoreResponse::affected(0));
                    }
                    if !owner.is_no_lock() {
                        return Ok(StoreResponse::failure(
                            ErrorCode::MappingIsAlreadyLocked,
                            format!("mapping {id} is already locked by {owner}"),
                        ));
                    }
                    self.set_lock_owner(&key, token)?;
                } else {
                    if owner.is_no_lock() {
                        return Ok(StoreResponse::affected(0));
                    }
                    if owner != token {
                        return Ok(StoreResponse::failure(
                            ErrorCode::MappingLockOwnerIdDoesNotMatch,
                            format!("mapping {id} is locked by {owner}, not by {token}"),
                        ));
                    }
                    self.set_lock_owner(&key, MappingLockToken::NO_LOCK)?;
                }
                Ok(StoreResponse::affected(1))
            }
            LockScope::UnlockAllOwnedBy | LockScope::ForceUnlockAll => {
                let force = scope == LockScope::ForceUnlockAll;
                let mut unlocked = 0;
                for row in self.stored_mappings(map)? {
                    let owner = row.mapping.lock_owner;
                    if !owner.is_no_lock() && (force || owner == token) {
                        self.set_lock_owner(
                            &child_key(map, row.mapping.id),
                            MappingLockToken::NO_LOCK,
                        )?;
                        unlocked += 1;
                    }
                }
                Ok(StoreResponse::affected(unlocked))
            }
        }
    }

    // ---- Operation log ----

    fn operation(&self, id: OperationId) -> StoreResult<Option<OperationRecord>> {
        self.get(tables::OPERATIONS, &id.to_string())
    }

    fn next_sequence(&self) -> StoreResult<u64> {
        let mut counters = self.txn.open_table(tables::COUNTERS)?;
        let current = counters
            .get(tables::OPERATION_SEQUENCE)?
            .map_or(0, |v| v.value());
        let next = current + 1;
        counters.insert(tables::OPERATION_SEQUENCE, next)?;
        Ok(next)
    }

    fn log_operation(&self, record: &OperationRecord) -> StoreResult<StoreResponse> {
        if let Some(existing) = self.operation(record.id)? {
            return Ok(StoreResponse::rows(StoreRows::Operations(vec![existing])));
        }
        let mut logged = record.clone();
        logged.sequence = self.next_sequence()?;
        logged.state = OperationState::LoggedGlobal;
        logged.logged_at_ms = now_ms();
        self.put(tables::OPERATIONS, &logged.id.to_string(), &logged)?;
        debug!(operation_id = %logged.id, kind = %logged.kind, sequence = logged.sequence, "logged operation");
        Ok(StoreResponse::rows(StoreRows::Operations(vec![logged])))
    }

    fn apply_global(&self, record: &OperationRecord) -> StoreResult<StoreResponse> {
        let Some(mut logged) = self.operation(record.id)? else {
            return Ok(StoreResponse::failure(
                ErrorCode::OperationAborted,
                format!("operation {} is no longer logged", record.id),
            ));
        };
        if logged.state.is_global_applied() {
            return Ok(StoreResponse::affected(0));
        }
        if logged.state.is_undoing() {
            return Ok(StoreResponse::failure(
                ErrorCode::OperationAborted,
                format!("operation {} is being undone", record.id),
            ));
        }
        if let Some(failure) = self.validate_global(&logged)? {
            return Ok(failure);
        }
        self.apply_global_change(&logged)?;
        logged.state = OperationState::AppliedGlobal;
        self.put(tables::OPERATIONS, &logged.id.to_string(), &logged)?;
        Ok(StoreResponse::affected(1))
    }

    fn validate_global(&self, record: &OperationRecord) -> StoreResult<Option<StoreResponse>> {
        let map = &record.shard_map;
        if let Some(failure) = self.missing_map(map.id)? {
            return Ok(Some(failure));
        }
        let pending = |what: String| {
            Some(StoreResponse::failure(
                ErrorCode::PendingOperation,
                format!("{what} is being changed by another operation"),
            ))
        };

        match &record.global {
            GlobalChange::AddShard { shard } => {
                let shards = self.stored_shards(map.id)?;
                if let Some(existing) = shards.iter().find(|s| s.shard.location == shard.location)
                {
                    if is_held_by_other(existing.pending.as_ref(), record.id) {
                        return Ok(pending(format!("shard {}", shard.location)));
                    }
                    return Ok(Some(StoreResponse::failure(
                        ErrorCode::ShardLocationAlreadyExists,
                        format!(
                            "shard location {} already exists in shard map '{}'",
                            shard.location, map.name
                        ),
                    )));
                }
                Ok(None)
            }
            GlobalChange::RemoveShard { shard } => {
                let stored =
                    self.get::<StoredShard>(tables::SHARDS, &child_key(map.id, shard.id))?;
                if let Some(row) = &stored
                    && is_held_by_other(row.pending.as_ref(), record.id)
                {
                    return Ok(pending(format!("shard {}", shard.location)));
                }
                let Some(stored) = stored.filter(|row| is_live(row.pending.as_ref())) else {
                    return Ok(Some(StoreResponse::failure(
                        ErrorCode::ShardDoesNotExist,
                        format!(
                            "shard {} does not exist in shard map '{}'",
                            shard.location, map.name
                        ),
                    )));
                };
                if stored.shard.version != shard.version {
                    return Ok(Some(StoreResponse::failure(
                        ErrorCode::ShardVersionMismatch,
                        format!(
                            "shard {} has version {}, expected {}",
                            shard.location, stored.shard.version, shard.version
                        ),
                    )));
                }
                let has_mappings = self
                    .stored_mappings(map.id)?
                    .iter()
                    .any(|row| row.mapping.shard.id == shard.id);
                if has_mappings {
                    return Ok(Some(StoreResponse::failure(
                        ErrorCode::ShardHasMappings,
                        format!("shard {} still has mappings", shard.location),
                    )));
                }
                Ok(None)
            }
            GlobalChange::ReplaceMappings {
                remove,
                add,
                lock_token,
                require_offline,
            } => {
                let rows = self.stored_mappings(map.id)?;
                for expected in remove {
                    let row = rows.iter().find(|r| r.mapping.id == expected.id);
                    if let Some(row) = row
                        && is_held_by_other(row.pending.as_ref(), record.id)
                    {
                        return Ok(pending(format!("mapping {}", expected.id)));
                    }
                    let Some(row) = row.filter(|r| is_live(r.pending.as_ref())) else {
                        return Ok(Some(StoreResponse::failure(
                            ErrorCode::MappingDoesNotExist,
                            format!(
                                "mapping {} does not exist in shard map '{}'",
                                expected.id, map.name
                            ),
                        )));
                    };
                    if row.mapping.version != expected.version {
                        return Ok(Some(StoreResponse::failure(
                            ErrorCode::MappingVersionMismatch,
                            format!(
                                "mapping {} has version {}, expected {}",
                                expected.id, row.mapping.version, expected.version
                            ),
                        )));
                    }
                    if row.mapping.lock_owner != *lock_token {
                        return Ok(Some(StoreResponse::failure(
                            ErrorCode::MappingLockOwnerIdDoesNotMatch,
                            format!(
                                "mapping {} is locked by {}, not by {lock_token}",
                                expected.id, row.mapping.lock_owner
                            ),
                        )));
                    }
                    if *require_offline && row.mapping.is_online() {
                        return Ok(Some(StoreResponse::failure(
                            ErrorCode::MappingIsNotOffline,
                            format!("mapping {} must be offline first", expected.id),
                        )));
                    }
                }

                let replaced: HashSet<MappingId> = remove.iter().map(|m| m.id).collect();
                let shards = self.stored_shards(map.id)?;
                for added in add {
                    if added.range.key_type() != map.key_type {
                        return Ok(Some(StoreResponse::failure(
                            ErrorCode::KeyTypeMismatch,
                            format!(
                                "mapping key type {} does not match shard map '{}' key type {}",
                                added.range.key_type(),
                                map.name,
                                map.key_type
                            ),
                        )));
                    }
                    let shard = shards
                        .iter()
                        .find(|s| s.shard.id == added.shard.id && is_live(s.pending.as_ref()));
                    let Some(shard) = shard else {
                        return Ok(Some(StoreResponse::failure(
                            ErrorCode::ShardDoesNotExist,
                            format!(
                                "shard {} does not exist in shard map '{}'",
                                added.shard.location, map.name
                            ),
                        )));
                    };
                    if is_held_by_other(shard.pending.as_ref(), record.id) {
                        return Ok(pending(format!("shard {}", added.shard.location)));
                    }
                    if shard.shard.version != added.shard.version {
                        return Ok(Some(StoreResponse::failure(
                            ErrorCode::ShardVersionMismatch,
                            format!(
                                "shard {} has version {}, expected {}",
                                added.shard.location, shard.shard.version, added.shard.version
                            ),
                        )));
                    }
                    let overlapping = rows.iter().filter(|r| {
                        !replaced.contains(&r.mapping.id)
                            && r.mapping.range.intersects(&added.range)
                    });
                    for row in overlapping {
                        if is_held_by_other(row.pending.as_ref(), record.id) {
                            return Ok(pending(format!("mapping {}", row.mapping.id)));
                        }
                        let code = match map.kind {
                            ShardMapKind::List => ErrorCode::MappingPointAlreadyMapped,
                            ShardMapKind::Range => ErrorCode::MappingRangeAlreadyMapped,
                        };
                        return Ok(Some(StoreResponse::failure(
                            code,
                            format!(
                                "{} is already mapped by mapping {} in shard map '{}'",
                                added.range, row.mapping.id, map.name
                            ),
                        )));
                    }
                }
                Ok(None)
            }
        }
    }

    fn apply_global_change(&self, record: &OperationRecord) -> StoreResult<()> {
        let map = record.shard_map.id;
        let marker = |removal| {
            Some(PendingMarker {
                operation_id: record.id,
                removal,
            })
        };
        match &record.global {
            GlobalChange::AddShard { shard } => {
                let row = StoredShard {
                    shard: shard.clone(),
                    pending: marker(false),
                };
                self.put(tables::SHARDS, &child_key(map, shard.id), &row)
            }
            GlobalChange::RemoveShard { shard } => {
                let key = child_key(map, shard.id);
                if let Some(mut row) = self.get::<StoredShard>(tables::SHARDS, &key)? {
                    row.pending = marker(true);
                    self.put(tables::SHARDS, &key, &row)?;
                }
                Ok(())
            }
            GlobalChange::ReplaceMappings { add, .. } => {
                for id in record.global.removed_mapping_ids() {
                    if let Some(mut row) = self.stored_mapping(map, id)? {
                        row.pending = marker(true);
                        self.put_mapping(&row)?;
                    }
                }
                for mapping in add {
                    self.put_mapping(&StoredMapping {
                        mapping: mapping.clone(),
                        pending: marker(false),
                    })?;
                }
                Ok(())
            }
        }
    }

    fn set_operation_state(
        &self,
        id: OperationId,
        state: OperationState,
    ) -> StoreResult<StoreResponse> {
        let Some(mut logged) = self.operation(id)? else {
            return Ok(StoreResponse::failure(
                ErrorCode::OperationAborted,
                format!("operation {id} is no longer logged"),
            ));
        };
        logged.state = state;
        self.put(tables::OPERATIONS, &id.to_string(), &logged)?;
        Ok(StoreResponse::affected(1))
    }

    fn complete_operation(&self, record: &OperationRecord) -> StoreResult<StoreResponse> {
        let Some(logged) = self.operation(record.id)? else {
            if self.after_state_visible(record)? {
                return Ok(StoreResponse::affected(0));
            }
            return Ok(StoreResponse::failure(
                ErrorCode::OperationAborted,
                format!("operation {} was rolled back", record.id),
            ));
        };
        if !logged.state.is_global_applied() {
            let code = if logged.state.is_undoing() {
                ErrorCode::OperationAborted
            } else {
                ErrorCode::IllegalState
            };
            return Ok(StoreResponse::failure(
                code,
                format!(
                    "operation {} cannot complete from state {}",
                    record.id, logged.state
                ),
            ));
        }

        let map = logged.shard_map.id;
        let own = |pending: Option<&PendingMarker>| {
            pending.is_some_and(|p| p.operation_id == logged.id)
        };
        match &logged.global {
            GlobalChange::AddShard { shard } => {
                let key = child_key(map, shard.id);
                if let Some(mut row) = self.get::<StoredShard>(tables::SHARDS, &key)?
                    && own(row.pending.as_ref())
                {
                    row.pending = None;
                    self.put(tables::SHARDS, &key, &row)?;
                }
            }
            GlobalChange::RemoveShard { shard } => {
                let key = child_key(map, shard.id);
                if let Some(row) = self.get::<StoredShard>(tables::SHARDS, &key)?
                    && own(row.pending.as_ref())
                {
                    self.remove(tables::SHARDS, &key)?;
                }
            }
            GlobalChange::ReplaceMappings { add, .. } => {
                for id in logged.global.removed_mapping_ids() {
                    if let Some(row) = self.stored_mapping(map, id)?
                        && own(row.pending.as_ref())
                    {
                        self.delete_mapping(map, id)?;
                    }
                }
                for mapping in add {
                    if let Some(mut row) = self.stored_mapping(map, mapping.id)?
                        && own(row.pending.as_ref())
                    {
                        row.pending = None;
                        self.put_mapping(&row)?;
                    }
                }
            }
        }
        self.remove(tables::OPERATIONS, &logged.id.to_string())?;
        Ok(StoreResponse::affected(1))
    }

    /// Whether the completed effect of an unlogged operation is in place
    fn after_state_visible(&self, record: &OperationRecord) -> StoreResult<bool> {
        let map = record.shard_map.id;
        let settled = |pending: Option<&PendingMarker>| {
            !pending.is_some_and(|p| p.operation_id == record.id)
        };
        match &record.global {
            GlobalChange::AddShard { shard } => Ok(self
                .get::<StoredShard>(tables::SHARDS, &child_key(map, shard.id))?
                .is_some_and(|row| settled(row.pending.as_ref()))),
            GlobalChange::RemoveShard { shard } => Ok(self
                .get::<StoredShard>(tables::SHARDS, &child_key(map, shard.id))?
                .is_none()),
            GlobalChange::ReplaceMappings { add, .. } => {
                for id in record.global.removed_mapping_ids() {
                    if self.stored_mapping(map, id)?.is_some() {
                        return Ok(false);
                    }
                }
                for mapping in add {
                    let visible = self
                        .stored_mapping(map, mapping.id)?
                        .is_some_and(|row| settled(row.pending.as_ref()));
                    if !visible {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    fn undo_global(&self, record: &OperationRecord) -> StoreResult<StoreResponse> {
        let Some(logged) = self.operation(record.id)? else {
            return Ok(StoreResponse::affected(0));
        };
        if logged.state.is_global_applied() || logged.state.is_undoing() {
            self.revert_global_change(&logged)?;
        }
        self.remove(tables::OPERATIONS, &logged.id.to_string())?;
        Ok(StoreResponse::affected(1))
    }

    fn revert_global_change(&self, record: &OperationRecord) -> StoreResult<()> {
        let map = record.shard_map.id;
        let own = |pending: Option<&PendingMarker>| {
            pending.is_some_and(|p| p.operation_id == record.id)
        };
        match &record.global {
            GlobalChange::AddShard { shard } => {
                let key = child_key(map, shard.id);
                if let Some(row) = self.get::<StoredShard>(tables::SHARDS, &key)?
                    && own(row.pending.as_ref())
                {
                    self.remove(tables::SHARDS, &key)?;
                }
            }
            GlobalChange::RemoveShard { shard } => {
                let key = child_key(map, shard.id);
                if let Some(mut row) = self.get::<StoredShard>(tables::SHARDS, &key)?
                    && own(row.pending.as_ref())
                {
                    row.pending = None;
                    self.put(tables::SHARDS, &key, &row)?;
                }
            }
            GlobalChange::ReplaceMappings { remove, add, .. } => {
                for mapping in add {
                    if let Some(row) = self.stored_mapping(map, mapping.id)?
                        && own(row.pending.as_ref())
                    {
                        self.delete_mapping(map, mapping.id)?;
                    }
                }
                for mapping in remove {
                    let restore = self
                        .stored_mapping(map, mapping.id)?
                        .is_none_or(|row| own(row.pending.as_ref()));
                    if restore {
                        self.put_mapping(&StoredMapping {
                            mapping: mapping.clone(),
                            pending: None,
                        })?;
                    }
                }
            }
        }
        Ok(())
    }

    // ---- Schema info ----

    fn schema_infos(&self, name: Option<&String>) -> StoreResult<StoreResponse> {
        let table = self.txn.open_table(tables::SCHEMA_INFO)?;
        let mut infos = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value();
            if name.is_none_or(|n| n == key) {
                infos.push((key.to_string(), entry.1.value().to_string()));
            }
        }
        Ok(StoreResponse::rows(StoreRows::SchemaInfos(infos)))
    }

    fn put_schema_info(&self, name: &str, xml: &str, replace: bool) -> StoreResult<StoreResponse> {
        let mut table = self.txn.open_table(tables::SCHEMA_INFO)?;
        let exists = table.get(name)?.is_some();
        if exists && !replace {
            return Ok(StoreResponse::failure(
                ErrorCode::SchemaInfoNameConflict,
                format!("schema info '{name}' already exists"),
            ));
        }
        if !exists && replace {
            return Ok(StoreResponse::failure(
                ErrorCode::SchemaInfoNameDoesNotExist,
                format!("schema info '{name}' does not exist"),
            ));
        }
        table.insert(name, xml)?;
        Ok(StoreResponse::affected(1))
    }

    fn remove_schema_info(&self, name: &str) -> StoreResult<StoreResponse> {
        let mut table = self.txn.open_table(tables::SCHEMA_INFO)?;
        if table.remove(name)?.is_none() {
            return Ok(StoreResponse::failure(
                ErrorCode::SchemaInfoNameDoesNotExist,
                format!("schema info '{name}' does not exist"),
            ));
        }
        Ok(StoreResponse::affected(1))
    }
}
