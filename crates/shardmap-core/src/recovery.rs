//! Recovery of interrupted operations and local mirror repair
//!
//! The operation log is scanned in sequence order. Operations whose global
//! change is applied are rolled forward; everything else is rolled back.
//! Deleting the log entry is the commit point, so a scan can be re-run at
//! any time.

use crate::client::StoreClient;
use crate::executor::{OperationExecutor, Resolution};
use shardmap_common::{
    Mapping, MappingLockToken, Result, Shard, ShardLocation, ShardMap,
};
use shardmap_store::schema::{BASE_VERSION, LOCAL_MAPPINGS_VERSION};
use shardmap_store::StoreRequest;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info};

/// Outcome counts of one recovery scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub rolled_forward: usize,
    pub rolled_back: usize,
    /// Logged too recently to be considered abandoned
    pub skipped: usize,
    pub failed: usize,
}

impl RecoveryReport {
    #[must_use]
    pub const fn resolved(&self) -> usize {
        self.rolled_forward + self.rolled_back
    }
}

/// Mapping rows of one shard that differ between the global and local store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingDifferences {
    pub shard_map: ShardMap,
    pub shard: Shard,
    pub only_in_global: Vec<Mapping>,
    pub only_in_local: Vec<Mapping>,
    /// Global row first, local row second
    pub mismatched: Vec<(Mapping, Mapping)>,
}

impl MappingDifferences {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.only_in_global.is_empty() && self.only_in_local.is_empty() && self.mismatched.is_empty()
    }
}

pub struct RecoveryManager<'a> {
    client: &'a StoreClient,
    min_age: Duration,
}

impl<'a> RecoveryManager<'a> {
    #[must_use]
    pub const fn new(client: &'a StoreClient, min_age: Duration) -> Self {
        Self { client, min_age }
    }

    /// Resolve every logged operation older than the minimum age
    ///
    /// Failures are counted and logged; the scan goes on with the next
    /// operation and a later scan retries the failed ones.
    pub fn recover_pending_operations(&self) -> Result<RecoveryReport> {
        let pending = self
            .client
            .global(
                "list pending operations",
                BASE_VERSION,
                StoreRequest::GetOperations,
            )?
            .into_operations();
        let executor = OperationExecutor::new(self.client);
        let now = now_ms();
        let min_age = u64::try_from(self.min_age.as_millis()).unwrap_or(u64::MAX);
        let mut report = RecoveryReport::default();

        for record in &pending {
            if now.saturating_sub(record.logged_at_ms) < min_age {
                report.skipped += 1;
                continue;
            }
            match executor.resume(record) {
                Ok(Resolution::RolledForward) => report.rolled_forward += 1,
                Ok(Resolution::RolledBack) => report.rolled_back += 1,
                Err(err) => {
                    error!(
                        operation_id = %record.id,
                        kind = %record.kind,
                        state = %record.state,
                        shard_map = %record.shard_map.name,
                        error = %err,
                        "failed to recover operation"
                    );
                    report.failed += 1;
                }
            }
        }

        if !pending.is_empty() {
            info!(
                rolled_forward = report.rolled_forward,
                rolled_back = report.rolled_back,
                skipped = report.skipped,
                failed = report.failed,
                "recovery scan finished"
            );
        }
        Ok(report)
    }

    /// Shards hosted at `location`, paired with their shard maps
    fn shards_at(&self, location: &ShardLocation) -> Result<Vec<(ShardMap, Shard)>> {
        let maps = self
            .client
            .global("list shard maps", BASE_VERSION, StoreRequest::GetShardMaps)?
            .into_shard_maps();
        let mut hosted = Vec::new();
        for map in maps {
            let shards = self
                .client
                .global(
                    "find shard by location",
                    BASE_VERSION,
                    StoreRequest::FindShardByLocation {
                        map: map.id,
                        location: location.clone(),
                    },
                )?
                .into_shards();
            hosted.extend(shards.into_iter().map(|shard| (map.clone(), shard)));
        }
        Ok(hosted)
    }

    fn global_mappings(&self, map: &ShardMap, shard: &Shard) -> Result<Vec<Mapping>> {
        Ok(self
            .client
            .global(
                "read shard mappings",
                BASE_VERSION,
                StoreRequest::GetMappings {
                    map: map.id,
                    range: None,
                    shard: Some(shard.id),
                },
            )?
            .into_mappings())
    }

    /// Compare the global mappings of every shard at `location` with its local mirror
    ///
    /// Only shards with differences are returned.
    pub fn detect_mapping_differences(
        &self,
        location: &ShardLocation,
    ) -> Result<Vec<MappingDifferences>> {
        let mut differences = Vec::new();
        for (shard_map, shard) in self.shards_at(location)? {
            let global = self.global_mappings(&shard_map, &shard)?;
            let local = self
                .client
                .local(
                    "read local mappings",
                    location,
                    LOCAL_MAPPINGS_VERSION,
                    StoreRequest::GetLocalMappings {
                        map: shard_map.id,
                        shard: shard.id,
                    },
                )?
                .into_mappings();

            let mut local: HashMap<_, _> = local.into_iter().map(|m| (m.id, m)).collect();
            let mut diff = MappingDifferences {
                shard_map,
                shard,
                only_in_global: Vec::new(),
                only_in_local: Vec::new(),
                mismatched: Vec::new(),
            };
            for mapping in global {
                match local.remove(&mapping.id) {
                    None => diff.only_in_global.push(mapping),
                    Some(mirror) if without_lock(&mapping) != mirror => {
                        diff.mismatched.push((mapping, mirror));
                    }
                    Some(_) => {}
                }
            }
            diff.only_in_local = local.into_values().collect();
            diff.only_in_local
                .sort_by(|a, b| a.range.low().cmp(b.range.low()));
            if !diff.is_empty() {
                differences.push(diff);
            }
        }
        Ok(differences)
    }

    /// Rewrite the local mirror of every shard at `location` from the global store
    ///
    /// Returns the number of mapping rows written.
    pub fn rebuild_local_mappings(&self, location: &ShardLocation) -> Result<u64> {
        let mut written = 0;
        for (shard_map, shard) in self.shards_at(location)? {
            let mappings = self.global_mappings(&shard_map, &shard)?;
            written += self
                .client
                .local(
                    "rebuild local mappings",
                    location,
                    LOCAL_MAPPINGS_VERSION,
                    StoreRequest::RebuildLocalMappings {
                        shard_map,
                        shard,
                        mappings,
                    },
                )?
                .affected;
        }
        info!(%location, mappings = written, "rebuilt local mappings");
        Ok(written)
    }
}

/// Local rows never carry lock owners
fn without_lock(mapping: &Mapping) -> Mapping {
    Mapping {
        lock_owner: MappingLockToken::NO_LOCK,
        ..mapping.clone()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
