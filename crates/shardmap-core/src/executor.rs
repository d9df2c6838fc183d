//! Operation state machine
//!
//! An operation is logged in the global store, applied there, applied to
//! each local store in order and then completed, which deletes the log
//! entry. A permanent failure after the global change rolls everything
//! back; if the rollback itself fails the log entry stays behind for
//! recovery.

use crate::client::StoreClient;
use shardmap_common::{Error, ErrorCode, Result, StoreVersion};
use shardmap_store::schema::{
    BASE_VERSION, GLOBAL_LOCKING_VERSION, GLOBAL_SCHEMA_INFO_VERSION, LOCAL_MAPPINGS_VERSION,
};
use shardmap_store::{
    LocalChange, LocalStep, OperationKind, OperationRecord, OperationState, StoreRequest,
};
use tracing::{debug, error, info, warn};

/// Minimum global store version an operation kind needs
#[must_use]
pub const fn global_min_version(kind: OperationKind) -> StoreVersion {
    match kind {
        OperationKind::LockMapping | OperationKind::UnlockMapping => GLOBAL_LOCKING_VERSION,
        OperationKind::AddSchemaInfo
        | OperationKind::ReplaceSchemaInfo
        | OperationKind::RemoveSchemaInfo => GLOBAL_SCHEMA_INFO_VERSION,
        _ => BASE_VERSION,
    }
}

/// Minimum local store version a local change needs
#[must_use]
pub const fn local_min_version(change: &LocalChange) -> StoreVersion {
    if change.touches_mappings() {
        LOCAL_MAPPINGS_VERSION
    } else {
        BASE_VERSION
    }
}

/// How recovery resolved a pending operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Remaining steps were applied and the operation completed
    RolledForward,
    /// The operation was undone
    RolledBack,
}

/// Runs operation records through their states
pub struct OperationExecutor<'a> {
    client: &'a StoreClient,
}

impl<'a> OperationExecutor<'a> {
    #[must_use]
    pub const fn new(client: &'a StoreClient) -> Self {
        Self { client }
    }

    /// Execute a new operation end to end
    pub fn execute(&self, record: OperationRecord) -> Result<()> {
        let min = global_min_version(record.kind);
        let record = self
            .client
            .global(
                "log operation",
                min,
                StoreRequest::LogOperation { record },
            )?
            .into_operations()
            .pop()
            .ok_or_else(|| Error::storage("operation log returned no record"))?;
        debug!(
            operation_id = %record.id,
            kind = %record.kind,
            shard_map = %record.shard_map.name,
            sequence = record.sequence,
            "operation logged"
        );

        if let Err(err) = self.client.global(
            "apply global change",
            min,
            StoreRequest::ApplyGlobal {
                record: record.clone(),
            },
        ) {
            debug!(operation_id = %record.id, error = %err, "global change rejected");
            self.discard(&record);
            return Err(err);
        }

        for (index, step) in record.local_steps.iter().enumerate() {
            if let Err(err) = self.apply_local(step) {
                warn!(
                    operation_id = %record.id,
                    location = %step.location,
                    error = %err,
                    "local step failed, undoing operation"
                );
                // A transient failure leaves the step's outcome unknown
                let attempted = if err.is_retryable() { index + 1 } else { index };
                self.undo(&record, attempted);
                return Err(err);
            }
            let applied = u32::try_from(index + 1).unwrap_or(u32::MAX);
            self.client.global(
                "record local progress",
                min,
                StoreRequest::SetOperationState {
                    id: record.id,
                    state: OperationState::AppliedLocal(applied),
                },
            )?;
        }

        self.client.global(
            "complete operation",
            min,
            StoreRequest::CompleteOperation {
                record: record.clone(),
            },
        )?;
        debug!(operation_id = %record.id, kind = %record.kind, "operation completed");
        Ok(())
    }

    /// Resolve a logged operation left behind by an interrupted run
    pub fn resume(&self, record: &OperationRecord) -> Result<Resolution> {
        match record.state {
            OperationState::Created
            | OperationState::LoggedGlobal
            | OperationState::UndoneCompleted => {
                self.client.global(
                    "discard operation",
                    global_min_version(record.kind),
                    StoreRequest::UndoGlobal {
                        record: record.clone(),
                    },
                )?;
                Ok(Resolution::RolledBack)
            }
            OperationState::AppliedGlobal | OperationState::AppliedLocal(_) => {
                self.roll_forward(record)
            }
            // Every local step is applied; only the log entry remains
            OperationState::Completed => {
                self.client.global(
                    "complete operation",
                    global_min_version(record.kind),
                    StoreRequest::CompleteOperation {
                        record: record.clone(),
                    },
                )?;
                Ok(Resolution::RolledForward)
            }
            OperationState::Undoing | OperationState::FailedPermanently => {
                self.roll_back(record)?;
                Ok(Resolution::RolledBack)
            }
        }
    }

    fn apply_local(&self, step: &LocalStep) -> Result<()> {
        self.client.local(
            "apply local step",
            &step.location,
            local_min_version(&step.apply),
            StoreRequest::ApplyLocal {
                change: step.apply.clone(),
            },
        )?;
        Ok(())
    }

    /// Whether a local change's end state already holds
    ///
    /// An undeployed local store holds no rows, so removals hold there.
    fn local_holds(&self, step: &LocalStep, change: &LocalChange) -> Result<bool> {
        let checked = self.client.local(
            "check local step",
            &step.location,
            local_min_version(change),
            StoreRequest::IsLocalApplied {
                change: change.clone(),
            },
        );
        match checked {
            Ok(response) => Ok(response.applied()),
            Err(err) if err.code() == ErrorCode::LocalStoreNotDeployed && *change == step.undo => {
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    /// Drop the log entry of an operation whose global change failed
    fn discard(&self, record: &OperationRecord) {
        if let Err(err) = self.client.global(
            "discard operation",
            global_min_version(record.kind),
            StoreRequest::UndoGlobal {
                record: record.clone(),
            },
        ) {
            error!(
                operation_id = %record.id,
                error = %err,
                "failed to discard operation, leaving it for recovery"
            );
        }
    }

    /// Undo the first `attempted` local steps and the global change
    fn undo(&self, record: &OperationRecord, attempted: usize) {
        let min = global_min_version(record.kind);
        let undone = self
            .client
            .global(
                "mark operation undoing",
                min,
                StoreRequest::SetOperationState {
                    id: record.id,
                    state: OperationState::Undoing,
                },
            )
            .and_then(|_| {
                for step in record.local_steps[..attempted].iter().rev() {
                    if !self.local_holds(step, &step.undo)? {
                        self.client.local(
                            "undo local step",
                            &step.location,
                            local_min_version(&step.undo),
                            StoreRequest::ApplyLocal {
                                change: step.undo.clone(),
                            },
                        )?;
                    }
                }
                self.client.global(
                    "undo global change",
                    min,
                    StoreRequest::UndoGlobal {
                        record: record.clone(),
                    },
                )
            });
        match undone {
            Ok(_) => info!(operation_id = %record.id, kind = %record.kind, "operation undone"),
            Err(err) => {
                error!(
                    operation_id = %record.id,
                    kind = %record.kind,
                    error = %err,
                    "undo failed, leaving operation for recovery"
                );
                if let Err(err) = self.client.global(
                    "mark operation failed",
                    min,
                    StoreRequest::SetOperationState {
                        id: record.id,
                        state: OperationState::FailedPermanently,
                    },
                ) {
                    warn!(
                        operation_id = %record.id,
                        error = %err,
                        "failed to mark operation failed, recovery will see it as undoing"
                    );
                }
            }
        }
    }

    /// Apply the remaining local steps and complete
    ///
    /// Steps the log records as applied are skipped; the rest are checked
    /// first since a crash may have hit between applying and recording.
    fn roll_forward(&self, record: &OperationRecord) -> Result<Resolution> {
        let min = global_min_version(record.kind);
        let recorded = usize::try_from(record.state.applied_local_steps()).unwrap_or(usize::MAX);
        for step in record.local_steps.iter().skip(recorded) {
            let applied = self
                .local_holds(step, &step.apply)
                .and_then(|holds| if holds { Ok(()) } else { self.apply_local(step) });
            match applied {
                Ok(()) => {}
                Err(err) if err.is_retryable() => return Err(err),
                Err(err) => {
                    warn!(
                        operation_id = %record.id,
                        location = %step.location,
                        error = %err,
                        "forward recovery failed, rolling back"
                    );
                    self.client.global(
                        "mark operation undoing",
                        min,
                        StoreRequest::SetOperationState {
                            id: record.id,
                            state: OperationState::Undoing,
                        },
                    )?;
                    self.roll_back(record)?;
                    return Ok(Resolution::RolledBack);
                }
            }
        }
        self.client.global(
            "complete operation",
            min,
            StoreRequest::CompleteOperation {
                record: record.clone(),
            },
        )?;
        Ok(Resolution::RolledForward)
    }

    fn roll_back(&self, record: &OperationRecord) -> Result<()> {
        for step in record.local_steps.iter().rev() {
            if !self.local_holds(step, &step.undo)? {
                self.client.local(
                    "undo local step",
                    &step.location,
                    local_min_version(&step.undo),
                    StoreRequest::ApplyLocal {
                        change: step.undo.clone(),
                    },
                )?;
            }
        }
        self.client.global(
            "undo global change",
            global_min_version(record.kind),
            StoreRequest::UndoGlobal {
                record: record.clone(),
            },
        )?;
        Ok(())
    }
}
