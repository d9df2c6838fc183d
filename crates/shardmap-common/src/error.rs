//! Error types for shard map management
//!
//! Every failure surfaced to callers carries a category (what kind of
//! problem it is) and a specific code (which rule was violated), so callers
//! can tell "already exists" apart from "must be offline first" without
//! parsing messages.

use std::fmt;
use thiserror::Error;

/// Common result type for shard map management operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The entity being created already exists
    AlreadyExists,
    /// The entity being looked up does not exist
    NotFound,
    /// The mutation requires a prior state that does not hold
    Precondition,
    /// Store schema version is incompatible with this library
    VersionMismatch,
    /// Mapping lock is owned by someone else
    LockConflict,
    /// Connectivity or timeout problem that outlived the retry budget
    Transient,
    /// Malformed input, never retried
    ArgumentInvalid,
    /// Storage engine or encoding failure
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AlreadyExists => "already-exists",
            Self::NotFound => "not-found",
            Self::Precondition => "precondition",
            Self::VersionMismatch => "version-mismatch",
            Self::LockConflict => "lock-conflict",
            Self::Transient => "transient",
            Self::ArgumentInvalid => "argument-invalid",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Specific failure code
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Already exists
    ShardMapAlreadyExists,
    ShardLocationAlreadyExists,
    MappingPointAlreadyMapped,
    MappingRangeAlreadyMapped,
    SchemaInfoNameConflict,

    // Not found
    ShardMapDoesNotExist,
    ShardMapLookupFailure,
    ShardDoesNotExist,
    MappingNotFoundForKey,
    SchemaInfoNameDoesNotExist,
    GlobalStoreNotDeployed,
    LocalStoreNotDeployed,

    // Precondition
    MappingDoesNotExist,
    MappingIsNotOffline,
    MappingVersionMismatch,
    ShardVersionMismatch,
    ShardHasMappings,
    ShardMapHasShards,
    OperationAborted,

    // Version
    GlobalStoreVersionMismatch,
    LocalStoreVersionMismatch,

    // Locking
    MappingLockOwnerIdDoesNotMatch,
    MappingIsAlreadyLocked,

    // Transient
    StoreUnreachable,
    StoreTimeout,
    PendingOperation,

    // Arguments
    InvalidArgument,
    KeyTypeMismatch,
    ShardMapKindMismatch,
    IllegalState,

    // Internal
    StorageFailure,
    Serialization,
}

impl ErrorCode {
    /// Category this code belongs to
    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self {
            Self::ShardMapAlreadyExists
            | Self::ShardLocationAlreadyExists
            | Self::MappingPointAlreadyMapped
            | Self::MappingRangeAlreadyMapped
            | Self::SchemaInfoNameConflict => ErrorCategory::AlreadyExists,

            Self::ShardMapDoesNotExist
            | Self::ShardMapLookupFailure
            | Self::ShardDoesNotExist
            | Self::MappingNotFoundForKey
            | Self::SchemaInfoNameDoesNotExist
            | Self::GlobalStoreNotDeployed
            | Self::LocalStoreNotDeployed => ErrorCategory::NotFound,

            Self::MappingDoesNotExist
            | Self::MappingIsNotOffline
            | Self::MappingVersionMismatch
            | Self::ShardVersionMismatch
            | Self::ShardHasMappings
            | Self::ShardMapHasShards
            | Self::OperationAborted => ErrorCategory::Precondition,

            Self::GlobalStoreVersionMismatch | Self::LocalStoreVersionMismatch => {
                ErrorCategory::VersionMismatch
            }

            Self::MappingLockOwnerIdDoesNotMatch | Self::MappingIsAlreadyLocked => {
                ErrorCategory::LockConflict
            }

            Self::StoreUnreachable | Self::StoreTimeout | Self::PendingOperation => {
                ErrorCategory::Transient
            }

            Self::InvalidArgument
            | Self::KeyTypeMismatch
            | Self::ShardMapKindMismatch
            | Self::IllegalState => ErrorCategory::ArgumentInvalid,

            Self::StorageFailure | Self::Serialization => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Categorized shard map management error
#[derive(Debug, Error)]
#[error("{code} ({category}): {message}")]
pub struct Error {
    category: ErrorCategory,
    code: ErrorCode,
    message: String,
}

impl Error {
    /// Create an error for the given code
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            category: code.category(),
            code,
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, msg)
    }

    /// Create an illegal state error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::IllegalState, msg)
    }

    /// Create a storage failure error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::StorageFailure, msg)
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Serialization, msg)
    }

    /// Failure category
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.category
    }

    /// Specific failure code
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Human readable description naming the entity involved
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category == ErrorCategory::Transient
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.category == ErrorCategory::NotFound
    }
}
