//! Error taxonomy for the state/execution core.
//!
//! Every failure maps to exactly one [`ErrorKind`], so callers can branch
//! on the kind alone. Execution errors are never returned from the engine
//! loop; they are recorded on the slot as a [`SlotError`] and surfaced on
//! read.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::RowState;
use crate::ids::{SessionId, UnitId};
use crate::ledger::EventKind;
use crate::matrix::Permission;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Machine-readable error kind for logging and caller dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidSession,
    SessionAlreadyExists,
    UnitNotFound,
    UnitDeleted,
    ForeignUnit,
    InvalidPayload,
    SlotNotFound,
    SlotOccupied,
    SlotEmpty,
    UnitAlreadyCommitted,
    RowNotFound,
    RowFull,
    InvalidRowState,
    PermissionDenied,
    ExecutionTimeout,
    ExecutionFailure,
    VersionNotFound,
    RegistryConflict,
    ConfigError,
    CorruptLog,
    CheckpointNotFound,
    IoError,
    SerializationError,
    Poisoned,
}

impl ErrorKind {
    /// Machine-readable code for logging
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidSession => "INVALID_SESSION",
            Self::SessionAlreadyExists => "SESSION_ALREADY_EXISTS",
            Self::UnitNotFound => "UNIT_NOT_FOUND",
            Self::UnitDeleted => "UNIT_DELETED",
            Self::ForeignUnit => "FOREIGN_UNIT",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::SlotNotFound => "SLOT_NOT_FOUND",
            Self::SlotOccupied => "SLOT_OCCUPIED",
            Self::SlotEmpty => "SLOT_EMPTY",
            Self::UnitAlreadyCommitted => "UNIT_ALREADY_COMMITTED",
            Self::RowNotFound => "ROW_NOT_FOUND",
            Self::RowFull => "ROW_FULL",
            Self::InvalidRowState => "INVALID_ROW_STATE",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ExecutionTimeout => "EXECUTION_TIMEOUT",
            Self::ExecutionFailure => "EXECUTION_FAILURE",
            Self::VersionNotFound => "VERSION_NOT_FOUND",
            Self::RegistryConflict => "REGISTRY_CONFLICT",
            Self::ConfigError => "CONFIG_ERROR",
            Self::CorruptLog => "CORRUPT_LOG",
            Self::CheckpointNotFound => "CHECKPOINT_NOT_FOUND",
            Self::IoError => "IO_ERROR",
            Self::SerializationError => "SERIALIZATION_ERROR",
            Self::Poisoned => "POISONED",
        }
    }

    /// Fatal kinds mean the in-memory state can no longer be trusted.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::CorruptLog | Self::Poisoned)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid session {session_id}: {reason}")]
    InvalidSession {
        session_id: SessionId,
        reason: &'static str,
    },

    #[error("session already exists: {session_id}")]
    SessionAlreadyExists { session_id: SessionId },

    #[error("unit not found: {unit_id}")]
    UnitNotFound { unit_id: UnitId },

    #[error("unit deleted: {unit_id}")]
    UnitDeleted { unit_id: UnitId },

    #[error("unit {unit_id} belongs to session {owner}")]
    ForeignUnit { unit_id: UnitId, owner: SessionId },

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: EventKind, reason: String },

    #[error("slot not found: {address}")]
    SlotNotFound { address: String },

    #[error("slot {address} is occupied by {occupant}")]
    SlotOccupied { address: String, occupant: UnitId },

    #[error("slot {address} is empty")]
    SlotEmpty { address: String },

    #[error("unit {unit_id} is already committed at {address}")]
    UnitAlreadyCommitted { unit_id: UnitId, address: String },

    #[error("row not found: {row_id}")]
    RowNotFound { row_id: String },

    #[error("row {row_id} has no free slot")]
    RowFull { row_id: String },

    #[error("cannot {action} row {row_id} while {state}")]
    InvalidRowState {
        row_id: String,
        state: RowState,
        action: &'static str,
    },

    #[error("{permission} denied on slot {address}")]
    PermissionDenied {
        address: String,
        permission: Permission,
    },

    #[error("execution timed out after {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },

    #[error("execution failed: {message}")]
    ExecutionFailure { message: String },

    #[error("unit {unit_id} has no version {version}")]
    VersionNotFound { unit_id: UnitId, version: u64 },

    #[error("registry conflict: {message}")]
    RegistryConflict { message: String },

    #[error("config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("corrupt log: {message}")]
    CorruptLog { message: String },

    #[error("checkpoint not found: {path}")]
    CheckpointNotFound { path: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("lock poisoned: {what}")]
    Poisoned { what: &'static str },
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSession { .. } => ErrorKind::InvalidSession,
            Self::SessionAlreadyExists { .. } => ErrorKind::SessionAlreadyExists,
            Self::UnitNotFound { .. } => ErrorKind::UnitNotFound,
            Self::UnitDeleted { .. } => ErrorKind::UnitDeleted,
            Self::ForeignUnit { .. } => ErrorKind::ForeignUnit,
            Self::InvalidPayload { .. } => ErrorKind::InvalidPayload,
            Self::SlotNotFound { .. } => ErrorKind::SlotNotFound,
            Self::SlotOccupied { .. } => ErrorKind::SlotOccupied,
            Self::SlotEmpty { .. } => ErrorKind::SlotEmpty,
            Self::UnitAlreadyCommitted { .. } => ErrorKind::UnitAlreadyCommitted,
            Self::RowNotFound { .. } => ErrorKind::RowNotFound,
            Self::RowFull { .. } => ErrorKind::RowFull,
            Self::InvalidRowState { .. } => ErrorKind::InvalidRowState,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::ExecutionTimeout { .. } => ErrorKind::ExecutionTimeout,
            Self::ExecutionFailure { .. } => ErrorKind::ExecutionFailure,
            Self::VersionNotFound { .. } => ErrorKind::VersionNotFound,
            Self::RegistryConflict { .. } => ErrorKind::RegistryConflict,
            Self::Config { .. } => ErrorKind::ConfigError,
            Self::CorruptLog { .. } => ErrorKind::CorruptLog,
            Self::CheckpointNotFound { .. } => ErrorKind::CheckpointNotFound,
            Self::Io(_) => ErrorKind::IoError,
            Self::Serialization(_) => ErrorKind::SerializationError,
            Self::Poisoned { .. } => ErrorKind::Poisoned,
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn corrupt_log(message: impl Into<String>) -> Self {
        Self::CorruptLog {
            message: message.into(),
        }
    }

    pub fn invalid_payload(kind: EventKind, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            kind,
            reason: reason.into(),
        }
    }
}

/// Execution error as stored on a slot and returned by `read_output`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SlotError {
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::from(&CoreError::ExecutionTimeout { timeout_ms })
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ExecutionFailure,
            message: message.into(),
        }
    }
}

impl From<&CoreError> for SlotError {
    fn from(err: &CoreError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for SlotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Lock helpers that turn poisoning into a fatal [`CoreError`].
pub(crate) mod sync {
    use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

    use super::{CoreError, Result};

    pub(crate) fn lock<'a, T>(
        mutex: &'a Mutex<T>,
        what: &'static str,
    ) -> Result<MutexGuard<'a, T>> {
        mutex.lock().map_err(|_| CoreError::Poisoned { what })
    }

    pub(crate) fn read<'a, T>(
        lock: &'a RwLock<T>,
        what: &'static str,
    ) -> Result<RwLockReadGuard<'a, T>> {
        lock.read().map_err(|_| CoreError::Poisoned { what })
    }

    pub(crate) fn write<'a, T>(
        lock: &'a RwLock<T>,
        what: &'static str,
    ) -> Result<RwLockWriteGuard<'a, T>> {
        lock.write().map_err(|_| CoreError::Poisoned { what })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        let err = CoreError::SlotOccupied {
            address: "a1".to_string(),
            occupant: UnitId::from("u1"),
        };
        assert_eq!(err.kind(), ErrorKind::SlotOccupied);
        assert_eq!(err.kind().as_str(), "SLOT_OCCUPIED");
        assert_eq!(err.to_string(), "slot a1 is occupied by u1");
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(CoreError::corrupt_log("bad seq").kind().is_fatal());
        assert!(!CoreError::ExecutionTimeout { timeout_ms: 5 }.kind().is_fatal());
    }

    #[test]
    fn test_slot_error_from_timeout() {
        let err = SlotError::timeout(250);
        assert_eq!(err.kind, ErrorKind::ExecutionTimeout);
        assert_eq!(err.message, "execution timed out after 250ms");
    }
}
