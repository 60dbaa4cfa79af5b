//! State/execution core of the slotgrid workbench.
//!
//! An append-only event log reconstructs program state by replay; an
//! execution matrix of addressable slots runs committed code units across
//! independent per-runtime rows, swapping in new versions between
//! executions without stopping the row.
//!
//! - [`ledger`]: per-session event log (single writer of truth)
//! - [`snapshot`]: folds a unit's entries into its current state
//! - [`registry`]: permanent runtime identifiers
//! - [`matrix`]: slots, dual addressing, permission gate, subscriptions
//! - [`engine`]: per-row scheduler with hot-swap
//! - [`grid`]: the owning [`SlotGrid`] facade
//!
//! The core never parses or generates source code; executors plugged into
//! the [`executor::ExecutorTable`] do the language-specific work.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod grid;
pub mod ids;
pub mod ledger;
pub mod matrix;
pub mod registry;
pub mod snapshot;

pub use checkpoint::CheckpointStore;
pub use config::{CoreConfig, RowConfig};
pub use engine::{RowState, TickReport};
pub use error::{CoreError, ErrorKind, Result, SlotError};
pub use events::SlotEvent;
pub use executor::{Executor, ExecutorError, ExecutorTable, FnExecutor, LoadRequest, LoadedCode};
pub use grid::{SlotGrid, UnitSpec};
pub use ids::{ConnectionId, RequestId, SessionId, UnitId};
pub use ledger::{
    AppendRequest, EventKind, EventLog, ExecutionBatch, LogEntry, LogExport, UnitExecuted, UnitKind,
};
pub use matrix::{
    ExecutionRecord, MatrixExport, Permission, PermissionGroup, PermissionSet, SlotAddress,
    SlotView,
};
pub use registry::{IdentifierRegistry, RegistryBuilder, RuntimeCategory, RuntimeId};
pub use snapshot::{Materializer, UnitSnapshot};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
