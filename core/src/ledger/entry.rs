//! Log entry types and the typed payloads of unit-affecting events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::ids::{ConnectionId, SessionId, UnitId};
use crate::registry::RuntimeId;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    SessionCreated,
    SessionClosed,
    FileImported,
    RepositoryImported,
    UnitCreated,
    UnitDeleted,
    UnitMoved,
    CodeEdited,
    ParamsChanged,
    RuntimeChanged,
    KindChanged,
    PortsChanged,
    ConnectionCreated,
    ConnectionDeleted,
    ExportStarted,
    ExportCompleted,
    UnitExecuted,
    ExecutionBatch,
}

impl EventKind {
    /// Kinds folded by the materializer; these must name a unit.
    pub fn targets_unit(self) -> bool {
        matches!(
            self,
            Self::UnitCreated
                | Self::UnitDeleted
                | Self::UnitMoved
                | Self::CodeEdited
                | Self::ParamsChanged
                | Self::RuntimeChanged
                | Self::KindChanged
                | Self::PortsChanged
                | Self::UnitExecuted
        )
    }

    pub fn is_connection(self) -> bool {
        matches!(self, Self::ConnectionCreated | Self::ConnectionDeleted)
    }
}

/// One immutable record of the append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_id: String,
    pub session_id: SessionId,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<UnitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_runtime_id: Option<RuntimeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_runtime_id: Option<RuntimeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_order: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

impl LogEntry {
    pub fn entry_id_for(session_id: &SessionId, sequence_number: u64) -> String {
        format!("{session_id}-{sequence_number}")
    }

    /// Decode the payload into its typed form. A stored entry that fails
    /// to decode means the log itself is damaged.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            CoreError::corrupt_log(format!(
                "entry {} ({}) has malformed payload: {e}",
                self.entry_id, self.kind
            ))
        })
    }
}

/// Builder for a new entry; the log fills in sequence, id and timestamp.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub kind: EventKind,
    pub unit_id: Option<UnitId>,
    pub connection_id: Option<ConnectionId>,
    pub source_runtime_id: Option<RuntimeId>,
    pub target_runtime_id: Option<RuntimeId>,
    pub import_order: Option<u32>,
    pub payload: Value,
}

impl AppendRequest {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            unit_id: None,
            connection_id: None,
            source_runtime_id: None,
            target_runtime_id: None,
            import_order: None,
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn unit(mut self, unit_id: UnitId) -> Self {
        self.unit_id = Some(unit_id);
        self
    }

    pub fn connection(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = Some(connection_id);
        self
    }

    pub fn source_runtime(mut self, runtime_id: RuntimeId) -> Self {
        self.source_runtime_id = Some(runtime_id);
        self
    }

    pub fn target_runtime(mut self, runtime_id: RuntimeId) -> Self {
        self.target_runtime_id = Some(runtime_id);
        self
    }

    pub fn import_order(mut self, import_order: Option<u32>) -> Self {
        self.import_order = import_order;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn typed_payload<T: Serialize>(self, payload: &T) -> Result<Self> {
        Ok(self.payload(serde_json::to_value(payload)?))
    }

    /// Reject requests whose shape the materializer could not fold.
    pub(crate) fn validate(&self) -> Result<()> {
        let kind = self.kind;
        if kind.targets_unit() && self.unit_id.is_none() {
            return Err(CoreError::invalid_payload(kind, "unit_id is required"));
        }
        if kind.is_connection() && self.connection_id.is_none() {
            return Err(CoreError::invalid_payload(kind, "connection_id is required"));
        }
        match kind {
            EventKind::UnitCreated => {
                if self.source_runtime_id.is_none() {
                    return Err(CoreError::invalid_payload(kind, "source_runtime_id is required"));
                }
                self.check::<UnitCreated>()
            }
            EventKind::CodeEdited => self.check::<CodeEdited>(),
            EventKind::ParamsChanged => self.check::<ParamsChanged>(),
            EventKind::PortsChanged => self.check::<PortsChanged>(),
            EventKind::KindChanged => self.check::<KindChanged>(),
            EventKind::ConnectionCreated => self.check::<ConnectionCreated>(),
            EventKind::RuntimeChanged => {
                if self.target_runtime_id.is_none() {
                    return Err(CoreError::invalid_payload(kind, "target_runtime_id is required"));
                }
                self.check::<RuntimeChanged>()
            }
            EventKind::UnitExecuted => self.check::<UnitExecuted>(),
            EventKind::ExecutionBatch => self.check::<ExecutionBatch>(),
            _ => Ok(()),
        }
    }

    fn check<T: DeserializeOwned>(&self) -> Result<()> {
        serde_json::from_value::<T>(self.payload.clone())
            .map(|_| ())
            .map_err(|e| CoreError::invalid_payload(self.kind, e.to_string()))
    }
}

// ── Payloads ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Function,
    AsyncFunction,
    Class,
    Method,
    Variable,
    Import,
    Module,
    Script,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

impl Port {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitCreated {
    pub unit_kind: UnitKind,
    pub display_name: String,
    pub source_code: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub inputs: Vec<Port>,
    #[serde(default)]
    pub outputs: Vec<Port>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeEdited {
    pub new_code: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamsChanged {
    pub parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortsChanged {
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeChanged {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindChanged {
    pub unit_kind: UnitKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCreated {
    pub source_unit: UnitId,
    pub source_port: String,
    pub target_unit: UnitId,
    pub target_port: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitExecuted {
    pub address: String,
    pub version: u64,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Several executions recorded as one unit of work, such as a row tick or
/// a run-all request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionBatch {
    pub unit_ids: Vec<UnitId>,
    pub success: bool,
    pub total_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
