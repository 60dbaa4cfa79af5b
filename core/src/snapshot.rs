//! Snapshot materializer: derives unit state by folding log entries.
//!
//! A fold only depends on the entries it is given, so recomputing from the
//! same log prefix always yields an identical snapshot. Latest-state reads
//! resume from a cached fold; historical reads below the cache point fold
//! from scratch.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::sync::lock;
use crate::error::{CoreError, Result};
use crate::ids::{ConnectionId, SessionId, UnitId};
use crate::ledger::{
    CodeEdited, EventKind, EventLog, KindChanged, LogEntry, ParamsChanged, Port, PortsChanged,
    RuntimeChanged, UnitCreated, UnitKind,
};
use crate::registry::RuntimeId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ports {
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFlags {
    pub modified: bool,
    pub converted: bool,
    pub connected: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub import_order: Option<u32>,
    pub creation_order: Option<u64>,
    pub source_ref: Option<String>,
}

/// One entry of a unit's code history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeVersion {
    pub version: u64,
    pub code: String,
    pub runtime_id: RuntimeId,
    pub sequence_number: u64,
    pub reason: String,
    pub code_hash: String,
}

impl CodeVersion {
    fn new(
        version: u64,
        code: &str,
        runtime_id: RuntimeId,
        sequence_number: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            version,
            code: code.to_string(),
            runtime_id,
            sequence_number,
            reason: reason.into(),
            code_hash: code_hash(code),
        }
    }
}

/// Hex SHA-256 of a code body.
pub fn code_hash(code: &str) -> String {
    Sha256::digest(code.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Derived state of one unit as of a log position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSnapshot {
    pub unit_id: UnitId,
    pub session_id: SessionId,
    pub unit_kind: UnitKind,
    pub display_name: String,
    pub original_runtime_id: RuntimeId,
    pub current_runtime_id: RuntimeId,
    pub original_code: String,
    pub current_code: String,
    pub version: u64,
    pub parameters: BTreeMap<String, Value>,
    pub ports: Ports,
    pub flags: UnitFlags,
    pub provenance: Provenance,
    pub connections: BTreeSet<ConnectionId>,
    pub code_history: Vec<CodeVersion>,
    /// Sequence number of the last entry folded into this snapshot.
    pub as_of_sequence: u64,
}

impl UnitSnapshot {
    pub fn code_at(&self, version: u64) -> Option<&CodeVersion> {
        self.code_history.iter().find(|v| v.version == version)
    }

    fn seed(entry: &LogEntry, unit_id: UnitId, created: UnitCreated) -> Self {
        let runtime = entry.source_runtime_id.unwrap_or(RuntimeId::UNKNOWN);
        Self {
            unit_id,
            session_id: entry.session_id.clone(),
            unit_kind: created.unit_kind,
            display_name: created.display_name,
            original_runtime_id: runtime,
            current_runtime_id: runtime,
            original_code: created.source_code.clone(),
            code_history: vec![CodeVersion::new(
                1,
                &created.source_code,
                runtime,
                entry.sequence_number,
                "created",
            )],
            current_code: created.source_code,
            version: 1,
            parameters: created.parameters,
            ports: Ports {
                inputs: created.inputs,
                outputs: created.outputs,
            },
            flags: UnitFlags::default(),
            provenance: Provenance {
                import_order: entry.import_order,
                creation_order: entry.creation_order,
                source_ref: created.source_ref,
            },
            connections: BTreeSet::new(),
            as_of_sequence: entry.sequence_number,
        }
    }

    fn replace_code(&mut self, code: String, sequence_number: u64, reason: impl Into<String>) {
        self.version += 1;
        self.code_history.push(CodeVersion::new(
            self.version,
            &code,
            self.current_runtime_id,
            sequence_number,
            reason,
        ));
        self.current_code = code;
    }
}

#[derive(Debug, Clone, Default)]
struct Fold {
    snapshot: Option<UnitSnapshot>,
    deleted: bool,
    last_sequence: u64,
}

impl Fold {
    fn apply(&mut self, unit_id: &UnitId, entry: &LogEntry) -> Result<()> {
        self.last_sequence = entry.sequence_number;
        if self.deleted {
            return Ok(());
        }
        if entry.kind == EventKind::UnitCreated {
            if self.snapshot.is_none() {
                let created: UnitCreated = entry.decode()?;
                self.snapshot = Some(UnitSnapshot::seed(entry, unit_id.clone(), created));
            }
            return Ok(());
        }
        // Anything before the seed is ignored.
        let Some(snapshot) = self.snapshot.as_mut() else {
            return Ok(());
        };
        snapshot.as_of_sequence = entry.sequence_number;

        match entry.kind {
            EventKind::CodeEdited => {
                let edit: CodeEdited = entry.decode()?;
                let reason = if edit.reason.is_empty() {
                    "edit".to_string()
                } else {
                    edit.reason
                };
                snapshot.replace_code(edit.new_code, entry.sequence_number, reason);
                snapshot.flags.modified = true;
            }
            EventKind::ParamsChanged => {
                let change: ParamsChanged = entry.decode()?;
                snapshot.parameters = change.parameters;
                snapshot.flags.modified = true;
            }
            EventKind::PortsChanged => {
                let change: PortsChanged = entry.decode()?;
                snapshot.ports = Ports {
                    inputs: change.inputs,
                    outputs: change.outputs,
                };
                snapshot.flags.modified = true;
            }
            EventKind::KindChanged => {
                let change: KindChanged = entry.decode()?;
                snapshot.unit_kind = change.unit_kind;
                snapshot.flags.modified = true;
            }
            EventKind::RuntimeChanged => {
                let change: RuntimeChanged = entry.decode()?;
                if let Some(target) = entry.target_runtime_id {
                    snapshot.current_runtime_id = target;
                }
                snapshot.flags.converted = true;
                if let Some(code) = change.new_code {
                    let reason = format!("converted_to_{}", snapshot.current_runtime_id);
                    snapshot.replace_code(code, entry.sequence_number, reason);
                }
            }
            EventKind::ConnectionCreated => {
                if let Some(id) = &entry.connection_id {
                    snapshot.connections.insert(id.clone());
                }
                snapshot.flags.connected = !snapshot.connections.is_empty();
            }
            EventKind::ConnectionDeleted => {
                if let Some(id) = &entry.connection_id {
                    snapshot.connections.remove(id);
                }
                snapshot.flags.connected = !snapshot.connections.is_empty();
            }
            EventKind::UnitDeleted => self.deleted = true,
            _ => {}
        }
        Ok(())
    }

    fn into_snapshot(self, unit_id: &UnitId) -> Result<UnitSnapshot> {
        if self.deleted {
            return Err(CoreError::UnitDeleted {
                unit_id: unit_id.clone(),
            });
        }
        self.snapshot.ok_or_else(|| CoreError::UnitNotFound {
            unit_id: unit_id.clone(),
        })
    }
}

pub struct Materializer {
    log: Arc<EventLog>,
    cache: Mutex<HashMap<UnitId, Fold>>,
}

impl Materializer {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self {
            log,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of `unit_id`, or its state as of `as_of` when given.
    pub fn get_snapshot(&self, unit_id: &UnitId, as_of: Option<u64>) -> Result<UnitSnapshot> {
        self.fold(unit_id, as_of)?.into_snapshot(unit_id)
    }

    pub fn latest_version(&self, unit_id: &UnitId) -> Result<u64> {
        Ok(self.get_snapshot(unit_id, None)?.version)
    }

    pub fn code_at(&self, unit_id: &UnitId, version: u64) -> Result<CodeVersion> {
        let snapshot = self.get_snapshot(unit_id, None)?;
        snapshot
            .code_at(version)
            .cloned()
            .ok_or_else(|| CoreError::VersionNotFound {
                unit_id: unit_id.clone(),
                version,
            })
    }

    /// Live units of a session, ordered by import then creation order.
    pub fn active_snapshots(&self, session_id: &SessionId) -> Result<Vec<UnitSnapshot>> {
        let mut snapshots = Vec::new();
        for unit_id in self.log.units_in_session(session_id)? {
            match self.get_snapshot(&unit_id, None) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(CoreError::UnitDeleted { .. } | CoreError::UnitNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        snapshots.sort_by_key(|s| {
            (
                s.provenance.import_order.unwrap_or(0),
                s.provenance.creation_order.unwrap_or(u64::MAX),
            )
        });
        Ok(snapshots)
    }

    fn fold(&self, unit_id: &UnitId, as_of: Option<u64>) -> Result<Fold> {
        let cached = lock(&self.cache, "snapshot cache")?.get(unit_id).cloned();
        let base = match (cached, as_of) {
            (Some(fold), None) => fold,
            (Some(fold), Some(limit)) if fold.last_sequence <= limit => fold,
            _ => Fold::default(),
        };

        let mut fold = base;
        for entry in self.log.unit_entries(unit_id, fold.last_sequence, as_of)? {
            fold.apply(unit_id, &entry)?;
        }

        if as_of.is_none() {
            let mut cache = lock(&self.cache, "snapshot cache")?;
            let stale = cache
                .get(unit_id)
                .is_none_or(|existing| existing.last_sequence < fold.last_sequence);
            if stale {
                cache.insert(unit_id.clone(), fold.clone());
            }
        }
        Ok(fold)
    }
}
