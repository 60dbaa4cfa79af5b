//! Execution matrix: one row per runtime engine, fixed slots per row.
//!
//! All slots are created when the matrix is built and live for its whole
//! lifetime, so an address always resolves to the same `Arc<Mutex<Slot>>`.
//!
//! Lock order: unit index, then slot cells in ascending global index, then
//! the subscription table. Nothing takes a slot lock while holding the
//! subscription table.

mod address;
mod permissions;
mod slot;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub use address::SlotAddress;
pub use permissions::{Permission, PermissionGroup, PermissionSet};
pub(crate) use slot::{Loaded, duration_ms};
pub use slot::{ExecutionRecord, InputOrigin, PendingInput, Slot, SlotView};

use crate::error::sync::lock;
use crate::error::{CoreError, Result, SlotError};
use crate::events::SlotEvent;
use crate::ids::{RequestId, UnitId};
use crate::registry::RuntimeId;
use crate::snapshot::UnitSnapshot;

/// Version tag of [`MatrixExport`] documents.
pub const MATRIX_FORMAT_VERSION: u32 = 1;

/// Static description of a row, resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSpec {
    pub id: String,
    pub runtime_id: RuntimeId,
    pub max_slots: usize,
    pub tick_interval: Duration,
}

pub struct Row {
    id: String,
    runtime_id: RuntimeId,
    tick_interval: Duration,
    slots: Vec<Arc<Mutex<Slot>>>,
    tick_count: AtomicU64,
}

impl Row {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn runtime_id(&self) -> RuntimeId {
        self.runtime_id
    }

    pub fn max_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    pub(crate) fn slots(&self) -> &[Arc<Mutex<Slot>>] {
        &self.slots
    }

    pub(crate) fn record_tick(&self) -> u64 {
        self.tick_count.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SlotCoord {
    pub(crate) row: usize,
    pub(crate) position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowSummary {
    pub row_id: String,
    pub runtime_id: RuntimeId,
    pub max_slots: usize,
    pub occupied: usize,
    pub executions: u64,
    pub tick_count: u64,
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatrixSummary {
    pub total_slots: usize,
    pub occupied_slots: usize,
    pub rows: Vec<RowSummary>,
}

// ── Export documents ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotExport {
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<UnitId>,
    pub committed_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<SlotError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<u64>,
    pub execution_count: u64,
    #[serde(default)]
    pub input_buffer: Vec<PendingInput>,
    #[serde(default)]
    pub output_buffer: Vec<ExecutionRecord>,
    pub permissions: PermissionSet,
    pub active: bool,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowExport {
    pub row_id: String,
    pub runtime_id: RuntimeId,
    pub max_slots: usize,
    pub slots: Vec<SlotExport>,
}

/// Serialized matrix state. Loaded code is not part of it: imported slots
/// start with `executed_version = 0` and reload on their row's next tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixExport {
    pub format_version: u32,
    pub rows: Vec<RowExport>,
    /// `(subscriber, publisher)` address pairs.
    #[serde(default)]
    pub subscriptions: Vec<(String, String)>,
}

pub struct Matrix {
    rows: Vec<Row>,
    row_index: HashMap<String, usize>,
    unit_index: Mutex<HashMap<UnitId, SlotCoord>>,
    /// publisher -> subscribers
    subscriptions: Mutex<HashMap<SlotCoord, BTreeSet<SlotCoord>>>,
    events: broadcast::Sender<SlotEvent>,
}

impl Matrix {
    pub fn new(
        specs: Vec<RowSpec>,
        input_capacity: usize,
        output_capacity: usize,
        events: broadcast::Sender<SlotEvent>,
    ) -> Result<Self> {
        let mut rows = Vec::with_capacity(specs.len());
        let mut row_index = HashMap::new();
        let mut offset = 0;
        for spec in specs {
            if spec.id.is_empty() || !spec.id.chars().all(|c| c.is_ascii_lowercase()) {
                return Err(CoreError::config(format!(
                    "row id {:?} must be lowercase ascii letters",
                    spec.id
                )));
            }
            if spec.max_slots == 0 {
                return Err(CoreError::config(format!("row {} has no slots", spec.id)));
            }
            if row_index.insert(spec.id.clone(), rows.len()).is_some() {
                return Err(CoreError::config(format!("duplicate row id {}", spec.id)));
            }
            let slots = (1..=spec.max_slots)
                .map(|position| {
                    Arc::new(Mutex::new(Slot::new(
                        format!("{}{position}", spec.id),
                        offset + position,
                        spec.id.clone(),
                        position,
                        input_capacity,
                        output_capacity,
                    )))
                })
                .collect();
            offset += spec.max_slots;
            rows.push(Row {
                id: spec.id,
                runtime_id: spec.runtime_id,
                tick_interval: spec.tick_interval,
                slots,
                tick_count: AtomicU64::new(0),
            });
        }
        Ok(Self {
            rows,
            row_index,
            unit_index: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            events,
        })
    }

    // ── Addressing ────────────────────────────────────────────────────

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, row_id: &str) -> Result<&Row> {
        self.row_position(row_id).map(|index| &self.rows[index])
    }

    pub(crate) fn row_position(&self, row_id: &str) -> Result<usize> {
        self.row_index
            .get(row_id)
            .copied()
            .ok_or_else(|| CoreError::RowNotFound {
                row_id: row_id.to_string(),
            })
    }

    pub fn total_slots(&self) -> usize {
        self.rows.iter().map(Row::max_slots).sum()
    }

    pub(crate) fn coord(&self, address: &SlotAddress) -> Result<SlotCoord> {
        let not_found = || CoreError::SlotNotFound {
            address: address.to_string(),
        };
        match address {
            SlotAddress::Flat(index) => {
                let mut remaining = index.checked_sub(1).ok_or_else(not_found)?;
                for (row, r) in self.rows.iter().enumerate() {
                    if remaining < r.max_slots() {
                        return Ok(SlotCoord {
                            row,
                            position: remaining,
                        });
                    }
                    remaining -= r.max_slots();
                }
                Err(not_found())
            }
            SlotAddress::Grid { row, position } => {
                let row = *self.row_index.get(row).ok_or_else(not_found)?;
                let position = position.checked_sub(1).ok_or_else(not_found)?;
                if position >= self.rows[row].max_slots() {
                    return Err(not_found());
                }
                Ok(SlotCoord { row, position })
            }
        }
    }

    pub(crate) fn cell(&self, coord: SlotCoord) -> &Arc<Mutex<Slot>> {
        &self.rows[coord.row].slots[coord.position]
    }

    /// The slot object behind an address; both schemes yield the same `Arc`.
    pub fn slot(&self, address: &SlotAddress) -> Result<Arc<Mutex<Slot>>> {
        let coord = self.coord(address)?;
        Ok(Arc::clone(self.cell(coord)))
    }

    fn lock_slot(&self, coord: SlotCoord) -> Result<MutexGuard<'_, Slot>> {
        lock(self.cell(coord), "slot")
    }

    fn emit(&self, event: SlotEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    // ── Commit / release ──────────────────────────────────────────────

    /// Commit the snapshot's unit at its current version. Committing the
    /// unit already held by the slot refreshes its committed version.
    pub fn commit(&self, address: &SlotAddress, snapshot: &UnitSnapshot) -> Result<SlotView> {
        let coord = self.coord(address)?;
        let mut units = lock(&self.unit_index, "unit index")?;
        let mut slot = self.lock_slot(coord)?;
        if let Some(current) = slot.unit_id.clone() {
            if current == snapshot.unit_id {
                slot.refresh(snapshot.version);
                return Ok(slot.view());
            }
            return Err(CoreError::SlotOccupied {
                address: slot.address.clone(),
                occupant: current,
            });
        }
        if let Some(existing) = units.get(&snapshot.unit_id) {
            return Err(CoreError::UnitAlreadyCommitted {
                unit_id: snapshot.unit_id.clone(),
                address: self.cell_address(*existing),
            });
        }

        slot.occupy(snapshot.unit_id.clone(), snapshot.version);
        units.insert(snapshot.unit_id.clone(), coord);
        tracing::info!(
            slot = %slot.address,
            unit = %snapshot.unit_id,
            version = snapshot.version,
            "unit committed"
        );
        self.emit(SlotEvent::Committed {
            address: slot.address.clone(),
            unit_id: snapshot.unit_id.clone(),
            version: snapshot.version,
        });
        Ok(slot.view())
    }

    /// Commit into the first free slot of the row hosting the unit's
    /// current runtime. A unit already in the matrix is refreshed in place.
    pub fn place(&self, snapshot: &UnitSnapshot) -> Result<SlotView> {
        let existing = lock(&self.unit_index, "unit index")?
            .get(&snapshot.unit_id)
            .copied();
        if let Some(coord) = existing {
            let address = SlotAddress::flat(self.lock_slot(coord)?.flat_index);
            return self.commit(&address, snapshot);
        }
        let row = self
            .rows
            .iter()
            .find(|r| r.runtime_id == snapshot.current_runtime_id)
            .ok_or_else(|| CoreError::RowNotFound {
                row_id: format!("runtime {}", snapshot.current_runtime_id),
            })?;
        for cell in row.slots() {
            let flat_index = {
                let slot = lock(cell, "slot")?;
                if slot.unit_id.is_some() {
                    continue;
                }
                slot.flat_index
            };
            match self.commit(&SlotAddress::flat(flat_index), snapshot) {
                Err(CoreError::SlotOccupied { .. }) => continue,
                other => return other,
            }
        }
        Err(CoreError::RowFull {
            row_id: row.id.clone(),
        })
    }

    /// Release the slot's unit, buffers and versions in one step. Gated by
    /// the `clear` permission.
    pub fn release(&self, address: &SlotAddress) -> Result<UnitId> {
        let coord = self.coord(address)?;
        let mut units = lock(&self.unit_index, "unit index")?;
        let mut slot = self.lock_slot(coord)?;
        slot.permissions.check(Permission::Clear, &slot.address)?;
        let Some(unit_id) = slot.clear() else {
            return Err(CoreError::SlotEmpty {
                address: slot.address.clone(),
            });
        };
        units.remove(&unit_id);
        self.drop_subscriptions(coord)?;
        tracing::info!(slot = %slot.address, unit = %unit_id, "slot released");
        self.emit(SlotEvent::Released {
            address: slot.address.clone(),
            unit_id: unit_id.clone(),
        });
        Ok(unit_id)
    }

    /// Relocate a unit to an empty slot; the target reloads its code.
    pub fn move_unit(&self, from: &SlotAddress, to: &SlotAddress) -> Result<SlotView> {
        let from_coord = self.coord(from)?;
        let to_coord = self.coord(to)?;
        if from_coord == to_coord {
            return Ok(self.lock_slot(from_coord)?.view());
        }
        let mut units = lock(&self.unit_index, "unit index")?;
        let (mut source, mut target) = if from_coord < to_coord {
            let source = self.lock_slot(from_coord)?;
            let target = self.lock_slot(to_coord)?;
            (source, target)
        } else {
            let target = self.lock_slot(to_coord)?;
            let source = self.lock_slot(from_coord)?;
            (source, target)
        };
        if let Some(occupant) = &target.unit_id {
            return Err(CoreError::SlotOccupied {
                address: target.address.clone(),
                occupant: occupant.clone(),
            });
        }
        let version = source.committed_version;
        let Some(unit_id) = source.clear() else {
            return Err(CoreError::SlotEmpty {
                address: source.address.clone(),
            });
        };
        target.occupy(unit_id.clone(), version);
        units.insert(unit_id.clone(), to_coord);
        self.drop_subscriptions(from_coord)?;
        tracing::info!(from = %source.address, to = %target.address, unit = %unit_id, "unit moved");
        self.emit(SlotEvent::Released {
            address: source.address.clone(),
            unit_id: unit_id.clone(),
        });
        self.emit(SlotEvent::Committed {
            address: target.address.clone(),
            unit_id,
            version,
        });
        Ok(target.view())
    }

    // ── Gated operations ──────────────────────────────────────────────

    /// Queue input for execution. `permission` is `Push` for plain input
    /// and `Execute` for an explicit execution trigger.
    pub fn enqueue(
        &self,
        address: &SlotAddress,
        permission: Permission,
        origin: InputOrigin,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<RequestId> {
        let coord = self.coord(address)?;
        let mut slot = self.lock_slot(coord)?;
        slot.permissions.check(permission, &slot.address)?;
        if slot.unit_id.is_none() {
            return Err(CoreError::SlotEmpty {
                address: slot.address.clone(),
            });
        }
        Ok(slot.enqueue(PendingInput::new(origin, data, timeout)))
    }

    /// Remove a still-pending request. Returns false once it has started.
    pub fn cancel_pending(&self, address: &SlotAddress, request_id: RequestId) -> Result<bool> {
        let coord = self.coord(address)?;
        Ok(self.lock_slot(coord)?.cancel(request_id))
    }

    /// Up to `last_n` newest execution records, oldest first.
    pub fn read_output(
        &self,
        address: &SlotAddress,
        last_n: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let coord = self.coord(address)?;
        let slot = self.lock_slot(coord)?;
        slot.permissions.check(Permission::Read, &slot.address)?;
        Ok(slot.output_buffer.last_n(last_n))
    }

    // ── Permissions and flags ─────────────────────────────────────────

    pub fn set_permissions(&self, address: &SlotAddress, permissions: PermissionSet) -> Result<()> {
        let coord = self.coord(address)?;
        let mut slot = self.lock_slot(coord)?;
        slot.permissions = permissions;
        tracing::debug!(slot = %slot.address, ?permissions, "permissions updated");
        Ok(())
    }

    pub fn apply_permission_group(
        &self,
        address: &SlotAddress,
        group: PermissionGroup,
    ) -> Result<()> {
        self.set_permissions(address, group.permissions())
    }

    pub fn set_row_permissions(&self, row_id: &str, permissions: PermissionSet) -> Result<()> {
        for cell in self.row(row_id)?.slots() {
            lock(cell, "slot")?.permissions = permissions;
        }
        Ok(())
    }

    pub fn set_paused(&self, address: &SlotAddress, paused: bool) -> Result<()> {
        let coord = self.coord(address)?;
        self.lock_slot(coord)?.paused = paused;
        Ok(())
    }

    pub fn set_active(&self, address: &SlotAddress, active: bool) -> Result<()> {
        let coord = self.coord(address)?;
        self.lock_slot(coord)?.active = active;
        Ok(())
    }

    // ── Subscriptions ─────────────────────────────────────────────────

    /// Forward every successful output of `publisher` into the input
    /// buffer of `subscriber`, subject to the subscriber's push permission.
    pub fn subscribe(&self, subscriber: &SlotAddress, publisher: &SlotAddress) -> Result<()> {
        let subscriber = self.coord(subscriber)?;
        let publisher = self.coord(publisher)?;
        lock(&self.subscriptions, "subscriptions")?
            .entry(publisher)
            .or_default()
            .insert(subscriber);
        Ok(())
    }

    pub fn unsubscribe(&self, subscriber: &SlotAddress, publisher: &SlotAddress) -> Result<bool> {
        let subscriber = self.coord(subscriber)?;
        let publisher = self.coord(publisher)?;
        let mut subscriptions = lock(&self.subscriptions, "subscriptions")?;
        let removed = subscriptions
            .get_mut(&publisher)
            .is_some_and(|subs| subs.remove(&subscriber));
        subscriptions.retain(|_, subs| !subs.is_empty());
        Ok(removed)
    }

    pub(crate) fn subscribers_of(&self, publisher: SlotCoord) -> Result<Vec<SlotCoord>> {
        Ok(lock(&self.subscriptions, "subscriptions")?
            .get(&publisher)
            .map(|subs| subs.iter().copied().collect())
            .unwrap_or_default())
    }

    fn drop_subscriptions(&self, coord: SlotCoord) -> Result<()> {
        let mut subscriptions = lock(&self.subscriptions, "subscriptions")?;
        subscriptions.remove(&coord);
        for subs in subscriptions.values_mut() {
            subs.remove(&coord);
        }
        subscriptions.retain(|_, subs| !subs.is_empty());
        Ok(())
    }

    // ── Views ─────────────────────────────────────────────────────────

    /// Introspection view; not gated.
    pub fn slot_view(&self, address: &SlotAddress) -> Result<SlotView> {
        let coord = self.coord(address)?;
        Ok(self.lock_slot(coord)?.view())
    }

    pub fn row_view(&self, row_id: &str) -> Result<Vec<SlotView>> {
        self.row(row_id)?
            .slots()
            .iter()
            .map(|cell| Ok(lock(cell, "slot")?.view()))
            .collect()
    }

    pub fn slot_of_unit(&self, unit_id: &UnitId) -> Result<Option<String>> {
        let coord = lock(&self.unit_index, "unit index")?.get(unit_id).copied();
        Ok(coord.map(|c| self.cell_address(c)))
    }

    /// Occupied slots whose committed code has not been loaded yet.
    pub fn dirty_slots(&self) -> Result<Vec<String>> {
        let mut dirty = Vec::new();
        for row in &self.rows {
            for cell in row.slots() {
                let slot = lock(cell, "slot")?;
                if slot.dirty {
                    dirty.push(slot.address.clone());
                }
            }
        }
        Ok(dirty)
    }

    pub fn summary(&self) -> Result<MatrixSummary> {
        let mut rows = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let mut occupied = 0;
            let mut executions = 0;
            for cell in row.slots() {
                let slot = lock(cell, "slot")?;
                if slot.unit_id.is_some() {
                    occupied += 1;
                }
                executions += slot.execution_count;
            }
            rows.push(RowSummary {
                row_id: row.id.clone(),
                runtime_id: row.runtime_id,
                max_slots: row.max_slots(),
                occupied,
                executions,
                tick_count: row.tick_count(),
                tick_interval_ms: duration_ms(row.tick_interval),
            });
        }
        Ok(MatrixSummary {
            total_slots: self.total_slots(),
            occupied_slots: rows.iter().map(|r| r.occupied).sum(),
            rows,
        })
    }

    fn cell_address(&self, coord: SlotCoord) -> String {
        format!("{}{}", self.rows[coord.row].id, coord.position + 1)
    }

    // ── Export / import ───────────────────────────────────────────────

    pub fn export_matrix(&self) -> Result<MatrixExport> {
        let mut rows = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let mut slots = Vec::with_capacity(row.max_slots());
            for cell in row.slots() {
                let slot = lock(cell, "slot")?;
                slots.push(SlotExport {
                    position: slot.position,
                    unit_id: slot.unit_id.clone(),
                    committed_version: slot.committed_version,
                    last_output: slot.last_output.clone(),
                    last_error: slot.last_error.clone(),
                    last_duration_ms: slot.last_duration.map(duration_ms),
                    execution_count: slot.execution_count,
                    input_buffer: slot.input_buffer.iter().cloned().collect(),
                    output_buffer: slot.output_buffer.last_n(usize::MAX),
                    permissions: slot.permissions,
                    active: slot.active,
                    paused: slot.paused,
                });
            }
            rows.push(RowExport {
                row_id: row.id.clone(),
                runtime_id: row.runtime_id,
                max_slots: row.max_slots(),
                slots,
            });
        }
        let mut subscriptions = Vec::new();
        for (publisher, subs) in lock(&self.subscriptions, "subscriptions")?.iter() {
            for subscriber in subs {
                subscriptions.push((self.cell_address(*subscriber), self.cell_address(*publisher)));
            }
        }
        subscriptions.sort();
        Ok(MatrixExport {
            format_version: MATRIX_FORMAT_VERSION,
            rows,
            subscriptions,
        })
    }

    /// Replace all slot state with an export taken from a matrix of the
    /// same topology. Validated in full before any slot changes. Callers
    /// must make sure no row is running.
    pub fn import_matrix(&self, export: MatrixExport) -> Result<()> {
        if export.format_version != MATRIX_FORMAT_VERSION {
            return Err(CoreError::corrupt_log(format!(
                "unsupported matrix format version {}",
                export.format_version
            )));
        }
        if export.rows.len() != self.rows.len() {
            return Err(CoreError::corrupt_log("matrix export has a different row count"));
        }
        let mut seen: HashMap<UnitId, SlotCoord> = HashMap::new();
        for (row_pos, (row, doc)) in self.rows.iter().zip(&export.rows).enumerate() {
            if row.id != doc.row_id
                || row.runtime_id != doc.runtime_id
                || row.max_slots() != doc.max_slots
                || doc.slots.len() != doc.max_slots
            {
                return Err(CoreError::corrupt_log(format!(
                    "row {} does not match the exported topology",
                    row.id
                )));
            }
            for (position, slot) in doc.slots.iter().enumerate() {
                if slot.position != position + 1 {
                    return Err(CoreError::corrupt_log(format!(
                        "row {} slot {} is out of order",
                        row.id, slot.position
                    )));
                }
                if let Some(unit) = &slot.unit_id
                    && seen
                        .insert(unit.clone(), SlotCoord { row: row_pos, position })
                        .is_some()
                {
                    return Err(CoreError::corrupt_log(format!(
                        "unit {unit} appears in more than one slot"
                    )));
                }
            }
        }
        let mut subscriptions: HashMap<SlotCoord, BTreeSet<SlotCoord>> = HashMap::new();
        for (subscriber, publisher) in &export.subscriptions {
            let subscriber = self.coord(&subscriber.parse()?)?;
            let publisher = self.coord(&publisher.parse()?)?;
            subscriptions.entry(publisher).or_default().insert(subscriber);
        }

        let mut units = lock(&self.unit_index, "unit index")?;
        for (row, doc) in self.rows.iter().zip(export.rows) {
            for (cell, data) in row.slots().iter().zip(doc.slots) {
                let mut slot = lock(cell, "slot")?;
                slot.clear();
                if let Some(unit_id) = data.unit_id {
                    slot.occupy(unit_id, data.committed_version);
                }
                slot.last_output = data.last_output;
                slot.last_error = data.last_error;
                slot.last_duration = data.last_duration_ms.map(Duration::from_millis);
                slot.execution_count = data.execution_count;
                slot.restore_inputs(data.input_buffer);
                for record in data.output_buffer {
                    slot.output_buffer.push(record);
                }
                slot.permissions = data.permissions;
                slot.active = data.active;
                slot.paused = data.paused;
            }
        }
        *units = seen;
        *lock(&self.subscriptions, "subscriptions")? = subscriptions;
        tracing::info!(units = units.len(), "matrix imported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ledger::UnitKind;
    use crate::snapshot::{Ports, Provenance, UnitFlags};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn matrix() -> Matrix {
        let (tx, _) = broadcast::channel(16);
        Matrix::new(
            vec![
                RowSpec {
                    id: "a".into(),
                    runtime_id: RuntimeId::PYTHON,
                    max_slots: 3,
                    tick_interval: Duration::from_millis(10),
                },
                RowSpec {
                    id: "b".into(),
                    runtime_id: RuntimeId::JAVASCRIPT,
                    max_slots: 2,
                    tick_interval: Duration::from_millis(10),
                },
            ],
            8,
            4,
            tx,
        )
        .expect("matrix")
    }

    fn snapshot(unit: &str, version: u64, runtime: RuntimeId) -> UnitSnapshot {
        UnitSnapshot {
            unit_id: UnitId::from(unit),
            session_id: "s".into(),
            unit_kind: UnitKind::Function,
            display_name: unit.to_string(),
            original_runtime_id: runtime,
            current_runtime_id: runtime,
            original_code: String::new(),
            current_code: String::new(),
            version,
            parameters: BTreeMap::new(),
            ports: Ports::default(),
            flags: UnitFlags::default(),
            provenance: Provenance::default(),
            connections: BTreeSet::new(),
            code_history: Vec::new(),
            as_of_sequence: 0,
        }
    }

    fn addr(s: &str) -> SlotAddress {
        s.parse().expect("address")
    }

    #[test]
    fn test_flat_and_grid_resolve_to_same_slot() {
        let m = matrix();
        let flat = m.slot(&addr("slot-4")).expect("flat");
        let grid = m.slot(&addr("b1")).expect("grid");
        assert!(Arc::ptr_eq(&flat, &grid));
        assert_eq!(m.total_slots(), 5);

        for bad in ["slot-6", "a4", "z1"] {
            let err = match m.slot(&addr(bad)) {
                Ok(_) => panic!("{bad} should not resolve"),
                Err(e) => e,
            };
            assert_eq!(err.kind(), ErrorKind::SlotNotFound);
        }
    }

    #[test]
    fn test_commit_rejects_second_unit() {
        let m = matrix();
        m.commit(&addr("a1"), &snapshot("u1", 1, RuntimeId::PYTHON)).expect("commit");

        let err = match m.commit(&addr("slot-1"), &snapshot("u2", 1, RuntimeId::PYTHON)) {
            Ok(_) => panic!("occupied slot must reject"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::SlotOccupied);
        assert_eq!(
            m.slot_view(&addr("a1")).expect("view").unit_id,
            Some(UnitId::from("u1"))
        );
    }

    #[test]
    fn test_recommit_same_unit_refreshes_version() {
        let m = matrix();
        m.commit(&addr("a1"), &snapshot("u1", 1, RuntimeId::PYTHON)).expect("commit");
        let view = m
            .commit(&addr("a1"), &snapshot("u1", 3, RuntimeId::PYTHON))
            .expect("recommit");
        assert_eq!(view.committed_version, 3);
        assert_eq!(view.executed_version, 0);
    }

    #[test]
    fn test_unit_lives_in_one_slot() {
        let m = matrix();
        m.commit(&addr("a1"), &snapshot("u1", 1, RuntimeId::PYTHON)).expect("commit");
        let err = match m.commit(&addr("a2"), &snapshot("u1", 1, RuntimeId::PYTHON)) {
            Ok(_) => panic!("second slot must reject"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::UnitAlreadyCommitted);
    }

    #[test]
    fn test_place_picks_row_by_runtime() {
        let m = matrix();
        let first = m.place(&snapshot("js1", 1, RuntimeId::JAVASCRIPT)).expect("place");
        let second = m.place(&snapshot("js2", 1, RuntimeId::JAVASCRIPT)).expect("place");
        assert_eq!((first.address.as_str(), second.address.as_str()), ("b1", "b2"));

        let err = match m.place(&snapshot("js3", 1, RuntimeId::JAVASCRIPT)) {
            Ok(_) => panic!("row should be full"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::RowFull);

        let err = match m.place(&snapshot("rs", 1, RuntimeId::RUST)) {
            Ok(_) => panic!("no rust row"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::RowNotFound);
    }

    #[test]
    fn test_release_requires_clear_permission() {
        let m = matrix();
        m.commit(&addr("a1"), &snapshot("u1", 1, RuntimeId::PYTHON)).expect("commit");

        let err = match m.release(&addr("a1")) {
            Ok(_) => panic!("clear is denied by default"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(!m.slot_view(&addr("a1")).expect("view").is_empty());

        m.apply_permission_group(&addr("a1"), PermissionGroup::Admin)
            .expect("perms");
        assert_eq!(m.release(&addr("a1")).expect("release"), UnitId::from("u1"));
        assert_eq!(m.slot_of_unit(&UnitId::from("u1")).expect("lookup"), None);
        // The unit can be committed elsewhere once released.
        m.commit(&addr("a2"), &snapshot("u1", 1, RuntimeId::PYTHON)).expect("commit");
    }

    #[test]
    fn test_enqueue_is_gated_and_needs_occupant() {
        let m = matrix();
        let push = m.enqueue(&addr("a1"), Permission::Push, InputOrigin::Push, json!(1), None);
        let err = match push {
            Ok(_) => panic!("push denied by default"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        m.apply_permission_group(&addr("a1"), PermissionGroup::Default)
            .expect("perms");
        let push = m.enqueue(&addr("a1"), Permission::Push, InputOrigin::Push, json!(1), None);
        let err = match push {
            Ok(_) => panic!("empty slot"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::SlotEmpty);

        m.commit(&addr("a1"), &snapshot("u1", 1, RuntimeId::PYTHON)).expect("commit");
        let id = m
            .enqueue(&addr("a1"), Permission::Push, InputOrigin::Push, json!(1), None)
            .expect("enqueue");
        assert!(m.cancel_pending(&addr("a1"), id).expect("cancel"));
        assert!(!m.cancel_pending(&addr("a1"), id).expect("cancel again"));
    }

    #[test]
    fn test_move_unit_transfers_version() {
        let m = matrix();
        m.commit(&addr("a1"), &snapshot("u1", 2, RuntimeId::PYTHON)).expect("commit");
        let view = m.move_unit(&addr("a1"), &addr("b2")).expect("move");
        assert_eq!(view.address, "b2");
        assert_eq!(view.committed_version, 2);
        assert!(m.slot_view(&addr("a1")).expect("view").is_empty());
        assert_eq!(
            m.slot_of_unit(&UnitId::from("u1")).expect("lookup"),
            Some("b2".to_string())
        );
    }

    #[test]
    fn test_subscriptions_cleared_on_release() {
        let m = matrix();
        m.commit(&addr("a1"), &snapshot("u1", 1, RuntimeId::PYTHON)).expect("commit");
        m.subscribe(&addr("a2"), &addr("a1")).expect("subscribe");
        let publisher = m.coord(&addr("a1")).expect("coord");
        assert_eq!(m.subscribers_of(publisher).expect("subs").len(), 1);

        m.apply_permission_group(&addr("a1"), PermissionGroup::Admin)
            .expect("perms");
        m.release(&addr("a1")).expect("release");
        assert!(m.subscribers_of(publisher).expect("subs").is_empty());
    }

    #[test]
    fn test_export_import_resets_executed_version() {
        let m = matrix();
        m.commit(&addr("a1"), &snapshot("u1", 4, RuntimeId::PYTHON)).expect("commit");
        m.subscribe(&addr("b1"), &addr("a1")).expect("subscribe");
        m.set_permissions(&addr("a1"), PermissionSet::all()).expect("perms");
        {
            let cell = m.slot(&addr("a1")).expect("slot");
            let mut slot = cell.lock().expect("lock");
            slot.executed_version = 4;
            slot.dirty = false;
        }
        let export = m.export_matrix().expect("export");

        let restored = matrix();
        restored.import_matrix(export.clone()).expect("import");
        let view = restored.slot_view(&addr("a1")).expect("view");
        assert_eq!(view.committed_version, 4);
        assert_eq!(view.executed_version, 0);
        assert!(view.needs_hot_swap);
        assert_eq!(view.permissions, PermissionSet::all());
        assert_eq!(restored.export_matrix().expect("export").subscriptions, export.subscriptions);
        assert_eq!(
            restored.slot_of_unit(&UnitId::from("u1")).expect("lookup"),
            Some("a1".to_string())
        );
    }

    #[test]
    fn test_views_withhold_results_without_read() {
        let m = matrix();
        m.commit(&addr("a1"), &snapshot("u1", 1, RuntimeId::PYTHON)).expect("commit");
        {
            let cell = m.slot(&addr("a1")).expect("slot");
            let mut slot = cell.lock().expect("lock");
            slot.last_output = Some(json!("secret:1"));
            slot.last_error = Some(SlotError::failure("boom"));
        }
        m.set_permissions(&addr("a1"), PermissionSet::none()).expect("perms");

        let err = match m.read_output(&addr("a1"), 1) {
            Ok(_) => panic!("read is denied"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        let view = m.slot_view(&addr("a1")).expect("view");
        assert_eq!((view.last_output, view.last_error), (None, None));
        let row = m.row_view("a").expect("row");
        assert_eq!((row[0].last_output.clone(), row[0].last_error.clone()), (None, None));
        // Occupancy stays visible.
        assert_eq!(view.unit_id, Some(UnitId::from("u1")));

        m.set_permissions(&addr("a1"), PermissionSet::default()).expect("perms");
        assert_eq!(m.slot_view(&addr("a1")).expect("view").last_output, Some(json!("secret:1")));
    }

    #[test]
    fn test_import_caps_input_buffer_to_capacity() {
        let m = matrix();
        m.commit(&addr("a1"), &snapshot("u1", 1, RuntimeId::PYTHON)).expect("commit");
        let mut export = m.export_matrix().expect("export");
        export.rows[0].slots[0].input_buffer = (0..12)
            .map(|i| PendingInput::new(InputOrigin::Push, json!(i), None))
            .collect();

        let restored = matrix();
        restored.import_matrix(export).expect("import");
        assert_eq!(restored.slot_view(&addr("a1")).expect("view").pending_inputs, 8);
        let kept = restored.export_matrix().expect("export").rows[0].slots[0]
            .input_buffer
            .iter()
            .map(|p| p.data.clone())
            .collect::<Vec<_>>();
        assert_eq!(kept, (4..12).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[test]
    fn test_import_rejects_foreign_topology() {
        let m = matrix();
        let mut export = m.export_matrix().expect("export");
        export.rows[0].runtime_id = RuntimeId::RUST;
        let err = match m.import_matrix(export) {
            Ok(()) => panic!("topology mismatch"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::CorruptLog);
    }
}
