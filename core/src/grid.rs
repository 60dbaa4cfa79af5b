//! `SlotGrid`: the owning facade over log, materializer, matrix and engine.
//!
//! One `SlotGrid` is built per process and passed explicitly to callers;
//! there is no global instance. Mutations go to the log first, and the
//! matrix only ever sees versions the materializer derived from it.

use std::collections::BTreeMap;
use std::ops::RangeBounds;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;

use crate::checkpoint::CheckpointStore;
use crate::config::CoreConfig;
use crate::engine::{Engine, EngineSettings, RowState, TickReport};
use crate::error::{CoreError, Result};
use crate::events::SlotEvent;
use crate::executor::ExecutorTable;
use crate::ids::{ConnectionId, RequestId, SessionId, UnitId};
use crate::ledger::{
    AppendRequest, CodeEdited, ConnectionCreated, EventKind, EventLog, ExecutionBatch,
    KindChanged, LogEntry, LogExport, LogRange, ParamsChanged, Port, PortsChanged,
    RuntimeChanged, SessionStats, UnitCreated, UnitKind,
};
use crate::matrix::{
    ExecutionRecord, InputOrigin, Matrix, MatrixExport, MatrixSummary, Permission,
    PermissionGroup, PermissionSet, SlotAddress, SlotView,
};
use crate::registry::{IdentifierRegistry, RuntimeId};
use crate::snapshot::{CodeVersion, Materializer, UnitSnapshot};

/// A unit as handed over by the parser layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub unit_kind: UnitKind,
    pub runtime_id: RuntimeId,
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

impl UnitSpec {
    pub fn new(
        unit_kind: UnitKind,
        runtime_id: RuntimeId,
        display_name: impl Into<String>,
        source_code: impl Into<String>,
    ) -> Self {
        Self {
            unit_kind,
            runtime_id,
            display_name: display_name.into(),
            source_code: source_code.into(),
            parameters: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            source_ref: None,
        }
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_ports(mut self, inputs: Vec<Port>, outputs: Vec<Port>) -> Self {
        self.inputs = inputs;
        self.outputs = outputs;
        self
    }

    pub fn with_source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }
}

pub struct SlotGrid {
    config: CoreConfig,
    registry: Arc<IdentifierRegistry>,
    log: Arc<EventLog>,
    materializer: Arc<Materializer>,
    matrix: Arc<Matrix>,
    executors: Arc<ExecutorTable>,
    engine: Engine,
    events: broadcast::Sender<SlotEvent>,
}

impl SlotGrid {
    pub fn new(
        config: CoreConfig,
        registry: IdentifierRegistry,
        executors: ExecutorTable,
    ) -> Result<Self> {
        config.validate()?;
        let specs = config.row_specs(&registry)?;
        let (events, _) = broadcast::channel(config.event_channel_capacity);
        let log = Arc::new(EventLog::new(config.sequence_start));
        let materializer = Arc::new(Materializer::new(Arc::clone(&log)));
        let matrix = Arc::new(Matrix::new(
            specs,
            config.input_buffer_capacity,
            config.output_buffer_capacity,
            events.clone(),
        )?);
        let executors = Arc::new(executors);
        for row in matrix.rows() {
            if executors.get(row.runtime_id()).is_none() {
                tracing::debug!(row = row.id(), runtime = %row.runtime_id(), "no executor for row runtime");
            }
        }
        let engine = Engine::new(
            Arc::clone(&matrix),
            Arc::clone(&materializer),
            Arc::clone(&log),
            Arc::clone(&executors),
            events.clone(),
            EngineSettings::from(&config),
        );
        tracing::info!(
            rows = matrix.rows().len(),
            slots = matrix.total_slots(),
            executors = executors.runtimes().len(),
            "slot grid ready"
        );
        Ok(Self {
            config,
            registry: Arc::new(registry),
            log,
            materializer,
            matrix,
            executors,
            engine,
            events,
        })
    }

    /// Stock configuration and built-in registry.
    pub fn with_defaults(executors: ExecutorTable) -> Result<Self> {
        Self::new(CoreConfig::default(), IdentifierRegistry::builtin(), executors)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &IdentifierRegistry {
        &self.registry
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn materializer(&self) -> &Arc<Materializer> {
        &self.materializer
    }

    pub fn matrix(&self) -> &Arc<Matrix> {
        &self.matrix
    }

    pub fn executors(&self) -> &ExecutorTable {
        &self.executors
    }

    // ── Sessions and log ──────────────────────────────────────────────

    pub fn open_session(&self) -> Result<SessionId> {
        self.log.open_session()
    }

    /// Open a session under a caller-chosen id. The id must be usable as a
    /// file name (see [`SessionId::is_file_safe`]).
    pub fn open_session_with_id(&self, session_id: SessionId) -> Result<SessionId> {
        self.log.open_session_with_id(session_id)
    }

    pub fn close_session(&self, session_id: &SessionId) -> Result<String> {
        self.log.close_session(session_id)
    }

    pub fn append(&self, session_id: &SessionId, request: AppendRequest) -> Result<String> {
        self.log.append(session_id, request)
    }

    pub fn read_range(
        &self,
        session_id: &SessionId,
        range: impl RangeBounds<u64>,
    ) -> Result<LogRange> {
        self.log.read_range(session_id, range)
    }

    pub fn session_stats(&self, session_id: &SessionId) -> Result<SessionStats> {
        self.log.session_stats(session_id)
    }

    /// Every recorded execution of a unit, oldest first.
    pub fn unit_executions(&self, unit_id: &UnitId) -> Result<Vec<Arc<LogEntry>>> {
        self.log.unit_executions(unit_id)
    }

    pub fn get_snapshot(&self, unit_id: &UnitId, as_of: Option<u64>) -> Result<UnitSnapshot> {
        self.materializer.get_snapshot(unit_id, as_of)
    }

    pub fn active_snapshots(&self, session_id: &SessionId) -> Result<Vec<UnitSnapshot>> {
        self.materializer.active_snapshots(session_id)
    }

    pub fn code_at(&self, unit_id: &UnitId, version: u64) -> Result<CodeVersion> {
        self.materializer.code_at(unit_id, version)
    }

    // ── Typed recorders ───────────────────────────────────────────────

    /// Record a new unit. A fresh id is generated when `unit_id` is `None`.
    pub fn record_unit_created(
        &self,
        session_id: &SessionId,
        unit_id: Option<UnitId>,
        spec: UnitSpec,
    ) -> Result<UnitId> {
        self.create_unit(session_id, unit_id, spec, None)
    }

    /// Record a unit that arrived through `begin_import`.
    pub fn record_imported_unit(
        &self,
        session_id: &SessionId,
        import_order: u32,
        spec: UnitSpec,
    ) -> Result<UnitId> {
        self.create_unit(session_id, None, spec, Some(import_order))
    }

    fn create_unit(
        &self,
        session_id: &SessionId,
        unit_id: Option<UnitId>,
        spec: UnitSpec,
        import_order: Option<u32>,
    ) -> Result<UnitId> {
        let unit_id = unit_id.unwrap_or_else(UnitId::generate);
        let payload = UnitCreated {
            unit_kind: spec.unit_kind,
            display_name: spec.display_name,
            source_code: spec.source_code,
            parameters: spec.parameters,
            inputs: spec.inputs,
            outputs: spec.outputs,
            source_ref: spec.source_ref,
        };
        let request = AppendRequest::new(EventKind::UnitCreated)
            .unit(unit_id.clone())
            .source_runtime(spec.runtime_id)
            .import_order(import_order)
            .typed_payload(&payload)?;
        self.log.append(session_id, request)?;
        tracing::debug!(session = %session_id, unit = %unit_id, "unit created");
        Ok(unit_id)
    }

    /// Record a code edit. Returns `None` without appending when the code
    /// is unchanged.
    pub fn record_code_edit(
        &self,
        session_id: &SessionId,
        unit_id: &UnitId,
        new_code: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<Option<String>> {
        let new_code = new_code.into();
        let current = self.materializer.get_snapshot(unit_id, None)?;
        if current.current_code == new_code {
            tracing::debug!(unit = %unit_id, "code unchanged; edit not recorded");
            return Ok(None);
        }
        let payload = CodeEdited {
            new_code,
            reason: reason.into(),
        };
        let request = AppendRequest::new(EventKind::CodeEdited)
            .unit(unit_id.clone())
            .typed_payload(&payload)?;
        self.log.append(session_id, request).map(Some)
    }

    pub fn record_params_change(
        &self,
        session_id: &SessionId,
        unit_id: &UnitId,
        parameters: BTreeMap<String, Value>,
    ) -> Result<String> {
        let request = AppendRequest::new(EventKind::ParamsChanged)
            .unit(unit_id.clone())
            .typed_payload(&ParamsChanged { parameters })?;
        self.log.append(session_id, request)
    }

    pub fn record_ports_change(
        &self,
        session_id: &SessionId,
        unit_id: &UnitId,
        inputs: Vec<Port>,
        outputs: Vec<Port>,
    ) -> Result<String> {
        let request = AppendRequest::new(EventKind::PortsChanged)
            .unit(unit_id.clone())
            .typed_payload(&PortsChanged { inputs, outputs })?;
        self.log.append(session_id, request)
    }

    /// Record a runtime conversion, optionally with the converted code.
    pub fn record_runtime_change(
        &self,
        session_id: &SessionId,
        unit_id: &UnitId,
        target_runtime: RuntimeId,
        new_code: Option<String>,
    ) -> Result<String> {
        let current = self.materializer.get_snapshot(unit_id, None)?;
        let request = AppendRequest::new(EventKind::RuntimeChanged)
            .unit(unit_id.clone())
            .source_runtime(current.current_runtime_id)
            .target_runtime(target_runtime)
            .typed_payload(&RuntimeChanged { new_code })?;
        self.log.append(session_id, request)
    }

    pub fn record_kind_change(
        &self,
        session_id: &SessionId,
        unit_id: &UnitId,
        unit_kind: UnitKind,
    ) -> Result<String> {
        let request = AppendRequest::new(EventKind::KindChanged)
            .unit(unit_id.clone())
            .typed_payload(&KindChanged { unit_kind })?;
        self.log.append(session_id, request)
    }

    pub fn record_unit_deleted(&self, session_id: &SessionId, unit_id: &UnitId) -> Result<String> {
        self.log.append(
            session_id,
            AppendRequest::new(EventKind::UnitDeleted).unit(unit_id.clone()),
        )
    }

    /// Record a canvas move. The position is opaque to the core.
    pub fn record_unit_moved(
        &self,
        session_id: &SessionId,
        unit_id: &UnitId,
        position: Value,
    ) -> Result<String> {
        self.log.append(
            session_id,
            AppendRequest::new(EventKind::UnitMoved)
                .unit(unit_id.clone())
                .payload(position),
        )
    }

    pub fn record_connection_created(
        &self,
        session_id: &SessionId,
        connection: ConnectionCreated,
    ) -> Result<ConnectionId> {
        let connection_id = ConnectionId::generate();
        let request = AppendRequest::new(EventKind::ConnectionCreated)
            .connection(connection_id.clone())
            .typed_payload(&connection)?;
        self.log.append(session_id, request)?;
        Ok(connection_id)
    }

    pub fn record_connection_deleted(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<String> {
        self.log.append(
            session_id,
            AppendRequest::new(EventKind::ConnectionDeleted).connection(connection_id.clone()),
        )
    }

    /// Record a run over several units (for example a run-all request).
    /// Row ticks record their own batches when execution recording is on.
    pub fn record_execution_batch(
        &self,
        session_id: &SessionId,
        batch: ExecutionBatch,
    ) -> Result<String> {
        let request = AppendRequest::new(EventKind::ExecutionBatch).typed_payload(&batch)?;
        self.log.append(session_id, request)
    }

    /// Start a file import; units recorded with the returned order sort
    /// after everything imported before.
    pub fn begin_import(&self, session_id: &SessionId, file_path: &str) -> Result<u32> {
        let entry = self.log.append_entry(
            session_id,
            AppendRequest::new(EventKind::FileImported).payload(json!({ "file_path": file_path })),
        )?;
        let order = entry.import_order.unwrap_or_default();
        tracing::info!(session = %session_id, file = file_path, order, "import started");
        Ok(order)
    }

    pub fn record_export_started(
        &self,
        session_id: &SessionId,
        target_runtime: RuntimeId,
    ) -> Result<String> {
        self.log.append(
            session_id,
            AppendRequest::new(EventKind::ExportStarted).target_runtime(target_runtime),
        )
    }

    pub fn record_export_completed(
        &self,
        session_id: &SessionId,
        target_runtime: RuntimeId,
        file_count: usize,
    ) -> Result<String> {
        self.log.append(
            session_id,
            AppendRequest::new(EventKind::ExportCompleted)
                .target_runtime(target_runtime)
                .payload(json!({ "file_count": file_count })),
        )
    }

    // ── Matrix ────────────────────────────────────────────────────────

    pub fn commit(&self, address: &SlotAddress, unit_id: &UnitId) -> Result<SlotView> {
        let snapshot = self.materializer.get_snapshot(unit_id, None)?;
        self.matrix.commit(address, &snapshot)
    }

    pub fn place(&self, unit_id: &UnitId) -> Result<SlotView> {
        let snapshot = self.materializer.get_snapshot(unit_id, None)?;
        self.matrix.place(&snapshot)
    }

    /// Place every live unit of the session, in import/creation order.
    /// Stops at the first unit that cannot be placed.
    pub fn commit_all(&self, session_id: &SessionId) -> Result<Vec<SlotView>> {
        let snapshots = self.materializer.active_snapshots(session_id)?;
        let mut placed = Vec::with_capacity(snapshots.len());
        for snapshot in &snapshots {
            placed.push(self.matrix.place(snapshot)?);
        }
        tracing::info!(session = %session_id, units = placed.len(), "session committed");
        Ok(placed)
    }

    pub fn release(&self, address: &SlotAddress) -> Result<UnitId> {
        self.matrix.release(address)
    }

    pub fn move_unit(&self, from: &SlotAddress, to: &SlotAddress) -> Result<SlotView> {
        self.matrix.move_unit(from, to)
    }

    /// Re-record the code of `version` as a new edit. The slot picks the
    /// new version up like any other edit. Returns the new version.
    pub fn rollback(&self, address: &SlotAddress, version: u64) -> Result<u64> {
        let view = self.matrix.slot_view(address)?;
        let Some(unit_id) = view.unit_id else {
            return Err(CoreError::SlotEmpty {
                address: view.address,
            });
        };
        let code = self.materializer.code_at(&unit_id, version)?;
        let session = self
            .log
            .session_of(&unit_id)?
            .ok_or_else(|| CoreError::UnitNotFound {
                unit_id: unit_id.clone(),
            })?;
        let payload = CodeEdited {
            new_code: code.code,
            reason: format!("rollback_to_v{version}"),
        };
        let request = AppendRequest::new(EventKind::CodeEdited)
            .unit(unit_id.clone())
            .typed_payload(&payload)?;
        self.log.append(&session, request)?;
        let snapshot = self.materializer.get_snapshot(&unit_id, None)?;
        self.matrix.commit(address, &snapshot)?;
        tracing::info!(slot = %view.address, unit = %unit_id, to = version, new_version = snapshot.version, "rolled back");
        Ok(snapshot.version)
    }

    /// Trigger an execution. Gated by `execute`.
    pub fn execute(
        &self,
        address: &SlotAddress,
        input: Value,
        timeout: Option<Duration>,
    ) -> Result<RequestId> {
        self.matrix.enqueue(
            address,
            Permission::Execute,
            InputOrigin::Execute,
            input,
            timeout,
        )
    }

    /// Queue input data. Gated by `push`.
    pub fn push_input(&self, address: &SlotAddress, data: Value) -> Result<RequestId> {
        self.matrix
            .enqueue(address, Permission::Push, InputOrigin::Push, data, None)
    }

    pub fn cancel_pending(&self, address: &SlotAddress, request_id: RequestId) -> Result<bool> {
        self.matrix.cancel_pending(address, request_id)
    }

    pub fn read_output(
        &self,
        address: &SlotAddress,
        last_n: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        self.matrix.read_output(address, last_n)
    }

    pub fn set_permissions(&self, address: &SlotAddress, permissions: PermissionSet) -> Result<()> {
        self.matrix.set_permissions(address, permissions)
    }

    pub fn apply_permission_group(
        &self,
        address: &SlotAddress,
        group: PermissionGroup,
    ) -> Result<()> {
        self.matrix.apply_permission_group(address, group)
    }

    pub fn set_row_permissions(&self, row_id: &str, permissions: PermissionSet) -> Result<()> {
        self.matrix.set_row_permissions(row_id, permissions)
    }

    pub fn pause_slot(&self, address: &SlotAddress) -> Result<()> {
        self.matrix.set_paused(address, true)
    }

    pub fn resume_slot(&self, address: &SlotAddress) -> Result<()> {
        self.matrix.set_paused(address, false)
    }

    pub fn set_active(&self, address: &SlotAddress, active: bool) -> Result<()> {
        self.matrix.set_active(address, active)
    }

    pub fn subscribe(&self, subscriber: &SlotAddress, publisher: &SlotAddress) -> Result<()> {
        self.matrix.subscribe(subscriber, publisher)
    }

    pub fn unsubscribe(&self, subscriber: &SlotAddress, publisher: &SlotAddress) -> Result<bool> {
        self.matrix.unsubscribe(subscriber, publisher)
    }

    pub fn slot_view(&self, address: &SlotAddress) -> Result<SlotView> {
        self.matrix.slot_view(address)
    }

    pub fn row_view(&self, row_id: &str) -> Result<Vec<SlotView>> {
        self.matrix.row_view(row_id)
    }

    pub fn matrix_summary(&self) -> Result<MatrixSummary> {
        self.matrix.summary()
    }

    pub fn slot_of_unit(&self, unit_id: &UnitId) -> Result<Option<String>> {
        self.matrix.slot_of_unit(unit_id)
    }

    pub fn dirty_slots(&self) -> Result<Vec<String>> {
        self.matrix.dirty_slots()
    }

    // ── Engine ────────────────────────────────────────────────────────

    pub async fn start_row(&self, row_id: &str) -> Result<()> {
        self.engine.start_row(row_id).await
    }

    pub fn pause_row(&self, row_id: &str) -> Result<()> {
        self.engine.pause_row(row_id)
    }

    pub fn resume_row(&self, row_id: &str) -> Result<()> {
        self.engine.resume_row(row_id)
    }

    pub async fn stop_row(&self, row_id: &str) -> Result<()> {
        self.engine.stop_row(row_id).await
    }

    pub async fn start_all(&self) -> Result<()> {
        self.engine.start_all().await
    }

    pub async fn stop_all(&self) -> Result<()> {
        self.engine.stop_all().await
    }

    pub fn row_state(&self, row_id: &str) -> Result<RowState> {
        self.engine.row_state(row_id)
    }

    pub async fn tick_row(&self, row_id: &str) -> Result<TickReport> {
        self.engine.tick_row(row_id).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SlotEvent> {
        self.events.subscribe()
    }

    // ── Persistence ───────────────────────────────────────────────────

    pub fn export_log(&self, session_id: &SessionId) -> Result<LogExport> {
        self.log.export_log(session_id)
    }

    pub fn import_log(&self, export: LogExport) -> Result<SessionId> {
        self.log.import_log(export)
    }

    pub fn export_matrix(&self) -> Result<MatrixExport> {
        self.matrix.export_matrix()
    }

    /// Replace slot state from an export. Every row must be stopped.
    pub fn import_matrix(&self, export: MatrixExport) -> Result<()> {
        for row in self.matrix.rows() {
            let state = self.engine.row_state(row.id())?;
            if state != RowState::Stopped {
                return Err(CoreError::InvalidRowState {
                    row_id: row.id().to_string(),
                    state,
                    action: "import matrix",
                });
            }
        }
        self.matrix.import_matrix(export)
    }

    /// Write every session log and the matrix to `store`.
    pub fn save_checkpoint(&self, store: &CheckpointStore) -> Result<()> {
        let sessions = self.log.session_ids()?;
        for session in &sessions {
            store.write_log(&self.log.export_log(session)?)?;
        }
        store.write_matrix(&self.matrix.export_matrix()?)?;
        tracing::info!(sessions = sessions.len(), dir = %store.base_dir().display(), "checkpoint saved");
        Ok(())
    }

    /// Load every session log found in `store`, then the matrix if one was
    /// saved. Intended for a freshly built grid.
    pub fn restore_checkpoint(&self, store: &CheckpointStore) -> Result<()> {
        let sessions = store.list_sessions()?;
        for session in &sessions {
            self.import_log(store.read_log(session)?)?;
        }
        match store.read_matrix() {
            Ok(export) => self.import_matrix(export)?,
            Err(CoreError::CheckpointNotFound { .. }) => {
                tracing::info!("no matrix checkpoint; starting with an empty matrix");
            }
            Err(e) => return Err(e),
        }
        tracing::info!(sessions = sessions.len(), "checkpoint restored");
        Ok(())
    }
}
