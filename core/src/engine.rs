//! Engine loop: one independent scheduler per matrix row.
//!
//! ## Row lifecycle
//!
//! ```text
//!   stopped --start--> running <--pause/resume--> paused
//!      ^                  |                          |
//!      +------stop--------+----------stop------------+
//! ```
//!
//! Stopping cancels the row's token; the token is only checked between
//! ticks, so an in-flight tick always completes (graceful drain). A later
//! start spawns a fresh loop.
//!
//! ## Tick
//!
//! For every active, non-paused slot, in position order:
//! 1. pick up newer unit versions from the log (when `follow_log` is on)
//! 2. hot-swap when `committed_version != executed_version`
//! 3. run pending inputs, re-checking for a hot-swap before each one
//!
//! No slot lock is held while executor code runs. Every result is tagged
//! with the slot generation it was started under and dropped if the slot
//! was released or re-committed in the meantime.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::error::sync::lock;
use crate::error::{CoreError, Result, SlotError};
use crate::events::SlotEvent;
use crate::executor::{ExecutorError, ExecutorTable, LoadRequest};
use crate::ids::{SessionId, UnitId};
use crate::ledger::{AppendRequest, EventKind, EventLog, ExecutionBatch, UnitExecuted};
use crate::matrix::{
    ExecutionRecord, InputOrigin, Loaded, Matrix, PendingInput, Slot, SlotCoord, duration_ms,
};
use crate::snapshot::{Materializer, UnitSnapshot};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RowState {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub default_timeout: Duration,
    pub max_executions_per_tick: usize,
    pub follow_log: bool,
    pub record_executions: bool,
}

impl From<&CoreConfig> for EngineSettings {
    fn from(cfg: &CoreConfig) -> Self {
        Self {
            default_timeout: cfg.default_timeout(),
            max_executions_per_tick: cfg.max_executions_per_tick,
            follow_log: cfg.follow_log,
            record_executions: cfg.record_executions,
        }
    }
}

/// What one pass over a row did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub hot_swaps: usize,
    pub executions: usize,
    pub failures: usize,
}

/// One execution finished during a tick.
struct Executed {
    unit_id: UnitId,
    success: bool,
    duration_ms: u64,
}

struct Job {
    input: PendingInput,
    loaded: Option<Loaded>,
    generation: u64,
    version: u64,
    unit_id: UnitId,
    address: String,
}

struct EngineContext {
    matrix: Arc<Matrix>,
    materializer: Arc<Materializer>,
    log: Arc<EventLog>,
    executors: Arc<ExecutorTable>,
    events: broadcast::Sender<SlotEvent>,
    settings: EngineSettings,
    /// Serializes background ticks with on-demand `tick_row` calls.
    tick_locks: Vec<tokio::sync::Mutex<()>>,
}

struct RowHandle {
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl RowHandle {
    fn state(&self) -> RowState {
        if self.join.is_finished() {
            RowState::Stopped
        } else if self.paused.load(Ordering::SeqCst) {
            RowState::Paused
        } else {
            RowState::Running
        }
    }
}

pub struct Engine {
    ctx: Arc<EngineContext>,
    handles: Mutex<HashMap<usize, RowHandle>>,
}

impl Engine {
    pub fn new(
        matrix: Arc<Matrix>,
        materializer: Arc<Materializer>,
        log: Arc<EventLog>,
        executors: Arc<ExecutorTable>,
        events: broadcast::Sender<SlotEvent>,
        settings: EngineSettings,
    ) -> Self {
        let tick_locks = matrix
            .rows()
            .iter()
            .map(|_| tokio::sync::Mutex::new(()))
            .collect();
        Self {
            ctx: Arc::new(EngineContext {
                matrix,
                materializer,
                log,
                executors,
                events,
                settings,
                tick_locks,
            }),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn row_state(&self, row_id: &str) -> Result<RowState> {
        let row = self.ctx.matrix.row_position(row_id)?;
        Ok(lock(&self.handles, "row handles")?
            .get(&row)
            .map(RowHandle::state)
            .unwrap_or(RowState::Stopped))
    }

    /// Whether any row has a live loop.
    pub fn any_running(&self) -> Result<bool> {
        Ok(lock(&self.handles, "row handles")?
            .values()
            .any(|h| h.state() != RowState::Stopped))
    }

    pub async fn start_row(&self, row_id: &str) -> Result<()> {
        let row = self.ctx.matrix.row_position(row_id)?;
        let mut handles = lock(&self.handles, "row handles")?;
        if let Some(handle) = handles.get(&row) {
            let state = handle.state();
            if state != RowState::Stopped {
                return Err(CoreError::InvalidRowState {
                    row_id: row_id.to_string(),
                    state,
                    action: "start",
                });
            }
        }
        let cancel = CancellationToken::new();
        let paused = Arc::new(AtomicBool::new(false));
        let join = tokio::spawn(run_row(
            Arc::clone(&self.ctx),
            row,
            cancel.clone(),
            Arc::clone(&paused),
        ));
        handles.insert(
            row,
            RowHandle {
                cancel,
                paused,
                join,
            },
        );
        Ok(())
    }

    pub fn pause_row(&self, row_id: &str) -> Result<()> {
        self.set_paused(row_id, true, RowState::Running, "pause")
    }

    pub fn resume_row(&self, row_id: &str) -> Result<()> {
        self.set_paused(row_id, false, RowState::Paused, "resume")
    }

    fn set_paused(
        &self,
        row_id: &str,
        paused: bool,
        expected: RowState,
        action: &'static str,
    ) -> Result<()> {
        let row = self.ctx.matrix.row_position(row_id)?;
        let handles = lock(&self.handles, "row handles")?;
        let state = handles
            .get(&row)
            .map(RowHandle::state)
            .unwrap_or(RowState::Stopped);
        let Some(handle) = handles.get(&row).filter(|_| state == expected) else {
            return Err(CoreError::InvalidRowState {
                row_id: row_id.to_string(),
                state,
                action,
            });
        };
        handle.paused.store(paused, Ordering::SeqCst);
        tracing::info!(row = row_id, "row {action}d");
        Ok(())
    }

    /// Stop a row after its in-flight tick completes. Stopping a stopped
    /// row is a no-op.
    pub async fn stop_row(&self, row_id: &str) -> Result<()> {
        let row = self.ctx.matrix.row_position(row_id)?;
        let handle = lock(&self.handles, "row handles")?.remove(&row);
        let Some(handle) = handle else {
            return Ok(());
        };
        handle.cancel.cancel();
        if let Err(e) = handle.join.await {
            tracing::warn!(row = row_id, "row loop ended abnormally: {e}");
        }
        Ok(())
    }

    pub async fn start_all(&self) -> Result<()> {
        for row in self.ctx.matrix.rows() {
            if self.row_state(row.id())? == RowState::Stopped {
                self.start_row(row.id()).await?;
            }
        }
        Ok(())
    }

    pub async fn stop_all(&self) -> Result<()> {
        let handles: Vec<RowHandle> = lock(&self.handles, "row handles")?
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &handles {
            handle.cancel.cancel();
        }
        for result in futures::future::join_all(handles.into_iter().map(|h| h.join)).await {
            if let Err(e) = result {
                tracing::warn!("row loop ended abnormally: {e}");
            }
        }
        Ok(())
    }

    /// Run one pass over a row now, whatever its state.
    pub async fn tick_row(&self, row_id: &str) -> Result<TickReport> {
        let row = self.ctx.matrix.row_position(row_id)?;
        self.ctx.tick(row).await
    }
}

async fn run_row(
    ctx: Arc<EngineContext>,
    row: usize,
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
) {
    let row_ref = &ctx.matrix.rows()[row];
    let mut interval = tokio::time::interval(row_ref.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(row = row_ref.id(), "row loop started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if paused.load(Ordering::SeqCst) {
            continue;
        }
        match ctx.tick(row).await {
            Ok(report) if report.executions > 0 || report.hot_swaps > 0 => {
                tracing::debug!(
                    row = row_ref.id(),
                    tick = report.tick,
                    hot_swaps = report.hot_swaps,
                    executions = report.executions,
                    failures = report.failures,
                    "tick complete"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(row = row_ref.id(), kind = %e.kind(), "row loop halted: {e}");
                break;
            }
        }
    }
    tracing::info!(row = row_ref.id(), "row loop stopped");
}

impl EngineContext {
    async fn tick(&self, row: usize) -> Result<TickReport> {
        let _guard = self.tick_locks[row].lock().await;
        let row_ref = &self.matrix.rows()[row];
        let mut report = TickReport::default();
        let mut executed = Vec::new();
        for (position, cell) in row_ref.slots().iter().enumerate() {
            self.process_slot(SlotCoord { row, position }, cell, &mut report, &mut executed)
                .await?;
        }
        report.tick = row_ref.record_tick();
        if self.settings.record_executions && !executed.is_empty() {
            self.record_batch(row_ref.id(), &executed);
        }
        Ok(report)
    }

    async fn process_slot(
        &self,
        coord: SlotCoord,
        cell: &Arc<Mutex<Slot>>,
        report: &mut TickReport,
        batch: &mut Vec<Executed>,
    ) -> Result<()> {
        if self.settings.follow_log {
            self.follow_log(cell)?;
        }
        let mut executed = 0;
        loop {
            if self.hot_swap(cell).await? {
                report.hot_swaps += 1;
            }
            if executed >= self.settings.max_executions_per_tick {
                break;
            }
            let Some(job) = take_job(cell)? else {
                break;
            };
            let unit_id = job.unit_id.clone();
            let started = Instant::now();
            let success = self.execute(coord, cell, job).await?;
            batch.push(Executed {
                unit_id,
                success,
                duration_ms: duration_ms(started.elapsed()),
            });
            executed += 1;
            report.executions += 1;
            if !success {
                report.failures += 1;
            }
        }
        Ok(())
    }

    /// Raise the committed version when the log has moved past it.
    fn follow_log(&self, cell: &Arc<Mutex<Slot>>) -> Result<()> {
        let (unit_id, committed) = {
            let slot = lock(cell, "slot")?;
            match &slot.unit_id {
                Some(unit) if slot.active && !slot.paused => (unit.clone(), slot.committed_version),
                _ => return Ok(()),
            }
        };
        match self.materializer.latest_version(&unit_id) {
            Ok(version) if version > committed => {
                let mut slot = lock(cell, "slot")?;
                if slot.unit_id.as_ref() == Some(&unit_id) && slot.refresh(version) {
                    tracing::debug!(slot = %slot.address, unit = %unit_id, version, "new version committed from log");
                }
            }
            Ok(_) => {}
            Err(e) if e.kind().is_fatal() => return Err(e),
            Err(e) => tracing::debug!(unit = %unit_id, "not following unit: {e}"),
        }
        Ok(())
    }

    /// Load the committed version if it differs from the executed one.
    /// Runs only between executions of the slot.
    async fn hot_swap(&self, cell: &Arc<Mutex<Slot>>) -> Result<bool> {
        let (unit_id, target, from, generation, address) = {
            let slot = lock(cell, "slot")?;
            if !slot.needs_hot_swap() {
                return Ok(false);
            }
            let Some(unit) = slot.unit_id.clone() else {
                return Ok(false);
            };
            (
                unit,
                slot.committed_version,
                slot.executed_version,
                slot.generation,
                slot.address.clone(),
            )
        };

        let loaded = match self.materializer.get_snapshot(&unit_id, None) {
            Ok(snapshot) => self.load(&snapshot, target).await,
            Err(e) if e.kind().is_fatal() => return Err(e),
            Err(e @ CoreError::UnitDeleted { .. }) => {
                let mut slot = lock(cell, "slot")?;
                if slot.generation == generation {
                    tracing::warn!(slot = %address, unit = %unit_id, "unit deleted; slot deactivated");
                    slot.active = false;
                    slot.dirty = false;
                    slot.last_error = Some(SlotError::from(&e));
                }
                return Ok(false);
            }
            Err(e) => Loaded::Failed(SlotError::from(&e)),
        };

        let loaded_ok = matches!(loaded, Loaded::Ready(_));
        {
            let mut slot = lock(cell, "slot")?;
            if slot.generation != generation {
                tracing::debug!(slot = %address, "slot changed during load; discarding");
                return Ok(false);
            }
            if let Loaded::Failed(err) = &loaded {
                tracing::warn!(slot = %address, unit = %unit_id, version = target, "load failed: {err}");
                slot.last_error = Some(err.clone());
            }
            slot.loaded = Some(loaded);
            slot.executed_version = target;
            slot.dirty = slot.committed_version > target;
        }
        tracing::info!(slot = %address, unit = %unit_id, from, to = target, "hot-swapped");
        let _ = self.events.send(SlotEvent::HotSwapped {
            address,
            unit_id,
            from_version: from,
            to_version: target,
            loaded: loaded_ok,
        });
        Ok(true)
    }

    async fn load(&self, snapshot: &UnitSnapshot, version: u64) -> Loaded {
        let Some(code) = snapshot.code_at(version) else {
            return Loaded::Failed(SlotError::from(&CoreError::VersionNotFound {
                unit_id: snapshot.unit_id.clone(),
                version,
            }));
        };
        let Some(executor) = self.executors.get(code.runtime_id) else {
            return Loaded::Failed(SlotError::failure(format!(
                "no executor registered for runtime {}",
                code.runtime_id
            )));
        };
        let request = LoadRequest {
            unit_id: snapshot.unit_id.clone(),
            version,
            runtime_id: code.runtime_id,
            entry_point: snapshot.display_name.clone(),
            code: code.code.clone(),
        };
        match guarded(self.settings.default_timeout, async move {
            executor.load(request).await
        })
        .await
        {
            Ok(code) => Loaded::Ready(code),
            Err(err) => Loaded::Failed(err),
        }
    }

    async fn execute(&self, coord: SlotCoord, cell: &Arc<Mutex<Slot>>, job: Job) -> Result<bool> {
        let started = Instant::now();
        let timeout = job
            .input
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.settings.default_timeout);
        let result = match &job.loaded {
            Some(Loaded::Ready(code)) => {
                let code = Arc::clone(code);
                let data = job.input.data.clone();
                guarded(timeout, async move { code.run(data).await }).await
            }
            Some(Loaded::Failed(err)) => Err(err.clone()),
            None => Err(SlotError::failure("no code loaded")),
        };
        let elapsed = started.elapsed();
        let record = ExecutionRecord {
            request_id: job.input.request_id,
            version: job.version,
            output: result.as_ref().ok().cloned(),
            error: result.as_ref().err().cloned(),
            duration_ms: duration_ms(elapsed),
            completed_at: Utc::now(),
        };
        let success = record.is_success();

        {
            let mut slot = lock(cell, "slot")?;
            if slot.generation != job.generation {
                tracing::debug!(slot = %job.address, request = %record.request_id, "slot changed during execution; result discarded");
                return Ok(success);
            }
            slot.execution_count += 1;
            slot.last_duration = Some(elapsed);
            slot.last_executed_at = Some(record.completed_at);
            match &result {
                Ok(output) => {
                    slot.last_output = Some(output.clone());
                    slot.last_error = None;
                }
                Err(err) => slot.last_error = Some(err.clone()),
            }
            slot.output_buffer.push(record.clone());
        }
        if let Err(err) = &result {
            tracing::warn!(slot = %job.address, unit = %job.unit_id, kind = %err.kind, "execution failed: {}", err.message);
        }

        let _ = self.events.send(SlotEvent::Executed {
            address: job.address.clone(),
            unit_id: job.unit_id.clone(),
            request_id: record.request_id,
            version: job.version,
            success,
            duration_ms: record.duration_ms,
        });
        if self.settings.record_executions {
            self.record_execution(&job, &record);
        }
        if let Ok(output) = result {
            self.fan_out(coord, &job.address, output)?;
        }
        Ok(success)
    }

    fn record_execution(&self, job: &Job, record: &ExecutionRecord) {
        let session = match self.log.session_of(&job.unit_id) {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(unit = %job.unit_id, "cannot record execution: {e}");
                return;
            }
        };
        let payload = UnitExecuted {
            address: job.address.clone(),
            version: job.version,
            success: record.is_success(),
            duration_ms: record.duration_ms,
            error: record.error.as_ref().map(|e| e.message.clone()),
        };
        let result = AppendRequest::new(EventKind::UnitExecuted)
            .unit(job.unit_id.clone())
            .typed_payload(&payload)
            .and_then(|request| self.log.append(&session, request));
        if let Err(e) = result {
            tracing::warn!(unit = %job.unit_id, session = %session, "execution not recorded: {e}");
        }
    }

    /// Append one `execution_batch` per session whose units ran this tick.
    /// Closed or unknown sessions are skipped with a warning.
    fn record_batch(&self, row_id: &str, executed: &[Executed]) {
        let mut batches: BTreeMap<SessionId, (ExecutionBatch, usize)> = BTreeMap::new();
        for item in executed {
            let session = match self.log.session_of(&item.unit_id) {
                Ok(Some(session)) => session,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(unit = %item.unit_id, "cannot record execution batch: {e}");
                    continue;
                }
            };
            let (batch, failures) = batches.entry(session).or_insert_with(|| {
                (
                    ExecutionBatch {
                        unit_ids: Vec::new(),
                        success: true,
                        total_ms: 0,
                        row_id: Some(row_id.to_string()),
                        error: None,
                    },
                    0,
                )
            });
            if !batch.unit_ids.contains(&item.unit_id) {
                batch.unit_ids.push(item.unit_id.clone());
            }
            batch.total_ms = batch.total_ms.saturating_add(item.duration_ms);
            if !item.success {
                batch.success = false;
                *failures += 1;
            }
        }
        for (session, (mut batch, failures)) in batches {
            if failures > 0 {
                batch.error = Some(format!("{failures} execution(s) failed"));
            }
            let result = AppendRequest::new(EventKind::ExecutionBatch)
                .typed_payload(&batch)
                .and_then(|request| self.log.append(&session, request));
            if let Err(e) = result {
                tracing::warn!(row = row_id, session = %session, "execution batch not recorded: {e}");
            }
        }
    }

    /// Forward a successful output to subscriber slots that accept pushes.
    fn fan_out(&self, publisher: SlotCoord, address: &str, output: Value) -> Result<()> {
        for subscriber in self.matrix.subscribers_of(publisher)? {
            let mut slot = lock(self.matrix.cell(subscriber), "slot")?;
            if slot.unit_id.is_none() || !slot.permissions.push {
                tracing::debug!(from = address, to = %slot.address, "subscriber not accepting input");
                continue;
            }
            slot.enqueue(PendingInput::new(
                InputOrigin::Subscription {
                    publisher: address.to_string(),
                },
                output.clone(),
                None,
            ));
        }
        Ok(())
    }
}

fn take_job(cell: &Arc<Mutex<Slot>>) -> Result<Option<Job>> {
    let mut slot = lock(cell, "slot")?;
    if !slot.active || slot.paused {
        return Ok(None);
    }
    let Some(unit_id) = slot.unit_id.clone() else {
        return Ok(None);
    };
    let Some(input) = slot.input_buffer.pop_front() else {
        return Ok(None);
    };
    Ok(Some(Job {
        input,
        loaded: slot.loaded.clone(),
        generation: slot.generation,
        version: slot.executed_version,
        unit_id,
        address: slot.address.clone(),
    }))
}

/// Run executor work in its own task under a timeout. Timeouts abort the
/// task; panics and executor errors become execution failures.
async fn guarded<T, F>(timeout: Duration, work: F) -> std::result::Result<T, SlotError>
where
    T: Send + 'static,
    F: Future<Output = std::result::Result<T, ExecutorError>> + Send + 'static,
{
    let mut handle = tokio::spawn(work);
    match tokio::time::timeout(timeout, &mut handle).await {
        Err(_) => {
            handle.abort();
            Err(SlotError::timeout(duration_ms(timeout)))
        }
        Ok(Err(join)) if join.is_panic() => Err(SlotError::failure("executor panicked")),
        Ok(Err(_)) => Err(SlotError::failure("execution cancelled")),
        Ok(Ok(Err(e))) => Err(SlotError::failure(e.to_string())),
        Ok(Ok(Ok(value))) => Ok(value),
    }
}
