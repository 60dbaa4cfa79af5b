use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::permissions::PermissionSet;
use crate::error::SlotError;
use crate::executor::LoadedCode;
use crate::ids::{RequestId, UnitId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputOrigin {
    Push,
    Execute,
    /// Output of a publisher slot forwarded by a subscription.
    Subscription { publisher: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInput {
    pub request_id: RequestId,
    pub origin: InputOrigin,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingInput {
    pub fn new(origin: InputOrigin, data: Value, timeout: Option<Duration>) -> Self {
        Self {
            request_id: RequestId::generate(),
            origin,
            data,
            timeout_ms: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            enqueued_at: Utc::now(),
        }
    }
}

/// One completed execution as kept in the slot's output ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub request_id: RequestId,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SlotError>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Bounded ring of execution records; the oldest record is evicted first.
#[derive(Debug, Clone)]
pub(crate) struct OutputRing {
    records: VecDeque<ExecutionRecord>,
    max: usize,
}

impl OutputRing {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(max),
            max,
        }
    }

    pub(crate) fn push(&mut self, record: ExecutionRecord) {
        if self.max == 0 {
            return;
        }
        while self.records.len() >= self.max {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Up to `n` newest records, oldest first.
    pub(crate) fn last_n(&self, n: usize) -> Vec<ExecutionRecord> {
        let skip = self.records.len().saturating_sub(n);
        self.records.iter().skip(skip).cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }
}

/// Result of the most recent load for the executed version.
#[derive(Clone)]
pub(crate) enum Loaded {
    Ready(Arc<dyn LoadedCode>),
    Failed(SlotError),
}

/// Mutable state of one matrix cell. Guarded by the slot mutex; mutated
/// only by its row's engine loop and explicit commit/release/permission
/// calls.
pub struct Slot {
    pub(crate) address: String,
    pub(crate) flat_index: usize,
    pub(crate) row_id: String,
    pub(crate) position: usize,
    pub(crate) unit_id: Option<UnitId>,
    pub(crate) committed_version: u64,
    pub(crate) executed_version: u64,
    pub(crate) loaded: Option<Loaded>,
    pub(crate) last_output: Option<Value>,
    pub(crate) last_error: Option<SlotError>,
    pub(crate) last_duration: Option<Duration>,
    pub(crate) last_executed_at: Option<DateTime<Utc>>,
    pub(crate) execution_count: u64,
    pub(crate) input_buffer: VecDeque<PendingInput>,
    pub(crate) input_capacity: usize,
    pub(crate) output_buffer: OutputRing,
    pub(crate) permissions: PermissionSet,
    pub(crate) active: bool,
    pub(crate) dirty: bool,
    pub(crate) paused: bool,
    /// Bumped on every occupancy change; results tagged with an older
    /// generation are discarded.
    pub(crate) generation: u64,
}

impl Slot {
    pub(crate) fn new(
        address: String,
        flat_index: usize,
        row_id: String,
        position: usize,
        input_capacity: usize,
        output_capacity: usize,
    ) -> Self {
        Self {
            address,
            flat_index,
            row_id,
            position,
            unit_id: None,
            committed_version: 0,
            executed_version: 0,
            loaded: None,
            last_output: None,
            last_error: None,
            last_duration: None,
            last_executed_at: None,
            execution_count: 0,
            input_buffer: VecDeque::new(),
            input_capacity,
            output_buffer: OutputRing::new(output_capacity),
            permissions: PermissionSet::default(),
            active: true,
            dirty: false,
            paused: false,
            generation: 0,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn unit_id(&self) -> Option<&UnitId> {
        self.unit_id.as_ref()
    }

    pub fn needs_hot_swap(&self) -> bool {
        self.unit_id.is_some()
            && self.committed_version > self.executed_version
            && self.active
            && !self.paused
    }

    pub(crate) fn occupy(&mut self, unit_id: UnitId, version: u64) {
        self.reset_runtime_state();
        self.unit_id = Some(unit_id);
        self.committed_version = version;
        self.dirty = true;
    }

    /// Raise the committed version; never lowers it.
    pub(crate) fn refresh(&mut self, version: u64) -> bool {
        if version > self.committed_version {
            self.committed_version = version;
            self.dirty = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn clear(&mut self) -> Option<UnitId> {
        let unit = self.unit_id.take();
        self.reset_runtime_state();
        unit
    }

    fn reset_runtime_state(&mut self) {
        self.unit_id = None;
        self.committed_version = 0;
        self.executed_version = 0;
        self.loaded = None;
        self.last_output = None;
        self.last_error = None;
        self.last_duration = None;
        self.last_executed_at = None;
        self.execution_count = 0;
        self.input_buffer.clear();
        self.output_buffer.clear();
        self.active = true;
        self.dirty = false;
        self.paused = false;
        self.generation += 1;
    }

    /// Replace the pending inputs, keeping the newest ones that fit.
    pub(crate) fn restore_inputs(&mut self, inputs: Vec<PendingInput>) {
        let dropped = inputs.len().saturating_sub(self.input_capacity);
        if dropped > 0 {
            tracing::warn!(slot = %self.address, dropped, "restored input buffer over capacity; oldest requests dropped");
        }
        self.input_buffer = inputs.into_iter().skip(dropped).collect();
    }

    /// Queue an input; a full buffer drops its oldest pending request.
    pub(crate) fn enqueue(&mut self, input: PendingInput) -> RequestId {
        if self.input_capacity == 0 {
            tracing::warn!(slot = %self.address, "input buffer has zero capacity; input dropped");
            return input.request_id;
        }
        while self.input_buffer.len() >= self.input_capacity {
            if let Some(dropped) = self.input_buffer.pop_front() {
                tracing::warn!(
                    slot = %self.address,
                    request = %dropped.request_id,
                    "input buffer full; oldest pending request dropped"
                );
            }
        }
        let request_id = input.request_id;
        self.input_buffer.push_back(input);
        request_id
    }

    pub(crate) fn cancel(&mut self, request_id: RequestId) -> bool {
        let before = self.input_buffer.len();
        self.input_buffer.retain(|p| p.request_id != request_id);
        self.input_buffer.len() != before
    }

    /// Results are withheld from the view when `read` is denied.
    pub(crate) fn view(&self) -> SlotView {
        let readable = self.permissions.read;
        SlotView {
            address: self.address.clone(),
            flat_index: self.flat_index,
            row_id: self.row_id.clone(),
            position: self.position,
            unit_id: self.unit_id.clone(),
            committed_version: self.committed_version,
            executed_version: self.executed_version,
            loaded: matches!(self.loaded, Some(Loaded::Ready(_))),
            last_output: self.last_output.clone().filter(|_| readable),
            last_error: self.last_error.clone().filter(|_| readable),
            last_duration_ms: self.last_duration.map(duration_ms),
            last_executed_at: self.last_executed_at,
            execution_count: self.execution_count,
            pending_inputs: self.input_buffer.len(),
            buffered_outputs: self.output_buffer.len(),
            permissions: self.permissions,
            active: self.active,
            dirty: self.dirty,
            paused: self.paused,
            needs_hot_swap: self.needs_hot_swap(),
        }
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Read-only copy of a slot's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotView {
    pub address: String,
    pub flat_index: usize,
    pub row_id: String,
    pub position: usize,
    pub unit_id: Option<UnitId>,
    pub committed_version: u64,
    pub executed_version: u64,
    pub loaded: bool,
    pub last_output: Option<Value>,
    pub last_error: Option<SlotError>,
    pub last_duration_ms: Option<u64>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub execution_count: u64,
    pub pending_inputs: usize,
    pub buffered_outputs: usize,
    pub permissions: PermissionSet,
    pub active: bool,
    pub dirty: bool,
    pub paused: bool,
    pub needs_hot_swap: bool,
}

impl SlotView {
    pub fn is_empty(&self) -> bool {
        self.unit_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(n: u64) -> ExecutionRecord {
        ExecutionRecord {
            request_id: RequestId::generate(),
            version: n,
            output: Some(json!(n)),
            error: None,
            duration_ms: 0,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_output_ring_evicts_oldest() {
        let mut ring = OutputRing::new(3);
        for n in 1..=5 {
            ring.push(record(n));
        }
        let versions: Vec<u64> = ring.last_n(10).iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![3, 4, 5]);
        let versions: Vec<u64> = ring.last_n(2).iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![4, 5]);
    }

    #[test]
    fn test_input_buffer_drops_oldest_when_full() {
        let mut slot = Slot::new("a1".into(), 1, "a".into(), 1, 2, 4);
        slot.occupy(UnitId::from("u1"), 1);
        let first = slot.enqueue(PendingInput::new(InputOrigin::Push, json!(1), None));
        slot.enqueue(PendingInput::new(InputOrigin::Push, json!(2), None));
        slot.enqueue(PendingInput::new(InputOrigin::Push, json!(3), None));

        assert_eq!(slot.input_buffer.len(), 2);
        assert!(!slot.cancel(first));
        let data: Vec<Value> = slot.input_buffer.iter().map(|p| p.data.clone()).collect();
        assert_eq!(data, vec![json!(2), json!(3)]);
    }

    #[test]
    fn test_clear_resets_state_and_bumps_generation() {
        let mut slot = Slot::new("a1".into(), 1, "a".into(), 1, 4, 4);
        slot.occupy(UnitId::from("u1"), 3);
        let generation = slot.generation;
        slot.enqueue(PendingInput::new(InputOrigin::Execute, json!(1), None));

        assert_eq!(slot.clear(), Some(UnitId::from("u1")));
        assert!(slot.generation > generation);
        let view = slot.view();
        assert!(view.is_empty());
        assert_eq!(view.committed_version, 0);
        assert_eq!(view.pending_inputs, 0);
    }

    #[test]
    fn test_refresh_never_lowers_version() {
        let mut slot = Slot::new("a1".into(), 1, "a".into(), 1, 4, 4);
        slot.occupy(UnitId::from("u1"), 3);
        assert!(!slot.refresh(2));
        assert!(slot.refresh(5));
        assert_eq!(slot.committed_version, 5);
        assert!(slot.needs_hot_swap());
    }
}
