//! Append-only event log, one ordered sequence per session.
//!
//! ## Ordering
//!
//! Each session has a single critical section (its state mutex). Sequence
//! assignment, entry storage and index updates happen under it, so two
//! concurrent appends to one session always receive distinct, strictly
//! increasing sequence numbers, and an append is visible to every read
//! issued after it returns.
//!
//! Lock order: session state, then the unit-home index. The session map is
//! never held while a session state lock is taken.

mod entry;
mod range;

use std::collections::{BTreeMap, HashMap};
use std::ops::{Bound, RangeBounds};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub use entry::{
    AppendRequest, CodeEdited, ConnectionCreated, EventKind, ExecutionBatch, KindChanged,
    LogEntry, ParamsChanged, Port, PortsChanged, RuntimeChanged, UnitCreated, UnitExecuted,
    UnitKind,
};
pub use range::LogRange;

use crate::error::sync::{lock, read, write};
use crate::error::{CoreError, Result};
use crate::ids::{ConnectionId, SessionId, UnitId};

/// Sequence number of the first entry in a session unless configured.
pub const DEFAULT_SEQUENCE_START: u64 = 10_000;

/// Version tag of [`LogExport`] documents.
pub const LOG_FORMAT_VERSION: u32 = 1;

pub(crate) struct SessionLog {
    id: SessionId,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    next_sequence: u64,
    closed: bool,
    entries: Vec<Arc<LogEntry>>,
    by_unit: HashMap<UnitId, Vec<usize>>,
    by_kind: HashMap<EventKind, Vec<usize>>,
    connections: HashMap<ConnectionId, (UnitId, UnitId)>,
    units_created: u64,
    imports: u32,
}

impl SessionState {
    fn new(next_sequence: u64) -> Self {
        Self {
            next_sequence,
            ..Self::default()
        }
    }

    /// Units an entry touches: its own unit plus both connection endpoints.
    fn units_touched(&self, entry: &LogEntry) -> Result<Vec<UnitId>> {
        let mut units: Vec<UnitId> = entry.unit_id.iter().cloned().collect();
        match entry.kind {
            EventKind::ConnectionCreated => {
                let edge: ConnectionCreated = entry.decode()?;
                units.push(edge.source_unit);
                units.push(edge.target_unit);
            }
            EventKind::ConnectionDeleted => {
                if let Some((source, target)) = entry
                    .connection_id
                    .as_ref()
                    .and_then(|id| self.connections.get(id))
                {
                    units.push(source.clone());
                    units.push(target.clone());
                }
            }
            _ => {}
        }
        units.sort();
        units.dedup();
        Ok(units)
    }

    fn push(&mut self, entry: Arc<LogEntry>, units: &[UnitId]) -> Result<()> {
        let index = self.entries.len();
        if entry.kind == EventKind::ConnectionCreated
            && let Some(connection_id) = entry.connection_id.clone()
        {
            let edge: ConnectionCreated = entry.decode()?;
            self.connections
                .insert(connection_id, (edge.source_unit, edge.target_unit));
        }
        for unit in units {
            self.by_unit.entry(unit.clone()).or_default().push(index);
        }
        self.by_kind.entry(entry.kind).or_default().push(index);
        if let Some(order) = entry.creation_order {
            self.units_created = self.units_created.max(order);
        }
        if let Some(order) = entry.import_order {
            self.imports = self.imports.max(order);
        }
        match entry.kind {
            EventKind::SessionClosed => self.closed = true,
            EventKind::SessionCreated => self.closed = false,
            _ => {}
        }
        self.next_sequence = entry.sequence_number + 1;
        self.entries.push(entry);
        Ok(())
    }

    /// Index of the first entry with `sequence_number >= seq`.
    fn lower_bound(&self, seq: u64) -> usize {
        self.entries.partition_point(|e| e.sequence_number < seq)
    }
}

/// Per-session counters, as reported by [`EventLog::session_stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub session_id: SessionId,
    pub closed: bool,
    pub entry_count: usize,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    pub unit_count: usize,
    pub connection_count: usize,
    pub by_kind: BTreeMap<EventKind, usize>,
}

/// Serialized form of one session, for the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogExport {
    pub format_version: u32,
    pub session_id: SessionId,
    pub next_sequence: u64,
    pub closed: bool,
    pub entries: Vec<LogEntry>,
}

pub struct EventLog {
    sessions: RwLock<HashMap<SessionId, Arc<SessionLog>>>,
    /// First session that referenced each unit.
    unit_home: RwLock<HashMap<UnitId, SessionId>>,
    sequence_start: u64,
}

fn check_session_id(session_id: &SessionId) -> Result<()> {
    if session_id.is_file_safe() {
        Ok(())
    } else {
        Err(CoreError::InvalidSession {
            session_id: session_id.clone(),
            reason: "session ids may only contain letters, digits, '-', '_' and '.'",
        })
    }
}

impl EventLog {
    pub fn new(sequence_start: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            unit_home: RwLock::new(HashMap::new()),
            sequence_start,
        }
    }

    // ── Sessions ──────────────────────────────────────────────────────

    pub fn open_session(&self) -> Result<SessionId> {
        self.open_session_with_id(SessionId::generate())
    }

    pub fn open_session_with_id(&self, session_id: SessionId) -> Result<SessionId> {
        check_session_id(&session_id)?;
        {
            let mut sessions = write(&self.sessions, "session map")?;
            if sessions.contains_key(&session_id) {
                return Err(CoreError::SessionAlreadyExists { session_id });
            }
            sessions.insert(
                session_id.clone(),
                Arc::new(SessionLog {
                    id: session_id.clone(),
                    state: Mutex::new(SessionState::new(self.sequence_start)),
                }),
            );
        }
        self.append(&session_id, AppendRequest::new(EventKind::SessionCreated))?;
        tracing::info!(session = %session_id, "session opened");
        Ok(session_id)
    }

    /// Append `session_closed`; afterwards the session only serves reads.
    pub fn close_session(&self, session_id: &SessionId) -> Result<String> {
        let entry_id = self.append(session_id, AppendRequest::new(EventKind::SessionClosed))?;
        tracing::info!(session = %session_id, "session closed");
        Ok(entry_id)
    }

    pub fn is_closed(&self, session_id: &SessionId) -> Result<bool> {
        let session = self.session(session_id)?;
        Ok(lock(&session.state, "session state")?.closed)
    }

    pub fn session_ids(&self) -> Result<Vec<SessionId>> {
        let mut ids: Vec<SessionId> = read(&self.sessions, "session map")?
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn session(&self, session_id: &SessionId) -> Result<Arc<SessionLog>> {
        read(&self.sessions, "session map")?
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoreError::InvalidSession {
                session_id: session_id.clone(),
                reason: "unknown session",
            })
    }

    // ── Append ────────────────────────────────────────────────────────

    /// Append one entry and return its id.
    pub fn append(&self, session_id: &SessionId, request: AppendRequest) -> Result<String> {
        self.append_entry(session_id, request)
            .map(|entry| entry.entry_id.clone())
    }

    /// Append one entry and return the stored, immutable record.
    pub fn append_entry(
        &self,
        session_id: &SessionId,
        request: AppendRequest,
    ) -> Result<Arc<LogEntry>> {
        request.validate()?;
        let session = self.session(session_id)?;
        let mut state = lock(&session.state, "session state")?;
        if state.closed {
            return Err(CoreError::InvalidSession {
                session_id: session_id.clone(),
                reason: "session is closed",
            });
        }

        let sequence_number = state.next_sequence;
        let creation_order =
            (request.kind == EventKind::UnitCreated).then_some(state.units_created + 1);
        let import_order = match request.kind {
            EventKind::FileImported | EventKind::RepositoryImported => {
                Some(request.import_order.unwrap_or(state.imports + 1))
            }
            _ => request.import_order,
        };
        let entry = LogEntry {
            entry_id: LogEntry::entry_id_for(session_id, sequence_number),
            session_id: session_id.clone(),
            sequence_number,
            timestamp: Utc::now(),
            kind: request.kind,
            unit_id: request.unit_id,
            connection_id: request.connection_id,
            source_runtime_id: request.source_runtime_id,
            target_runtime_id: request.target_runtime_id,
            import_order,
            creation_order,
            payload: request.payload,
        };

        let units = state.units_touched(&entry)?;
        {
            let mut homes = write(&self.unit_home, "unit home index")?;
            for unit in &units {
                if let Some(owner) = homes.get(unit)
                    && owner != session_id
                {
                    return Err(CoreError::ForeignUnit {
                        unit_id: unit.clone(),
                        owner: owner.clone(),
                    });
                }
            }
            for unit in &units {
                homes
                    .entry(unit.clone())
                    .or_insert_with(|| session_id.clone());
            }
        }

        let entry = Arc::new(entry);
        state.push(Arc::clone(&entry), &units)?;
        tracing::trace!(
            session = %session_id,
            seq = sequence_number,
            kind = %entry.kind,
            "log entry appended"
        );
        Ok(entry)
    }

    // ── Reads ─────────────────────────────────────────────────────────

    /// Entries with sequence numbers inside `range`, capped at the last
    /// entry that existed when this call was made. Closed sessions stay
    /// readable.
    pub fn read_range(
        &self,
        session_id: &SessionId,
        range: impl RangeBounds<u64>,
    ) -> Result<LogRange> {
        let session = self.session(session_id)?;
        let (start, end) = {
            let state = lock(&session.state, "session state")?;
            let start = match range.start_bound() {
                Bound::Included(seq) => state.lower_bound(*seq),
                Bound::Excluded(seq) => state.lower_bound(seq.saturating_add(1)),
                Bound::Unbounded => 0,
            };
            let end = match range.end_bound() {
                Bound::Included(seq) => state.lower_bound(seq.saturating_add(1)),
                Bound::Excluded(seq) => state.lower_bound(*seq),
                Bound::Unbounded => state.entries.len(),
            };
            (start, end.max(start))
        };
        Ok(LogRange::new(session, start, end))
    }

    pub fn entry(
        &self,
        session_id: &SessionId,
        sequence_number: u64,
    ) -> Result<Option<Arc<LogEntry>>> {
        let session = self.session(session_id)?;
        let state = lock(&session.state, "session state")?;
        let index = state.lower_bound(sequence_number);
        Ok(state
            .entries
            .get(index)
            .filter(|e| e.sequence_number == sequence_number)
            .cloned())
    }

    pub fn last_sequence(&self, session_id: &SessionId) -> Result<Option<u64>> {
        let session = self.session(session_id)?;
        let state = lock(&session.state, "session state")?;
        Ok(state.entries.last().map(|e| e.sequence_number))
    }

    pub fn session_of(&self, unit_id: &UnitId) -> Result<Option<SessionId>> {
        Ok(read(&self.unit_home, "unit home index")?.get(unit_id).cloned())
    }

    /// Entries touching `unit_id` with `after < seq <= up_to`, in log order.
    pub fn unit_entries(
        &self,
        unit_id: &UnitId,
        after: u64,
        up_to: Option<u64>,
    ) -> Result<Vec<Arc<LogEntry>>> {
        let Some(session_id) = self.session_of(unit_id)? else {
            return Err(CoreError::UnitNotFound {
                unit_id: unit_id.clone(),
            });
        };
        let session = self.session(&session_id)?;
        let state = lock(&session.state, "session state")?;
        let indices = state.by_unit.get(unit_id).map(Vec::as_slice).unwrap_or(&[]);
        let first = indices.partition_point(|&i| state.entries[i].sequence_number <= after);
        Ok(indices[first..]
            .iter()
            .map(|&i| &state.entries[i])
            .take_while(|e| up_to.is_none_or(|limit| e.sequence_number <= limit))
            .cloned()
            .collect())
    }

    /// Every entry that ever touched the unit.
    pub fn unit_history(&self, unit_id: &UnitId) -> Result<Vec<Arc<LogEntry>>> {
        self.unit_entries(unit_id, 0, None)
    }

    /// `unit_executed` entries for one unit, oldest first.
    pub fn unit_executions(&self, unit_id: &UnitId) -> Result<Vec<Arc<LogEntry>>> {
        let mut history = self.unit_history(unit_id)?;
        history.retain(|entry| entry.kind == EventKind::UnitExecuted);
        Ok(history)
    }

    pub fn entries_by_kind(
        &self,
        session_id: &SessionId,
        kind: EventKind,
    ) -> Result<Vec<Arc<LogEntry>>> {
        let session = self.session(session_id)?;
        let state = lock(&session.state, "session state")?;
        Ok(state
            .by_kind
            .get(&kind)
            .map(|indices| indices.iter().map(|&i| Arc::clone(&state.entries[i])).collect())
            .unwrap_or_default())
    }

    /// Units referenced by the session, in order of first appearance.
    pub fn units_in_session(&self, session_id: &SessionId) -> Result<Vec<UnitId>> {
        let session = self.session(session_id)?;
        let state = lock(&session.state, "session state")?;
        let mut units: Vec<(usize, UnitId)> = state
            .by_unit
            .iter()
            .filter_map(|(unit, indices)| indices.first().map(|&i| (i, unit.clone())))
            .collect();
        units.sort();
        Ok(units.into_iter().map(|(_, unit)| unit).collect())
    }

    /// Endpoints of a connection as recorded when it was created.
    pub fn connection_endpoints(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<Option<(UnitId, UnitId)>> {
        let session = self.session(session_id)?;
        let state = lock(&session.state, "session state")?;
        Ok(state.connections.get(connection_id).cloned())
    }

    pub fn session_stats(&self, session_id: &SessionId) -> Result<SessionStats> {
        let session = self.session(session_id)?;
        let state = lock(&session.state, "session state")?;
        Ok(SessionStats {
            session_id: session_id.clone(),
            closed: state.closed,
            entry_count: state.entries.len(),
            first_sequence: state.entries.first().map(|e| e.sequence_number),
            last_sequence: state.entries.last().map(|e| e.sequence_number),
            unit_count: state.by_unit.len(),
            connection_count: state.connections.len(),
            by_kind: state
                .by_kind
                .iter()
                .map(|(kind, indices)| (*kind, indices.len()))
                .collect(),
        })
    }

    // ── Export / import ───────────────────────────────────────────────

    pub fn export_log(&self, session_id: &SessionId) -> Result<LogExport> {
        let session = self.session(session_id)?;
        let state = lock(&session.state, "session state")?;
        tracing::info!(session = %session_id, entries = state.entries.len(), "log exported");
        Ok(LogExport {
            format_version: LOG_FORMAT_VERSION,
            session_id: session_id.clone(),
            next_sequence: state.next_sequence,
            closed: state.closed,
            entries: state.entries.iter().map(|e| e.as_ref().clone()).collect(),
        })
    }

    /// Rebuild a session from an export. The document is validated in
    /// full before anything becomes visible.
    pub fn import_log(&self, export: LogExport) -> Result<SessionId> {
        if export.format_version != LOG_FORMAT_VERSION {
            return Err(CoreError::corrupt_log(format!(
                "unsupported log format version {}",
                export.format_version
            )));
        }
        let session_id = export.session_id.clone();
        check_session_id(&session_id)?;
        let mut state = SessionState::new(export.next_sequence);
        let mut touched: Vec<UnitId> = Vec::new();
        let mut previous: Option<u64> = None;
        for entry in export.entries {
            if entry.session_id != session_id {
                return Err(CoreError::corrupt_log(format!(
                    "entry {} belongs to session {}",
                    entry.entry_id, entry.session_id
                )));
            }
            if previous.is_some_and(|prev| entry.sequence_number <= prev) {
                return Err(CoreError::corrupt_log(format!(
                    "sequence {} is not strictly increasing",
                    entry.sequence_number
                )));
            }
            if entry.kind.targets_unit() && entry.unit_id.is_none() {
                return Err(CoreError::corrupt_log(format!(
                    "entry {} ({}) has no unit",
                    entry.entry_id, entry.kind
                )));
            }
            previous = Some(entry.sequence_number);
            let units = state.units_touched(&entry)?;
            touched.extend(units.iter().cloned());
            state.push(Arc::new(entry), &units)?;
        }
        if let Some(last) = previous
            && export.next_sequence <= last
        {
            return Err(CoreError::corrupt_log(format!(
                "next sequence {} does not follow last entry {last}",
                export.next_sequence
            )));
        }
        state.next_sequence = export.next_sequence;
        state.closed = export.closed;

        let mut sessions = write(&self.sessions, "session map")?;
        if sessions.contains_key(&session_id) {
            return Err(CoreError::SessionAlreadyExists { session_id });
        }
        let mut homes = write(&self.unit_home, "unit home index")?;
        for unit in &touched {
            if let Some(owner) = homes.get(unit)
                && owner != &session_id
            {
                return Err(CoreError::ForeignUnit {
                    unit_id: unit.clone(),
                    owner: owner.clone(),
                });
            }
        }
        for unit in touched {
            homes.entry(unit).or_insert_with(|| session_id.clone());
        }
        let entry_count = state.entries.len();
        sessions.insert(
            session_id.clone(),
            Arc::new(SessionLog {
                id: session_id.clone(),
                state: Mutex::new(state),
            }),
        );
        tracing::info!(session = %session_id, entries = entry_count, "log imported");
        Ok(session_id)
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_SEQUENCE_START)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::registry::RuntimeId;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn created(unit: &str, code: &str) -> AppendRequest {
        AppendRequest::new(EventKind::UnitCreated)
            .unit(UnitId::from(unit))
            .source_runtime(RuntimeId::PYTHON)
            .payload(json!({
                "unit_kind": "function",
                "display_name": unit,
                "source_code": code,
            }))
    }

    fn edit(unit: &str, code: &str) -> AppendRequest {
        AppendRequest::new(EventKind::CodeEdited)
            .unit(UnitId::from(unit))
            .payload(json!({"new_code": code}))
    }

    #[test]
    fn test_sequence_starts_at_configured_value() {
        let log = EventLog::default();
        let session = log.open_session().expect("open");
        let id = log.append(&session, created("u1", "x")).expect("append");

        assert_eq!(id, format!("{session}-10001"));
        assert_eq!(log.last_sequence(&session).expect("seq"), Some(10_001));
    }

    #[test]
    fn test_closed_session_rejects_appends_but_stays_readable() {
        let log = EventLog::default();
        let session = log.open_session().expect("open");
        log.append(&session, created("u1", "x")).expect("append");
        log.close_session(&session).expect("close");

        let err = match log.append(&session, edit("u1", "y")) {
            Ok(_) => panic!("closed session must reject appends"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidSession);
        assert_eq!(log.read_range(&session, ..).expect("range").count(), 3);
    }

    #[test]
    fn test_unknown_session_is_invalid() {
        let log = EventLog::default();
        let err = match log.append(&SessionId::from("nope"), edit("u1", "y")) {
            Ok(_) => panic!("unknown session must be rejected"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidSession);
    }

    #[test]
    fn test_session_ids_must_be_plain_names() {
        let log = EventLog::default();
        for bad in ["../../escaped", "a/b", "a\\b", ".hidden", "", "tab\there"] {
            let err = match log.open_session_with_id(SessionId::from(bad)) {
                Ok(_) => panic!("{bad:?} must be rejected"),
                Err(e) => e,
            };
            assert_eq!(err.kind(), ErrorKind::InvalidSession, "{bad:?}");
        }
        assert!(log.session_ids().expect("ids").is_empty());
        log.open_session_with_id(SessionId::from("design-review_2.v1"))
            .expect("plain name");

        let source = EventLog::default();
        let session = source.open_session().expect("open");
        let mut export = source.export_log(&session).expect("export");
        export.session_id = SessionId::from("../../escaped");
        let err = match EventLog::default().import_log(export) {
            Ok(_) => panic!("unsafe imported id must be rejected"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidSession);
    }

    #[test]
    fn test_read_range_reports_poisoned_session() {
        let log = EventLog::default();
        let session = log.open_session().expect("open");
        log.append(&session, created("u1", "x")).expect("append");
        let mut range = log.read_range(&session, ..).expect("range");
        assert!(range.try_next().expect("first").is_some());

        let shared = log.session(&session).expect("session");
        let _ = std::thread::spawn(move || {
            let _guard = shared.state.lock().expect("lock");
            panic!("writer died holding the session lock");
        })
        .join();

        let err = match range.try_next() {
            Ok(entry) => panic!("expected poisoned session, got {entry:?}"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::Poisoned);
        range.restart();
        assert_eq!(range.next(), None);
        assert_eq!(range.next(), None);
    }

    #[test]
    fn test_read_range_is_capped_and_restartable() {
        let log = EventLog::default();
        let session = log.open_session().expect("open");
        for i in 0..4 {
            log.append(&session, edit("u1", &format!("v{i}"))).expect("append");
        }

        let mut range = log.read_range(&session, 10_001..=10_003).expect("range");
        log.append(&session, edit("u1", "late")).expect("append");

        let seqs: Vec<u64> = range.by_ref().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![10_001, 10_002, 10_003]);

        range.restart();
        assert_eq!(range.len(), 3);

        let open_ended: Vec<u64> = log
            .read_range(&session, 10_003..)
            .expect("range")
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(open_ended, vec![10_003, 10_004, 10_005]);
    }

    #[test]
    fn test_unit_belongs_to_first_session() {
        let log = EventLog::default();
        let first = log.open_session().expect("open");
        let second = log.open_session().expect("open");
        log.append(&first, created("u1", "x")).expect("append");

        let err = match log.append(&second, edit("u1", "y")) {
            Ok(_) => panic!("foreign unit must be rejected"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::ForeignUnit);
    }

    #[test]
    fn test_connection_events_index_both_endpoints() {
        let log = EventLog::default();
        let session = log.open_session().expect("open");
        log.append(&session, created("a", "x")).expect("append");
        log.append(&session, created("b", "y")).expect("append");
        let conn = ConnectionId::from("c1");
        log.append(
            &session,
            AppendRequest::new(EventKind::ConnectionCreated)
                .connection(conn.clone())
                .payload(json!({
                    "source_unit": "a", "source_port": "out",
                    "target_unit": "b", "target_port": "in",
                })),
        )
        .expect("connect");
        log.append(
            &session,
            AppendRequest::new(EventKind::ConnectionDeleted).connection(conn.clone()),
        )
        .expect("disconnect");

        let kinds: Vec<EventKind> = log
            .unit_history(&UnitId::from("b"))
            .expect("history")
            .iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::UnitCreated,
                EventKind::ConnectionCreated,
                EventKind::ConnectionDeleted
            ]
        );
        assert_eq!(
            log.connection_endpoints(&session, &conn).expect("endpoints"),
            Some((UnitId::from("a"), UnitId::from("b")))
        );
    }

    #[test]
    fn test_creation_and_import_order_assigned() {
        let log = EventLog::default();
        let session = log.open_session().expect("open");
        let import = log
            .append_entry(&session, AppendRequest::new(EventKind::FileImported))
            .expect("import");
        assert_eq!(import.import_order, Some(1));

        log.append(&session, created("a", "x")).expect("append");
        let b = log.append_entry(&session, created("b", "y")).expect("append");
        assert_eq!(b.creation_order, Some(2));

        let stats = log.session_stats(&session).expect("stats");
        assert_eq!(stats.unit_count, 2);
        assert_eq!(stats.by_kind.get(&EventKind::UnitCreated), Some(&2));
    }

    #[test]
    fn test_export_import_rebuilds_session() {
        let source = EventLog::default();
        let session = source.open_session().expect("open");
        source.append(&session, created("u1", "x")).expect("append");
        source.append(&session, edit("u1", "y")).expect("append");
        let export = source.export_log(&session).expect("export");

        let target = EventLog::default();
        target.import_log(export.clone()).expect("import");
        assert_eq!(target.export_log(&session).expect("export"), export);
        assert_eq!(target.unit_history(&UnitId::from("u1")).expect("history").len(), 2);

        let id = target.append(&session, edit("u1", "z")).expect("append");
        assert_eq!(id, format!("{session}-10003"));
    }

    #[test]
    fn test_import_rejects_out_of_order_entries() {
        let source = EventLog::default();
        let session = source.open_session().expect("open");
        source.append(&session, created("u1", "x")).expect("append");
        let mut export = source.export_log(&session).expect("export");
        export.entries.reverse();

        let err = match EventLog::default().import_log(export) {
            Ok(_) => panic!("out of order import must fail"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::CorruptLog);
    }
}
