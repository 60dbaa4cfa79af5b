use std::sync::Arc;

use super::SessionLog;
use super::entry::LogEntry;
use crate::error::Result;
use crate::error::sync::lock;

/// Lazy, restartable, finite view over part of a session log.
///
/// The upper bound is fixed when the range is created, so entries appended
/// afterwards are never yielded. Entries are fetched one at a time; the
/// session lock is only held while cloning a single `Arc`.
#[derive(Clone)]
pub struct LogRange {
    session: Arc<SessionLog>,
    start: usize,
    end: usize,
    cursor: usize,
}

impl LogRange {
    pub(super) fn new(session: Arc<SessionLog>, start: usize, end: usize) -> Self {
        Self {
            session,
            start,
            end,
            cursor: start,
        }
    }

    /// Rewind to the first entry of the range.
    pub fn restart(&mut self) {
        self.cursor = self.start;
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Like `next`, but reports a poisoned session instead of ending early.
    pub fn try_next(&mut self) -> Result<Option<Arc<LogEntry>>> {
        if self.cursor >= self.end {
            return Ok(None);
        }
        let entry = lock(&self.session.state, "session state")?
            .entries
            .get(self.cursor)
            .cloned();
        if entry.is_some() {
            self.cursor += 1;
        }
        Ok(entry)
    }
}

impl std::fmt::Debug for LogRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRange")
            .field("session", &self.session.id)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl Iterator for LogRange {
    type Item = Arc<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.try_next() {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(session = %self.session.id, "log range stopped: {e}");
                self.cursor = self.end;
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end.saturating_sub(self.cursor);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for LogRange {}
