//! Disk checkpoints for session logs and matrix state.
//!
//! ## Layout
//!
//! ```text
//! ~/.local/share/slotgrid/
//!   sessions/{session_id}.json   LogExport
//!   matrix.json                  MatrixExport
//! ```
//!
//! Files are written to a `.tmp` sibling and renamed into place, so a crash
//! leaves either the previous checkpoint or the new one.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CoreError, Result};
use crate::ids::SessionId;
use crate::ledger::LogExport;
use crate::matrix::MatrixExport;

const SESSIONS_DIR: &str = "sessions";
const MATRIX_FILE: &str = "matrix.json";

pub struct CheckpointStore {
    base_dir: PathBuf,
}

impl CheckpointStore {
    /// Create a store at the XDG data directory (`~/.local/share/slotgrid/`).
    pub fn new() -> Result<Self> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| {
                CoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "could not determine XDG_DATA_HOME",
                ))
            })?
            .join("slotgrid");
        Self::with_base_dir(data_dir)
    }

    /// Create a store with a custom base directory (for testing).
    pub fn with_base_dir(base_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(base_dir.join(SESSIONS_DIR))?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn session_path(&self, session_id: &SessionId) -> Result<PathBuf> {
        if !session_id.is_file_safe() {
            return Err(CoreError::InvalidSession {
                session_id: session_id.clone(),
                reason: "session id is not a plain file name",
            });
        }
        Ok(self
            .base_dir
            .join(SESSIONS_DIR)
            .join(format!("{session_id}.json")))
    }

    fn matrix_path(&self) -> PathBuf {
        self.base_dir.join(MATRIX_FILE)
    }

    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<PathBuf> {
        let json = serde_json::to_string_pretty(value)?;
        self.atomic_write(path, json.as_bytes())?;
        tracing::debug!(path = %path.display(), bytes = json.len(), "checkpoint written");
        Ok(path.to_path_buf())
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::CheckpointNotFound {
                    path: path.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&data).map_err(|e| {
            CoreError::corrupt_log(format!("unreadable checkpoint {}: {e}", path.display()))
        })
    }

    // ── Session logs ────────────────────────────────────────────────────

    pub fn write_log(&self, export: &LogExport) -> Result<PathBuf> {
        self.write_json(&self.session_path(&export.session_id)?, export)
    }

    pub fn read_log(&self, session_id: &SessionId) -> Result<LogExport> {
        self.read_json(&self.session_path(session_id)?)
    }

    /// Session ids with a checkpoint on disk, sorted.
    pub fn list_sessions(&self) -> Result<Vec<SessionId>> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(self.base_dir.join(SESSIONS_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                sessions.push(SessionId::from(stem));
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    pub fn remove_log(&self, session_id: &SessionId) -> Result<bool> {
        match std::fs::remove_file(self.session_path(session_id)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // ── Matrix ──────────────────────────────────────────────────────────

    pub fn write_matrix(&self, export: &MatrixExport) -> Result<PathBuf> {
        self.write_json(&self.matrix_path(), export)
    }

    pub fn read_matrix(&self) -> Result<MatrixExport> {
        self.read_json(&self.matrix_path())
    }
}
