//! File-backed session snapshot.
//!
//! The actor is the only writer. Control surfaces read `session.json` to
//! reconstruct status after being closed and reopened.
//!
//! # File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "snapshot": { "active": true, "stats": { ... }, "target_handle": "...", "session_id": "..." }
//! }
//! ```
//!
//! Missing, empty, corrupt, or wrong-version files read as an inactive snapshot.
//! Writes go through a temp file + rename so readers never see a partial file.

use chrono::Utc;
use crawl_capture_protocol::SessionSnapshot;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    snapshot: SessionSnapshot,
}

pub struct SnapshotStore {
    file_path: Option<PathBuf>,
    last_written: Option<SessionSnapshot>,
}

impl SnapshotStore {
    pub fn new(file_path: &Path) -> Self {
        Self {
            file_path: Some(file_path.to_path_buf()),
            last_written: None,
        }
    }

    pub fn new_in_memory() -> Self {
        Self {
            file_path: None,
            last_written: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn last_written(&self) -> Option<&SessionSnapshot> {
        self.last_written.as_ref()
    }

    pub fn load(&self) -> SessionSnapshot {
        match &self.file_path {
            Some(path) => read_snapshot(path),
            None => self.last_written.clone().unwrap_or_default(),
        }
    }

    pub fn save(&mut self, snapshot: &SessionSnapshot) -> Result<(), String> {
        let mut snapshot = snapshot.clone();
        snapshot.updated_at = Some(Utc::now().to_rfc3339());

        if let Some(file_path) = &self.file_path {
            write_snapshot(file_path, &snapshot)?;
        }
        self.last_written = Some(snapshot);
        Ok(())
    }

    /// No session survives a daemon restart; a snapshot still claiming
    /// `active` is left over from a crash. Stats are kept for display.
    pub fn reset_stale(&mut self) -> Result<bool, String> {
        let snapshot = self.load();
        if !snapshot.active {
            return Ok(false);
        }

        warn!(
            session_id = ?snapshot.session_id,
            target_handle = ?snapshot.target_handle,
            "Resetting stale active snapshot left by a previous daemon"
        );
        self.save(&SessionSnapshot {
            active: false,
            stats: snapshot.stats,
            target_handle: None,
            session_id: None,
            updated_at: None,
        })?;
        Ok(true)
    }
}

/// Reads the snapshot file the way a reopened control surface would.
pub fn read_snapshot(path: &Path) -> SessionSnapshot {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return SessionSnapshot::default()
        }
        Err(err) => {
            warn!(error = %err, "Failed to read session snapshot");
            return SessionSnapshot::default();
        }
    };

    if content.trim().is_empty() {
        return SessionSnapshot::default();
    }

    match serde_json::from_str::<StoreFile>(&content) {
        Ok(file) if file.version == STORE_VERSION => file.snapshot,
        Ok(file) => {
            warn!(
                version = file.version,
                expected = STORE_VERSION,
                "Unsupported session snapshot version"
            );
            SessionSnapshot::default()
        }
        Err(err) => {
            warn!(error = %err, "Failed to parse session snapshot");
            SessionSnapshot::default()
        }
    }
}

fn write_snapshot(file_path: &Path, snapshot: &SessionSnapshot) -> Result<(), String> {
    let file = StoreFile {
        version: STORE_VERSION,
        snapshot: snapshot.clone(),
    };
    let content = serde_json::to_string_pretty(&file)
        .map_err(|e| format!("Failed to serialize snapshot: {}", e))?;

    let parent_dir = file_path
        .parent()
        .ok_or_else(|| "Snapshot path has no parent directory".to_string())?;
    fs::create_dir_all(parent_dir)
        .map_err(|e| format!("Failed to create snapshot directory: {}", e))?;
    let mut temp_file =
        NamedTempFile::new_in(parent_dir).map_err(|e| format!("Temp file error: {}", e))?;
    temp_file
        .write_all(content.as_bytes())
        .map_err(|e| format!("Failed to write temp snapshot: {}", e))?;
    temp_file
        .flush()
        .map_err(|e| format!("Failed to flush temp snapshot: {}", e))?;
    temp_file
        .persist(file_path)
        .map_err(|e| format!("Failed to write snapshot: {}", e.error))?;

    Ok(())
}
