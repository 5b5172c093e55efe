//! Durable per-task status files.
//!
//! `logs/status.json` is rewritten atomically at every state transition and is
//! the crash-recoverable source of truth for task state, independent of the
//! manager's in-memory table. Atomicity comes from writing a temp file in the
//! same directory, fsyncing, then renaming over the target.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use conveyor_core::{Error, Result, TaskStatusFile, STATUS_FILE};

use crate::allocator::Workspace;

/// Write data to a file atomically by writing to a temporary file and renaming
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::configuration("Invalid file path: no parent directory".to_string()))?;

    fs::create_dir_all(parent)
        .map_err(|e| Error::file_system(parent.to_path_buf(), "create parent directory", e))?;

    // Temp file in the same directory so the rename stays on one filesystem
    let temp_name = format!(".{}.tmp", uuid::Uuid::new_v4());
    let temp_path = parent.join(&temp_name);

    let result = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| Error::file_system(&temp_path, "create temporary file", e))?;

        file.write_all(content)
            .map_err(|e| Error::file_system(&temp_path, "write to temporary file", e))?;

        file.sync_all()
            .map_err(|e| Error::file_system(&temp_path, "sync temporary file", e))?;

        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
        return result;
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::file_system(path.to_path_buf(), "atomic rename", e)
    })?;

    Ok(())
}

/// Path of the status file inside a workspace
#[must_use]
pub fn status_path(workspace: &Workspace) -> PathBuf {
    workspace.logs_dir().join(STATUS_FILE)
}

/// Persist the status document for a task.
pub fn write_status(workspace: &Workspace, status: &TaskStatusFile) -> Result<()> {
    let json = serde_json::to_vec_pretty(status)?;
    write_atomic(&status_path(workspace), &json)
}

/// Read a status document back, e.g. for recovery or the sweeper's
/// terminal-state check.
pub fn read_status(path: &Path) -> Result<TaskStatusFile> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::file_system(path.to_path_buf(), "read status file", e))?;
    Ok(serde_json::from_str(&content)?)
}
