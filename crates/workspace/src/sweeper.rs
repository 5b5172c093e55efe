//! Retention sweeping of expired task workspaces.
//!
//! The sweeper walks the date partitions under the tasks root and removes
//! every task tree whose partition date is older than the retention window.
//! Removal is idempotent and tolerant of partial prior removal; a workspace
//! whose status file still reports a non-terminal state is left alone
//! regardless of age.

use std::path::PathBuf;

use chrono::NaiveDate;

use conveyor_core::{Result, PARTITION_DATE_FORMAT, STATUS_FILE};

use crate::allocator::Workspace;
use crate::status;

/// Outcome of one sweep pass. The caller records audit events from this, so a
/// pass that removed nothing produces no events.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Workspace roots that were removed in this pass
    pub removed: Vec<PathBuf>,
    /// Expired workspaces left in place because their task is not terminal
    pub skipped_non_terminal: Vec<PathBuf>,
}

/// Periodic reclamation of expired task directories.
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    tasks_root: PathBuf,
    retain_days: u32,
}

impl RetentionSweeper {
    #[must_use]
    pub fn new(tasks_root: impl Into<PathBuf>, retain_days: u32) -> Self {
        Self {
            tasks_root: tasks_root.into(),
            retain_days,
        }
    }

    /// Remove every expired, terminal task workspace. Returns what happened.
    pub async fn sweep(&self, now: chrono::DateTime<chrono::Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        if !self.tasks_root.exists() {
            // Nothing allocated yet; sweeping is a no-op
            return Ok(report);
        }

        let cutoff = now.date_naive() - chrono::Days::new(u64::from(self.retain_days));

        let mut partitions = tokio::fs::read_dir(&self.tasks_root)
            .await
            .map_err(|e| conveyor_core::Error::file_system(self.tasks_root.clone(), "read tasks root", e))?;

        while let Some(partition) = partitions
            .next_entry()
            .await
            .map_err(|e| conveyor_core::Error::file_system(self.tasks_root.clone(), "read tasks root", e))?
        {
            let name = partition.file_name();
            let Some(date) = name
                .to_str()
                .and_then(|s| NaiveDate::parse_from_str(s, PARTITION_DATE_FORMAT).ok())
            else {
                tracing::warn!(entry = %name.to_string_lossy(), "unrecognized entry under tasks root, leaving it");
                continue;
            };

            if date >= cutoff {
                continue;
            }

            self.sweep_partition(partition.path(), &mut report).await;

            // Drop the partition directory itself once it is empty
            match tokio::fs::remove_dir(partition.path()).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::debug!(
                        partition = %partition.path().display(),
                        "partition not yet empty, keeping it: {e}"
                    );
                }
            }
        }

        Ok(report)
    }

    async fn sweep_partition(&self, partition: PathBuf, report: &mut SweepReport) {
        let mut entries = match tokio::fs::read_dir(&partition).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(partition = %partition.display(), "failed to read partition: {e}");
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(partition = %partition.display(), "failed to read partition entry: {e}");
                    break;
                }
            };

            let root = entry.path();
            let workspace = Workspace::at(root.clone());
            let status_path = workspace.logs_dir().join(STATUS_FILE);

            match status::read_status(&status_path) {
                Ok(file) if !file.state.is_terminal() => {
                    tracing::info!(
                        workspace = %root.display(),
                        state = %file.state,
                        "expired workspace belongs to a non-terminal task, keeping it"
                    );
                    report.skipped_non_terminal.push(root);
                    continue;
                }
                Ok(_) => {}
                Err(_) => {
                    // No readable status file: either partial prior removal or
                    // an allocation that never got as far as its first status
                    // write. Both are safe to reclaim at this age.
                    tracing::warn!(
                        workspace = %root.display(),
                        "expired workspace has no readable status file, removing"
                    );
                }
            }

            match tokio::fs::remove_dir_all(&root).await {
                Ok(()) => {
                    tracing::info!(workspace = %root.display(), "removed expired workspace");
                    report.removed.push(root);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(workspace = %root.display(), "failed to remove workspace: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::{JobParams, JobType, TaskId, TaskRecord, TaskState};

    use crate::allocator::WorkspaceAllocator;

    fn record_in(state: TaskState) -> TaskRecord {
        let mut record = TaskRecord::new(TaskId::new(), JobType::Convert, JobParams::new());
        if state != TaskState::Created {
            record.transition(TaskState::Running).unwrap();
        }
        if state.is_terminal() {
            record.transition(state).unwrap();
        }
        record
    }

    fn allocate_aged(
        root: &std::path::Path,
        age_days: u64,
        state: TaskState,
    ) -> crate::allocator::Workspace {
        let allocator = WorkspaceAllocator::new(root);
        let then = chrono::Utc::now() - chrono::Duration::days(age_days as i64);
        let ws = allocator.allocate(TaskId::new(), then).unwrap();
        status::write_status(&ws, &record_in(state).status_file()).unwrap();
        ws
    }

    #[tokio::test]
    async fn removes_expired_terminal_workspaces() {
        let dir = tempfile::tempdir().unwrap();
        let ws = allocate_aged(dir.path(), 30, TaskState::Completed);

        let sweeper = RetentionSweeper::new(dir.path(), 14);
        let report = sweeper.sweep(chrono::Utc::now()).await.unwrap();

        assert_eq!(report.removed, vec![ws.root().to_path_buf()]);
        assert!(!ws.root().exists());
    }

    #[tokio::test]
    async fn keeps_workspaces_inside_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let ws = allocate_aged(dir.path(), 2, TaskState::Completed);

        let sweeper = RetentionSweeper::new(dir.path(), 14);
        let report = sweeper.sweep(chrono::Utc::now()).await.unwrap();

        assert!(report.removed.is_empty());
        assert!(ws.root().exists());
    }

    #[tokio::test]
    async fn never_removes_non_terminal_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let ws = allocate_aged(dir.path(), 30, TaskState::Running);

        let sweeper = RetentionSweeper::new(dir.path(), 14);
        let report = sweeper.sweep(chrono::Utc::now()).await.unwrap();

        assert!(report.removed.is_empty());
        assert_eq!(report.skipped_non_terminal, vec![ws.root().to_path_buf()]);
        assert!(ws.root().exists());
    }

    #[tokio::test]
    async fn sweeping_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        allocate_aged(dir.path(), 30, TaskState::Failed);

        let sweeper = RetentionSweeper::new(dir.path(), 14);
        let first = sweeper.sweep(chrono::Utc::now()).await.unwrap();
        assert_eq!(first.removed.len(), 1);

        let second = sweeper.sweep(chrono::Utc::now()).await.unwrap();
        assert!(second.removed.is_empty());
        assert!(second.skipped_non_terminal.is_empty());
    }

    #[tokio::test]
    async fn missing_root_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let sweeper = RetentionSweeper::new(dir.path().join("never-created"), 14);
        let report = sweeper.sweep(chrono::Utc::now()).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }
}
