//! Task workspace allocation.
//!
//! Each task owns exactly one directory tree
//! `tasks/<date>/<taskId>/{input,temp,output,logs}` under a date-partitioned
//! root. Trees are created before the pipeline starts and are never reused
//! across tasks; only the retention sweeper removes them.

use std::fs;
use std::path::{Path, PathBuf};

use conveyor_core::{
    Error, Result, TaskId, INPUT_DIR, LOGS_DIR, OUTPUT_DIR, PARTITION_DATE_FORMAT, TEMP_DIR,
};

/// The directory tree owned by one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Wrap an existing workspace root (used by the sweeper and by recovery)
    #[must_use]
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn input_dir(&self) -> PathBuf {
        self.root.join(INPUT_DIR)
    }

    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    /// Whether `path` lies inside this workspace. Artifact paths must.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}

/// Creates task-scoped directory trees under a date-partitioned root.
#[derive(Debug, Clone)]
pub struct WorkspaceAllocator {
    tasks_root: PathBuf,
}

impl WorkspaceAllocator {
    #[must_use]
    pub fn new(tasks_root: impl Into<PathBuf>) -> Self {
        Self {
            tasks_root: tasks_root.into(),
        }
    }

    #[must_use]
    pub fn tasks_root(&self) -> &Path {
        &self.tasks_root
    }

    /// Create the full tree for one task.
    ///
    /// The task id is collision-free, so an already-existing root means a
    /// previous allocation for the same id and is rejected rather than reused.
    pub fn allocate(&self, task_id: TaskId, now: chrono::DateTime<chrono::Utc>) -> Result<Workspace> {
        let partition = now.format(PARTITION_DATE_FORMAT).to_string();
        let root = self.tasks_root.join(partition).join(task_id.to_string());

        if root.exists() {
            return Err(Error::configuration(format!(
                "workspace '{}' already exists, refusing to reuse it",
                root.display()
            )));
        }

        for dir in [INPUT_DIR, TEMP_DIR, OUTPUT_DIR, LOGS_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .map_err(|e| Error::file_system(path, "create workspace directory", e))?;
        }

        tracing::debug!(task_id = %task_id, root = %root.display(), "workspace allocated");
        Ok(Workspace::at(root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_all_four_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = WorkspaceAllocator::new(dir.path());
        let ws = allocator.allocate(TaskId::new(), chrono::Utc::now()).unwrap();

        assert!(ws.input_dir().is_dir());
        assert!(ws.temp_dir().is_dir());
        assert!(ws.output_dir().is_dir());
        assert!(ws.logs_dir().is_dir());
    }

    #[test]
    fn partitions_by_date() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = WorkspaceAllocator::new(dir.path());
        let now = chrono::Utc::now();
        let ws = allocator.allocate(TaskId::new(), now).unwrap();

        let partition = now.format(PARTITION_DATE_FORMAT).to_string();
        assert!(ws.root().starts_with(dir.path().join(partition)));
    }

    #[test]
    fn refuses_to_reuse_an_existing_root() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = WorkspaceAllocator::new(dir.path());
        let id = TaskId::new();
        let now = chrono::Utc::now();
        allocator.allocate(id, now).unwrap();
        assert!(allocator.allocate(id, now).is_err());
    }

    #[test]
    fn containment_check_tracks_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = WorkspaceAllocator::new(dir.path());
        let ws = allocator.allocate(TaskId::new(), chrono::Utc::now()).unwrap();

        assert!(ws.contains(&ws.output_dir().join("artifact.bin")));
        assert!(!ws.contains(Path::new("/etc/passwd")));
    }
}
