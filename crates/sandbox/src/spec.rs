//! Per-execution sandbox specification.

use std::path::PathBuf;
use std::time::Duration;

use conveyor_config::SandboxSettings;

/// Everything the runner needs to know about one child's isolation.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Directory the child starts in; always inside the task workspace
    pub working_dir: PathBuf,
    /// Paths the child may read (shared tool directories)
    pub read_only_paths: Vec<PathBuf>,
    /// Paths the child may read and write (the task workspace, shared drop area)
    pub read_write_paths: Vec<PathBuf>,
    /// Apply the filesystem allow-list
    pub restrict_filesystem: bool,
    /// Leave network access enabled (off by default)
    pub allow_network: bool,
    /// RLIMIT_CPU ceiling in seconds
    pub cpu_secs: Option<u64>,
    /// RLIMIT_AS ceiling in bytes
    pub memory_bytes: Option<u64>,
    /// Wall-clock budget; the child group is killed when it expires
    pub timeout: Duration,
}

impl SandboxSpec {
    /// Build a spec for one step from the configured ceilings.
    #[must_use]
    pub fn for_workspace(
        settings: &SandboxSettings,
        working_dir: PathBuf,
        workspace_root: PathBuf,
        extra_writable: Vec<PathBuf>,
        allow_network: bool,
        timeout: Duration,
    ) -> Self {
        let mut read_write_paths = vec![workspace_root];
        read_write_paths.extend(extra_writable);
        Self {
            working_dir,
            read_only_paths: settings.shared_tool_paths.clone(),
            read_write_paths,
            restrict_filesystem: settings.restrict_filesystem,
            allow_network,
            cpu_secs: settings.cpu_secs,
            memory_bytes: settings.memory_bytes,
            timeout,
        }
    }

    /// A spec with no isolation at all: process group and timeout supervision
    /// only. Constructing one is a deliberate, visible choice; the runner
    /// never downgrades to this on its own.
    #[must_use]
    pub fn unrestricted(working_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            working_dir,
            read_only_paths: Vec::new(),
            read_write_paths: Vec::new(),
            restrict_filesystem: false,
            allow_network: true,
            cpu_secs: None,
            memory_bytes: None,
            timeout,
        }
    }

    /// Whether any isolation backend has to be initialized for this spec
    #[must_use]
    pub fn wants_isolation(&self) -> bool {
        self.restrict_filesystem
            || !self.allow_network
            || self.cpu_secs.is_some()
            || self.memory_bytes.is_some()
    }
}
