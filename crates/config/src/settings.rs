//! Typed runtime settings.
//!
//! Settings are loaded from a JSON file and then overridden by `CONVEYOR_*`
//! environment variables, so deployments can tune the orchestrator without
//! editing the file. Nothing here is hard-coded into the execution path; every
//! component receives its knobs through this struct.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use conveyor_core::{
    Error, Result, CONVEYOR_MAX_CONCURRENT_VAR, CONVEYOR_RETAIN_DAYS_VAR, CONVEYOR_TASKS_ROOT_VAR,
};

/// What happens to a submission when the concurrency cap is already reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Fail the submission immediately with a capacity error
    Reject,
    /// Block the caller on a bounded queue until a slot frees up
    Queue { depth: usize },
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self::Reject
    }
}

/// Resource and isolation ceilings applied to every step child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSettings {
    /// RLIMIT_CPU in seconds, None = unlimited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_secs: Option<u64>,
    /// RLIMIT_AS in bytes, None = unlimited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    /// Whether filesystem isolation (landlock allow-list) is applied
    pub restrict_filesystem: bool,
    /// Whether network access is disabled for steps that do not opt in
    pub restrict_network: bool,
    /// Read-only paths visible to every step in addition to the workspace
    #[serde(default)]
    pub shared_tool_paths: Vec<PathBuf>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            cpu_secs: Some(300),
            memory_bytes: Some(2 * 1024 * 1024 * 1024),
            restrict_filesystem: true,
            restrict_network: true,
            shared_tool_paths: vec![PathBuf::from("/usr"), PathBuf::from("/bin"), PathBuf::from("/lib")],
        }
    }
}

/// Audit log location and rotation thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSettings {
    pub path: PathBuf,
    /// Rotate once the current log exceeds this size
    pub max_bytes: u64,
    /// Rotate once the current log is older than this many days
    pub max_age_days: u32,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(conveyor_core::AUDIT_LOG_NAME),
            max_bytes: 16 * 1024 * 1024,
            max_age_days: 7,
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Root under which date-partitioned task workspaces live
    pub tasks_root: PathBuf,
    /// Shared, tool-defined drop area the artifact collector also sweeps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_output_dir: Option<PathBuf>,
    /// Workspaces older than this many days are removed by the sweeper
    pub retain_days: u32,
    /// Hard cap on concurrently running tasks
    pub max_concurrent_tasks: usize,
    pub admission: AdmissionPolicy,
    /// Applied when a step does not declare its own timeout
    pub default_step_timeout_secs: u64,
    pub sandbox: SandboxSettings,
    pub audit: AuditSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tasks_root: PathBuf::from("tasks"),
            shared_output_dir: None,
            retain_days: 14,
            max_concurrent_tasks: 4,
            admission: AdmissionPolicy::Reject,
            default_step_timeout_secs: 300,
            sandbox: SandboxSettings::default(),
            audit: AuditSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_system(path.to_path_buf(), "read configuration", e))?;
        let mut settings: Settings = serde_json::from_str(&content)?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults plus environment overrides, for installs with no config file.
    pub fn from_env() -> Result<Self> {
        let mut settings = Settings::default();
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Environment overrides beat the file; useful for containers and tests.
    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var(CONVEYOR_TASKS_ROOT_VAR) {
            tracing::debug!(%root, "overriding tasks root from environment");
            self.tasks_root = PathBuf::from(root);
        }
        if let Ok(value) = std::env::var(CONVEYOR_MAX_CONCURRENT_VAR) {
            match value.parse() {
                Ok(parsed) => self.max_concurrent_tasks = parsed,
                Err(_) => {
                    tracing::warn!(%value, "ignoring unparsable {CONVEYOR_MAX_CONCURRENT_VAR}");
                }
            }
        }
        if let Ok(value) = std::env::var(CONVEYOR_RETAIN_DAYS_VAR) {
            match value.parse() {
                Ok(parsed) => self.retain_days = parsed,
                Err(_) => {
                    tracing::warn!(%value, "ignoring unparsable {CONVEYOR_RETAIN_DAYS_VAR}");
                }
            }
        }
    }

    /// Reject configurations that cannot run safely.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(Error::configuration(
                "maxConcurrentTasks must be at least 1",
            ));
        }
        if self.retain_days == 0 {
            return Err(Error::configuration(
                "retainDays must be at least 1: workspaces must survive until their task is observable",
            ));
        }
        if self.default_step_timeout_secs == 0 {
            return Err(Error::configuration("defaultStepTimeoutSecs must be nonzero"));
        }
        if let AdmissionPolicy::Queue { depth } = self.admission {
            if depth == 0 {
                return Err(Error::configuration("admission queue depth must be nonzero"));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn zero_cap_is_rejected() {
        let settings = Settings {
            max_concurrent_tasks: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_queue_depth_is_rejected() {
        let settings = Settings {
            admission: AdmissionPolicy::Queue { depth: 0 },
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conveyor.json");
        std::fs::write(
            &path,
            r#"{
                "tasksRoot": "/var/lib/conveyor/tasks",
                "retainDays": 3,
                "maxConcurrentTasks": 2,
                "admission": { "policy": "queue", "depth": 8 }
            }"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.tasks_root, PathBuf::from("/var/lib/conveyor/tasks"));
        assert_eq!(settings.retain_days, 3);
        assert_eq!(settings.admission, AdmissionPolicy::Queue { depth: 8 });
        // Untouched fields fall back to defaults
        assert_eq!(settings.default_step_timeout_secs, 300);
    }

    #[test]
    fn malformed_file_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conveyor.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Settings::load(&path).is_err());
    }
}
