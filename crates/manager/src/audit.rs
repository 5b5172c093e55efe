//! Append-only audit log with rotation.
//!
//! Every lifecycle event becomes one JSON line. A single async mutex
//! serializes writers so concurrent tasks never interleave or reorder lines.
//! The log rotates when it grows past the configured size or age: the current
//! file is renamed with a timestamp suffix and a fresh one takes its place;
//! rotation never drops or reorders prior events.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use conveyor_config::AuditSettings;
use conveyor_core::{AuditEvent, AuditRecord, Error, Result, AUDIT_ROTATED_PREFIX};

struct AuditState {
    /// When the current log file started accumulating events
    opened_at: chrono::DateTime<chrono::Utc>,
}

/// Serialized, rotating JSON-lines audit sink.
pub struct AuditLogger {
    settings: AuditSettings,
    state: Mutex<AuditState>,
}

impl AuditLogger {
    pub fn new(settings: AuditSettings) -> Result<Self> {
        if let Some(parent) = settings.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::file_system(parent.to_path_buf(), "create audit directory", e))?;
            }
        }

        // Resume the age clock from an existing file's mtime
        let opened_at = std::fs::metadata(&settings.path)
            .and_then(|m| m.modified())
            .map(chrono::DateTime::<chrono::Utc>::from)
            .unwrap_or_else(|_| chrono::Utc::now());

        Ok(Self {
            settings,
            state: Mutex::new(AuditState { opened_at }),
        })
    }

    /// Append one event, rotating first if the current log is over budget.
    pub async fn record(&self, event: AuditEvent) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(rotated_to) = self.rotate_if_needed(&mut state)? {
            let name = rotated_to
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.append(&AuditRecord::now(AuditEvent::LogRotated { rotated_to: name }))?;
        }

        self.append(&AuditRecord::now(event))
    }

    fn append(&self, record: &AuditRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.settings.path)
            .map_err(|e| Error::file_system(self.settings.path.clone(), "open audit log", e))?;
        writeln!(file, "{line}")
            .map_err(|e| Error::file_system(self.settings.path.clone(), "append audit event", e))?;
        Ok(())
    }

    /// Rotate when over size or age budget; returns the rotated-to path.
    fn rotate_if_needed(&self, state: &mut AuditState) -> Result<Option<PathBuf>> {
        let metadata = match std::fs::metadata(&self.settings.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::file_system(
                    self.settings.path.clone(),
                    "stat audit log",
                    e,
                ))
            }
        };

        let now = chrono::Utc::now();
        let over_size = metadata.len() >= self.settings.max_bytes;
        let over_age = now - state.opened_at
            >= chrono::Duration::days(i64::from(self.settings.max_age_days));
        if !over_size && !over_age {
            return Ok(None);
        }

        let stem = now.format("%Y%m%dT%H%M%S%f");
        let rotated_name = format!("{AUDIT_ROTATED_PREFIX}{stem}.log");
        let rotated_path = self
            .settings
            .path
            .parent()
            .map(|p| p.join(&rotated_name))
            .unwrap_or_else(|| PathBuf::from(&rotated_name));

        std::fs::rename(&self.settings.path, &rotated_path)
            .map_err(|e| Error::file_system(self.settings.path.clone(), "rotate audit log", e))?;
        state.opened_at = now;

        tracing::info!(rotated_to = %rotated_path.display(), "audit log rotated");
        Ok(Some(rotated_path))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.settings.path
    }
}

/// Last `n` lines of an audit log, oldest first.
pub fn tail_log(path: &Path, n: usize) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::file_system(path.to_path_buf(), "read audit log", e))?;
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|s| s.to_string()).collect())
}
