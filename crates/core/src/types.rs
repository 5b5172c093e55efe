use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{Error, FailureKind, Result};

/// Opaque, collision-free, time-sortable task identifier.
///
/// UUIDv7 embeds a millisecond timestamp in the high bits, so lexicographic
/// order of the string form matches creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(uuid::Uuid);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// Parse an identifier from its string form
    pub fn parse(s: &str) -> Result<Self> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::not_found(s))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a task.
///
/// Transitions are monotonic: `Created -> Running -> {Completed, Failed,
/// Cancelled}`, with `Cancelling` as the cooperative intermediate between
/// `Running` and `Cancelled`. Terminal states are entered exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Created,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving to `next` is a legal forward transition
    #[must_use]
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::{Cancelled, Cancelling, Completed, Created, Failed, Running};
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Failed)
                | (Created, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelling)
                | (Running, Cancelled)
                | (Cancelling, Cancelled)
                | (Cancelling, Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Supported pipeline kinds.
///
/// Each job type resolves to a fixed, ordered step list; the mapping is a pure
/// function of job type and parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Ingest one input document, transform it, package the result
    Convert,
    /// Scan a directory tree and render a summary report
    Report,
    /// Stage declared inputs and produce a verified archive
    Bundle,
}

impl JobType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "convert" => Ok(Self::Convert),
            "report" => Ok(Self::Report),
            "bundle" => Ok(Self::Bundle),
            other => Err(Error::validation(
                other,
                "unknown job type (expected convert, report or bundle)",
            )),
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Convert => "convert",
            Self::Report => "report",
            Self::Bundle => "bundle",
        };
        f.write_str(s)
    }
}

/// Raw job parameters as submitted by the caller.
///
/// Resolved into a strongly typed step list exactly once, at submission time;
/// step execution never performs string-keyed lookups into this map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams(HashMap<String, String>);

impl JobParams {
    #[must_use]
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    #[must_use]
    pub fn from_map(map: HashMap<String, String>) -> Self {
        Self(map)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Fetch a required parameter, erroring in the job type's name if absent
    pub fn require(&self, job_type: JobType, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::validation(job_type.to_string(), format!("missing required parameter '{key}'")))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn iter(&self) -> std::collections::hash_map::Iter<'_, String, String> {
        self.0.iter()
    }

    #[must_use]
    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }
}

/// Outcome of one execution attempt of one step; append-only once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    /// 1-based index of the step in its pipeline
    pub step_index: usize,
    /// 1-based attempt counter
    pub attempt: u32,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Tail of captured stdout, bounded by the runner
    pub stdout_tail: String,
    /// Tail of captured stderr, bounded by the runner
    pub stderr_tail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
}

impl StepResult {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Terminal status of a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Never launched because an earlier step aborted the pipeline
    Skipped,
}

/// Why a step attempt failed, with its retry classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// A file promoted into the task's output directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Logical name, unique within the task (collisions are suffixed)
    pub name: String,
    /// Absolute path, always under the owning task's workspace
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the file content
    pub checksum: String,
    /// Name of the step that produced it
    pub produced_by: String,
}

/// Full record of a task as owned by the task manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub job_type: JobType,
    pub params: JobParams,
    pub state: TaskState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    pub steps: Vec<StepResult>,
    pub artifacts: Vec<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskRecord {
    #[must_use]
    pub fn new(id: TaskId, job_type: JobType, params: JobParams) -> Self {
        Self {
            id,
            job_type,
            params,
            state: TaskState::Created,
            created_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
            workspace: None,
            steps: Vec::new(),
            artifacts: Vec::new(),
            error: None,
        }
    }

    /// Apply a state transition, rejecting anything non-monotonic.
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::state_transition(
                self.id.to_string(),
                self.state.to_string(),
                next.to_string(),
            ));
        }
        if next == TaskState::Running {
            self.started_at = Some(chrono::Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(chrono::Utc::now());
        }
        self.state = next;
        Ok(())
    }

    /// Snapshot returned by status queries
    #[must_use]
    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id,
            job_type: self.job_type,
            state: self.state,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            steps: self.steps.clone(),
            artifacts: self.artifacts.clone(),
            error: self.error.clone(),
        }
    }

    /// Durable document written to `logs/status.json` at every transition
    #[must_use]
    pub fn status_file(&self) -> TaskStatusFile {
        TaskStatusFile {
            state: self.state,
            job_type: self.job_type,
            parameters: self.params.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            artifacts: self.artifacts.clone(),
            checksums: self
                .artifacts
                .iter()
                .map(|a| (a.name.clone(), a.checksum.clone()))
                .collect(),
            error: self.error.clone(),
        }
    }
}

/// Read-only task snapshot for callers of the status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub job_type: JobType,
    pub state: TaskState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub steps: Vec<StepResult>,
    pub artifacts: Vec<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The crash-recoverable source of truth for task state, independent of the
/// in-memory table. Written atomically at `logs/status.json` on every
/// transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusFile {
    pub state: TaskState,
    pub job_type: JobType,
    pub parameters: JobParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub artifacts: Vec<Artifact>,
    pub checksums: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
