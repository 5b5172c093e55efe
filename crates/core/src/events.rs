//! Audit event types shared across crates.
//!
//! Every lifecycle transition produces one event; the audit logger in the
//! manager crate serializes each as a single JSON object per line. Events are
//! append-only and never reordered.

use serde::{Deserialize, Serialize};

use crate::types::{JobType, TaskId, TaskState};

/// One lifecycle event, stamped at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub at: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditRecord {
    #[must_use]
    pub fn now(event: AuditEvent) -> Self {
        Self {
            at: chrono::Utc::now(),
            event,
        }
    }
}

/// Task lifecycle events recorded by the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A job request was admitted
    TaskSubmitted { task_id: TaskId, job_type: JobType },
    /// Workspace allocated, pipeline about to start
    TaskStarted { task_id: TaskId, workspace: String },
    /// A step attempt began
    StepStarted {
        task_id: TaskId,
        step: String,
        attempt: u32,
    },
    /// A step attempt ended
    StepFinished {
        task_id: TaskId,
        step: String,
        attempt: u32,
        exit_code: Option<i32>,
        success: bool,
    },
    /// A failed attempt was classified transient and will be retried
    StepRetried {
        task_id: TaskId,
        step: String,
        next_attempt: u32,
        backoff_ms: u64,
    },
    /// A step was never launched because the pipeline aborted earlier
    StepSkipped { task_id: TaskId, step: String },
    /// A caller asked for cancellation
    CancelRequested { task_id: TaskId },
    /// The task reached a terminal state
    TaskFinalized {
        task_id: TaskId,
        state: TaskState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// The retention sweeper completed one pass
    SweeperRun { removed: usize, skipped: usize },
    /// One expired task workspace was removed
    WorkspaceRemoved { workspace: String },
    /// The audit log itself was rotated
    LogRotated { rotated_to: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_to_single_json_lines() {
        let record = AuditRecord::now(AuditEvent::CancelRequested {
            task_id: TaskId::new(),
        });
        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains("\"event\":\"cancel_requested\""));
    }

    #[test]
    fn finalized_event_carries_state() {
        let record = AuditRecord::now(AuditEvent::TaskFinalized {
            task_id: TaskId::new(),
            state: TaskState::Failed,
            error: Some("step 'render' failed".to_string()),
        });
        let line = serde_json::to_string(&record).unwrap();
        assert!(line.contains("\"state\":\"failed\""));
        assert!(line.contains("render"));
    }
}
