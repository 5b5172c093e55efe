//! Task lifecycle ownership.
//!
//! The manager is the only component that mutates task state. It admits
//! submissions against the concurrency cap, allocates a workspace, drives the
//! pipeline engine on a spawned supervisor, and mirrors every transition into
//! the durable status file and the audit log. Pipeline failures are absorbed
//! into terminal task states; the manager process survives any task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use conveyor_config::{AdmissionPolicy, Settings};
use conveyor_core::{
    Artifact, AuditEvent, Error, JobParams, JobType, Result, StepResult, StepStatus, TaskId,
    TaskRecord, TaskState, TaskView,
};
use conveyor_pipeline::{
    resolve_pipeline, validate_params, PipelineEngine, PipelineObserver, PipelineOutcome,
};
use conveyor_sandbox::CancelFlag;
use conveyor_workspace::{
    write_status, RetentionSweeper, SweepReport, Workspace, WorkspaceAllocator,
};

use crate::audit::AuditLogger;

struct TaskEntry {
    record: TaskRecord,
    workspace: Option<Workspace>,
    cancel: CancelFlag,
}

type TaskTable = Arc<RwLock<HashMap<TaskId, TaskEntry>>>;

/// Owns the task table and the full submit/status/cancel surface.
pub struct TaskManager {
    settings: Settings,
    allocator: WorkspaceAllocator,
    engine: Arc<PipelineEngine>,
    audit: Arc<AuditLogger>,
    tasks: TaskTable,
    running: Arc<Semaphore>,
    queued: AtomicUsize,
}

impl TaskManager {
    pub fn new(settings: Settings) -> Result<Self> {
        let audit = Arc::new(AuditLogger::new(settings.audit.clone())?);
        Ok(Self {
            allocator: WorkspaceAllocator::new(settings.tasks_root.clone()),
            engine: Arc::new(PipelineEngine::new(&settings)),
            audit,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(Semaphore::new(settings.max_concurrent_tasks)),
            queued: AtomicUsize::new(0),
            settings,
        })
    }

    /// Admit a job, allocate its workspace, and start its pipeline.
    ///
    /// Returns once the task is running (or queued work has been admitted);
    /// the pipeline itself continues on a spawned supervisor. Validation and
    /// admission failures leave no trace on disk.
    pub async fn submit(&self, job_type: JobType, params: JobParams) -> Result<TaskId> {
        validate_params(job_type, &params)?;
        let steps = resolve_pipeline(job_type, &params)?;
        let permit = self.admit().await?;

        let id = TaskId::new();
        let cancel = CancelFlag::new();
        {
            let mut tasks = self.tasks.write().await;
            tasks.insert(
                id,
                TaskEntry {
                    record: TaskRecord::new(id, job_type, params),
                    workspace: None,
                    cancel: cancel.clone(),
                },
            );
        }
        self.audit
            .record(AuditEvent::TaskSubmitted { task_id: id, job_type })
            .await?;
        info!(task_id = %id, job_type = %job_type, "task submitted");

        let workspace = match self.allocator.allocate(id, chrono::Utc::now()) {
            Ok(ws) => ws,
            Err(e) => {
                self.finalize_before_start(id, &e).await;
                return Err(e);
            }
        };

        {
            let mut tasks = self.tasks.write().await;
            if let Some(entry) = tasks.get_mut(&id) {
                entry.record.workspace = Some(workspace.root().to_path_buf());
                entry.workspace = Some(workspace.clone());
                persist_status(entry);
                if let Err(e) = entry.record.transition(TaskState::Running) {
                    error!(task_id = %id, error = %e, "could not start task");
                    return Err(e);
                }
                persist_status(entry);
            }
        }
        self.audit
            .record(AuditEvent::TaskStarted {
                task_id: id,
                workspace: workspace.root().display().to_string(),
            })
            .await?;

        self.spawn_supervisor(id, steps, workspace, cancel, permit);
        Ok(id)
    }

    /// Snapshot of one task's current state, steps, and artifacts.
    pub async fn status(&self, id: TaskId) -> Result<TaskView> {
        let tasks = self.tasks.read().await;
        tasks
            .get(&id)
            .map(|entry| entry.record.view())
            .ok_or_else(|| Error::not_found(id.to_string()))
    }

    /// Request cooperative cancellation of a running task.
    ///
    /// Idempotent while cancellation is already in flight; an error for tasks
    /// that have already reached a terminal state.
    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        let state = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(&id)
                .ok_or_else(|| Error::not_found(id.to_string()))?;
            match entry.record.state {
                TaskState::Cancelling => return Ok(()),
                state if state.is_terminal() => {
                    return Err(Error::validation(
                        entry.record.job_type.to_string(),
                        format!("task {id} already finished as {state}"),
                    ));
                }
                TaskState::Running => {
                    entry.record.transition(TaskState::Cancelling)?;
                    entry.cancel.cancel();
                    persist_status(entry);
                    TaskState::Cancelling
                }
                TaskState::Created => {
                    // Not yet started; the supervisor will observe the flag
                    // before the first step launches.
                    entry.cancel.cancel();
                    entry.record.state
                }
                other => other,
            }
        };
        debug!(task_id = %id, state = %state, "cancellation requested");
        self.audit
            .record(AuditEvent::CancelRequested { task_id: id })
            .await
    }

    /// Block until the task reaches a terminal state, then return its view.
    pub async fn wait(&self, id: TaskId) -> Result<TaskView> {
        loop {
            let view = self.status(id).await?;
            if view.state.is_terminal() {
                return Ok(view);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Run one retention pass and record what it removed.
    pub async fn sweep(&self, now: chrono::DateTime<chrono::Utc>) -> Result<SweepReport> {
        let sweeper = RetentionSweeper::new(
            self.settings.tasks_root.clone(),
            self.settings.retain_days,
        );
        let report = sweeper.sweep(now).await?;
        for workspace in &report.removed {
            self.audit
                .record(AuditEvent::WorkspaceRemoved {
                    workspace: workspace.display().to_string(),
                })
                .await?;
        }
        self.audit
            .record(AuditEvent::SweeperRun {
                removed: report.removed.len(),
                skipped: report.skipped_non_terminal.len(),
            })
            .await?;
        Ok(report)
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        match self.settings.admission {
            AdmissionPolicy::Reject => {
                Arc::clone(&self.running).try_acquire_owned().map_err(|_| {
                    warn!(
                        max_concurrent = self.settings.max_concurrent_tasks,
                        "submission rejected at capacity"
                    );
                    Error::capacity(self.settings.max_concurrent_tasks)
                })
            }
            AdmissionPolicy::Queue { depth } => {
                if self.queued.fetch_add(1, Ordering::SeqCst) >= depth {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::capacity(self.settings.max_concurrent_tasks));
                }
                let permit = Arc::clone(&self.running)
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::configuration("task semaphore closed"));
                self.queued.fetch_sub(1, Ordering::SeqCst);
                permit
            }
        }
    }

    fn spawn_supervisor(
        &self,
        id: TaskId,
        steps: Vec<conveyor_pipeline::StepDef>,
        workspace: Workspace,
        cancel: CancelFlag,
        permit: OwnedSemaphorePermit,
    ) {
        let engine = Arc::clone(&self.engine);
        let tasks = Arc::clone(&self.tasks);
        let audit = Arc::clone(&self.audit);

        tokio::spawn(async move {
            let observer = ManagerObserver {
                tasks: Arc::clone(&tasks),
                audit: Arc::clone(&audit),
            };
            // The inner spawn fences off step-level panics so the task can
            // still be finalized as failed.
            let joined = tokio::spawn(async move {
                engine
                    .execute(id, &steps, &workspace, cancel, &observer)
                    .await
                    .outcome
            })
            .await;

            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_error) => PipelineOutcome::Failed {
                    error: format!("pipeline supervisor failed: {join_error}"),
                },
            };
            finalize(&tasks, &audit, id, outcome).await;
            drop(permit);
        });
    }

    /// Terminal path for tasks that never got a workspace.
    async fn finalize_before_start(&self, id: TaskId, cause: &Error) {
        let mut tasks = self.tasks.write().await;
        if let Some(entry) = tasks.get_mut(&id) {
            entry.record.error = Some(cause.to_string());
            if let Err(e) = entry.record.transition(TaskState::Failed) {
                error!(task_id = %id, error = %e, "could not mark task failed");
            }
        }
        drop(tasks);
        if let Err(e) = self
            .audit
            .record(AuditEvent::TaskFinalized {
                task_id: id,
                state: TaskState::Failed,
                error: Some(cause.to_string()),
            })
            .await
        {
            warn!(task_id = %id, error = %e, "audit write failed");
        }
    }
}

async fn finalize(tasks: &TaskTable, audit: &AuditLogger, id: TaskId, outcome: PipelineOutcome) {
    let (state, error) = {
        let mut table = tasks.write().await;
        let Some(entry) = table.get_mut(&id) else {
            error!(task_id = %id, "finalizing unknown task");
            return;
        };

        let was_cancelling = entry.record.state == TaskState::Cancelling;
        let (next, error) = match outcome {
            // A cancel that raced pipeline completion still counts as a
            // cancellation; the work is present but the task was abandoned.
            PipelineOutcome::Completed if was_cancelling => (TaskState::Cancelled, None),
            PipelineOutcome::Completed => (TaskState::Completed, None),
            PipelineOutcome::Failed { error } => (TaskState::Failed, Some(error)),
            PipelineOutcome::Cancelled => (TaskState::Cancelled, None),
        };

        entry.record.error = error.clone();
        if let Err(e) = entry.record.transition(next) {
            error!(task_id = %id, error = %e, "finalize transition rejected");
            return;
        }
        persist_status(entry);
        (next, error)
    };

    info!(task_id = %id, state = %state, "task finalized");
    if let Err(e) = audit
        .record(AuditEvent::TaskFinalized {
            task_id: id,
            state,
            error,
        })
        .await
    {
        warn!(task_id = %id, error = %e, "audit write failed");
    }
}

/// Writes the durable status file for an entry, tolerating (but logging)
/// filesystem errors so state transitions are never blocked on disk.
fn persist_status(entry: &TaskEntry) {
    if let Some(workspace) = &entry.workspace {
        if let Err(e) = write_status(workspace, &entry.record.status_file()) {
            warn!(task_id = %entry.record.id, error = %e, "status file write failed");
        }
    }
}

/// Mirrors engine progress into the task table and the audit log.
struct ManagerObserver {
    tasks: TaskTable,
    audit: Arc<AuditLogger>,
}

impl ManagerObserver {
    async fn record_event(&self, task_id: TaskId, event: AuditEvent) {
        if let Err(e) = self.audit.record(event).await {
            warn!(task_id = %task_id, error = %e, "audit write failed");
        }
    }
}

#[async_trait]
impl PipelineObserver for ManagerObserver {
    async fn on_step_started(&self, task_id: TaskId, step: &str, attempt: u32) {
        self.record_event(
            task_id,
            AuditEvent::StepStarted {
                task_id,
                step: step.to_string(),
                attempt,
            },
        )
        .await;
    }

    async fn on_step_result(&self, task_id: TaskId, result: &StepResult) {
        {
            let mut table = self.tasks.write().await;
            if let Some(entry) = table.get_mut(&task_id) {
                // Deferred collection may re-report a step whose output
                // contract broke after it already reported success.
                let existing = entry
                    .record
                    .steps
                    .iter_mut()
                    .find(|s| s.step_index == result.step_index && s.attempt == result.attempt);
                match existing {
                    Some(slot) => *slot = result.clone(),
                    None => entry.record.steps.push(result.clone()),
                }
                persist_status(entry);
            }
        }
        let event = if result.status == StepStatus::Skipped {
            AuditEvent::StepSkipped {
                task_id,
                step: result.step.clone(),
            }
        } else {
            AuditEvent::StepFinished {
                task_id,
                step: result.step.clone(),
                attempt: result.attempt,
                exit_code: result.exit_code,
                success: result.succeeded(),
            }
        };
        self.record_event(task_id, event).await;
    }

    async fn on_step_retry(&self, task_id: TaskId, step: &str, next_attempt: u32, backoff: Duration) {
        self.record_event(
            task_id,
            AuditEvent::StepRetried {
                task_id,
                step: step.to_string(),
                next_attempt,
                backoff_ms: backoff.as_millis() as u64,
            },
        )
        .await;
    }

    async fn on_artifacts(&self, task_id: TaskId, artifacts: &[Artifact]) {
        let mut table = self.tasks.write().await;
        if let Some(entry) = table.get_mut(&task_id) {
            entry.record.artifacts.extend(artifacts.iter().cloned());
            persist_status(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.tasks_root = dir.join("tasks");
        settings.audit.path = dir.join("audit.log");
        settings.sandbox.restrict_filesystem = false;
        settings.sandbox.restrict_network = false;
        settings.sandbox.cpu_secs = None;
        settings.sandbox.memory_bytes = None;
        settings
    }

    #[tokio::test]
    async fn status_of_unknown_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TaskManager::new(test_settings(dir.path())).unwrap();
        let err = manager.status(TaskId::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn cancel_of_unknown_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TaskManager::new(test_settings(dir.path())).unwrap();
        let err = manager.cancel(TaskId::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn submission_with_missing_parameters_is_rejected_early() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TaskManager::new(test_settings(dir.path())).unwrap();
        let err = manager
            .submit(JobType::Convert, JobParams::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        // No workspace may exist for a rejected submission
        assert!(!dir.path().join("tasks").exists());
    }
}
