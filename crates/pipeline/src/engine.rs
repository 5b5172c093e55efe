//! Sequential pipeline execution.
//!
//! Steps run strictly in order, each through the sandbox layer. A failing
//! step aborts the pipeline unless it declared `continue_on_failure`; aborted
//! pipelines record every later step as skipped. Failures classified
//! transient are retried with exponential backoff within the step's attempt
//! budget. Cancellation is observed between steps and inside a running step
//! via the shared flag; it is cooperative, bounded by the current step's
//! timeout.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;

use conveyor_config::{SandboxSettings, Settings};
use conveyor_core::{
    Artifact, Error, FailureKind, Result, StepFailure, StepResult, StepStatus, TaskId,
};
use conveyor_sandbox::{CancelFlag, ProcessRunner, SandboxSpec};
use conveyor_workspace::Workspace;

use crate::backoff::delay_before_attempt;
use crate::collector::ArtifactCollector;
use crate::step::{CollectTiming, OutputLocation, StepDef};

/// How a pipeline ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Failed { error: String },
    Cancelled,
}

/// Everything a pipeline execution produced, in order.
#[derive(Debug)]
pub struct PipelineRun {
    pub steps: Vec<StepResult>,
    pub artifacts: Vec<Artifact>,
    pub outcome: PipelineOutcome,
}

/// Hook for the task manager to persist progress as it happens.
#[async_trait]
pub trait PipelineObserver: Send + Sync {
    async fn on_step_started(&self, task_id: TaskId, step: &str, attempt: u32);
    async fn on_step_result(&self, task_id: TaskId, result: &StepResult);
    async fn on_step_retry(&self, task_id: TaskId, step: &str, next_attempt: u32, backoff: Duration);
    async fn on_artifacts(&self, task_id: TaskId, artifacts: &[Artifact]);
}

/// Observer that records nothing; used by tests and one-shot runs.
pub struct NullObserver;

#[async_trait]
impl PipelineObserver for NullObserver {
    async fn on_step_started(&self, _: TaskId, _: &str, _: u32) {}
    async fn on_step_result(&self, _task_id: TaskId, _result: &StepResult) {}
    async fn on_step_retry(&self, _: TaskId, _: &str, _: u32, _: Duration) {}
    async fn on_artifacts(&self, _task_id: TaskId, _artifacts: &[Artifact]) {}
}

/// Executes resolved pipelines inside a task workspace.
pub struct PipelineEngine {
    runner: ProcessRunner,
    collector: ArtifactCollector,
    sandbox: SandboxSettings,
    default_timeout: Duration,
}

impl PipelineEngine {
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self {
            runner: ProcessRunner::new(),
            collector: ArtifactCollector::new(settings.shared_output_dir.clone()),
            sandbox: settings.sandbox.clone(),
            default_timeout: settings.default_step_timeout(),
        }
    }

    /// Run all steps to an outcome. Pipeline-level failures are encoded in
    /// the returned outcome, never raised; the orchestrator process must
    /// survive any pipeline.
    pub async fn execute(
        &self,
        task_id: TaskId,
        steps: &[StepDef],
        workspace: &Workspace,
        cancel: CancelFlag,
        observer: &dyn PipelineObserver,
    ) -> PipelineRun {
        let mut run = PipelineRun {
            steps: Vec::new(),
            artifacts: Vec::new(),
            outcome: PipelineOutcome::Completed,
        };
        let mut taken_names: HashSet<String> = HashSet::new();
        let mut deferred_collect: Vec<usize> = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            let step_index = index + 1;

            if cancel.is_cancelled() {
                run.outcome = PipelineOutcome::Cancelled;
                break;
            }

            match self
                .run_step(task_id, step, step_index, workspace, &cancel, observer, &mut run, &mut taken_names)
                .await
            {
                StepVerdict::Succeeded => {
                    if step.collect == CollectTiming::PipelineEnd && !step.outputs.is_empty() {
                        deferred_collect.push(index);
                    }
                }
                StepVerdict::FailedContinue => {}
                StepVerdict::FailedAbort { error } => {
                    self.mark_skipped(task_id, &steps[index + 1..], step_index, &mut run, observer)
                        .await;
                    run.outcome = PipelineOutcome::Failed { error };
                    break;
                }
                StepVerdict::Cancelled => {
                    run.outcome = PipelineOutcome::Cancelled;
                    break;
                }
            }
        }

        if run.outcome == PipelineOutcome::Completed {
            for index in deferred_collect {
                let step = &steps[index];
                match self
                    .collector
                    .collect(step, index + 1, workspace, &mut taken_names)
                {
                    Ok(artifacts) => {
                        observer.on_artifacts(task_id, &artifacts).await;
                        run.artifacts.extend(artifacts);
                    }
                    Err(e) => {
                        // The step already reported success; a broken output
                        // contract discovered now still fails that step.
                        if let Some(pos) = run.steps.iter().rposition(|r| {
                            r.step_index == index + 1 && r.status == StepStatus::Succeeded
                        }) {
                            run.steps[pos].status = StepStatus::Failed;
                            run.steps[pos].failure = Some(StepFailure {
                                kind: FailureKind::Permanent,
                                message: e.to_string(),
                            });
                            let corrected = run.steps[pos].clone();
                            observer.on_step_result(task_id, &corrected).await;
                        }
                        run.outcome = PipelineOutcome::Failed {
                            error: e.to_string(),
                        };
                        break;
                    }
                }
            }
        }

        run
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        task_id: TaskId,
        step: &StepDef,
        step_index: usize,
        workspace: &Workspace,
        cancel: &CancelFlag,
        observer: &dyn PipelineObserver,
        run: &mut PipelineRun,
        taken_names: &mut HashSet<String>,
    ) -> StepVerdict {
        let spec = self.spec_for(step, workspace);

        for attempt in 1..=step.max_attempts {
            observer.on_step_started(task_id, &step.name, attempt).await;
            let outcome = self
                .attempt_step(task_id, step, step_index, attempt, workspace, &spec, cancel, taken_names)
                .await;

            match outcome {
                Ok(AttemptOutcome::Cancelled) => return StepVerdict::Cancelled,
                Ok(AttemptOutcome::Done { result, artifacts }) => {
                    let succeeded = result.succeeded();
                    let transient = result
                        .failure
                        .as_ref()
                        .is_some_and(|f| f.kind == FailureKind::Transient);

                    observer.on_step_result(task_id, &result).await;
                    run.steps.push(result);
                    if !artifacts.is_empty() {
                        observer.on_artifacts(task_id, &artifacts).await;
                        run.artifacts.extend(artifacts);
                    }

                    if succeeded {
                        return StepVerdict::Succeeded;
                    }
                    if transient && attempt < step.max_attempts {
                        let backoff = delay_before_attempt(attempt + 1);
                        tracing::info!(
                            task_id = %task_id,
                            step = %step.name,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            "transient step failure, retrying"
                        );
                        observer
                            .on_step_retry(task_id, &step.name, attempt + 1, backoff)
                            .await;
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    let error = format!("step '{}' failed after {attempt} attempt(s)", step.name);
                    return if step.continue_on_failure {
                        StepVerdict::FailedContinue
                    } else {
                        StepVerdict::FailedAbort { error }
                    };
                }
                Err(e) => {
                    // Runner-level error: sandbox init or spawn. Both are
                    // permanent; sandbox loss additionally aborts regardless
                    // of the step's failure policy.
                    let fatal = matches!(e, Error::SandboxUnavailable { .. });
                    let result = StepResult {
                        step: step.name.clone(),
                        step_index,
                        attempt,
                        status: StepStatus::Failed,
                        exit_code: None,
                        duration: Duration::ZERO,
                        stdout_tail: String::new(),
                        stderr_tail: String::new(),
                        failure: Some(StepFailure {
                            kind: FailureKind::Permanent,
                            message: e.to_string(),
                        }),
                    };
                    observer.on_step_result(task_id, &result).await;
                    run.steps.push(result);
                    return if fatal || !step.continue_on_failure {
                        StepVerdict::FailedAbort {
                            error: e.to_string(),
                        }
                    } else {
                        StepVerdict::FailedContinue
                    };
                }
            }
        }

        // max_attempts >= 1 means the loop always returns before this point
        StepVerdict::FailedAbort {
            error: format!("step '{}' exhausted its attempts", step.name),
        }
    }

    /// One execution attempt plus after-step collection.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_step(
        &self,
        task_id: TaskId,
        step: &StepDef,
        step_index: usize,
        attempt: u32,
        workspace: &Workspace,
        spec: &SandboxSpec,
        cancel: &CancelFlag,
        taken_names: &mut HashSet<String>,
    ) -> Result<AttemptOutcome> {
        tracing::debug!(task_id = %task_id, step = %step.name, attempt, "launching step");

        let process = self
            .runner
            .run(&step.program, &step.args, &step.env, spec, cancel.clone())
            .await?;

        if process.cancelled {
            return Ok(AttemptOutcome::Cancelled);
        }

        let mut failure = None;
        if process.timed_out {
            failure = Some(StepFailure {
                kind: if step.retry_on_timeout {
                    FailureKind::Transient
                } else {
                    FailureKind::Permanent
                },
                message: Error::timeout(&step.name, spec.timeout).to_string(),
            });
        } else if process.exit_code != Some(0) {
            failure = Some(StepFailure {
                kind: if step.is_retryable_exit(process.exit_code) {
                    FailureKind::Transient
                } else {
                    FailureKind::Permanent
                },
                message: format!(
                    "exited with code {}",
                    process
                        .exit_code
                        .map_or_else(|| "unknown".to_string(), |c| c.to_string())
                ),
            });
        }

        let mut artifacts = Vec::new();
        if failure.is_none() && step.collect == CollectTiming::AfterStep && !step.outputs.is_empty()
        {
            match self
                .collector
                .collect(step, step_index, workspace, taken_names)
            {
                Ok(collected) => artifacts = collected,
                Err(e) => {
                    // The process claimed success but broke its output
                    // contract; silent no-output must not read as success.
                    failure = Some(StepFailure {
                        kind: FailureKind::Permanent,
                        message: e.to_string(),
                    });
                }
            }
        }

        let status = if failure.is_none() {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        };
        Ok(AttemptOutcome::Done {
            result: StepResult {
                step: step.name.clone(),
                step_index,
                attempt,
                status,
                exit_code: process.exit_code,
                duration: process.duration,
                stdout_tail: process.stdout_tail,
                stderr_tail: process.stderr_tail,
                failure,
            },
            artifacts,
        })
    }

    async fn mark_skipped(
        &self,
        task_id: TaskId,
        remaining: &[StepDef],
        failed_index: usize,
        run: &mut PipelineRun,
        observer: &dyn PipelineObserver,
    ) {
        for (offset, step) in remaining.iter().enumerate() {
            let result = StepResult {
                step: step.name.clone(),
                step_index: failed_index + offset + 1,
                attempt: 1,
                status: StepStatus::Skipped,
                exit_code: None,
                duration: Duration::ZERO,
                stdout_tail: String::new(),
                stderr_tail: String::new(),
                failure: None,
            };
            observer.on_step_result(task_id, &result).await;
            run.steps.push(result);
        }
    }

    fn spec_for(&self, step: &StepDef, workspace: &Workspace) -> SandboxSpec {
        // Steps that drop files into the shared area need it writable
        let extra_writable = step
            .outputs
            .iter()
            .filter_map(|o| match &o.location {
                OutputLocation::Shared(_) => self.collector_shared_dir(),
                OutputLocation::Workspace(_) => None,
            })
            .take(1)
            .collect();

        SandboxSpec::for_workspace(
            &self.sandbox,
            workspace.root().to_path_buf(),
            workspace.root().to_path_buf(),
            extra_writable,
            step.allow_network || !self.sandbox.restrict_network,
            step.timeout.unwrap_or(self.default_timeout),
        )
    }

    fn collector_shared_dir(&self) -> Option<std::path::PathBuf> {
        self.collector.shared_dir().map(|p| p.to_path_buf())
    }
}

enum StepVerdict {
    Succeeded,
    FailedContinue,
    FailedAbort { error: String },
    Cancelled,
}

enum AttemptOutcome {
    Done {
        result: StepResult,
        artifacts: Vec<Artifact>,
    },
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::DeclaredOutput;
    use conveyor_core::TaskId;
    use conveyor_workspace::WorkspaceAllocator;

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.sandbox.restrict_filesystem = false;
        settings.sandbox.restrict_network = false;
        settings.sandbox.cpu_secs = None;
        settings.sandbox.memory_bytes = None;
        settings.default_step_timeout_secs = 30;
        settings
    }

    fn test_workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkspaceAllocator::new(dir.path())
            .allocate(TaskId::new(), chrono::Utc::now())
            .unwrap();
        (dir, ws)
    }

    fn engine() -> PipelineEngine {
        PipelineEngine::new(&test_settings())
    }

    #[tokio::test]
    async fn happy_path_produces_declared_artifacts() {
        let (_dir, ws) = test_workspace();
        let steps = vec![
            StepDef::shell("write", "echo payload > output/a.txt").with_output(
                DeclaredOutput::required("a.txt", OutputLocation::Workspace("output/a.txt".into())),
            ),
        ];

        let run = engine()
            .execute(TaskId::new(), &steps, &ws, CancelFlag::new(), &NullObserver)
            .await;

        assert_eq!(run.outcome, PipelineOutcome::Completed);
        assert_eq!(run.artifacts.len(), 1);
        assert_eq!(run.artifacts[0].name, "a.txt");
        assert!(run.steps.iter().all(|s| s.succeeded()));
    }

    #[tokio::test]
    async fn aborting_failure_skips_all_later_steps() {
        let (_dir, ws) = test_workspace();
        let steps = vec![
            StepDef::shell("ok", "true"),
            StepDef::shell("boom", "exit 1"),
            StepDef::shell("never-a", "echo x > output/x.txt").with_output(
                DeclaredOutput::required("x.txt", OutputLocation::Workspace("output/x.txt".into())),
            ),
            StepDef::shell("never-b", "true"),
        ];

        let run = engine()
            .execute(TaskId::new(), &steps, &ws, CancelFlag::new(), &NullObserver)
            .await;

        assert!(matches!(run.outcome, PipelineOutcome::Failed { .. }));
        let statuses: Vec<_> = run.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            [
                StepStatus::Succeeded,
                StepStatus::Failed,
                StepStatus::Skipped,
                StepStatus::Skipped
            ]
        );
        // Nothing from skipped steps may appear in the artifact list
        assert!(run.artifacts.is_empty());
    }

    #[tokio::test]
    async fn best_effort_failure_does_not_abort() {
        let (_dir, ws) = test_workspace();
        let steps = vec![
            StepDef::shell("shaky", "exit 1").best_effort(),
            StepDef::shell("after", "true"),
        ];

        let run = engine()
            .execute(TaskId::new(), &steps, &ws, CancelFlag::new(), &NullObserver)
            .await;

        assert_eq!(run.outcome, PipelineOutcome::Completed);
        assert_eq!(run.steps[0].status, StepStatus::Failed);
        assert_eq!(run.steps[1].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn transient_failure_retries_until_success() {
        let (_dir, ws) = test_workspace();
        // Fails with the retryable code twice, then succeeds
        let script = r#"
            count=$(cat temp/count 2>/dev/null || echo 0)
            count=$((count + 1))
            echo "$count" > temp/count
            [ "$count" -ge 3 ] || exit 75
        "#;
        let steps = vec![StepDef::shell("flaky", script).with_attempts(3, vec![75])];

        let run = engine()
            .execute(TaskId::new(), &steps, &ws, CancelFlag::new(), &NullObserver)
            .await;

        assert_eq!(run.outcome, PipelineOutcome::Completed);
        assert_eq!(run.steps.len(), 3);
        assert_eq!(run.steps[0].attempt, 1);
        assert_eq!(run.steps[2].attempt, 3);
        assert!(run.steps[2].succeeded());
    }

    #[tokio::test]
    async fn permanent_exit_code_is_not_retried() {
        let (_dir, ws) = test_workspace();
        let steps = vec![StepDef::shell("fatal", "exit 2").with_attempts(3, vec![75])];

        let run = engine()
            .execute(TaskId::new(), &steps, &ws, CancelFlag::new(), &NullObserver)
            .await;

        assert!(matches!(run.outcome, PipelineOutcome::Failed { .. }));
        assert_eq!(run.steps.len(), 1);
    }

    #[tokio::test]
    async fn silent_no_output_is_a_step_failure() {
        let (_dir, ws) = test_workspace();
        let steps = vec![StepDef::shell("liar", "true").with_output(
            DeclaredOutput::required(
                "promised.txt",
                OutputLocation::Workspace("output/promised.txt".into()),
            ),
        )];

        let run = engine()
            .execute(TaskId::new(), &steps, &ws, CancelFlag::new(), &NullObserver)
            .await;

        assert!(matches!(run.outcome, PipelineOutcome::Failed { .. }));
        assert_eq!(run.steps[0].status, StepStatus::Failed);
        assert_eq!(run.steps[0].exit_code, Some(0));
    }

    #[tokio::test]
    async fn deferred_collection_picks_up_late_outputs() {
        let (_dir, ws) = test_workspace();
        let mut producer = StepDef::shell("produce", "echo partial > output/late.txt").with_output(
            DeclaredOutput::required("late.txt", OutputLocation::Workspace("output/late.txt".into())),
        );
        producer.collect = CollectTiming::PipelineEnd;
        let steps = vec![
            producer,
            StepDef::shell("finalize", "echo done >> output/late.txt"),
        ];

        let run = engine()
            .execute(TaskId::new(), &steps, &ws, CancelFlag::new(), &NullObserver)
            .await;

        assert_eq!(run.outcome, PipelineOutcome::Completed);
        assert_eq!(run.artifacts.len(), 1);
        assert_eq!(run.artifacts[0].name, "late.txt");
    }

    #[tokio::test]
    async fn missing_deferred_output_fails_the_producing_step() {
        let (_dir, ws) = test_workspace();
        let mut step = StepDef::shell("late-liar", "true").with_output(DeclaredOutput::required(
            "late.txt",
            OutputLocation::Workspace("output/late.txt".into()),
        ));
        step.collect = CollectTiming::PipelineEnd;
        let steps = vec![step];

        let run = engine()
            .execute(TaskId::new(), &steps, &ws, CancelFlag::new(), &NullObserver)
            .await;

        assert!(matches!(run.outcome, PipelineOutcome::Failed { .. }));
        assert_eq!(run.steps[0].status, StepStatus::Failed);
        assert!(run.steps[0].failure.is_some());
        assert!(run.artifacts.is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_launching_steps() {
        let (_dir, ws) = test_workspace();
        let cancel = CancelFlag::new();
        let flag = cancel.clone();
        let steps = vec![
            StepDef::shell("long", "sleep 30"),
            StepDef::shell("after", "true"),
        ];

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            flag.cancel();
        });

        let run = engine()
            .execute(TaskId::new(), &steps, &ws, cancel, &NullObserver)
            .await;

        assert_eq!(run.outcome, PipelineOutcome::Cancelled);
        // The second step was never launched
        assert!(run.steps.iter().all(|s| s.step != "after"));
    }

    #[tokio::test]
    async fn step_timeout_is_recorded_as_failure() {
        let (_dir, ws) = test_workspace();
        let mut step = StepDef::shell("slow", "sleep 30");
        step.timeout = Some(Duration::from_millis(200));
        let steps = vec![step];

        let run = engine()
            .execute(TaskId::new(), &steps, &ws, CancelFlag::new(), &NullObserver)
            .await;

        assert!(matches!(run.outcome, PipelineOutcome::Failed { .. }));
        let failure = run.steps[0].failure.as_ref().unwrap();
        assert!(failure.message.contains("timed out"));
    }
}
