//! Immutable step definitions.
//!
//! A step wraps one external tool invocation: the command, its declared
//! outputs, and its failure policy. Definitions are resolved from the job type
//! at pipeline-build time and never change afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Where a step promises to leave an output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLocation {
    /// Path relative to the task workspace root (`output/...`, `temp/...`)
    Workspace(PathBuf),
    /// File name inside the shared, tool-defined drop area outside the task tree
    Shared(String),
}

/// One output a step declares it will produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredOutput {
    /// Logical artifact name
    pub name: String,
    pub location: OutputLocation,
    /// A required output that is absent fails the step even on exit 0
    pub required: bool,
}

impl DeclaredOutput {
    #[must_use]
    pub fn required(name: impl Into<String>, location: OutputLocation) -> Self {
        Self {
            name: name.into(),
            location,
            required: true,
        }
    }

    #[must_use]
    pub fn optional(name: impl Into<String>, location: OutputLocation) -> Self {
        Self {
            name: name.into(),
            location,
            required: false,
        }
    }
}

/// When the collector sweeps this step's outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectTiming {
    /// Immediately after the step, so failed pipelines keep partial artifacts
    #[default]
    AfterStep,
    /// Deferred to pipeline end (for tools that finalize files late)
    PipelineEnd,
}

/// One stage of a pipeline. Immutable once resolved.
#[derive(Debug, Clone)]
pub struct StepDef {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    /// Environment passed to the child; nothing else leaks through
    pub env: HashMap<String, String>,
    pub outputs: Vec<DeclaredOutput>,
    /// Best-effort step: a failure records the result and moves on
    pub continue_on_failure: bool,
    /// Total attempt budget, 1 = no retries
    pub max_attempts: u32,
    /// Exit codes classified transient and thus retryable
    pub retryable_exit_codes: Vec<i32>,
    /// Whether a timeout counts as transient for this step
    pub retry_on_timeout: bool,
    /// Overrides the configured default when set
    pub timeout: Option<Duration>,
    pub allow_network: bool,
    pub collect: CollectTiming,
}

impl StepDef {
    /// A single-attempt `sh -c` step with no declared outputs; the common
    /// building block of the built-in pipelines.
    #[must_use]
    pub fn shell(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.into()],
            env: HashMap::new(),
            outputs: Vec::new(),
            continue_on_failure: false,
            max_attempts: 1,
            retryable_exit_codes: Vec::new(),
            retry_on_timeout: false,
            timeout: None,
            allow_network: false,
            collect: CollectTiming::AfterStep,
        }
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: DeclaredOutput) -> Self {
        self.outputs.push(output);
        self
    }

    #[must_use]
    pub fn best_effort(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }

    #[must_use]
    pub fn with_attempts(mut self, max_attempts: u32, retryable_exit_codes: Vec<i32>) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retryable_exit_codes = retryable_exit_codes;
        self
    }

    /// Whether a failed attempt with this exit code may be retried
    #[must_use]
    pub fn is_retryable_exit(&self, exit_code: Option<i32>) -> bool {
        exit_code.is_some_and(|code| self.retryable_exit_codes.contains(&code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_step_defaults_are_strict() {
        let step = StepDef::shell("noop", "true");
        assert_eq!(step.max_attempts, 1);
        assert!(!step.continue_on_failure);
        assert!(!step.allow_network);
        assert!(step.outputs.is_empty());
    }

    #[test]
    fn retryable_exit_classification() {
        let step = StepDef::shell("flaky", "exit 75").with_attempts(3, vec![75]);
        assert!(step.is_retryable_exit(Some(75)));
        assert!(!step.is_retryable_exit(Some(1)));
        assert!(!step.is_retryable_exit(None));
    }

    #[test]
    fn attempts_floor_at_one() {
        let step = StepDef::shell("s", "true").with_attempts(0, vec![]);
        assert_eq!(step.max_attempts, 1);
    }
}
