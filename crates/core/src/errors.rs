use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for conveyor operations
pub type Result<T> = std::result::Result<T, Error>;

/// How a failure should be treated by the retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Worth retrying within the step's attempt budget
    Transient,
    /// Retrying cannot help (bad input, missing contract, sandbox down)
    Permanent,
}

/// Core error type for conveyor operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Job parameters failed schema validation; caller's fault, never retried
    #[error("invalid parameters for job '{job_type}': {message}")]
    Validation { job_type: String, message: String },

    /// No execution slot available under the configured concurrency cap
    #[error("concurrency cap of {max_concurrent} reached, submission rejected")]
    Capacity { max_concurrent: usize },

    /// Unknown task identifier
    #[error("no task with id '{task_id}'")]
    NotFound { task_id: String },

    /// A step exceeded its time budget
    #[error("step '{step}' timed out after {duration:?}")]
    Timeout { step: String, duration: Duration },

    /// The isolation backend could not be initialized; fatal for the task,
    /// running unsandboxed is never an acceptable fallback
    #[error("sandbox unavailable: {message}")]
    SandboxUnavailable { message: String },

    /// A step promised an output it did not produce
    #[error("step '{step}' did not produce declared output '{output}'")]
    ArtifactMissing { step: String, output: String },

    /// Command execution errors
    #[error("{}", format_command_error(.command, .args, .message, .exit_code))]
    CommandExecution {
        command: String,
        args: Vec<String>,
        message: String,
        exit_code: Option<i32>,
    },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Illegal task state transition
    #[error("invalid transition for task '{task_id}': {from} -> {to}")]
    StateTransition {
        task_id: String,
        from: String,
        to: String,
    },

    /// File system operations
    #[error("file system {operation} operation failed for '{path}': {source}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },
}

fn format_command_error(
    command: &str,
    args: &[String],
    message: &str,
    exit_code: &Option<i32>,
) -> String {
    let args_str = args.join(" ");
    match exit_code {
        Some(code) => {
            if args_str.is_empty() {
                format!("command '{command}' failed with exit code {code}: {message}")
            } else {
                format!("command '{command} {args_str}' failed with exit code {code}: {message}")
            }
        }
        None => {
            if args_str.is_empty() {
                format!("command '{command}' failed: {message}")
            } else {
                format!("command '{command} {args_str}' failed: {message}")
            }
        }
    }
}

// Conversion implementations
impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::FileSystem {
            path: PathBuf::new(),
            operation: "unknown".to_string(),
            source: error,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json {
            message: error.to_string(),
            source: error,
        }
    }
}

// Helper methods for creating errors with context
impl Error {
    /// Create a validation error for a job type
    #[must_use]
    pub fn validation(job_type: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            job_type: job_type.into(),
            message: message.into(),
        }
    }

    /// Create a capacity error
    #[must_use]
    pub fn capacity(max_concurrent: usize) -> Self {
        Error::Capacity { max_concurrent }
    }

    /// Create a not-found error
    #[must_use]
    pub fn not_found(task_id: impl Into<String>) -> Self {
        Error::NotFound {
            task_id: task_id.into(),
        }
    }

    /// Create a step timeout error
    #[must_use]
    pub fn timeout(step: impl Into<String>, duration: Duration) -> Self {
        Error::Timeout {
            step: step.into(),
            duration,
        }
    }

    /// Create a sandbox-unavailable error
    #[must_use]
    pub fn sandbox_unavailable(message: impl Into<String>) -> Self {
        Error::SandboxUnavailable {
            message: message.into(),
        }
    }

    /// Create an artifact-missing error
    #[must_use]
    pub fn artifact_missing(step: impl Into<String>, output: impl Into<String>) -> Self {
        Error::ArtifactMissing {
            step: step.into(),
            output: output.into(),
        }
    }

    /// Create a command execution error
    #[must_use]
    pub fn command_execution(
        command: impl Into<String>,
        args: Vec<String>,
        message: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Error::CommandExecution {
            command: command.into(),
            args,
            message: message.into(),
            exit_code,
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Create a state transition error
    #[must_use]
    pub fn state_transition(
        task_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Error::StateTransition {
            task_id: task_id.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a file system error with context
    #[must_use]
    pub fn file_system(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Error::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    /// How the pipeline engine should classify this error for retry purposes.
    ///
    /// Only capacity and timeout conditions are considered transient here;
    /// non-zero exit codes are classified separately against each step's
    /// retryable set.
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Capacity { .. } | Error::Timeout { .. } => FailureKind::Transient,
            _ => FailureKind::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_formats_exit_code() {
        let err = Error::command_execution(
            "tar",
            vec!["-czf".to_string(), "out.tgz".to_string()],
            "archive failed",
            Some(2),
        );
        let text = err.to_string();
        assert!(text.contains("tar -czf out.tgz"));
        assert!(text.contains("exit code 2"));
    }

    #[test]
    fn sandbox_unavailable_is_permanent() {
        let err = Error::sandbox_unavailable("landlock not supported by kernel");
        assert_eq!(err.failure_kind(), FailureKind::Permanent);
    }

    #[test]
    fn timeout_is_transient() {
        let err = Error::timeout("render", Duration::from_secs(30));
        assert_eq!(err.failure_kind(), FailureKind::Transient);
    }
}
