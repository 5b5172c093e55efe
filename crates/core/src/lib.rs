//! Core domain types, errors, and constants for the `conveyor` orchestrator.
//!
//! This crate establishes the foundational data structures and error handling
//! used throughout the workspace: the task lifecycle state machine, step and
//! artifact records, the durable status-file document, and the audit event
//! vocabulary.
//!
//! ## Key Components
//!
//! - **`errors`**: The primary `Error` enum and `Result` alias, covering the
//!   full failure taxonomy (validation, capacity, timeout, sandbox, artifact
//!   contract, not-found) plus ambient file-system/JSON/command failures.
//! - **`types`**: `TaskId`, `TaskState`, `TaskRecord`, `StepResult`,
//!   `Artifact` and the `status.json` document, with invariants enforced at
//!   the type level (monotonic transitions, append-only step results).
//! - **`events`**: The audit event vocabulary, one JSON object per line.
//! - **`constants`**: Shared directory names, env var names and limits.

pub mod constants;
pub mod errors;
pub mod events;
pub mod types;

pub use self::{
    constants::*,
    errors::{Error, FailureKind, Result},
    events::{AuditEvent, AuditRecord},
    types::*,
};
