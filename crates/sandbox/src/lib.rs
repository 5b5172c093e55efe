//! Sandboxed external process execution for conveyor.
//!
//! Every pipeline step's child process goes through this crate: spawn in its
//! own process group, filesystem visibility constrained to an explicit
//! allow-list (landlock), CPU/memory ceilings (rlimits), network disabled
//! unless the step opts in (user+net namespaces), and guaranteed reaping of
//! the child and its descendants on timeout or cancellation.
//!
//! If a spec requests isolation the host cannot provide, execution fails with
//! `SandboxUnavailable` before anything is spawned. There is no unsandboxed
//! fallback.

mod guard;
mod isolation;
mod runner;
mod spec;

pub use guard::{CancelFlag, ProcessGuard, WaitOutcome};
pub use isolation::probe;
pub use runner::{ProcessResult, ProcessRunner};
pub use spec::SandboxSpec;
