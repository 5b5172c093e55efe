//! Pipeline resolution and execution for conveyor.
//!
//! A job type resolves to a fixed, ordered list of immutable step
//! definitions; the engine executes them strictly sequentially through the
//! sandbox layer, retrying transient failures with backoff, honoring
//! continue-on-failure policies, and promoting declared outputs into the
//! task's artifact set with checksums.

mod backoff;
mod collector;
mod engine;
mod jobs;
mod step;

pub use collector::{checksum_file, ArtifactCollector};
pub use engine::{NullObserver, PipelineEngine, PipelineObserver, PipelineOutcome, PipelineRun};
pub use jobs::{resolve_pipeline, validate_params, BundleParams, ConvertParams, ReportParams};
pub use step::{CollectTiming, DeclaredOutput, OutputLocation, StepDef};
