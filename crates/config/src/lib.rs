//! Runtime configuration for conveyor.
//!
//! Everything the orchestrator can be tuned with lives here: the tasks root,
//! retention window, concurrency cap and admission policy, per-step timeout
//! default, sandbox ceilings, and audit rotation thresholds. All of it is
//! externally supplied; components never read ambient state directly.

mod settings;

pub use settings::{AdmissionPolicy, AuditSettings, SandboxSettings, Settings};
