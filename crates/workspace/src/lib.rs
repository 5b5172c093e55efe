//! Task-scoped filesystem areas for conveyor.
//!
//! One task owns one `{input,temp,output,logs}` tree under a date-partitioned
//! root. This crate creates those trees, keeps the durable `status.json`
//! document current, and reclaims expired trees on a schedule.

mod allocator;
mod status;
mod sweeper;

pub use allocator::{Workspace, WorkspaceAllocator};
pub use status::{read_status, status_path, write_atomic, write_status};
pub use sweeper::{RetentionSweeper, SweepReport};
