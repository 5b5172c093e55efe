//! Task manager: lifecycle ownership, admission control, audit logging.

pub mod audit;
pub mod manager;

pub use audit::{tail_log, AuditLogger};
pub use manager::TaskManager;
