/// Constants used throughout the conveyor codebase
// Workspace layout
pub const INPUT_DIR: &str = "input";
pub const TEMP_DIR: &str = "temp";
pub const OUTPUT_DIR: &str = "output";
pub const LOGS_DIR: &str = "logs";
pub const STATUS_FILE: &str = "status.json";

/// Date partition format under the tasks root (`tasks/<date>/<taskId>`)
pub const PARTITION_DATE_FORMAT: &str = "%Y-%m-%d";

// Environment variable names
pub const CONVEYOR_CONFIG_VAR: &str = "CONVEYOR_CONFIG";
pub const CONVEYOR_TASKS_ROOT_VAR: &str = "CONVEYOR_TASKS_ROOT";
pub const CONVEYOR_MAX_CONCURRENT_VAR: &str = "CONVEYOR_MAX_CONCURRENT";
pub const CONVEYOR_RETAIN_DAYS_VAR: &str = "CONVEYOR_RETAIN_DAYS";
pub const CONVEYOR_LOG_VAR: &str = "CONVEYOR_LOG";

// Audit log file names
pub const AUDIT_LOG_NAME: &str = "audit.log";
pub const AUDIT_ROTATED_PREFIX: &str = "audit-";

/// How much captured child output a StepResult keeps, per stream
pub const OUTPUT_TAIL_BYTES: usize = 8 * 1024;
