//! Stable exit codes for `pentest-agent` commands.

/// Command succeeded; for `run`, the planner declared the objective finished.
pub const OK: i32 = 0;
/// Invalid invocation, config, credentials or unreachable target.
pub const INVALID: i32 = 1;
/// An oracle-backed step failed and the run was aborted.
pub const FAILED: i32 = 2;
/// `run` hit `controller.max_iterations` before the planner finished.
pub const INCOMPLETE: i32 = 3;
