//! Stable exit codes for buildrun CLI commands.

/// Command succeeded; for `run`, every phase is COMPLETE.
pub const OK: i32 = 0;
/// Invalid workspace, config or plan, or any other error.
pub const INVALID: i32 = 1;
/// `buildrun run` stopped at a BLOCKED phase (policy or approval).
pub const BLOCKED: i32 = 2;
/// `buildrun run` stopped at a FAILED phase.
pub const FAILED: i32 = 3;
/// `buildrun run` was cancelled.
pub const CANCELLED: i32 = 4;
