//! Side-effecting adapters: filesystem, subprocesses, git, HTTP and clock.

pub mod apply;
pub mod attempt_log;
pub mod cancel;
pub mod checkpoint;
pub mod ci;
pub mod clock;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod git;
pub mod init;
pub mod lease;
pub mod plan;
pub mod process;
pub mod proposer;
pub mod resolver;
pub mod run_state;
pub mod supervisor;
pub mod telemetry;
