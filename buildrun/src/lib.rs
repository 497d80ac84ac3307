//! Governed, phase-by-phase build runner.
//!
//! A run walks an ordered plan of phases. Each phase attempt asks a Patch
//! Proposer for a structured change, pushes it through a governed apply
//! kernel (sanitize, policy, quality, optional human approval, checkpoint),
//! verifies it with CI and lets a retry policy decide what happens next.
//!
//! - **[`core`]**: Pure, deterministic logic (classification, policy, hashing,
//!   retry decisions). No I/O.
//! - **[`io`]**: Side effects (filesystem, git, subprocesses, HTTP, clock).
//!   Behind traits where tests need fakes.
//!
//! Orchestration modules ([`kernel`], [`dispatch`], [`executor`], [`run`])
//! tie the two together and implement the CLI commands.

pub mod core;
pub mod dispatch;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod kernel;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
