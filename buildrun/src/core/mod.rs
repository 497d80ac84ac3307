//! Deterministic, pure logic shared by the phase executor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod approval;
pub mod ci_parse;
pub mod diff;
pub mod outcome;
pub mod path_pattern;
pub mod policy;
pub mod quality;
pub mod retry;
pub mod sanitizer;
pub mod types;
