//! Unified exit codes. Part of the public contract: scripts key off these.

pub const SUCCESS: i32 = 0;
/// The case (or at least one batch case) resolved to a non-Correct result.
pub const CASE_NOT_CORRECT: i32 = 1;
/// Setup, config or I/O failure before or during evaluation.
pub const INTERNAL_ERROR: i32 = 2;
