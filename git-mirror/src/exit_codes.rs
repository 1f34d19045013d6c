//! Stable exit codes for the `git-mirror` CLI.

/// Every pass completed (and, with `--fail-on-error`, no entry failed).
pub const OK: i32 = 0;
/// Settings, catalog, git availability or base directory problem.
pub const FATAL: i32 = 1;
/// `--fail-on-error` was given and at least one entry failed.
pub const ENTRIES_FAILED: i32 = 2;
