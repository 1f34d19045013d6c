//! Side-effecting helpers: processes, git, catalog and marker files, settings.

pub mod catalog;
pub mod config;
pub mod git;
pub mod marker;
pub mod process;
