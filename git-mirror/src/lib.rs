//! Keeps a set of git repositories mirrored to secondary remotes.
//!
//! A catalog lists `(source, mirror)` pairs. Each pass clones new sources as
//! bare mirrors, fetches existing ones, and pushes every ref to the mirror
//! target, running entries in parallel up to a configured bound.
//!
//! - **[`core`]**: Entries, derived directory names and pass reports. No I/O.
//! - **[`io`]**: Catalog and settings files, the marker file, process
//!   execution and the git adapter.
//!
//! [`sync`] schedules one pass; [`looping`] repeats passes on an interval.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod sync;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
