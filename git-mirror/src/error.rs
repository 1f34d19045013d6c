//! Error taxonomy for the mirror engine.
//!
//! Errors are split by blast radius:
//!
//! - [`CommandError`]: a single external process invocation went wrong.
//! - [`MirrorError`]: one catalog entry failed. Recorded in the batch report,
//!   never aborts the batch.
//! - [`CatalogError`] / [`SyncError`]: fatal, raised before any job starts.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure of one external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command exited with {}: {}", exit_code_label(.exit_code), .stderr.trim())]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("command timed out after {timeout:?}")]
    TimedOut { timeout: Duration },

    #[error("command io error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (killed by signal)".to_string(),
    }
}

/// The git step a mirror job was executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorStep {
    Clone,
    SetPushUrl,
    Fetch,
    Push,
}

impl fmt::Display for MirrorStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MirrorStep::Clone => "clone",
            MirrorStep::SetPushUrl => "set-push-url",
            MirrorStep::Fetch => "fetch",
            MirrorStep::Push => "push",
        };
        f.write_str(name)
    }
}

/// Per-entry failure.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("clone failed: {0}")]
    CloneFailed(#[source] CommandError),

    #[error("setting push url failed: {0}")]
    RemoteConfigFailed(#[source] CommandError),

    #[error("push failed: {0}")]
    PushFailed(#[source] CommandError),

    #[error("fetch failed: {0}")]
    FetchFailed(#[source] CommandError),

    #[error("{step} timed out after {timeout:?}")]
    TimedOut { step: MirrorStep, timeout: Duration },

    #[error("cannot derive a local directory name from source '{0}'")]
    InvalidSource(String),

    #[error("{} was created for {found}, catalog expects {expected}", .dir.display())]
    MismatchedMirror {
        dir: PathBuf,
        expected: String,
        found: String,
    },

    #[error("mirror marker {}: {source}", .path.display())]
    Marker {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mirror job panicked: {0}")]
    Panicked(String),
}

impl MirrorError {
    /// Wrap a command failure for `step`, surfacing timeouts as their own kind.
    pub fn from_step(step: MirrorStep, err: CommandError) -> Self {
        if let CommandError::TimedOut { timeout } = err {
            return MirrorError::TimedOut { step, timeout };
        }
        match step {
            MirrorStep::Clone => MirrorError::CloneFailed(err),
            MirrorStep::SetPushUrl => MirrorError::RemoteConfigFailed(err),
            MirrorStep::Fetch => MirrorError::FetchFailed(err),
            MirrorStep::Push => MirrorError::PushFailed(err),
        }
    }

    /// Step the job was in when it failed, if it failed inside a git step.
    pub fn step(&self) -> Option<MirrorStep> {
        match self {
            MirrorError::CloneFailed(_) => Some(MirrorStep::Clone),
            MirrorError::RemoteConfigFailed(_) => Some(MirrorStep::SetPushUrl),
            MirrorError::FetchFailed(_) => Some(MirrorStep::Fetch),
            MirrorError::PushFailed(_) => Some(MirrorStep::Push),
            MirrorError::TimedOut { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// Catalog could not be loaded.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("mirrors file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("read mirrors file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed mirrors file {}: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },
}

/// Fatal errors that abort a pass before any job is dispatched.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("git is not available ({0}); install git (https://git-scm.com) and re-run")]
    ToolUnavailable(#[source] CommandError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("create repositories directory {}: {source}", .path.display())]
    BaseDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_reported_as_its_own_kind() {
        let err = MirrorError::from_step(
            MirrorStep::Fetch,
            CommandError::TimedOut {
                timeout: Duration::from_secs(5),
            },
        );
        assert!(matches!(
            err,
            MirrorError::TimedOut {
                step: MirrorStep::Fetch,
                ..
            }
        ));
        assert_eq!(err.to_string(), "fetch timed out after 5s");
    }

    #[test]
    fn step_failures_map_to_step_variants() {
        let failed = || CommandError::Failed {
            exit_code: Some(128),
            stderr: "fatal: nope\n".to_string(),
        };
        assert!(matches!(
            MirrorError::from_step(MirrorStep::Clone, failed()),
            MirrorError::CloneFailed(_)
        ));
        assert!(matches!(
            MirrorError::from_step(MirrorStep::SetPushUrl, failed()),
            MirrorError::RemoteConfigFailed(_)
        ));
        assert!(matches!(
            MirrorError::from_step(MirrorStep::Push, failed()),
            MirrorError::PushFailed(_)
        ));
        let fetch = MirrorError::from_step(MirrorStep::Fetch, failed());
        assert_eq!(fetch.step(), Some(MirrorStep::Fetch));
        assert_eq!(
            fetch.to_string(),
            "fetch failed: command exited with status 128: fatal: nope"
        );
    }

    #[test]
    fn sub_second_timeouts_keep_their_unit() {
        let err = CommandError::TimedOut {
            timeout: Duration::from_millis(200),
        };
        assert_eq!(err.to_string(), "command timed out after 200ms");
        let err = MirrorError::from_step(MirrorStep::Clone, err);
        assert_eq!(err.to_string(), "clone timed out after 200ms");
    }

    #[test]
    fn signal_exit_is_labelled() {
        let err = CommandError::Failed {
            exit_code: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("killed by signal"));
    }
}
