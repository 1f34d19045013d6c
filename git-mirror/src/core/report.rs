//! Per-entry outcomes and the batch report.

use std::path::PathBuf;
use std::time::Duration;

use crate::core::entry::MirrorEntry;
use crate::error::MirrorError;

/// Terminal state of one mirror job.
#[derive(Debug)]
pub enum SyncOutcome {
    /// Local mirror was absent; cloned, configured and pushed.
    Initialized,
    /// Local mirror existed; fetched and pushed.
    Updated,
    Failed(MirrorError),
}

impl SyncOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, SyncOutcome::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Initialized => "initialized",
            SyncOutcome::Updated => "updated",
            SyncOutcome::Failed(_) => "failed",
        }
    }

    pub fn error(&self) -> Option<&MirrorError> {
        match self {
            SyncOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Outcome of one catalog entry.
#[derive(Debug)]
pub struct EntryReport {
    pub entry: MirrorEntry,
    /// `None` when no directory could be derived from the source.
    pub local_dir: Option<PathBuf>,
    pub outcome: SyncOutcome,
    pub elapsed: Duration,
}

/// Result of one sync pass: one record per catalog entry, in catalog order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub entries: Vec<EntryReport>,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn initialized(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::Initialized))
    }

    pub fn updated(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::Updated))
    }

    pub fn failed(&self) -> usize {
        self.count(SyncOutcome::is_failed)
    }

    pub fn has_failures(&self) -> bool {
        self.entries.iter().any(|e| e.outcome.is_failed())
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntryReport> {
        self.entries.iter().filter(|e| e.outcome.is_failed())
    }

    /// First record whose entry has the given source.
    pub fn find(&self, source: &str) -> Option<&EntryReport> {
        self.entries.iter().find(|e| e.entry.source == source)
    }

    fn count(&self, pred: impl Fn(&SyncOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }
}
