//! Repeated sync passes for `git-mirror sync --loop`.

use std::time::Duration;

use chrono::{Local, TimeDelta};
use tracing::{error, info, warn};

use crate::core::report::BatchReport;
use crate::error::SyncError;
use crate::io::config::LoopSettings;

/// Summary of a loop invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Passes attempted, including aborted ones.
    pub passes: u32,
    /// Passes that stopped before dispatch (catalog or base directory errors).
    pub aborted_passes: u32,
    /// Completed passes in which at least one entry failed.
    pub passes_with_failures: u32,
}

/// Run `pass` until `max_passes` is reached, sleeping between passes.
///
/// A missing git binary ends the loop with an error. Any other fatal pass
/// error is logged and the next pass runs after the usual interval, so a
/// repaired catalog is picked up without a restart.
pub fn run_loop<P, F, S>(
    settings: &LoopSettings,
    mut pass: P,
    mut on_report: F,
    mut sleep: S,
) -> Result<LoopOutcome, SyncError>
where
    P: FnMut() -> Result<BatchReport, SyncError>,
    F: FnMut(&BatchReport),
    S: FnMut(Duration),
{
    let mut outcome = LoopOutcome::default();
    loop {
        outcome.passes += 1;
        info!(pass = outcome.passes, "starting sync pass");
        match pass() {
            Ok(report) => {
                if report.has_failures() {
                    outcome.passes_with_failures += 1;
                }
                on_report(&report);
            }
            Err(err @ SyncError::ToolUnavailable(_)) => {
                error!(error = %err, "git is not available, stopping");
                return Err(err);
            }
            Err(err) => {
                outcome.aborted_passes += 1;
                error!(error = %err, "sync pass aborted");
            }
        }

        if settings.max_passes.is_some_and(|max| outcome.passes >= max) {
            info!(passes = outcome.passes, "reached max passes");
            return Ok(outcome);
        }

        let interval = settings.interval();
        match next_run_at(interval) {
            Some(at) => info!(next_run = %at, "sleeping {}s", interval.as_secs()),
            None => warn!("sleeping {}s", interval.as_secs()),
        }
        sleep(interval);
    }
}

fn next_run_at(interval: Duration) -> Option<String> {
    let delta = TimeDelta::from_std(interval).ok()?;
    let at = Local::now().checked_add_signed(delta)?;
    Some(at.format("%Y-%m-%d %H:%M:%S").to_string())
}
