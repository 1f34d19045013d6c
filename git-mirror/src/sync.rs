//! Mirror synchronization: per-entry clone-vs-update decision and the bounded
//! job pool that runs one job per catalog entry.
//!
//! Every job ends in a [`SyncOutcome`]; a failing entry never cancels another.
//! Only fatal conditions (unreadable catalog, missing git, base directory that
//! cannot be created) abort a pass, and they do so before any job starts.

use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, error, info, instrument, warn};

use crate::core::entry::MirrorEntry;
use crate::core::report::{BatchReport, EntryReport, SyncOutcome};
use crate::error::{MirrorError, SyncError};
use crate::io::catalog::load_catalog;
use crate::io::config::Settings;
use crate::io::git::{Git, GitOptions};
use crate::io::marker::{MarkerCheck, MirrorMarker, check_marker, write_marker};
use crate::io::process::CommandRunner;

/// Default number of mirror jobs allowed in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Maximum number of concurrent jobs.
    pub concurrency: usize,
    pub git: GitOptions,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            git: GitOptions::default(),
        }
    }
}

/// Instrumentation hook for job lifecycle events.
///
/// Called from worker threads; implementations must be thread-safe.
pub trait SyncObserver: Sync {
    fn job_started(&self, _entry: &MirrorEntry) {}
    fn job_finished(&self, _entry: &MirrorEntry, _outcome: &SyncOutcome) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}

/// What a job will do for its entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPlan {
    /// No local mirror yet: clone, set push url, push.
    Initialize { dir: PathBuf },
    /// Local mirror present: fetch, push.
    Update { dir: PathBuf },
    /// No directory name can be derived from the source.
    InvalidSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedJob {
    pub entry: MirrorEntry,
    pub plan: JobPlan,
}

/// Decide the branch for one entry from the current filesystem state.
pub fn plan_entry(entry: &MirrorEntry, base_dir: &Path) -> JobPlan {
    match entry.local_dir(base_dir) {
        Some(dir) if dir.exists() => JobPlan::Update { dir },
        Some(dir) => JobPlan::Initialize { dir },
        None => JobPlan::InvalidSource,
    }
}

/// Preview the action for every entry without running anything.
pub fn plan(entries: &[MirrorEntry], base_dir: &Path) -> Vec<PlannedJob> {
    entries
        .iter()
        .map(|entry| PlannedJob {
            entry: entry.clone(),
            plan: plan_entry(entry, base_dir),
        })
        .collect()
}

/// Runs mirror jobs for a batch of entries.
pub struct Scheduler<R> {
    git: Git<R>,
    concurrency: usize,
}

impl<R: CommandRunner> Scheduler<R> {
    pub fn new(runner: R, settings: SyncSettings) -> Self {
        Self {
            git: Git::new(runner, settings.git),
            concurrency: settings.concurrency.max(1),
        }
    }

    pub fn git(&self) -> &Git<R> {
        &self.git
    }

    pub fn run(&self, entries: &[MirrorEntry], base_dir: &Path) -> Result<BatchReport, SyncError> {
        self.run_with_observer(entries, base_dir, &NoopObserver)
    }

    /// Run one job per entry and wait for all of them.
    ///
    /// The report lists entries in catalog order, whatever order jobs finish in.
    #[instrument(skip_all, fields(base_dir = %base_dir.display(), entries = entries.len(), concurrency = self.concurrency))]
    pub fn run_with_observer<O: SyncObserver>(
        &self,
        entries: &[MirrorEntry],
        base_dir: &Path,
        observer: &O,
    ) -> Result<BatchReport, SyncError> {
        let started = Instant::now();
        fs::create_dir_all(base_dir).map_err(|source| SyncError::BaseDirectory {
            path: base_dir.to_path_buf(),
            source,
        })?;

        let noun = if entries.len() == 1 { "repository" } else { "repositories" };
        info!("mirroring {} {noun}", entries.len());

        let locks = directory_locks(entries, base_dir);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency)
            .thread_name(|idx| format!("mirror-job-{idx}"))
            .build()?;

        let records: Vec<EntryReport> = pool.install(|| {
            entries
                .par_iter()
                .map(|entry| self.run_job(entry, base_dir, &locks, observer))
                .collect()
        });

        let report = BatchReport {
            entries: records,
            elapsed: started.elapsed(),
        };
        info!(
            initialized = report.initialized(),
            updated = report.updated(),
            failed = report.failed(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "sync pass finished"
        );
        Ok(report)
    }

    fn run_job<O: SyncObserver>(
        &self,
        entry: &MirrorEntry,
        base_dir: &Path,
        locks: &HashMap<PathBuf, Mutex<()>>,
        observer: &O,
    ) -> EntryReport {
        let started = Instant::now();
        observer.job_started(entry);

        let local_dir = entry.local_dir(base_dir);
        let outcome = match &local_dir {
            Some(dir) => {
                // Jobs sharing a directory run one after another.
                let _guard = locks
                    .get(dir)
                    .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner));
                let job = AssertUnwindSafe(|| self.execute(entry, dir));
                match panic::catch_unwind(job) {
                    Ok(outcome) => outcome,
                    Err(payload) => SyncOutcome::Failed(MirrorError::Panicked(panic_message(&*payload))),
                }
            }
            None => SyncOutcome::Failed(MirrorError::InvalidSource(entry.source.clone())),
        };

        match &outcome {
            SyncOutcome::Failed(err) => {
                error!(source = %entry.source, target = %entry.target, error = %err, "mirror job failed");
            }
            ok => {
                info!(source = %entry.source, target = %entry.target, outcome = ok.label(), "mirror job finished");
            }
        }
        observer.job_finished(entry, &outcome);

        EntryReport {
            entry: entry.clone(),
            local_dir,
            outcome,
            elapsed: started.elapsed(),
        }
    }

    /// Pick the branch once, from directory existence, then run it.
    fn execute(&self, entry: &MirrorEntry, dir: &Path) -> SyncOutcome {
        if dir.exists() {
            debug!(dir = %dir.display(), "local mirror exists, updating");
            match self.update(entry, dir) {
                Ok(()) => SyncOutcome::Updated,
                Err(err) => SyncOutcome::Failed(err),
            }
        } else {
            debug!(dir = %dir.display(), "no local mirror, initializing");
            match self.initialize(entry, dir) {
                Ok(()) => SyncOutcome::Initialized,
                Err(err) => SyncOutcome::Failed(err),
            }
        }
    }

    /// Clone, set the push url, record the marker, push.
    ///
    /// `dir` was absent when the job started and the directory lock is held, so
    /// anything left behind by a failed clone or set-url belongs to this job and
    /// is removed. Otherwise the next pass would update a mirror with no push
    /// url and push back to origin.
    fn initialize(&self, entry: &MirrorEntry, dir: &Path) -> Result<(), MirrorError> {
        if let Err(err) = self.git.initialize_mirror(&entry.source, dir) {
            if dir.exists() {
                discard_partial_clone(dir);
            }
            return Err(err);
        }
        if let Err(err) = self.git.set_push_target(dir, &entry.target) {
            discard_partial_clone(dir);
            return Err(err);
        }
        write_marker(dir, &MirrorMarker::for_entry(entry))?;
        self.git.push_mirror(dir)
    }

    fn update(&self, entry: &MirrorEntry, dir: &Path) -> Result<(), MirrorError> {
        if check_marker(dir, entry)? == MarkerCheck::Missing {
            // Nothing says where this directory pushes; point it at the target first.
            warn!(dir = %dir.display(), source = %entry.source, "local mirror has no marker, adopting it");
            self.git.set_push_target(dir, &entry.target)?;
            write_marker(dir, &MirrorMarker::for_entry(entry))?;
        }
        self.git.update_mirror(dir)
    }
}

/// One lock per local directory, warning when different sources collide.
fn directory_locks(entries: &[MirrorEntry], base_dir: &Path) -> HashMap<PathBuf, Mutex<()>> {
    let mut owners: HashMap<PathBuf, &str> = HashMap::new();
    for entry in entries {
        let Some(dir) = entry.local_dir(base_dir) else {
            continue;
        };
        match owners.get(&dir) {
            Some(first) if *first != entry.source => {
                warn!(
                    dir = %dir.display(),
                    first = %first,
                    second = %entry.source,
                    "two sources map to the same local mirror directory; the later one will be rejected as mismatched"
                );
            }
            Some(_) => {}
            None => {
                owners.insert(dir, &entry.source);
            }
        }
    }
    owners
        .into_keys()
        .map(|dir| (dir, Mutex::new(())))
        .collect()
}

/// Remove an incomplete clone, so the next pass starts over.
fn discard_partial_clone(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => warn!(dir = %dir.display(), "removed incomplete clone"),
        Err(e) => warn!(dir = %dir.display(), err = %e, "failed to remove incomplete clone"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one full pass: load the catalog, probe git, sync every entry.
///
/// The catalog is read first so a broken catalog costs no process spawns.
pub fn sync_once<R, O>(runner: R, settings: &Settings, observer: &O) -> Result<BatchReport, SyncError>
where
    R: CommandRunner,
    O: SyncObserver,
{
    let entries = load_catalog(&settings.mirrors_file)?;
    let scheduler = Scheduler::new(runner, settings.sync_settings());
    scheduler.git().probe_version()?;
    scheduler.run_with_observer(&entries, &settings.repositories_dir, observer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MirrorStep;
    use crate::io::marker::read_marker;
    use crate::test_support::{RecordingObserver, ScriptedRunner, entries};

    fn scheduler(runner: &ScriptedRunner, concurrency: usize) -> Scheduler<&ScriptedRunner> {
        Scheduler::new(
            runner,
            SyncSettings {
                concurrency,
                ..SyncSettings::default()
            },
        )
    }

    /// A local mirror as a previous pass leaves it.
    fn mirrored_dir(base: &Path, entry: &MirrorEntry) -> PathBuf {
        let dir = entry.local_dir(base).expect("derived dir");
        fs::create_dir_all(&dir).expect("mkdir");
        write_marker(&dir, &MirrorMarker::for_entry(entry)).expect("marker");
        dir
    }

    #[test]
    fn absent_directory_initializes_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedRunner::new();
        let entry = MirrorEntry::new("https://host/group/project.git", "git@backup:project.git");

        let report = scheduler(&runner, 5)
            .run(std::slice::from_ref(&entry), temp.path())
            .expect("run");

        assert!(matches!(report.entries[0].outcome, SyncOutcome::Initialized));
        assert_eq!(runner.steps(), vec!["clone", "set-url", "push"]);
        let dir = temp.path().join("project.git");
        assert_eq!(report.entries[0].local_dir.as_deref(), Some(dir.as_path()));
        assert_eq!(
            read_marker(&dir).expect("read marker"),
            Some(MirrorMarker::for_entry(&entry))
        );
    }

    #[test]
    fn present_directory_updates_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let entry = MirrorEntry::new("https://host/group/project", "B");
        mirrored_dir(temp.path(), &entry);
        let runner = ScriptedRunner::new();

        let report = scheduler(&runner, 5)
            .run(std::slice::from_ref(&entry), temp.path())
            .expect("run");

        assert!(matches!(report.entries[0].outcome, SyncOutcome::Updated));
        assert_eq!(runner.steps(), vec!["fetch", "push"]);
    }

    #[test]
    fn unmarked_directory_gets_push_url_before_update() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("project.git");
        fs::create_dir_all(&dir).expect("mkdir");
        let runner = ScriptedRunner::new();
        let entry = MirrorEntry::new("https://host/group/project", "B");

        let report = scheduler(&runner, 5)
            .run(std::slice::from_ref(&entry), temp.path())
            .expect("run");

        assert!(matches!(report.entries[0].outcome, SyncOutcome::Updated));
        assert_eq!(runner.steps(), vec!["set-url", "fetch", "push"]);
        assert_eq!(
            read_marker(&dir).expect("read marker"),
            Some(MirrorMarker::for_entry(&entry))
        );
    }

    #[test]
    fn unmarked_directory_is_not_pushed_when_push_url_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("project.git");
        fs::create_dir_all(&dir).expect("mkdir");
        let runner = ScriptedRunner::new().fail_step("set-url", 2, "not a git repository");

        let report = scheduler(&runner, 5)
            .run(&[MirrorEntry::new("https://host/project", "B")], temp.path())
            .expect("run");

        assert!(matches!(
            report.entries[0].outcome,
            SyncOutcome::Failed(MirrorError::RemoteConfigFailed(_))
        ));
        assert_eq!(runner.steps(), vec!["set-url"]);
        assert_eq!(read_marker(&dir).expect("read marker"), None);
    }

    #[test]
    fn fetch_failure_prevents_push() {
        let temp = tempfile::tempdir().expect("tempdir");
        let entry = MirrorEntry::new("https://host/project.git", "B");
        mirrored_dir(temp.path(), &entry);
        let runner = ScriptedRunner::new().fail_step("fetch", 128, "fatal: could not read from remote");

        let report = scheduler(&runner, 5)
            .run(std::slice::from_ref(&entry), temp.path())
            .expect("run");

        assert!(matches!(
            report.entries[0].outcome,
            SyncOutcome::Failed(MirrorError::FetchFailed(_))
        ));
        assert_eq!(runner.steps(), vec!["fetch"]);
    }

    #[test]
    fn failed_push_url_discards_the_clone() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedRunner::new().fail_step("set-url", 2, "error: No such remote");

        let report = scheduler(&runner, 5)
            .run(&[MirrorEntry::new("A", "B")], temp.path())
            .expect("run");

        assert!(matches!(
            report.entries[0].outcome,
            SyncOutcome::Failed(MirrorError::RemoteConfigFailed(_))
        ));
        assert_eq!(runner.steps(), vec!["clone", "set-url"]);
        assert!(!temp.path().join("A.git").exists());
    }

    #[test]
    fn clone_failure_stops_the_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedRunner::new().fail_step("clone", 128, "repository not found");

        let report = scheduler(&runner, 5)
            .run(&[MirrorEntry::new("A", "B")], temp.path())
            .expect("run");

        let err = report.entries[0].outcome.error().expect("failed");
        assert_eq!(err.step(), Some(MirrorStep::Clone));
        assert_eq!(runner.steps(), vec!["clone"]);
    }

    #[test]
    fn timed_out_clone_is_removed_and_retried_next_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let entry = MirrorEntry::new("ssh://example.invalid/group/proj.git", "B");
        let runner = ScriptedRunner::new()
            .time_out_step("clone")
            .leave_partial_clones();

        let report = scheduler(&runner, 5)
            .run(std::slice::from_ref(&entry), temp.path())
            .expect("run");

        assert!(matches!(
            report.entries[0].outcome,
            SyncOutcome::Failed(MirrorError::TimedOut {
                step: MirrorStep::Clone,
                ..
            })
        ));
        assert_eq!(runner.steps(), vec!["clone"]);
        assert!(!temp.path().join("proj.git").exists());
        assert!(matches!(
            plan_entry(&entry, temp.path()),
            JobPlan::Initialize { .. }
        ));
    }

    #[test]
    fn failed_clone_leftovers_are_removed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedRunner::new()
            .fail_step("clone", 128, "early EOF")
            .leave_partial_clones();

        let report = scheduler(&runner, 5)
            .run(&[MirrorEntry::new("https://host/app.git", "B")], temp.path())
            .expect("run");

        assert!(matches!(
            report.entries[0].outcome,
            SyncOutcome::Failed(MirrorError::CloneFailed(_))
        ));
        assert!(!temp.path().join("app.git").exists());
    }

    #[test]
    fn one_failure_does_not_affect_others() {
        let temp = tempfile::tempdir().expect("tempdir");
        let batch = entries(6);
        let runner = ScriptedRunner::new()
            .fail_step_in("clone", "repo-1.git")
            .fail_step_in("push", "repo-4.git");

        let report = scheduler(&runner, 3).run(&batch, temp.path()).expect("run");

        assert_eq!(report.len(), 6);
        assert_eq!(report.failed(), 2);
        assert_eq!(report.initialized(), 4);
        for (record, entry) in report.entries.iter().zip(&batch) {
            assert_eq!(&record.entry, entry, "report keeps catalog order");
        }
        assert!(matches!(
            report.entries[1].outcome,
            SyncOutcome::Failed(MirrorError::CloneFailed(_))
        ));
        assert!(matches!(
            report.entries[4].outcome,
            SyncOutcome::Failed(MirrorError::PushFailed(_))
        ));
        assert_eq!(runner.steps_for("repo-1.git"), vec!["clone"]);
        assert_eq!(runner.steps_for("repo-2.git"), vec!["clone", "set-url", "push"]);
    }

    #[test]
    fn concurrency_never_exceeds_bound() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedRunner::new().with_delay(std::time::Duration::from_millis(40));
        let observer = RecordingObserver::new();

        let report = scheduler(&runner, 3)
            .run_with_observer(&entries(12), temp.path(), &observer)
            .expect("run");

        assert_eq!(report.len(), 12);
        assert_eq!(observer.started(), 12);
        assert_eq!(observer.finished().len(), 12);
        assert!(observer.max_active() <= 3, "max active {}", observer.max_active());
        assert!(observer.max_active() > 1, "jobs never overlapped");
    }

    #[test]
    fn single_worker_runs_jobs_one_at_a_time() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedRunner::new().with_delay(std::time::Duration::from_millis(5));
        let observer = RecordingObserver::new();

        scheduler(&runner, 1)
            .run_with_observer(&entries(4), temp.path(), &observer)
            .expect("run");

        assert_eq!(observer.max_active(), 1);
    }

    #[test]
    fn duplicate_entries_run_twice_without_racing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedRunner::new().with_delay(std::time::Duration::from_millis(5));
        let entry = MirrorEntry::new("A", "B");

        let report = scheduler(&runner, 5)
            .run(&[entry.clone(), entry], temp.path())
            .expect("run");

        assert_eq!(report.initialized(), 1);
        assert_eq!(report.updated(), 1);
        let mut steps = runner.steps();
        steps.sort_unstable();
        assert_eq!(steps, vec!["clone", "fetch", "push", "push", "set-url"]);
    }

    #[test]
    fn colliding_sources_are_rejected_as_mismatched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedRunner::new();
        let batch = vec![
            MirrorEntry::new("https://one.example/app.git", "B1"),
            MirrorEntry::new("https://two.example/app.git", "B2"),
        ];

        let report = scheduler(&runner, 2).run(&batch, temp.path()).expect("run");

        assert_eq!(report.initialized(), 1);
        assert_eq!(report.failed(), 1);
        assert!(report.failures().all(|r| matches!(
            r.outcome,
            SyncOutcome::Failed(MirrorError::MismatchedMirror { .. })
        )));
        assert_eq!(runner.steps(), vec!["clone", "set-url", "push"]);
    }

    #[test]
    fn mismatched_marker_runs_no_git() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("app.git");
        fs::create_dir_all(&dir).expect("mkdir");
        write_marker(&dir, &MirrorMarker::for_entry(&MirrorEntry::new("https://elsewhere/app", "B")))
            .expect("marker");
        let runner = ScriptedRunner::new();

        let report = scheduler(&runner, 5)
            .run(&[MirrorEntry::new("https://host/app", "B")], temp.path())
            .expect("run");

        assert!(matches!(
            report.entries[0].outcome,
            SyncOutcome::Failed(MirrorError::MismatchedMirror { .. })
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn invalid_source_fails_only_that_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedRunner::new();

        let report = scheduler(&runner, 5)
            .run(&[MirrorEntry::new("https://host/.git", "B"), MirrorEntry::new("ok", "B")], temp.path())
            .expect("run");

        assert!(matches!(
            report.entries[0].outcome,
            SyncOutcome::Failed(MirrorError::InvalidSource(_))
        ));
        assert_eq!(report.entries[0].local_dir, None);
        assert!(matches!(report.entries[1].outcome, SyncOutcome::Initialized));
    }

    #[test]
    fn base_directory_is_created() {
        let temp = tempfile::tempdir().expect("tempdir");
        let base = temp.path().join("nested").join("repositories");
        let runner = ScriptedRunner::new();

        scheduler(&runner, 5).run(&[], &base).expect("run");
        assert!(base.is_dir());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn base_directory_failure_is_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("file");
        fs::write(&blocker, "not a directory").expect("write");
        let runner = ScriptedRunner::new();

        let err = scheduler(&runner, 5)
            .run(&entries(2), &blocker.join("repositories"))
            .unwrap_err();
        assert!(matches!(err, SyncError::BaseDirectory { .. }));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn plan_reports_branch_per_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("old.git")).expect("mkdir");
        let planned = plan(
            &[
                MirrorEntry::new("https://h/old.git", "B"),
                MirrorEntry::new("https://h/new", "B"),
                MirrorEntry::new("", "B"),
            ],
            temp.path(),
        );
        assert_eq!(
            planned[0].plan,
            JobPlan::Update {
                dir: temp.path().join("old.git")
            }
        );
        assert_eq!(
            planned[1].plan,
            JobPlan::Initialize {
                dir: temp.path().join("new.git")
            }
        );
        assert_eq!(planned[2].plan, JobPlan::InvalidSource);
    }
}
