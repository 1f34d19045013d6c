//! Test-only helpers: a scripted command runner and a recording observer.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::core::entry::MirrorEntry;
use crate::core::report::SyncOutcome;
use crate::error::CommandError;
use crate::io::process::{CommandOutput, CommandRequest, CommandRunner, OutputMode};
use crate::sync::SyncObserver;

/// One recorded call to [`ScriptedRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub mode: OutputMode,
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// True when this call worked on the mirror directory named `dir_name`.
    pub fn touches(&self, dir_name: &str) -> bool {
        let in_dir = self
            .workdir
            .as_deref()
            .and_then(Path::file_name)
            .is_some_and(|name| name == dir_name);
        let clones_into = git_step(self) == "clone"
            && self
                .argv
                .last()
                .map(Path::new)
                .and_then(Path::file_name)
                .is_some_and(|name| name == dir_name);
        in_dir || clones_into
    }
}

/// Short name of the git step an invocation performs.
pub fn git_step(invocation: &Invocation) -> &'static str {
    match invocation.argv.get(1).map(String::as_str) {
        Some("clone") => "clone",
        Some("remote") => "set-url",
        Some("fetch") => "fetch",
        Some("push") => "push",
        Some("--version") => "version",
        _ => "other",
    }
}

type Rule = Box<dyn Fn(&CommandRequest) -> Option<CommandError> + Send + Sync>;

/// Command runner that records every request and answers from rules.
///
/// Requests no rule matches succeed. A successful `clone` creates its
/// destination directory, so later passes see the mirror as present.
#[derive(Default)]
pub struct ScriptedRunner {
    calls: Mutex<Vec<Invocation>>,
    rules: Vec<Rule>,
    delay: Duration,
    partial_clones: bool,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call (to make jobs overlap).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Failed clones still create their destination, as a killed `git clone` does.
    pub fn leave_partial_clones(mut self) -> Self {
        self.partial_clones = true;
        self
    }

    /// Fail every request matching `pred` with exit code 1.
    pub fn fail_with<F>(mut self, pred: F) -> Self
    where
        F: Fn(&CommandRequest) -> bool + Send + Sync + 'static,
    {
        self.rules.push(Box::new(move |req| {
            pred(req).then(|| CommandError::Failed {
                exit_code: Some(1),
                stderr: "scripted failure".to_string(),
            })
        }));
        self
    }

    /// Fail every call of `step` (see [`git_step`]).
    pub fn fail_step(mut self, step: &'static str, exit_code: i32, stderr: &str) -> Self {
        let stderr = stderr.to_string();
        self.rules.push(Box::new(move |req| {
            (git_step(&invocation(req)) == step).then(|| CommandError::Failed {
                exit_code: Some(exit_code),
                stderr: stderr.clone(),
            })
        }));
        self
    }

    /// Fail `step` only for the mirror directory named `dir_name`.
    pub fn fail_step_in(mut self, step: &'static str, dir_name: &str) -> Self {
        let dir_name = dir_name.to_string();
        self.rules.push(Box::new(move |req| {
            let call = invocation(req);
            (git_step(&call) == step && call.touches(&dir_name)).then(|| CommandError::Failed {
                exit_code: Some(128),
                stderr: format!("scripted {step} failure in {dir_name}"),
            })
        }));
        self
    }

    /// Report every call of `step` as timed out.
    pub fn time_out_step(mut self, step: &'static str) -> Self {
        self.rules.push(Box::new(move |req| {
            (git_step(&invocation(req)) == step).then(|| CommandError::TimedOut {
                timeout: req.timeout.unwrap_or_default(),
            })
        }));
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Step names of every call, in call order.
    pub fn steps(&self) -> Vec<&'static str> {
        self.calls().iter().map(git_step).collect()
    }

    /// Step names of the calls that touched the mirror directory `dir_name`.
    pub fn steps_for(&self, dir_name: &str) -> Vec<&'static str> {
        self.calls()
            .iter()
            .filter(|call| call.touches(dir_name))
            .map(git_step)
            .collect()
    }
}

fn invocation(req: &CommandRequest) -> Invocation {
    Invocation {
        argv: req.argv.clone(),
        workdir: req.workdir.clone(),
        mode: req.mode,
        timeout: req.timeout,
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError> {
        let call = invocation(request);
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call.clone());

        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if let Some(err) = self.rules.iter().find_map(|rule| rule(request)) {
            if self.partial_clones && git_step(&call) == "clone" {
                if let Some(dest) = call.argv.last() {
                    fs::create_dir_all(dest)?;
                }
            }
            return Err(err);
        }

        let stdout = match git_step(&call) {
            "clone" => {
                if let Some(dest) = call.argv.last() {
                    fs::create_dir_all(dest)?;
                }
                String::new()
            }
            "version" => "git version 2.47.0 (scripted)\n".to_string(),
            _ => String::new(),
        };
        let captured = request.mode == OutputMode::Capture;
        Ok(CommandOutput {
            exit_code: Some(0),
            stdout: captured.then_some(stdout),
            stderr: captured.then(String::new),
        })
    }
}

/// Observer that tracks how many jobs run at once.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: AtomicUsize,
    finished: Mutex<Vec<(MirrorEntry, &'static str)>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest number of jobs observed in flight at the same time.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// `(entry, outcome label)` in completion order.
    pub fn finished(&self) -> Vec<(MirrorEntry, &'static str)> {
        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl SyncObserver for RecordingObserver {
    fn job_started(&self, _entry: &MirrorEntry) {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn job_finished(&self, entry: &MirrorEntry, outcome: &SyncOutcome) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((entry.clone(), outcome.label()));
    }
}

/// Temporary workspace with a repositories directory and catalog helpers.
pub struct TestWorkspace {
    dir: tempfile::TempDir,
}

impl TestWorkspace {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn base_dir(&self) -> PathBuf {
        self.dir.path().join("repositories")
    }

    /// Write `contents` as `mirrors.json` and return its path.
    pub fn write_catalog(&self, contents: &str) -> std::io::Result<PathBuf> {
        let path = self.dir.path().join("mirrors.json");
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// Write a JSON catalog for `entries`.
    pub fn write_entries(&self, entries: &[MirrorEntry]) -> std::io::Result<PathBuf> {
        let json = serde_json::to_string_pretty(entries).map_err(std::io::Error::other)?;
        self.write_catalog(&json)
    }
}

/// `count` distinct entries named `repo-0`, `repo-1`, ...
pub fn entries(count: usize) -> Vec<MirrorEntry> {
    (0..count)
        .map(|i| {
            MirrorEntry::new(
                format!("https://source.example/group/repo-{i}.git"),
                format!("git@mirror.example:group/repo-{i}.git"),
            )
        })
        .collect()
}
