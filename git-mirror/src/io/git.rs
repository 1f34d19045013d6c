//! Git adapter for mirror jobs.
//!
//! Every operation is a thin, explicit composition of `git` subcommands run
//! through a [`CommandRunner`]; no git logic is implemented here.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::error::{MirrorError, MirrorStep, SyncError};
use crate::io::process::{CommandRequest, CommandRunner, OutputMode, StreamTarget};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How git is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOptions {
    /// Program name or path of the git binary.
    pub program: String,
    /// Output handling for clone/fetch/push and remote configuration.
    pub output: OutputMode,
    /// Per-command limit; the process is killed when exceeded.
    pub timeout: Option<Duration>,
}

impl Default for GitOptions {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
            output: OutputMode::Stream(StreamTarget::Terminal),
            timeout: Some(DEFAULT_COMMAND_TIMEOUT),
        }
    }
}

/// Wrapper for executing git mirror operations.
#[derive(Debug, Clone)]
pub struct Git<R> {
    runner: R,
    options: GitOptions,
}

impl<R: CommandRunner> Git<R> {
    pub fn new(runner: R, options: GitOptions) -> Self {
        Self { runner, options }
    }

    pub fn options(&self) -> &GitOptions {
        &self.options
    }

    /// Run `git --version`; any failure means git cannot be used.
    #[instrument(skip_all)]
    pub fn probe_version(&self) -> Result<String, SyncError> {
        let request = CommandRequest::new([self.options.program.as_str(), "--version"])
            .timeout(self.options.timeout);
        let output = self
            .runner
            .run(&request)
            .map_err(SyncError::ToolUnavailable)?;
        let version = output.stdout.unwrap_or_default().trim().to_string();
        info!(%version, "git is installed");
        Ok(version)
    }

    /// `git clone --mirror <source> <dest>`.
    #[instrument(skip_all, fields(source = %source, dest = %dest.display()))]
    pub fn initialize_mirror(&self, source: &str, dest: &Path) -> Result<(), MirrorError> {
        info!("cloning repository as bare mirror");
        let dest = dest.to_string_lossy();
        self.run_step(MirrorStep::Clone, &["clone", "--mirror", source, &dest], None)
    }

    /// Point the push URL of `origin` at the mirror target.
    #[instrument(skip_all, fields(repo = %repo_dir.display(), target = %target))]
    pub fn set_push_target(&self, repo_dir: &Path, target: &str) -> Result<(), MirrorError> {
        info!("setting push url");
        self.run_step(
            MirrorStep::SetPushUrl,
            &["remote", "set-url", "--push", "origin", target],
            Some(repo_dir),
        )
    }

    /// `git push --mirror`: all refs, including deletions.
    #[instrument(skip_all, fields(repo = %repo_dir.display()))]
    pub fn push_mirror(&self, repo_dir: &Path) -> Result<(), MirrorError> {
        info!("pushing all branches and tags");
        self.run_step(MirrorStep::Push, &["push", "--mirror"], Some(repo_dir))
    }

    /// Pruning fetch from origin, then mirror push.
    ///
    /// A failed fetch never reaches the push.
    #[instrument(skip_all, fields(repo = %repo_dir.display()))]
    pub fn update_mirror(&self, repo_dir: &Path) -> Result<(), MirrorError> {
        info!("fetching changes from origin");
        self.run_step(MirrorStep::Fetch, &["fetch", "-p", "origin"], Some(repo_dir))?;
        self.push_mirror(repo_dir)
    }

    fn run_step(&self, step: MirrorStep, args: &[&str], workdir: Option<&Path>) -> Result<(), MirrorError> {
        let mut request = CommandRequest::new(
            std::iter::once(self.options.program.as_str()).chain(args.iter().copied()),
        )
        .mode(self.options.output)
        .timeout(self.options.timeout);
        if let Some(dir) = workdir {
            request = request.workdir(dir);
        }
        self.runner
            .run(&request)
            .map_err(|err| MirrorError::from_step(step, err))?;
        debug!(%step, "git step completed");
        Ok(())
    }
}
