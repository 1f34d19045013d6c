//! Helpers for running child processes with optional timeouts, either capturing
//! their output or streaming it line by line.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::CommandError;

/// Where streamed child output goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTarget {
    /// Forward to this process's stdout/stderr.
    #[default]
    Terminal,
    /// Emit each line as a tracing event.
    Log,
}

/// How a command's stdout/stderr are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Collect both streams in memory.
    Capture,
    /// Forward each line as it arrives; nothing is kept.
    Stream(StreamTarget),
}

/// A single external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub mode: OutputMode,
    /// Kill the child if it runs longer than this.
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            workdir: None,
            mode: OutputMode::Capture,
            timeout: None,
        }
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn mode(mut self, mode: OutputMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }

    /// Space-joined command line for logs and error messages.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Result of a successful command.
///
/// `stdout`/`stderr` are only populated in [`OutputMode::Capture`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Abstraction over process execution.
///
/// Mirror operations only talk to this trait, so tests can script git
/// responses without spawning anything.
pub trait CommandRunner: Sync {
    /// Run the command to completion. A non-zero exit is an error.
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError> {
        (**self).run(request)
    }
}

/// Runner that spawns real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError> {
        run_command(request)
    }
}

#[derive(Debug, Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

impl Pipe {
    fn name(self) -> &'static str {
        match self {
            Pipe::Stdout => "stdout",
            Pipe::Stderr => "stderr",
        }
    }
}

/// Run a command, reading stdout and stderr concurrently while it runs.
///
/// Both reader threads are joined before the exit status is classified, so
/// trailing output is never lost, even when the child is killed on timeout.
#[instrument(skip_all, fields(program = %request.program(), streaming = matches!(request.mode, OutputMode::Stream(_))))]
pub fn run_command(request: &CommandRequest) -> Result<CommandOutput, CommandError> {
    let program = request.program().to_string();
    if program.is_empty() {
        return Err(CommandError::Spawn {
            program,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line"),
        });
    }

    let mut cmd = Command::new(&program);
    cmd.args(request.args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Own process group, so a timeout also kills helpers (ssh, hooks) holding our pipes.
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
    if let Some(dir) = &request.workdir {
        cmd.current_dir(dir);
    }

    info!(
        command = %request.display(),
        cwd = %request.workdir.as_deref().map(|d| d.display().to_string()).unwrap_or_else(|| ".".to_string()),
        "running command"
    );
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            error!(err = %source, "failed to spawn command");
            return Err(CommandError::Spawn { program, source });
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr was not piped"))?;

    let stdout_handle = spawn_reader(stdout, Pipe::Stdout, request.mode);
    let stderr_handle = spawn_reader(stderr, Pipe::Stderr, request.mode);

    let waited = wait_child(&mut child, request.timeout);

    let stdout = join_reader(stdout_handle);
    let stderr = join_reader(stderr_handle);

    let status = match waited? {
        Some(status) => status,
        None => {
            let timeout = request.timeout.unwrap_or_default();
            warn!(timeout = ?timeout, command = %request.display(), "command timed out, killed");
            return Err(CommandError::TimedOut { timeout });
        }
    };
    let stdout = stdout?;
    let stderr = stderr?;

    if !status.success() {
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        warn!(exit_code = ?status.code(), command = %request.display(), stderr = %stderr.trim(), "command failed");
        return Err(CommandError::Failed {
            exit_code: status.code(),
            stderr,
        });
    }

    debug!(exit_code = ?status.code(), "command finished");
    let output = match request.mode {
        OutputMode::Capture => {
            let stdout = String::from_utf8_lossy(&stdout).into_owned();
            let stderr = String::from_utf8_lossy(&stderr).into_owned();
            if !stdout.trim().is_empty() {
                debug!(stdout = %stdout.trim(), "captured stdout");
            }
            if !stderr.trim().is_empty() {
                debug!(stderr = %stderr.trim(), "captured stderr");
            }
            CommandOutput {
                exit_code: status.code(),
                stdout: Some(stdout),
                stderr: Some(stderr),
            }
        }
        OutputMode::Stream(_) => CommandOutput {
            exit_code: status.code(),
            stdout: None,
            stderr: None,
        },
    };
    Ok(output)
}

/// Wait for the child, killing it once `timeout` elapses.
///
/// Returns `Ok(None)` when the child was killed for running too long.
fn wait_child(child: &mut Child, timeout: Option<Duration>) -> Result<Option<ExitStatus>, CommandError> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some).map_err(CommandError::Io);
    };
    match child.wait_timeout(timeout) {
        Ok(Some(status)) => Ok(Some(status)),
        Ok(None) => {
            kill_tree(child)?;
            child.wait()?;
            Ok(None)
        }
        Err(err) => {
            // Readers only finish once the pipes close.
            let _ = kill_tree(child);
            let _ = child.wait();
            Err(CommandError::Io(err))
        }
    }
}

/// Kill the child and everything in its process group.
#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_tree(child: &mut Child) -> std::io::Result<()> {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return child.kill();
    };
    // SAFETY: killpg only sends a signal; the group was created at spawn.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    warn!(err = %err, pgid, "killpg failed, killing child only");
    child.kill()
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

fn spawn_reader<R>(reader: R, pipe: Pipe, mode: OutputMode) -> thread::JoinHandle<std::io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || match mode {
        OutputMode::Capture => {
            let mut reader = reader;
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(buf)
        }
        OutputMode::Stream(target) => {
            forward_lines(reader, pipe, target)?;
            Ok(Vec::new())
        }
    })
}

fn join_reader(handle: thread::JoinHandle<std::io::Result<Vec<u8>>>) -> Result<Vec<u8>, CommandError> {
    match handle.join() {
        Ok(result) => result.map_err(CommandError::Io),
        Err(_) => Err(CommandError::Io(std::io::Error::other(
            "output reader thread panicked",
        ))),
    }
}

/// Forward a pipe line by line until EOF.
///
/// Sink write errors are logged and ignored so the pipe keeps draining.
fn forward_lines<R: Read>(reader: R, pipe: Pipe, target: StreamTarget) -> std::io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            return Ok(());
        }
        match target {
            StreamTarget::Terminal => {
                let written = match pipe {
                    Pipe::Stdout => write_flush(&mut std::io::stdout().lock(), &line),
                    Pipe::Stderr => write_flush(&mut std::io::stderr().lock(), &line),
                };
                if let Err(e) = written {
                    warn!(err = %e, stream = pipe.name(), "failed to forward child output");
                }
            }
            StreamTarget::Log => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    info!(stream = pipe.name(), "{text}");
                }
            }
        }
    }
}

fn write_flush<W: Write>(out: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    out.write_all(bytes)?;
    out.flush()
}
