//! `git-mirror`: keep git repositories mirrored to secondary remotes.
//!
//! Reads a catalog of `(source, mirror)` pairs and, for each one, clones the
//! source as a bare mirror (first run) or fetches it (later runs), then pushes
//! every ref to the mirror target.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::Result;
use clap::builder::FalseyValueParser;
use clap::{Args, Parser, Subcommand};

use git_mirror::core::entry::MirrorEntry;
use git_mirror::core::report::{BatchReport, SyncOutcome};
use git_mirror::exit_codes;
use git_mirror::io::catalog::load_catalog;
use git_mirror::io::config::{DEFAULT_SETTINGS_FILE, Settings, SettingsOverrides, load_settings};
use git_mirror::io::process::SystemRunner;
use git_mirror::logging;
use git_mirror::looping::run_loop;
use git_mirror::sync::{JobPlan, SyncObserver, plan, sync_once};

#[derive(Parser)]
#[command(
    name = "git-mirror",
    version,
    about = "Mirror git repositories to secondary remotes"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Settings file (missing file means defaults).
    #[arg(long, global = true, env = "GIT_MIRROR_CONFIG", default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,

    /// Catalog of mirror entries (JSON, or TOML with a `.toml` extension).
    #[arg(long, global = true, env = "GIT_MIRROR_MIRRORS_FILE")]
    mirrors_file: Option<PathBuf>,

    /// Directory holding the local bare mirrors.
    #[arg(long, global = true, env = "GIT_MIRROR_REPOSITORIES_DIR")]
    repositories_dir: Option<PathBuf>,

    /// Maximum number of repositories synced at once.
    #[arg(long, global = true, env = "GIT_MIRROR_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Log filter used when `RUST_LOG` is unset (e.g. `info`, `git_mirror=debug`).
    #[arg(long, global = true, env = "GIT_MIRROR_LOG_LEVEL")]
    log_level: Option<String>,

    /// Also append logs to `git-mirror.log` and `git-mirror.error.log` here.
    #[arg(long, global = true, env = "GIT_MIRROR_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Capture git output instead of streaming it.
    #[arg(long, global = true, env = "GIT_MIRROR_QUIET_GIT", value_parser = FalseyValueParser::new())]
    quiet_git: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Clone or update every catalog entry and push it to its mirror.
    Sync(SyncArgs),
    /// Show what `sync` would do for each entry without running git.
    Plan,
}

#[derive(Args)]
struct SyncArgs {
    /// Keep running passes, sleeping between them.
    #[arg(long = "loop", env = "GIT_MIRROR_LOOP", value_parser = FalseyValueParser::new())]
    run_loop: bool,

    /// Seconds to sleep between passes.
    #[arg(long, env = "GIT_MIRROR_SLEEP_SECS")]
    sleep_secs: Option<u64>,

    /// Stop the loop after this many passes.
    #[arg(long, env = "GIT_MIRROR_MAX_PASSES")]
    max_passes: Option<u32>,

    /// Exit with status 2 when any entry failed.
    #[arg(long, env = "GIT_MIRROR_FAIL_ON_ERROR", value_parser = FalseyValueParser::new())]
    fail_on_error: bool,
}

impl Cli {
    fn overrides(&self) -> SettingsOverrides {
        let global = &self.global;
        let mut overrides = SettingsOverrides {
            mirrors_file: global.mirrors_file.clone(),
            repositories_dir: global.repositories_dir.clone(),
            concurrency: global.concurrency,
            log_level: global.log_level.clone(),
            log_dir: global.log_dir.clone(),
            stream_output: global.quiet_git.then_some(false),
            ..SettingsOverrides::default()
        };
        if let Command::Sync(args) = &self.command {
            overrides.loop_enabled = args.run_loop.then_some(true);
            overrides.sleep_secs = args.sleep_secs;
            overrides.max_passes = args.max_passes;
        }
        overrides
    }
}

fn main() {
    let cli = Cli::parse();
    let code = match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::FATAL
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<i32> {
    let settings = cli.overrides().apply(load_settings(&cli.global.config)?)?;
    logging::init(&settings.log_level, settings.log_dir.as_deref())?;

    match &cli.command {
        Command::Sync(args) => cmd_sync(&settings, args.fail_on_error),
        Command::Plan => cmd_plan(&settings),
    }
}

fn cmd_sync(settings: &Settings, fail_on_error: bool) -> Result<i32> {
    let progress = ProgressObserver::default();
    let failed = if settings.run_loop.enabled {
        let outcome = run_loop(
            &settings.run_loop,
            || {
                progress.reset();
                sync_once(SystemRunner, settings, &progress)
            },
            print_summary,
            thread::sleep,
        )?;
        outcome.passes_with_failures + outcome.aborted_passes > 0
    } else {
        let report = sync_once(SystemRunner, settings, &progress)?;
        print_summary(&report);
        report.has_failures()
    };

    if fail_on_error && failed {
        return Ok(exit_codes::ENTRIES_FAILED);
    }
    Ok(exit_codes::OK)
}

fn cmd_plan(settings: &Settings) -> Result<i32> {
    let entries = load_catalog(&settings.mirrors_file)?;
    for job in plan(&entries, &settings.repositories_dir) {
        match &job.plan {
            JobPlan::Initialize { dir } => {
                println!("initialize {} -> {} ({})", job.entry.source, job.entry.target, dir.display());
            }
            JobPlan::Update { dir } => {
                println!("update     {} -> {} ({})", job.entry.source, job.entry.target, dir.display());
            }
            JobPlan::InvalidSource => {
                println!("invalid    {} (no directory name can be derived)", job.entry.source);
            }
        }
    }
    Ok(exit_codes::OK)
}

fn print_summary(report: &BatchReport) {
    for record in report.failures() {
        if let Some(err) = record.outcome.error() {
            println!("failed: {}: {err}", record.entry.source);
        }
    }
    println!(
        "summary: {} repositories, {} initialized, {} updated, {} failed in {:.1}s",
        report.len(),
        report.initialized(),
        report.updated(),
        report.failed(),
        report.elapsed.as_secs_f64()
    );
}

/// Prints one line per finished job.
#[derive(Default)]
struct ProgressObserver {
    finished: AtomicUsize,
}

impl ProgressObserver {
    fn reset(&self) {
        self.finished.store(0, Ordering::SeqCst);
    }
}

impl SyncObserver for ProgressObserver {
    fn job_finished(&self, entry: &MirrorEntry, outcome: &SyncOutcome) {
        let done = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        println!("[{done}] {:<11} {} -> {}", outcome.label(), entry.source, entry.target);
    }
}
