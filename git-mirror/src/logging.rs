//! Tracing setup for the `git-mirror` binary.
//!
//! Diagnostics go to stderr so stdout stays free for the sync summary and for
//! git output streamed to the terminal. With a log directory configured, every
//! event is also appended to `git-mirror.log` and errors to
//! `git-mirror.error.log`.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE: &str = "git-mirror.log";
pub const ERROR_LOG_FILE: &str = "git-mirror.error.log";

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` (from settings) is used.
///
/// ```bash
/// RUST_LOG=git_mirror=debug git-mirror sync
/// ```
pub fn init(default_level: &str, log_dir: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (all, errors) = match log_dir {
        Some(dir) => {
            let (all, errors) =
                open_log_files(dir).with_context(|| format!("open log files in {}", dir.display()))?;
            (Some(all), Some(errors))
        }
        None => (None, None),
    };
    let file_layer = all.map(|file| fmt::layer().with_writer(Mutex::new(file)).with_ansi(false));
    let error_layer = errors.map(|file| {
        fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_filter(LevelFilter::ERROR)
    });

    // A second init (tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).compact())
        .with(file_layer)
        .with(error_layer)
        .try_init();
    Ok(())
}

/// Create `dir` if needed and open both log files for appending.
pub fn open_log_files(dir: &Path) -> io::Result<(File, File)> {
    fs::create_dir_all(dir)?;
    let open = |name: &str| OpenOptions::new().create(true).append(true).open(dir.join(name));
    Ok((open(LOG_FILE)?, open(ERROR_LOG_FILE)?))
}
