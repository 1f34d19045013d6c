//! Settings for `git-mirror`, read from `git-mirror.toml`.
//!
//! Resolution order: built-in defaults, then the TOML file (if present), then
//! command-line flags and their environment variables ([`SettingsOverrides`]).
//! The resolved [`Settings`] value is passed explicitly to every component.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::git::GitOptions;
use crate::io::process::{OutputMode, StreamTarget};
use crate::sync::{DEFAULT_CONCURRENCY, SyncSettings};

pub const DEFAULT_SETTINGS_FILE: &str = "git-mirror.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Catalog of (source, mirror) pairs.
    pub mirrors_file: PathBuf,

    /// Base directory holding one bare mirror clone per entry.
    pub repositories_dir: PathBuf,

    /// Maximum number of mirror jobs in flight.
    pub concurrency: usize,

    /// Kill any single git command running longer than this. `0` disables the limit.
    pub command_timeout_secs: u64,

    /// Forward git output live instead of capturing it.
    pub stream_output: bool,

    /// Where streamed output goes (`terminal` or `log`).
    pub stream_target: StreamTarget,

    pub git_program: String,

    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,

    /// Also append logs to files in this directory.
    pub log_dir: Option<PathBuf>,

    #[serde(rename = "loop")]
    pub run_loop: LoopSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopSettings {
    /// Repeat sync passes instead of running once.
    pub enabled: bool,

    /// Pause between passes.
    pub sleep_secs: u64,

    /// Stop after this many passes (unbounded when unset).
    pub max_passes: Option<u32>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            sleep_secs: 60 * 60,
            max_passes: None,
        }
    }
}

impl LoopSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sleep_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mirrors_file: PathBuf::from("mirrors.json"),
            repositories_dir: PathBuf::from("repositories"),
            concurrency: DEFAULT_CONCURRENCY,
            command_timeout_secs: 60 * 60,
            stream_output: true,
            stream_target: StreamTarget::Terminal,
            git_program: "git".to_string(),
            log_level: "info".to_string(),
            log_dir: None,
            run_loop: LoopSettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.mirrors_file.as_os_str().is_empty() {
            return Err(anyhow!("mirrors_file must not be empty"));
        }
        if self.repositories_dir.as_os_str().is_empty() {
            return Err(anyhow!("repositories_dir must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(anyhow!("concurrency must be > 0"));
        }
        if self.git_program.trim().is_empty() {
            return Err(anyhow!("git_program must not be empty"));
        }
        if self.run_loop.sleep_secs == 0 {
            return Err(anyhow!("loop.sleep_secs must be > 0"));
        }
        if self.run_loop.max_passes == Some(0) {
            return Err(anyhow!("loop.max_passes must be > 0 when set"));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }

    pub fn git_options(&self) -> GitOptions {
        let output = if self.stream_output {
            OutputMode::Stream(self.stream_target)
        } else {
            OutputMode::Capture
        };
        GitOptions {
            program: self.git_program.clone(),
            output,
            timeout: self.command_timeout(),
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            concurrency: self.concurrency,
            git: self.git_options(),
        }
    }
}

/// Values supplied on the command line or through environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsOverrides {
    pub mirrors_file: Option<PathBuf>,
    pub repositories_dir: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub log_level: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub stream_output: Option<bool>,
    pub loop_enabled: Option<bool>,
    pub sleep_secs: Option<u64>,
    pub max_passes: Option<u32>,
}

impl SettingsOverrides {
    /// Apply on top of `base` and re-validate.
    pub fn apply(&self, mut base: Settings) -> Result<Settings> {
        if let Some(path) = &self.mirrors_file {
            base.mirrors_file = path.clone();
        }
        if let Some(dir) = &self.repositories_dir {
            base.repositories_dir = dir.clone();
        }
        if let Some(concurrency) = self.concurrency {
            base.concurrency = concurrency;
        }
        if let Some(level) = &self.log_level {
            base.log_level = level.clone();
        }
        if let Some(dir) = &self.log_dir {
            base.log_dir = Some(dir.clone());
        }
        if let Some(stream) = self.stream_output {
            base.stream_output = stream;
        }
        if let Some(enabled) = self.loop_enabled {
            base.run_loop.enabled = enabled;
        }
        if let Some(secs) = self.sleep_secs {
            base.run_loop.sleep_secs = secs;
        }
        if let Some(max) = self.max_passes {
            base.run_loop.max_passes = Some(max);
        }
        base.validate()?;
        Ok(base)
    }
}

/// Load settings from a TOML file.
///
/// If the file is missing, returns `Settings::default()`.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        let settings = Settings::default();
        settings.validate()?;
        return Ok(settings);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(settings)
}
