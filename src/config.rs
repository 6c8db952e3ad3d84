//! Acquisition settings and config file loading.
//!
//! Settings are layered: built-in defaults, then the optional config file,
//! then command-line flags that were given explicitly. The file is a flat
//! list of `key = value` lines with `#` comments:
//!
//! ```text
//! concurrency = 8          # simultaneous piece transfers
//! retry_attempts = 3
//! retry_delay_secs = 10
//! output_dir = "/data/downloads"
//! working_dir = "/data/working"
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::download::constants::{
    DEFAULT_RETRY_DELAY, PROGRESS_INITIAL_DELAY, PROGRESS_INTERVAL,
};
use crate::download::{ConcurrencyBudget, DownloadEngine, Layout, PieceScheduler, RetryPolicy};
use crate::events::EventSink;
use crate::source::SourceRegistry;

pub use crate::download::constants::{DEFAULT_CONCURRENCY, DEFAULT_MAX_ATTEMPTS};

/// Accepted concurrency budget.
pub const CONCURRENCY_RANGE: std::ops::RangeInclusive<u64> = 1..=100;
/// Accepted retry attempt ceiling.
pub const RETRY_ATTEMPTS_RANGE: std::ops::RangeInclusive<u64> = 1..=20;
/// Accepted retry delay in seconds.
pub const RETRY_DELAY_RANGE: std::ops::RangeInclusive<u64> = 0..=300;
/// Accepted progress timing in seconds.
pub const PROGRESS_SECS_RANGE: std::ops::RangeInclusive<u64> = 1..=3600;

/// Errors raised while reading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file '{}': {source}", .path.display())]
    Read {
        /// Config file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A line is not `key = value`.
    #[error("invalid config syntax on line {line}: expected key = value")]
    Syntax {
        /// 1-based line number.
        line: usize,
    },

    /// A key the loader does not know.
    #[error("unknown configuration key '{key}' on line {line}")]
    UnknownKey {
        /// Offending key.
        key: String,
        /// 1-based line number.
        line: usize,
    },

    /// A value that does not parse or is out of range.
    #[error("invalid value for `{key}`{}: {reason}", .line.map(|l| format!(" on line {l}")).unwrap_or_default())]
    InvalidValue {
        /// Offending key.
        key: String,
        /// 1-based line number, when the value came from a file.
        line: Option<usize>,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, line: Option<usize>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            line,
            reason: reason.into(),
        }
    }
}

/// Settings read from the config file. Unset keys keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Simultaneous piece transfers.
    pub concurrency: Option<usize>,
    /// Attempts per piece.
    pub retry_attempts: Option<u32>,
    /// Seconds between attempts.
    pub retry_delay_secs: Option<u64>,
    /// Root of final outputs.
    pub output_dir: Option<PathBuf>,
    /// Root of working pieces.
    pub working_dir: Option<PathBuf>,
    /// Seconds before the first progress report.
    pub progress_initial_delay_secs: Option<u64>,
    /// Seconds between progress reports.
    pub progress_interval_secs: Option<u64>,
}

/// Complete acquisition settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireConfig {
    /// Process-wide cap on simultaneous piece transfers.
    pub concurrency: usize,
    /// Attempts per piece before the source is abandoned.
    pub retry_attempts: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
    /// Root of final outputs.
    pub output_dir: PathBuf,
    /// Root of working pieces.
    pub working_dir: PathBuf,
    /// Delay before the first progress report of a piece.
    pub progress_initial_delay: Duration,
    /// Interval between progress reports.
    pub progress_interval: Duration,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            output_dir: PathBuf::from("."),
            working_dir: PathBuf::from("working"),
            progress_initial_delay: PROGRESS_INITIAL_DELAY,
            progress_interval: PROGRESS_INTERVAL,
        }
    }
}

impl AcquireConfig {
    /// Overlays every key set in `file`.
    #[must_use]
    pub fn with_file(mut self, file: &FileConfig) -> Self {
        if let Some(concurrency) = file.concurrency {
            self.concurrency = concurrency;
        }
        if let Some(attempts) = file.retry_attempts {
            self.retry_attempts = attempts;
        }
        if let Some(secs) = file.retry_delay_secs {
            self.retry_delay = Duration::from_secs(secs);
        }
        if let Some(dir) = &file.output_dir {
            self.output_dir.clone_from(dir);
        }
        if let Some(dir) = &file.working_dir {
            self.working_dir.clone_from(dir);
        }
        if let Some(secs) = file.progress_initial_delay_secs {
            self.progress_initial_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = file.progress_interval_secs {
            self.progress_interval = Duration::from_secs(secs);
        }
        self
    }

    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "concurrency",
            None,
            u64::try_from(self.concurrency).unwrap_or(u64::MAX),
            &CONCURRENCY_RANGE,
        )?;
        check_range(
            "retry_attempts",
            None,
            u64::from(self.retry_attempts),
            &RETRY_ATTEMPTS_RANGE,
        )?;
        check_range(
            "retry_delay_secs",
            None,
            self.retry_delay.as_secs(),
            &RETRY_DELAY_RANGE,
        )?;
        check_range(
            "progress_initial_delay_secs",
            None,
            self.progress_initial_delay.as_secs(),
            &PROGRESS_SECS_RANGE,
        )?;
        check_range(
            "progress_interval_secs",
            None,
            self.progress_interval.as_secs(),
            &PROGRESS_SECS_RANGE,
        )?;
        if self.output_dir == self.working_dir {
            return Err(ConfigError::invalid(
                "working_dir",
                None,
                "must differ from output_dir",
            ));
        }
        Ok(())
    }

    /// Retry policy for piece transfers.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_delay)
    }

    /// Output and working roots.
    #[must_use]
    pub fn layout(&self) -> Layout {
        Layout::new(&self.output_dir, &self.working_dir)
    }

    /// Builds an engine over `registry` reporting to `sink`.
    #[must_use]
    pub fn engine(&self, registry: SourceRegistry, sink: Arc<dyn EventSink>) -> DownloadEngine {
        let scheduler = PieceScheduler::new(
            ConcurrencyBudget::new(self.concurrency),
            self.retry_policy(),
            sink,
        )
        .with_progress(self.progress_initial_delay, self.progress_interval);
        DownloadEngine::new(registry, self.layout(), scheduler)
    }
}

fn check_range(
    key: &str,
    line: Option<usize>,
    value: u64,
    range: &std::ops::RangeInclusive<u64>,
) -> Result<(), ConfigError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            key,
            line,
            format!(
                "{value} is out of range, expected {}..={}",
                range.start(),
                range.end()
            ),
        ))
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/mirrordl/config.toml`
/// 2. `$HOME/.config/mirrordl/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("mirrordl")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("mirrordl")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file at the default path, if there is one.
///
/// # Errors
///
/// Any [`ConfigError`] from reading or parsing an existing file.
pub fn load_default_file_config() -> Result<Option<(PathBuf, FileConfig)>, ConfigError> {
    let Some(path) = resolve_default_config_path() else {
        return Ok(None);
    };
    if !path.exists() {
        debug!(path = %path.display(), "no config file");
        return Ok(None);
    }
    let config = load_file_config(&path)?;
    Ok(Some((path, config)))
}

/// Reads and parses a config file.
///
/// # Errors
///
/// [`ConfigError::Read`] when the file cannot be read, otherwise any parse
/// error from [`parse_config_str`].
pub fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config_str(&raw)?;
    debug!(path = %path.display(), ?config, "loaded config file");
    Ok(config)
}

/// Parses `key = value` lines.
///
/// # Errors
///
/// The first syntax error, unknown key or invalid value, with its line.
pub fn parse_config_str(raw: &str) -> Result<FileConfig, ConfigError> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            return Err(ConfigError::Syntax { line: line_no });
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let line = Some(line_no);

        match key {
            "concurrency" => {
                let parsed = parse_integer(key, line, value, &CONCURRENCY_RANGE)?;
                cfg.concurrency = Some(to_usize(key, line, parsed)?);
            }
            "retry_attempts" => {
                let parsed = parse_integer(key, line, value, &RETRY_ATTEMPTS_RANGE)?;
                cfg.retry_attempts = Some(
                    u32::try_from(parsed)
                        .map_err(|_| ConfigError::invalid(key, line, "out of range for u32"))?,
                );
            }
            "retry_delay_secs" => {
                cfg.retry_delay_secs = Some(parse_integer(key, line, value, &RETRY_DELAY_RANGE)?);
            }
            "progress_initial_delay_secs" => {
                cfg.progress_initial_delay_secs =
                    Some(parse_integer(key, line, value, &PROGRESS_SECS_RANGE)?);
            }
            "progress_interval_secs" => {
                cfg.progress_interval_secs =
                    Some(parse_integer(key, line, value, &PROGRESS_SECS_RANGE)?);
            }
            "output_dir" => {
                cfg.output_dir = Some(PathBuf::from(parse_string_literal(key, line, value)?));
            }
            "working_dir" => {
                cfg.working_dir = Some(PathBuf::from(parse_string_literal(key, line, value)?));
            }
            unknown => {
                return Err(ConfigError::UnknownKey {
                    key: unknown.to_string(),
                    line: line_no,
                });
            }
        }
    }
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(key: &str, line: Option<usize>, raw: &str) -> Result<String, ConfigError> {
    if raw.len() < 2 || !raw.starts_with('"') || !raw.ends_with('"') {
        return Err(ConfigError::invalid(key, line, "expected double-quoted string"));
    }
    let inner = &raw[1..raw.len() - 1];
    if inner.is_empty() {
        return Err(ConfigError::invalid(key, line, "must not be empty"));
    }
    Ok(inner.to_string())
}

fn parse_integer(
    key: &str,
    line: Option<usize>,
    raw: &str,
    range: &std::ops::RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let value = raw
        .parse::<u64>()
        .map_err(|e| ConfigError::invalid(key, line, format!("'{raw}': {e}")))?;
    check_range(key, line, value, range)?;
    Ok(value)
}

fn to_usize(key: &str, line: Option<usize>, value: u64) -> Result<usize, ConfigError> {
    usize::try_from(value).map_err(|_| ConfigError::invalid(key, line, "out of range for usize"))
}
