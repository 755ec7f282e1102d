//! Logging bootstrap shared by the harness library and binaries.
//!
//! Wraps tracing-subscriber setup behind a small builder so every binary
//! configures the same way: `LogConfig::from_env("info").with_stderr()`,
//! optionally a file destination, then `init_logging` once at startup. The
//! returned guards must be held for the life of the process so buffered
//! log lines are flushed on exit.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::Layer;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable consulted for the default filter directive.
pub const LOG_ENV_VAR: &str = "RTH_LOG";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum FileTarget {
    #[default]
    None,
    /// A run-scoped file named `<prefix>-<timestamp>.log` under a directory.
    Dir(PathBuf),
    /// An exact file path (the worker's `--log` flag).
    Path(PathBuf),
}

/// Where and how log output is emitted.
#[derive(Debug, Clone)]
pub struct LogConfig {
    level: String,
    stderr: bool,
    json: bool,
    file: FileTarget,
    file_prefix: String,
}

impl LogConfig {
    /// Build a config from the `RTH_LOG` environment variable, falling back
    /// to `default_level`. No destination is enabled yet.
    pub fn from_env(default_level: &str) -> Self {
        Self {
            level: std::env::var(LOG_ENV_VAR).unwrap_or_else(|_| default_level.to_string()),
            stderr: false,
            json: false,
            file: FileTarget::None,
            file_prefix: "rth".to_string(),
        }
    }

    #[must_use]
    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    #[must_use]
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    #[must_use]
    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Log to a run-scoped file under `dir` (created if missing).
    #[must_use]
    pub fn with_file_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.file = FileTarget::Dir(dir.into());
        self
    }

    /// Log to exactly `path`.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = FileTarget::Path(path.into());
        self
    }

    /// Prefix for run-scoped file names (default `rth`).
    #[must_use]
    pub fn with_file_prefix(mut self, prefix: &str) -> Self {
        self.file_prefix = prefix.to_string();
        self
    }

    pub fn level(&self) -> &str {
        &self.level
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("invalid log filter '{0}'")]
    InvalidFilter(String),
    #[error("failed to prepare log destination: {0}")]
    Io(#[from] std::io::Error),
}

/// Install the global subscriber described by `config`.
///
/// Safe to call more than once: later calls keep the first subscriber and
/// still hand back live guards for their own writers.
pub fn init_logging(config: &LogConfig) -> Result<Vec<WorkerGuard>, LogError> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|_| LogError::InvalidFilter(config.level.clone()))?;

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.stderr {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
        guards.push(guard);
        if config.json {
            layers.push(fmt::layer().json().with_writer(writer).boxed());
        } else {
            layers.push(fmt::layer().compact().with_writer(writer).boxed());
        }
    }

    if let Some((dir, name)) = file_destination(config)? {
        std::fs::create_dir_all(&dir)?;
        let appender = tracing_appender::rolling::never(&dir, &name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        if config.json {
            layers.push(fmt::layer().json().with_writer(writer).boxed());
        } else {
            layers.push(fmt::layer().with_ansi(false).with_writer(writer).boxed());
        }
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init();
    tracing::debug!(level = %config.level, "logging initialized");
    Ok(guards)
}

fn file_destination(config: &LogConfig) -> Result<Option<(PathBuf, String)>, LogError> {
    match &config.file {
        FileTarget::None => Ok(None),
        FileTarget::Dir(dir) => {
            let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
            Ok(Some((
                dir.clone(),
                format!("{}-{stamp}.log", config.file_prefix),
            )))
        }
        FileTarget::Path(path) => {
            let name = path
                .file_name()
                .ok_or_else(|| {
                    LogError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "log path has no file name",
                    ))
                })?
                .to_string_lossy()
                .into_owned();
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => Path::new(".").to_path_buf(),
            };
            Ok(Some((dir, name)))
        }
    }
}
