//! Run configuration for the harness core.
//!
//! One [`HarnessConfig`] is built per run and threaded explicitly through
//! the pool and every channel it creates; nothing here is global. Values
//! load from TOML with per-field defaults, so a config file only needs to
//! name what it changes.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_MAX_POOL_SIZE: usize = 4;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SELECTION_ATTEMPTS: u32 = 3;
pub const DEFAULT_TIMEOUT_FACTOR: f64 = 1.0;
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CLOSE_GRACE_SECS: u64 = 15;
pub const DEFAULT_WORKER_IDLE_LIMIT_SECS: u64 = 600;

fn default_max_pool_size() -> usize {
    DEFAULT_MAX_POOL_SIZE
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_selection_attempts() -> u32 {
    DEFAULT_SELECTION_ATTEMPTS
}

fn default_timeout_factor() -> f64 {
    DEFAULT_TIMEOUT_FACTOR
}

fn default_keepalive_interval_secs() -> u64 {
    DEFAULT_KEEPALIVE_INTERVAL_SECS
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_close_grace_secs() -> u64 {
    DEFAULT_CLOSE_GRACE_SECS
}

fn default_worker_idle_limit_secs() -> u64 {
    DEFAULT_WORKER_IDLE_LIMIT_SECS
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("rth-logs")
}

fn default_run_id() -> Uuid {
    Uuid::new_v4()
}

/// Pool admission and eviction policy, fixed for a run.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Most idle channels retained at once.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    /// Idle channels older than this are closed on the next save.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Bounded attempts per agent selection.
    #[serde(default = "default_selection_attempts")]
    pub selection_attempts: u32,
    /// Global multiplier applied to the worker connect window.
    #[serde(default = "default_timeout_factor")]
    pub timeout_factor: f64,
    /// Security policy file forwarded to workers.
    #[serde(default)]
    pub policy_file: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            selection_attempts: DEFAULT_SELECTION_ATTEMPTS,
            timeout_factor: DEFAULT_TIMEOUT_FACTOR,
            policy_file: None,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Scale a base duration by the run's timeout factor. Non-positive
    /// factors collapse to zero rather than panicking.
    pub fn scaled(&self, base: Duration) -> Duration {
        base.mul_f64(self.timeout_factor.max(0.0))
    }
}

/// How worker processes are launched and connected.
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchConfig {
    /// Worker executable.
    pub worker_program: PathBuf,
    /// Replacement environment for spawned workers. The inherited
    /// environment is cleared first; only these variables survive.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Directory for per-worker log files.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    /// Base window for the worker's callback connection, before the
    /// timeout factor is applied.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// How long a closing worker may take to exit before it is killed.
    #[serde(default = "default_close_grace_secs")]
    pub close_grace_secs: u64,
    /// Inactivity limit handed to workers on their command line.
    #[serde(default = "default_worker_idle_limit_secs")]
    pub worker_idle_limit_secs: u64,
    /// Directories prepended to the platform shared-library path variable
    /// in the worker environment.
    #[serde(default)]
    pub native_lib_dirs: Vec<PathBuf>,
}

impl LaunchConfig {
    pub fn new(worker_program: impl Into<PathBuf>) -> Self {
        Self {
            worker_program: worker_program.into(),
            env: HashMap::new(),
            logs_dir: default_logs_dir(),
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            close_grace_secs: DEFAULT_CLOSE_GRACE_SECS,
            worker_idle_limit_secs: DEFAULT_WORKER_IDLE_LIMIT_SECS,
            native_lib_dirs: Vec::new(),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }

    /// The complete worker launch environment: the replacement env plus
    /// the shared-library path when native directories are configured.
    pub fn worker_env(&self) -> HashMap<String, String> {
        let mut env = self.env.clone();
        if !self.native_lib_dirs.is_empty() {
            let var = shared_library_path_var();
            let mut paths: Vec<String> = self
                .native_lib_dirs
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            if let Some(existing) = env.get(var) {
                if !existing.is_empty() {
                    paths.push(existing.clone());
                }
            }
            let sep = if cfg!(windows) { ";" } else { ":" };
            env.insert(var.to_string(), paths.join(sep));
        }
        env
    }
}

/// Name of the dynamic-linker search path variable on this platform.
pub fn shared_library_path_var() -> &'static str {
    if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else if cfg!(windows) {
        "PATH"
    } else {
        "LD_LIBRARY_PATH"
    }
}

/// Everything the core needs for one run.
#[derive(Debug, Clone, Deserialize)]
pub struct HarnessConfig {
    /// Identifies the run in logs and reports.
    #[serde(default = "default_run_id")]
    pub run_id: Uuid,
    #[serde(default)]
    pub pool: PoolConfig,
    pub launch: LaunchConfig,
}

impl HarnessConfig {
    pub fn new(worker_program: impl Into<PathBuf>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pool: PoolConfig::default(),
            launch: LaunchConfig::new(worker_program),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
