//! Runtime Test Harness controller core: a pool of reusable worker
//! processes, the framed loopback channel to each of them, and a
//! supervised executor for one-shot commands.
//!
//! The expected shape of a run: build one [`HarnessConfig`], hand it to an
//! [`AgentPool`], then per test action [`AgentPool::checkout`] a channel,
//! [`Agent::perform`] the request into an [`ActionSink`], and
//! [`AgentPool::save`] the channel back. [`AgentPool::flush`] at the end
//! closes the idlers and yields the usage report.

pub mod agent;
pub mod alarm;
pub mod command;
pub mod config;
pub mod error;
pub mod keepalive;
pub mod pool;
pub mod sink;
pub mod stats;

pub use agent::{ActionTimeout, Agent, AgentKey, WORKER_STDERR_STREAM, WORKER_STDOUT_STREAM};
pub use alarm::{Alarm, TimeoutHandler, TraceTimeoutHandler, DEFAULT_HANDLER_BUDGET};
pub use command::ProcessCommand;
pub use config::{
    shared_library_path_var, ConfigError, HarnessConfig, LaunchConfig, PoolConfig,
};
pub use error::{AgentError, CommandError, SelectionError};
pub use keepalive::{KeepAlive, DEFAULT_PROBE_INTERVAL};
pub use pool::AgentPool;
pub use sink::ActionSink;
pub use stats::PoolReport;
