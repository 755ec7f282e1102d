//! Runtime Test Harness - Worker Agent
//!
//! Launched by the harness controller, the worker phones home over
//! loopback TCP, then executes compile/run actions against its runtime
//! image until it is told to close or goes idle too long.

#![forbid(unsafe_code)]

mod actions;

use actions::ActionContext;
use anyhow::{Context, Result};
use clap::Parser;
use rth_common::{init_logging, FrameReader, FrameWriter, LogConfig, Request};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

#[derive(Parser)]
#[command(name = "rth-wkr")]
#[command(author, version, about = "RTH worker agent - pooled test execution")]
struct Cli {
    /// Controller port to connect back to
    #[arg(long)]
    port: u16,

    /// Channel id assigned by the controller
    #[arg(long)]
    id: u32,

    /// Worker log file (stderr when omitted)
    #[arg(long)]
    log: Option<PathBuf>,

    /// Runtime image under test
    #[arg(long)]
    runtime: PathBuf,

    /// Runtime option passed to every tool invocation (repeatable)
    #[arg(long = "opt")]
    options: Vec<String>,

    /// Security policy file forwarded to runtime tools
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Exit when no frame arrives for this long
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10m")]
    idle_limit: Duration,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info");
    log_config = match &cli.log {
        Some(path) => log_config.with_file(path),
        None => log_config.with_stderr(),
    };
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    info!(
        id = cli.id,
        port = cli.port,
        runtime = %cli.runtime.display(),
        "worker starting"
    );
    let stream = TcpStream::connect(("127.0.0.1", cli.port))
        .await
        .with_context(|| format!("connecting back to controller on port {}", cli.port))?;
    stream.set_nodelay(true)?;

    let work_dir = std::env::current_dir().context("resolving working directory")?;
    let context = ActionContext::new(work_dir, cli.runtime, cli.options, cli.policy);

    serve(stream, &context, cli.idle_limit).await
}

/// Request loop: one action at a time, in arrival order. Any frame resets
/// the inactivity clock, keepalive probes included.
async fn serve(stream: TcpStream, context: &ActionContext, idle_limit: Duration) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let writer = Arc::new(Mutex::new(FrameWriter::new(write_half)));

    loop {
        let request = match tokio::time::timeout(idle_limit, reader.read_request()).await {
            Err(_) => {
                info!(?idle_limit, "inactivity limit reached, shutting down");
                break;
            }
            Ok(Ok(None)) => {
                info!("controller disconnected");
                break;
            }
            Ok(Ok(Some(request))) => request,
            Ok(Err(e)) => {
                error!("protocol failure, shutting down: {e}");
                anyhow::bail!("protocol failure: {e}");
            }
        };
        match request {
            Request::KeepAlive => debug!("keepalive probe"),
            Request::Close => {
                info!("close requested");
                break;
            }
            Request::Compile(action) => actions::run_compile(context, &action, &writer).await?,
            Request::Main(action) => actions::run_main(context, &action, &writer).await?,
        }
    }
    Ok(())
}
