//! Executing actions against the runtime image.
//!
//! Every action shells out to a tool under the image's `bin/` directory
//! (`compile` or `run`), streams the tool's output back to the controller
//! as it appears, and finishes with exactly one status frame. Tool
//! failures are statuses, not worker failures: the worker survives to take
//! the next action.

use anyhow::Result;
use rth_common::{
    interpret_exit, CompileAction, FrameWriter, MainAction, Status, StatusLineScanner,
    MESSAGE_STREAM, STDERR_STREAM, STDOUT_STREAM,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Environment names under which request metadata reaches runtime tools.
pub const ENV_TEST_NAME: &str = "RTH_TEST_NAME";
pub const ENV_CLASS_PATH: &str = "RTH_CLASS_PATH";
pub const ENV_MODULE_PATH: &str = "RTH_MODULE_PATH";
pub const ENV_ADD_EXPORTS: &str = "RTH_ADD_EXPORTS";
pub const ENV_ADD_OPENS: &str = "RTH_ADD_OPENS";
pub const ENV_ADD_MODULES: &str = "RTH_ADD_MODULES";
pub const ENV_POLICY: &str = "RTH_POLICY";
pub const ENV_PROP_PREFIX: &str = "RTH_PROP_";

const COPY_BUF: usize = 8 * 1024;

/// What this worker was launched with; identical for every action it runs.
pub struct ActionContext {
    work_dir: PathBuf,
    runtime: PathBuf,
    options: Vec<String>,
    policy: Option<PathBuf>,
}

impl ActionContext {
    pub fn new(
        work_dir: PathBuf,
        runtime: PathBuf,
        options: Vec<String>,
        policy: Option<PathBuf>,
    ) -> Self {
        Self {
            work_dir,
            runtime,
            options,
            policy,
        }
    }

    fn tool(&self, name: &str) -> PathBuf {
        self.runtime.join("bin").join(name)
    }

    fn base_env(&self, test_name: &str, properties: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let mut env = vec![(ENV_TEST_NAME.to_string(), test_name.to_string())];
        if let Some(policy) = &self.policy {
            env.push((ENV_POLICY.to_string(), policy.display().to_string()));
        }
        for (key, value) in properties {
            env.push((property_var(key), value.clone()));
        }
        env
    }
}

/// `RTH_PROP_` name for a test property key.
fn property_var(key: &str) -> String {
    let mut name = String::with_capacity(ENV_PROP_PREFIX.len() + key.len());
    name.push_str(ENV_PROP_PREFIX);
    for ch in key.chars() {
        if ch.is_ascii_alphanumeric() {
            name.push(ch.to_ascii_uppercase());
        } else {
            name.push('_');
        }
    }
    name
}

pub async fn run_compile<W>(
    context: &ActionContext,
    action: &CompileAction,
    writer: &Arc<Mutex<FrameWriter<W>>>,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut args = context.options.clone();
    args.extend(action.args.iter().cloned());
    let env = context.base_env(&action.test_name, &action.properties);
    execute_streaming(
        &action.test_name,
        context.tool("compile"),
        args,
        env,
        &context.work_dir,
        writer,
    )
    .await
}

pub async fn run_main<W>(
    context: &ActionContext,
    action: &MainAction,
    writer: &Arc<Mutex<FrameWriter<W>>>,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut args = context.options.clone();
    args.push(action.entry_point.clone());
    args.extend(action.args.iter().cloned());

    let mut env = context.base_env(&action.test_name, &action.properties);
    if !action.class_path.is_empty() {
        env.push((ENV_CLASS_PATH.to_string(), action.class_path.clone()));
    }
    if !action.module_path.is_empty() {
        env.push((ENV_MODULE_PATH.to_string(), action.module_path.clone()));
    }
    for (var, set) in [
        (ENV_ADD_EXPORTS, &action.add_exports),
        (ENV_ADD_OPENS, &action.add_opens),
        (ENV_ADD_MODULES, &action.add_modules),
    ] {
        if !set.is_empty() {
            let joined = set.iter().cloned().collect::<Vec<_>>().join(" ");
            env.push((var.to_string(), joined));
        }
    }
    execute_streaming(
        &action.test_name,
        context.tool("run"),
        args,
        env,
        &context.work_dir,
        writer,
    )
    .await
}

/// Run one tool to completion, forwarding its output as it arrives and
/// finishing with a status frame. Only controller I/O bubbles up as an
/// error; everything the tool does wrong becomes a status.
async fn execute_streaming<W>(
    test_name: &str,
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    work_dir: &Path,
    writer: &Arc<Mutex<FrameWriter<W>>>,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    {
        let mut writer = writer.lock().await;
        writer
            .write_output(
                MESSAGE_STREAM,
                &format!("exec: {} {}\n", program.display(), args.join(" ")),
            )
            .await?;
    }

    let mut command = Command::new(&program);
    command
        .args(&args)
        .current_dir(work_dir)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!(test = test_name, program = %program.display(), "starting tool");

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let status = Status::error(format!("failed to start {}: {e}", program.display()));
            info!(test = test_name, status = %status, "action finished");
            writer.lock().await.write_status(&status).await?;
            return Ok(());
        }
    };

    let out_task = child
        .stdout
        .take()
        .map(|stdout| tokio::spawn(forward_scanned(stdout, writer.clone())));
    let err_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(forward(stderr, writer.clone())));

    let exit = child.wait().await;
    let scanned = match out_task {
        Some(task) => task.await.unwrap_or(None),
        None => None,
    };
    if let Some(task) = err_task {
        let _ = task.await;
    }

    let status = match exit {
        Ok(exit) => match exit.code() {
            None => Status::error("tool terminated abnormally"),
            code => interpret_exit(code, scanned.as_ref(), None),
        },
        Err(e) => Status::error(format!("waiting for tool failed: {e}")),
    };
    info!(test = test_name, status = %status, "action finished");
    writer.lock().await.write_status(&status).await?;
    Ok(())
}

/// Forward stdout chunk by chunk, scanning for an embedded status line.
async fn forward_scanned<R, W>(mut stream: R, writer: Arc<Mutex<FrameWriter<W>>>) -> Option<Status>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut scanner = StatusLineScanner::new();
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                scanner.feed(&buf[..n]);
                let text = String::from_utf8_lossy(&buf[..n]);
                let mut writer = writer.lock().await;
                if writer.write_output(STDOUT_STREAM, &text).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("stdout forwarding ended: {e}");
                break;
            }
        }
    }
    scanner.finish()
}

async fn forward<R, W>(mut stream: R, writer: Arc<Mutex<FrameWriter<W>>>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                let mut writer = writer.lock().await;
                if writer.write_output(STDERR_STREAM, &text).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("stderr forwarding ended: {e}");
                break;
            }
        }
    }
}
