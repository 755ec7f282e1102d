//! Worker channels: one spawned worker process plus its framed loopback
//! connection.
//!
//! Construction binds an ephemeral listener first and passes the port on
//! the worker command line, so the worker phones home and no port is ever
//! guessed. A channel is single-flight by contract: whoever holds it runs
//! one exchange at a time, and the pool guarantees a channel is never
//! handed to two callers at once.

use crate::alarm::{kill_process, Alarm, TimeoutHandler};
use crate::command::{wait_for_handler, HANDLER_GRACE};
use crate::config::HarnessConfig;
use crate::error::AgentError;
use crate::keepalive::KeepAlive;
use crate::sink::ActionSink;
use rth_common::{FrameReader, FrameWriter, Reply, Request, Status};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpSocket;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Streams that carry the worker's native (non-protocol) output while an
/// action is in flight.
pub const WORKER_STDOUT_STREAM: &str = "worker.out";
pub const WORKER_STDERR_STREAM: &str = "worker.err";

static NEXT_AGENT_ID: AtomicU32 = AtomicU32::new(1);

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;
type SharedSink = Option<Arc<ActionSink>>;

/// Identifies interchangeable workers: two channels can substitute for
/// each other iff their keys are equal, options in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentKey {
    pub work_dir: PathBuf,
    pub runtime_image: PathBuf,
    pub options: Vec<String>,
}

impl AgentKey {
    pub fn new(
        work_dir: impl Into<PathBuf>,
        runtime_image: impl Into<PathBuf>,
        options: Vec<String>,
    ) -> Self {
        Self {
            work_dir: work_dir.into(),
            runtime_image: runtime_image.into(),
            options,
        }
    }
}

/// Timeout policy for one exchange: the limit plus the diagnostic handler
/// to run if it elapses. Callers apply any global timeout factor before
/// constructing this.
#[derive(Clone)]
pub struct ActionTimeout {
    pub limit: Duration,
    pub handler: Arc<dyn TimeoutHandler>,
}

impl ActionTimeout {
    pub fn new(limit: Duration, handler: Arc<dyn TimeoutHandler>) -> Self {
        Self { limit, handler }
    }
}

/// One worker channel.
pub struct Agent {
    id: u32,
    key: AgentKey,
    log_path: PathBuf,
    pid: Option<u32>,
    child: StdMutex<Option<Child>>,
    reader: Mutex<FrameReader<BoxedRead>>,
    writer: Arc<Mutex<FrameWriter<BoxedWrite>>>,
    keep_alive: KeepAlive,
    sink_tx: watch::Sender<SharedSink>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    broken: AtomicBool,
    idle_since: StdMutex<Option<Instant>>,
    close_grace: Duration,
    copiers: StdMutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Launch a worker and wait for it to phone home.
    ///
    /// On any failure the partially-started worker is killed and the error
    /// is reported as a creation fault; no half-open channel ever escapes.
    pub async fn start(config: &HarnessConfig, key: &AgentKey) -> Result<Arc<Self>, AgentError> {
        let id = NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed);
        std::fs::create_dir_all(&config.launch.logs_dir).map_err(AgentError::Spawn)?;
        let log_path = config.launch.logs_dir.join(format!("agent-{id}.log"));
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(AgentError::Spawn)?;
        let log_file = Arc::new(StdMutex::new(log_file));

        // Bind before spawning; the worker learns the port from its
        // command line. Address reuse stays off so a stale port cannot be
        // hijacked by an unrelated process.
        let socket = TcpSocket::new_v4().map_err(AgentError::Spawn)?;
        socket.set_reuseaddr(false).map_err(AgentError::Spawn)?;
        socket
            .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .map_err(AgentError::Spawn)?;
        let listener = socket.listen(1).map_err(AgentError::Spawn)?;
        let port = listener.local_addr().map_err(AgentError::Spawn)?.port();

        let mut command = Command::new(&config.launch.worker_program);
        command
            .arg("--port")
            .arg(port.to_string())
            .arg("--id")
            .arg(id.to_string())
            .arg("--log")
            .arg(&log_path)
            .arg("--runtime")
            .arg(&key.runtime_image)
            .arg("--idle-limit")
            .arg(format!("{}s", config.launch.worker_idle_limit_secs));
        for option in &key.options {
            command.arg("--opt").arg(option);
        }
        if let Some(policy) = &config.pool.policy_file {
            command.arg("--policy").arg(policy);
        }
        command
            .current_dir(&key.work_dir)
            .env_clear()
            .envs(config.launch.worker_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(id, port, dir = %key.work_dir.display(), "launching worker");
        let mut child = command.spawn().map_err(AgentError::Spawn)?;
        let pid = child.id();

        let Some(stdout) = child.stdout.take() else {
            kill_partial(&mut child, pid).await;
            return Err(AgentError::Spawn(std::io::Error::other(
                "worker stdout unavailable",
            )));
        };
        let Some(stderr) = child.stderr.take() else {
            kill_partial(&mut child, pid).await;
            return Err(AgentError::Spawn(std::io::Error::other(
                "worker stderr unavailable",
            )));
        };

        // Copiers start before the accept so early native output (a crash
        // banner, a linker error) is never lost.
        let (sink_tx, _) = watch::channel(None);
        let copiers = vec![
            spawn_native_copier(
                stdout,
                sink_tx.subscribe(),
                log_file.clone(),
                WORKER_STDOUT_STREAM,
            ),
            spawn_native_copier(
                stderr,
                sink_tx.subscribe(),
                log_file,
                WORKER_STDERR_STREAM,
            ),
        ];

        let accept_window = config.pool.scaled(config.launch.connect_timeout());
        let stream = match tokio::time::timeout(accept_window, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!(id, %peer, "worker connected");
                stream
            }
            Ok(Err(e)) => {
                warn!(id, "worker callback accept failed: {e}");
                kill_partial(&mut child, pid).await;
                abort_all(copiers);
                return Err(AgentError::Handshake(e));
            }
            Err(_) => {
                warn!(id, ?accept_window, "worker never connected back");
                kill_partial(&mut child, pid).await;
                abort_all(copiers);
                return Err(AgentError::HandshakeTimeout(accept_window));
            }
        };
        drop(listener);

        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(FrameWriter::new(
            Box::new(write_half) as BoxedWrite
        )));
        let keep_alive = KeepAlive::start(writer.clone(), config.launch.keepalive_interval());
        let (shutdown_tx, _) = watch::channel(false);

        info!(id, ?pid, log = %log_path.display(), "worker channel ready");
        Ok(Arc::new(Self {
            id,
            key: key.clone(),
            log_path,
            pid,
            child: StdMutex::new(Some(child)),
            reader: Mutex::new(FrameReader::new(Box::new(read_half) as BoxedRead)),
            writer,
            keep_alive,
            sink_tx,
            shutdown_tx,
            closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            idle_since: StdMutex::new(None),
            close_grace: config.launch.close_grace(),
            copiers: StdMutex::new(copiers),
        }))
    }

    /// Channel over caller-supplied streams, with no process behind it.
    #[cfg(test)]
    pub(crate) fn for_test(
        key: AgentKey,
        read: impl AsyncRead + Send + Unpin + 'static,
        write: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Arc<Self> {
        let id = NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed);
        let writer = Arc::new(Mutex::new(FrameWriter::new(Box::new(write) as BoxedWrite)));
        let keep_alive = KeepAlive::start(writer.clone(), Duration::from_secs(3600));
        let (sink_tx, _) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            key,
            log_path: PathBuf::from("/dev/null"),
            pid: None,
            child: StdMutex::new(None),
            reader: Mutex::new(FrameReader::new(Box::new(read) as BoxedRead)),
            writer,
            keep_alive,
            sink_tx,
            shutdown_tx,
            closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            idle_since: StdMutex::new(None),
            close_grace: Duration::from_secs(1),
            copiers: StdMutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn key(&self) -> &AgentKey {
        &self.key
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Whether this channel can serve an action for the given selector.
    pub fn matches(&self, work_dir: &Path, runtime_image: &Path, options: &[String]) -> bool {
        self.key.work_dir == work_dir
            && self.key.runtime_image == runtime_image
            && self.key.options == options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A broken channel suffered an I/O, protocol or timeout fault and
    /// must not be pooled again.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub(crate) fn set_idle(&self, at: Option<Instant>) {
        *lock(&self.idle_since) = at;
    }

    pub(crate) fn idle_since(&self) -> Option<Instant> {
        *lock(&self.idle_since)
    }

    /// Run one request/response exchange.
    ///
    /// Output frames land in `sink` as they arrive; the distinguished
    /// `messages` stream routes to the sink's message log. Any fault marks
    /// the channel broken. A timeout outcome is raised only after the
    /// diagnostic handler has completed or exhausted its budget, and takes
    /// precedence over whatever the exchange itself produced.
    pub async fn perform(
        &self,
        request: &Request,
        sink: &Arc<ActionSink>,
        timeout: Option<ActionTimeout>,
    ) -> Result<Status, AgentError> {
        debug_assert!(
            matches!(request, Request::Compile(_) | Request::Main(_)),
            "only action requests may be performed"
        );
        if self.is_closed() || self.is_broken() {
            return Err(AgentError::Closed);
        }
        let started = Instant::now();

        let mut handler_done: Option<oneshot::Receiver<bool>> = None;
        let mut handler_budget = Duration::ZERO;
        let alarm = timeout.map(|t| {
            let (done_tx, done_rx) = oneshot::channel();
            handler_done = Some(done_rx);
            handler_budget = t.handler.budget();
            let handler = t.handler;
            let pid = self.pid;
            let shutdown_tx = self.shutdown_tx.clone();
            let id = self.id;
            Alarm::schedule(t.limit, move || {
                tokio::spawn(async move {
                    warn!(id, "action timeout elapsed; running diagnostic handler");
                    let budget = handler.budget() + HANDLER_GRACE;
                    let join = tokio::time::timeout(
                        budget,
                        tokio::task::spawn_blocking(move || handler.handle_timeout(pid)),
                    )
                    .await;
                    let completed = matches!(join, Ok(Ok(())));
                    if !completed {
                        warn!(id, "diagnostic handler did not finish within its budget");
                    }
                    // Unblocks the pending frame read, whatever state the
                    // worker is in.
                    shutdown_tx.send_replace(true);
                    let _ = done_tx.send(completed);
                });
            })
        });

        self.keep_alive.set_enabled(false);
        self.sink_tx.send_replace(Some(sink.clone()));

        let result = self.exchange(request, sink).await;

        self.sink_tx.send_replace(None);
        if let Some(alarm) = &alarm {
            alarm.cancel();
        }
        self.keep_alive.set_enabled(true);

        if let Some(alarm) = &alarm {
            if alarm.fired() {
                self.broken.store(true, Ordering::Release);
                let completed = wait_for_handler(handler_done, handler_budget).await;
                let elapsed = started.elapsed();
                warn!(id = self.id, ?elapsed, completed, "action timed out");
                return Err(AgentError::Timeout {
                    elapsed,
                    handler_completed: completed,
                });
            }
        }
        if result.is_err() {
            self.broken.store(true, Ordering::Release);
        }
        result
    }

    async fn exchange(
        &self,
        request: &Request,
        sink: &Arc<ActionSink>,
    ) -> Result<Status, AgentError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        {
            let mut writer = self.writer.lock().await;
            writer
                .write_request(request)
                .await
                .map_err(AgentError::from_protocol)?;
        }
        let mut reader = self.reader.lock().await;
        loop {
            let reply = tokio::select! {
                reply = reader.read_reply() => reply,
                _ = shutdown_rx.changed() => {
                    debug!(id = self.id, "exchange cut short by shutdown signal");
                    return Err(AgentError::Closed);
                }
            };
            match reply {
                Ok(Reply::Output { stream, data }) => sink.append(&stream, &data),
                Ok(Reply::Status(status)) => return Ok(status),
                Ok(Reply::KeepAlive) => {}
                Err(e) => return Err(AgentError::from_protocol(e)),
            }
        }
    }

    /// Shut the channel down and reap the worker. Idempotent.
    ///
    /// The clean path sends a close request and shuts the stream down; if
    /// that I/O fails the worker is killed outright. Either way the exit
    /// wait is guarded by an alarm so a wedged worker cannot stall the
    /// caller past the close grace.
    pub async fn close(&self) -> Result<(), AgentError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(id = self.id, "closing worker channel");
        self.keep_alive.stop();
        self.shutdown_tx.send_replace(true);

        let clean = {
            let mut writer = self.writer.lock().await;
            match writer.write_request(&Request::Close).await {
                Ok(()) => {
                    let _ = writer.shutdown().await;
                    true
                }
                Err(e) => {
                    debug!(id = self.id, "clean close failed: {e}");
                    false
                }
            }
        };

        let child = lock(&self.child).take();
        let mut wait_failure = None;
        if let Some(mut child) = child {
            if !clean {
                if let Err(e) = child.start_kill() {
                    debug!(id = self.id, "kill failed: {e}");
                    if let Some(pid) = self.pid {
                        kill_process(pid, true);
                    }
                }
            }
            let pid = self.pid;
            let id = self.id;
            let guard = Alarm::schedule(self.close_grace, move || {
                warn!(id, "worker did not exit within close grace; killing");
                if let Some(pid) = pid {
                    kill_process(pid, true);
                }
            });
            match child.wait().await {
                Ok(status) => debug!(id = self.id, ?status, "worker exited"),
                Err(e) => {
                    warn!(id = self.id, "waiting for worker exit failed: {e}");
                    if let Some(pid) = self.pid {
                        kill_process(pid, true);
                    }
                    wait_failure = Some(e);
                }
            }
            guard.cancel();
        }

        let copiers: Vec<JoinHandle<()>> = lock(&self.copiers).drain(..).collect();
        for mut task in copiers {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        match wait_failure {
            Some(e) => Err(AgentError::Io(e)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .field("broken", &self.is_broken())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn kill_partial(child: &mut Child, pid: Option<u32>) {
    if let Err(e) = child.start_kill() {
        debug!("kill of partially-started worker failed: {e}");
        if let Some(pid) = pid {
            kill_process(pid, true);
        }
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
}

fn abort_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        task.abort();
    }
}

/// Forward one native output stream to the registered action sink, or to
/// the per-worker log file when no action is in flight.
fn spawn_native_copier<R>(
    mut stream: R,
    sink_rx: watch::Receiver<SharedSink>,
    log_file: Arc<StdMutex<std::fs::File>>,
    label: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        use std::io::Write;
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let sink = sink_rx.borrow().clone();
                    match sink {
                        Some(sink) => sink.append(label, &text),
                        None => {
                            let mut file = lock(&log_file);
                            let _ = file.write_all(text.as_bytes());
                        }
                    }
                }
                Err(e) => {
                    debug!("native {label} copy ended: {e}");
                    break;
                }
            }
        }
    })
}
