//! Idle-connection probes for reserved worker channels.

use rth_common::FrameWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically writes keepalive frames through a channel's shared frame
/// writer so the worker's inactivity guard does not expire while the
/// channel sits reserved but unused.
///
/// Exchanges disable the prober before locking the writer, so a probe can
/// delay a request by at most one frame but can never interleave with one.
pub struct KeepAlive {
    enabled_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl KeepAlive {
    pub fn start<W>(writer: Arc<Mutex<FrameWriter<W>>>, interval: Duration) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (enabled_tx, enabled_rx) = watch::channel(true);
        let task = tokio::spawn(probe_loop(writer, enabled_rx, interval));
        Self { enabled_tx, task }
    }

    /// Enable or disable probe emission. Idempotent.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled_tx.send_replace(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled_tx.borrow()
    }

    /// Stop probing for good.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn probe_loop<W>(
    writer: Arc<Mutex<FrameWriter<W>>>,
    enabled_rx: watch::Receiver<bool>,
    interval: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; a probe right at connect time
    // is pointless, so swallow it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !*enabled_rx.borrow() {
            continue;
        }
        let mut writer = writer.lock().await;
        // An exchange may have disabled probing while we waited for the
        // lock; its request write must not be followed by a stray probe.
        if !*enabled_rx.borrow() {
            continue;
        }
        if let Err(e) = writer.write_keepalive().await {
            debug!("keepalive probe failed, stopping: {e}");
            break;
        }
        trace!("keepalive probe sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rth_common::{FrameReader, Request};
    use tokio::time::timeout;

    fn harness() -> (KeepAlive, FrameReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>) {
        let (near, far) = tokio::io::duplex(4096);
        let (_near_read, write) = tokio::io::split(near);
        let (read, _far_write) = tokio::io::split(far);
        let writer = Arc::new(Mutex::new(FrameWriter::new(write)));
        let keep_alive = KeepAlive::start(writer, Duration::from_millis(20));
        (keep_alive, FrameReader::new(read))
    }

    #[tokio::test]
    async fn test_probes_arrive_while_enabled() {
        let (keep_alive, mut reader) = harness();
        for _ in 0..3 {
            let frame = timeout(Duration::from_millis(500), reader.read_request())
                .await
                .expect("probe within interval")
                .expect("read");
            assert!(matches!(frame, Some(Request::KeepAlive)));
        }
        keep_alive.stop();
    }

    #[tokio::test]
    async fn test_disabled_prober_stays_silent() {
        let (keep_alive, mut reader) = harness();
        keep_alive.set_enabled(false);
        assert!(!keep_alive.is_enabled());
        let silent = timeout(Duration::from_millis(120), reader.read_request()).await;
        assert!(silent.is_err(), "no probe may be written while disabled");

        keep_alive.set_enabled(true);
        let frame = timeout(Duration::from_millis(500), reader.read_request())
            .await
            .expect("probe after re-enable")
            .expect("read");
        assert!(matches!(frame, Some(Request::KeepAlive)));
    }

    #[tokio::test]
    async fn test_probe_never_splits_a_request_frame() {
        // Grab the writer lock (like an exchange does), let several probe
        // intervals elapse, write a request, then release. The far end
        // must see whole frames only.
        let (near, far) = tokio::io::duplex(4096);
        let (_, write) = tokio::io::split(near);
        let (read, _far_write) = tokio::io::split(far);
        let writer = Arc::new(Mutex::new(FrameWriter::new(write)));
        let keep_alive = KeepAlive::start(writer.clone(), Duration::from_millis(10));
        let mut reader = FrameReader::new(read);

        {
            keep_alive.set_enabled(false);
            let mut guard = writer.lock().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            guard
                .write_request(&Request::Close)
                .await
                .expect("write close");
        }
        let frame = loop {
            match timeout(Duration::from_millis(500), reader.read_request())
                .await
                .expect("frame")
                .expect("read")
            {
                Some(Request::KeepAlive) => continue,
                other => break other,
            }
        };
        assert!(matches!(frame, Some(Request::Close)));
        keep_alive.stop();
    }
}
