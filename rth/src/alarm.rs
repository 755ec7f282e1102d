//! One-shot cancellable alarms and the timeout diagnostic hook.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Advisory budget granted to diagnostic handlers that do not declare one.
pub const DEFAULT_HANDLER_BUDGET: Duration = Duration::from_secs(300);

/// Hook invoked when an action outlives its timeout, before the channel or
/// process is torn down.
///
/// Runs on a dedicated blocking thread so it may take its time collecting
/// diagnostics (thread dumps, artifact snapshots). It is bounded by
/// [`TimeoutHandler::budget`] plus a grace period; a handler that exceeds
/// its budget is abandoned and teardown proceeds without it.
pub trait TimeoutHandler: Send + Sync {
    /// Advisory budget for [`TimeoutHandler::handle_timeout`].
    fn budget(&self) -> Duration {
        DEFAULT_HANDLER_BUDGET
    }

    /// Called once per firing with the worker's pid, if still known.
    fn handle_timeout(&self, pid: Option<u32>);
}

/// Handler that only records the firing on the activity trace.
#[derive(Debug, Default)]
pub struct TraceTimeoutHandler;

impl TimeoutHandler for TraceTimeoutHandler {
    fn budget(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn handle_timeout(&self, pid: Option<u32>) {
        warn!(?pid, "timeout elapsed; no diagnostic handler configured");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AlarmState {
    Pending,
    Fired,
    Cancelled,
}

/// A cancellable one-shot delayed callback.
///
/// The firing decision and `cancel` serialize on one lock: once `cancel`
/// returns, the callback either already ran (`fired` reports true) or never
/// will. `cancel` is idempotent and harmless after firing; `fired` stays
/// queryable for the alarm's whole life.
#[derive(Debug)]
pub struct Alarm {
    state: Arc<Mutex<AlarmState>>,
    cancel_signal: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl Alarm {
    /// Arm the alarm. After `delay`, unless cancelled first, `on_fire` runs
    /// exactly once on the alarm's own task.
    pub fn schedule<F>(delay: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(Mutex::new(AlarmState::Pending));
        let cancel_signal = Arc::new(Notify::new());
        let task = tokio::spawn({
            let state = state.clone();
            let cancel_signal = cancel_signal.clone();
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let fire = {
                            let mut state = lock(&state);
                            if *state == AlarmState::Pending {
                                *state = AlarmState::Fired;
                                true
                            } else {
                                false
                            }
                        };
                        if fire {
                            debug!(?delay, "alarm fired");
                            on_fire();
                        }
                    }
                    _ = cancel_signal.notified() => {}
                }
            }
        });
        Self {
            state,
            cancel_signal,
            task,
        }
    }

    /// Disarm the alarm. Idempotent; a no-op once fired.
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        if *state == AlarmState::Pending {
            *state = AlarmState::Cancelled;
        }
        drop(state);
        self.cancel_signal.notify_one();
    }

    /// Whether the callback ran (or is running).
    pub fn fired(&self) -> bool {
        *lock(&self.state) == AlarmState::Fired
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        // The callback itself has no await points, so an abort can only
        // land while the task is parked on the timer.
        self.task.abort();
    }
}

fn lock(state: &Mutex<AlarmState>) -> std::sync::MutexGuard<'_, AlarmState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Signal a process by pid. Used where no `Child` handle is reachable,
/// such as alarm callbacks.
pub(crate) fn kill_process(pid: u32, force: bool) {
    #[cfg(unix)]
    {
        let signal = if force { "-KILL" } else { "-TERM" };
        match std::process::Command::new("kill")
            .arg(signal)
            .arg(pid.to_string())
            .output()
        {
            Ok(out) if out.status.success() => debug!(pid, signal, "signalled process"),
            Ok(out) => debug!(pid, signal, status = ?out.status, "kill reported failure"),
            Err(e) => warn!(pid, "could not run kill: {e}"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = force;
        warn!(pid, "process signalling is not supported on this platform");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_alarm_fires_after_delay() {
        let count = Arc::new(AtomicU32::new(0));
        let alarm = Alarm::schedule(Duration::from_millis(20), {
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(!alarm.fired());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(alarm.fired());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let count = Arc::new(AtomicU32::new(0));
        let alarm = Alarm::schedule(Duration::from_millis(50), {
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        alarm.cancel();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!alarm.fired());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_safe_after_firing() {
        let alarm = Alarm::schedule(Duration::from_millis(10), || {});
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(alarm.fired());
        alarm.cancel();
        alarm.cancel();
        assert!(alarm.fired(), "cancel must not erase a recorded firing");
    }

    #[tokio::test]
    async fn test_cancel_decision_is_definitive() {
        // After cancel returns, either the callback already ran and fired()
        // says so, or it never runs. Hammer the race a few times.
        for _ in 0..50 {
            let count = Arc::new(AtomicU32::new(0));
            let alarm = Alarm::schedule(Duration::from_millis(1), {
                let count = count.clone();
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            });
            tokio::time::sleep(Duration::from_millis(1)).await;
            alarm.cancel();
            let fired = alarm.fired();
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(count.load(Ordering::SeqCst), u32::from(fired));
            assert_eq!(alarm.fired(), fired);
        }
    }

    #[tokio::test]
    async fn test_default_handler_budget() {
        struct Quiet;
        impl TimeoutHandler for Quiet {
            fn handle_timeout(&self, _pid: Option<u32>) {}
        }
        assert_eq!(Quiet.budget(), DEFAULT_HANDLER_BUDGET);
        assert!(TraceTimeoutHandler.budget() < DEFAULT_HANDLER_BUDGET);
    }
}
