//! The keyed cache of idle worker channels.
//!
//! One lock guards all pool state, and worker creation happens while it is
//! held: checkouts serialize, a channel is never handed to two callers,
//! and a saver can never slip in mid-creation. Eviction closes run outside
//! the lock since they only touch channels already removed from it.

use crate::agent::{Agent, AgentKey};
use crate::config::{HarnessConfig, PoolConfig};
use crate::error::{AgentError, SelectionError};
use crate::stats::{PoolReport, PoolStats};
use rand::RngExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type AttemptFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AgentError>> + Send + 'a>>;

/// Reuses idle worker channels keyed by (work dir, runtime image,
/// options), bounded in size and idle age.
pub struct AgentPool {
    config: HarnessConfig,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    /// Idle channels per key; most recently saved at the back.
    by_key: HashMap<AgentKey, VecDeque<Arc<Agent>>>,
    /// Global idle order, oldest save at the front. Mirrors `by_key`.
    all: VecDeque<(u32, AgentKey)>,
    /// Channels currently held by callers, for directory force-closes.
    checked_out: HashMap<u32, Weak<Agent>>,
    stats: PoolStats,
}

impl AgentPool {
    pub fn new(config: HarnessConfig) -> Self {
        info!(run_id = %config.run_id, max = config.pool.max_pool_size, "agent pool created");
        Self {
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Hand out an idle channel for the key, or create one.
    ///
    /// Creation faults of the I/O class are retried up to the configured
    /// attempt count with jittered backoff; any other fault aborts. The
    /// returned error carries every prior fault, oldest first.
    pub async fn checkout(
        &self,
        work_dir: impl Into<PathBuf>,
        runtime_image: impl Into<PathBuf>,
        options: Vec<String>,
    ) -> Result<Arc<Agent>, SelectionError> {
        let key = AgentKey::new(work_dir, runtime_image, options);
        let key = &key;
        select_with_retry(self.config.pool.selection_attempts, move |_| {
            Box::pin(self.try_checkout(key)) as AttemptFuture<'_, Arc<Agent>>
        })
        .await
    }

    async fn try_checkout(&self, key: &AgentKey) -> Result<Arc<Agent>, AgentError> {
        let mut state = self.state.lock().await;
        let reused = match state.by_key.get_mut(key) {
            Some(idle) => {
                let agent = idle.pop_back();
                if idle.is_empty() {
                    state.by_key.remove(key);
                }
                agent
            }
            None => None,
        };
        if let Some(agent) = reused {
            state.all.retain(|(id, _)| *id != agent.id());
            agent.set_idle(None);
            state.stats.record_reuse(agent.id(), key);
            state.checked_out.insert(agent.id(), Arc::downgrade(&agent));
            debug!(id = agent.id(), "reusing pooled worker channel");
            return Ok(agent);
        }
        // Creation stays under the pool lock: one worker comes up at a
        // time, and nothing else can touch the pool meanwhile.
        let agent = Agent::start(&self.config, key).await?;
        state.stats.record_creation(agent.id(), key);
        state.checked_out.insert(agent.id(), Arc::downgrade(&agent));
        Ok(agent)
    }

    /// Return a channel to the pool.
    ///
    /// Unusable channels (broken or closed) are discarded instead of
    /// pooled. Saving a channel that is already idle is a caller bug and
    /// panics. Eviction runs afterwards: size bound first, then idle
    /// expiry, both oldest save first.
    pub async fn save(&self, agent: Arc<Agent>) {
        {
            let mut state = self.state.lock().await;
            state.checked_out.remove(&agent.id());
        }
        if agent.is_broken() || agent.is_closed() {
            warn!(id = agent.id(), "discarding unusable channel instead of pooling it");
            if let Err(e) = agent.close().await {
                debug!(id = agent.id(), "close of discarded channel failed: {e}");
            }
            return;
        }
        let victims = {
            let mut state = self.state.lock().await;
            assert!(
                !state.all.iter().any(|(id, _)| *id == agent.id()),
                "channel {} saved while already idle",
                agent.id()
            );
            agent.set_idle(Some(Instant::now()));
            state
                .by_key
                .entry(agent.key().clone())
                .or_default()
                .push_back(agent.clone());
            state.all.push_back((agent.id(), agent.key().clone()));
            let idle_now = state.all.len();
            state.stats.record_pool_size(idle_now);
            collect_victims(&mut state, &self.config.pool)
        };
        close_victims(victims).await;
    }

    /// Close every idle channel, clear all state, and produce the run's
    /// usage report (it also goes to the activity trace).
    pub async fn flush(&self) -> PoolReport {
        let (victims, report) = {
            let mut state = self.state.lock().await;
            let mut victims = Vec::new();
            for (_, idle) in state.by_key.drain() {
                victims.extend(idle);
            }
            state.all.clear();
            state.checked_out.clear();
            let report = state.stats.report(&self.config.run_id.to_string());
            (victims, report)
        };
        info!(closing = victims.len(), "flushing agent pool");
        close_victims(victims).await;
        info!("{report}");
        report
    }

    /// Force-close every channel bound to a working directory, idle or
    /// currently checked out. Returns how many were closed.
    pub async fn close_dir(&self, work_dir: &Path) -> usize {
        let victims = {
            let mut state = self.state.lock().await;
            let mut victims = Vec::new();
            let keys: Vec<AgentKey> = state
                .by_key
                .keys()
                .filter(|key| key.work_dir == work_dir)
                .cloned()
                .collect();
            for key in keys {
                if let Some(idle) = state.by_key.remove(&key) {
                    victims.extend(idle);
                }
            }
            state.all.retain(|(_, key)| key.work_dir != work_dir);
            state.checked_out.retain(|_, weak| match weak.upgrade() {
                Some(agent) if agent.key().work_dir == work_dir => {
                    victims.push(agent);
                    false
                }
                Some(_) => true,
                // The holder dropped the channel without saving it.
                None => false,
            });
            victims
        };
        let count = victims.len();
        for victim in victims {
            warn!(id = victim.id(), dir = %work_dir.display(), "force-closing channel for unusable directory");
            if let Err(e) = victim.close().await {
                warn!(id = victim.id(), "force-close failed: {e}");
            }
        }
        count
    }

    /// Usage statistics so far, without disturbing the pool.
    pub async fn snapshot(&self) -> PoolReport {
        let state = self.state.lock().await;
        state.stats.report(&self.config.run_id.to_string())
    }

    /// How many channels sit idle right now.
    pub async fn idle_count(&self) -> usize {
        self.state.lock().await.all.len()
    }
}

async fn select_with_retry<'a, T, F>(attempts: u32, mut attempt_fn: F) -> Result<T, SelectionError>
where
    F: FnMut(u32) -> AttemptFuture<'a, T>,
{
    let attempts = attempts.max(1);
    let mut suppressed = Vec::new();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(fault) if fault.is_retryable() && attempt < attempts => {
                warn!(attempt, "agent selection failed, will retry: {fault}");
                suppressed.push(fault);
                tokio::time::sleep(retry_backoff(attempt)).await;
            }
            Err(fault) => {
                return Err(SelectionError {
                    attempts: attempt,
                    last: fault,
                    suppressed,
                });
            }
        }
    }
}

fn retry_backoff(attempt: u32) -> Duration {
    let jitter = rand::rng().random_range(0..50);
    Duration::from_millis(100 * u64::from(attempt) + jitter)
}

/// Pull every channel that must go: size overflow first, then expired
/// idlers, both from the oldest end of the global order.
fn collect_victims(state: &mut PoolState, config: &PoolConfig) -> Vec<Arc<Agent>> {
    let mut victims = Vec::new();
    while state.all.len() > config.max_pool_size {
        let Some((id, key)) = state.all.pop_front() else {
            break;
        };
        if let Some(agent) = remove_idle(state, id, &key) {
            victims.push(agent);
        }
    }
    let idle_timeout = config.idle_timeout();
    while let Some((id, key)) = state.all.pop_front() {
        let Some(agent) = remove_idle(state, id, &key) else {
            continue;
        };
        let expired = agent
            .idle_since()
            .map(|at| at.elapsed() > idle_timeout)
            .unwrap_or(false);
        if expired {
            victims.push(agent);
        } else {
            // Oldest survivor: everything behind it is younger still.
            state.by_key.entry(key.clone()).or_default().push_front(agent);
            state.all.push_front((id, key));
            break;
        }
    }
    victims
}

fn remove_idle(state: &mut PoolState, id: u32, key: &AgentKey) -> Option<Arc<Agent>> {
    let idle = state.by_key.get_mut(key)?;
    let pos = idle.iter().position(|agent| agent.id() == id)?;
    let agent = idle.remove(pos);
    if idle.is_empty() {
        state.by_key.remove(key);
    }
    agent
}

async fn close_victims(victims: Vec<Arc<Agent>>) {
    for victim in victims {
        debug!(id = victim.id(), "evicting idle worker channel");
        if let Err(e) = victim.close().await {
            warn!(id = victim.id(), "evicted channel failed to close: {e}");
        }
    }
}
