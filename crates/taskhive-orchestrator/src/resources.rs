use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use taskhive_core::{HiveError, HiveResult};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Resource pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Upper bound on agent slots held at once across all agents.
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,
    /// Default wait for resource keys before failing closed.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_max_concurrent_agents() -> usize {
    4
}
fn default_acquire_timeout_ms() -> u64 {
    30_000
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: default_max_concurrent_agents(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl ResourceConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Default)]
struct PoolState {
    slots: HashMap<String, usize>,
    held_slots: usize,
    locks: HashMap<String, String>,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub max_concurrent_agents: usize,
    pub held_slots: usize,
    pub slots_by_agent: BTreeMap<String, usize>,
    /// Resource key to holding agent.
    pub locked_resources: BTreeMap<String, String>,
    pub utilization: f64,
}

/// Concurrency gate for active agents plus an exclusive lock table for
/// named resources.
///
/// Multi-key acquisition is all-or-nothing: a caller either receives every
/// key it asked for or none of them, so two agents asking for overlapping
/// sets in different orders can never deadlock each other. A key held by
/// anyone (including the asking agent) blocks acquisition.
///
/// Waiters park on a single release notification instead of polling.
pub struct ResourcePool {
    config: ResourceConfig,
    state: Mutex<PoolState>,
    released: Notify,
}

impl ResourcePool {
    pub fn new(config: ResourceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
            released: Notify::new(),
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Take one agent slot if fewer than `max_concurrent_agents` are held.
    ///
    /// Never waits; callers that fail should retry later.
    pub fn acquire_agent_slot(&self, agent: &str) -> bool {
        let mut state = self.state.lock();
        if state.held_slots >= self.config.max_concurrent_agents {
            return false;
        }
        state.held_slots += 1;
        *state.slots.entry(agent.to_string()).or_insert(0) += 1;
        debug!(agent = %agent, held = state.held_slots, "Agent slot acquired");
        true
    }

    /// Wait up to `timeout` for an agent slot.
    pub async fn acquire_agent_slot_timeout(
        &self,
        agent: &str,
        timeout: Duration,
    ) -> HiveResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.acquire_agent_slot(agent) {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(HiveError::Timeout(format!(
                    "no agent slot for '{agent}' within {}ms",
                    timeout.as_millis()
                )));
            }
        }
    }

    /// Return one slot held by `agent`. Releasing a slot that is not held is
    /// a no-op.
    pub fn release_agent_slot(&self, agent: &str) {
        {
            let mut state = self.state.lock();
            let remaining = match state.slots.get_mut(agent) {
                Some(count) => {
                    *count -= 1;
                    *count
                }
                None => return,
            };
            if remaining == 0 {
                state.slots.remove(agent);
            }
            state.held_slots = state.held_slots.saturating_sub(1);
        }
        self.released.notify_waiters();
    }

    /// Acquire every key in `keys` for `agent` or none of them, right now.
    pub fn try_acquire_resources(&self, agent: &str, keys: &[String]) -> bool {
        let mut state = self.state.lock();
        if keys.iter().any(|k| state.locks.contains_key(k)) {
            return false;
        }
        for key in keys {
            state.locks.insert(key.clone(), agent.to_string());
        }
        true
    }

    /// Wait until every key in `keys` can be taken at once, or fail with
    /// [`HiveError::Timeout`]. A partial set is never held.
    pub async fn acquire_resources(
        &self,
        agent: &str,
        keys: &[String],
        timeout: Duration,
    ) -> HiveResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_acquire_resources(agent, keys) {
                debug!(agent = %agent, keys = ?keys, "Resources acquired");
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(agent = %agent, keys = ?keys, "Resource acquisition timed out");
                return Err(HiveError::Timeout(format!(
                    "resources {keys:?} unavailable for '{agent}' within {}ms",
                    timeout.as_millis()
                )));
            }
        }
    }

    /// Release the keys in `keys` that `agent` actually holds and return them.
    pub fn release_resources(&self, agent: &str, keys: &[String]) -> Vec<String> {
        let mut released = Vec::new();
        {
            let mut state = self.state.lock();
            for key in keys {
                if state.locks.get(key).is_some_and(|holder| holder == agent) {
                    state.locks.remove(key);
                    released.push(key.clone());
                }
            }
        }
        if !released.is_empty() {
            self.released.notify_waiters();
        }
        released
    }

    /// Drop every slot and key held by `agent`.
    pub fn release_all(&self, agent: &str) -> Vec<String> {
        let released: Vec<String> = {
            let mut state = self.state.lock();
            if let Some(count) = state.slots.remove(agent) {
                state.held_slots = state.held_slots.saturating_sub(count);
            }
            let mut keys: Vec<String> = state
                .locks
                .iter()
                .filter(|(_, holder)| holder.as_str() == agent)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                state.locks.remove(key);
            }
            keys.sort();
            keys
        };
        self.released.notify_waiters();
        released
    }

    /// Agent currently holding `key`.
    pub fn holder_of(&self, key: &str) -> Option<String> {
        self.state.lock().locks.get(key).cloned()
    }

    pub fn held_slots(&self) -> usize {
        self.state.lock().held_slots
    }

    /// Fraction of agent slots in use.
    pub fn utilization(&self) -> f64 {
        if self.config.max_concurrent_agents == 0 {
            return 0.0;
        }
        self.state.lock().held_slots as f64 / self.config.max_concurrent_agents as f64
    }

    /// Wait for the next release of a slot or resource, up to `timeout`.
    /// Returns `true` if a release happened.
    pub async fn wait_for_release(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.released.notified())
            .await
            .is_ok()
    }

    /// Slot count and key holders at this instant.
    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock();
        PoolSnapshot {
            max_concurrent_agents: self.config.max_concurrent_agents,
            held_slots: state.held_slots,
            slots_by_agent: state.slots.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            locked_resources: state
                .locks
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            utilization: if self.config.max_concurrent_agents == 0 {
                0.0
            } else {
                state.held_slots as f64 / self.config.max_concurrent_agents as f64
            },
        }
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new(ResourceConfig::default())
    }
}
