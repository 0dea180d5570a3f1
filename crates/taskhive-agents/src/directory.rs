use crate::capability::{AgentCapability, AgentStatus};
use crate::ledger::AgentLedger;
use crate::strategy::{AgentSelector, SelectionStrategy, StrategyKind, TaskRequirements};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use taskhive_core::{HiveError, HiveResult, TaskId};
use tracing::{debug, info, warn};

/// Directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub default_strategy: StrategyKind,
    /// Max load given to agents registered without one.
    #[serde(default = "default_max_load")]
    pub default_max_load: u32,
    /// Working agents silent for longer than this are marked stuck.
    #[serde(default = "default_stuck_after_secs")]
    pub stuck_after_secs: u64,
}

fn default_max_load() -> u32 {
    3
}

fn default_stuck_after_secs() -> u64 {
    900
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            default_strategy: StrategyKind::default(),
            default_max_load: default_max_load(),
            stuck_after_secs: default_stuck_after_secs(),
        }
    }
}

/// Outcome of a ledger sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub offlined: Vec<String>,
}

/// Compact per-agent view for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub name: String,
    pub role: String,
    pub status: AgentStatus,
    pub current_load: u32,
    pub max_load: u32,
    pub performance_score: f64,
    pub success_rate: f64,
    pub average_response_secs: Option<f64>,
    pub tasks_seen: usize,
    pub last_active: DateTime<Utc>,
}

impl From<&AgentCapability> for AgentSummary {
    fn from(a: &AgentCapability) -> Self {
        Self {
            name: a.name.clone(),
            role: a.role.clone(),
            status: a.status,
            current_load: a.current_load,
            max_load: a.max_load,
            performance_score: a.performance_score,
            success_rate: a.success_rate,
            average_response_secs: a.average_response_time(),
            tasks_seen: a.task_history.len(),
            last_active: a.last_active,
        }
    }
}

/// Point-in-time view of the whole directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub agents: Vec<AgentSummary>,
    pub total_load: u32,
    pub total_capacity: u32,
}

/// Registry of worker agents.
///
/// The directory owns every [`AgentCapability`] and mutates them only under
/// its own lock; callers address agents by name.
pub struct AgentDirectory {
    agents: RwLock<HashMap<String, AgentCapability>>,
    strategies: HashMap<StrategyKind, SelectionStrategy>,
    config: DirectoryConfig,
}

impl AgentDirectory {
    pub fn new(config: DirectoryConfig) -> Self {
        let strategies = [
            StrategyKind::RoundRobin,
            StrategyKind::LeastLoaded,
            StrategyKind::BestFit,
            StrategyKind::PerformanceBased,
        ]
        .into_iter()
        .map(|k| (k, SelectionStrategy::new(k)))
        .collect();

        Self {
            agents: RwLock::new(HashMap::new()),
            strategies,
            config,
        }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Register an agent with the default max load.
    ///
    /// Re-registering a known name refreshes role and expertise but keeps the
    /// agent's load and performance history.
    pub fn register_agent(
        &self,
        name: &str,
        role: &str,
        expertise: &[String],
    ) -> HiveResult<()> {
        let capability = AgentCapability::new(name, role, expertise.iter().cloned())
            .with_max_load(self.config.default_max_load);
        self.register(capability)
    }

    /// Register a fully-specified capability record.
    pub fn register(&self, capability: AgentCapability) -> HiveResult<()> {
        if capability.name.trim().is_empty() {
            return Err(HiveError::Config("agent name must not be empty".into()));
        }
        let mut agents = self.agents.write();
        match agents.get_mut(&capability.name) {
            Some(existing) => {
                existing.role = capability.role;
                existing.expertise = capability.expertise;
                existing.max_load = capability.max_load;
                if existing.status == AgentStatus::Offline {
                    existing.status = if existing.current_load > 0 {
                        AgentStatus::Working
                    } else {
                        AgentStatus::Idle
                    };
                }
                debug!(agent = %existing.name, "Agent re-registered");
            }
            None => {
                info!(agent = %capability.name, role = %capability.role, "Agent registered");
                agents.insert(capability.name.clone(), capability);
            }
        }
        Ok(())
    }

    /// Remove an agent, returning its final record.
    pub fn unregister_agent(&self, name: &str) -> HiveResult<AgentCapability> {
        let removed = self.agents.write().remove(name);
        match removed {
            Some(agent) => {
                info!(agent = %name, "Agent unregistered");
                Ok(agent)
            }
            None => Err(HiveError::NotFound(format!("agent '{name}'"))),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.read().contains_key(name)
    }

    /// Clone of one agent's record.
    pub fn get(&self, name: &str) -> Option<AgentCapability> {
        self.agents.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Pick the best agent able to take a task.
    ///
    /// Candidates are filtered to agents that can handle the task type and
    /// have spare load, then the strategy (or the configured default)
    /// chooses among them.
    pub fn find_best_agent(
        &self,
        requirements: &TaskRequirements,
        strategy: Option<StrategyKind>,
    ) -> Option<String> {
        let kind = strategy.unwrap_or(self.config.default_strategy);
        let agents = self.agents.read();
        let mut pool: Vec<&AgentCapability> = agents
            .values()
            .filter(|a| a.can_handle(requirements.task_type.as_deref()))
            .collect();
        pool.sort_by(|a, b| a.name.cmp(&b.name));

        let selected = self
            .strategies
            .get(&kind)
            .and_then(|s| s.select(&pool, requirements))
            .map(|a| a.name.clone());

        if selected.is_none() {
            debug!(strategy = %kind, candidates = pool.len(), "No capable agent found");
        }
        selected
    }

    /// Charge one unit of load to an agent for a task it is starting.
    pub fn assign_task(&self, name: &str, task_id: Option<TaskId>) -> HiveResult<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(name)
            .ok_or_else(|| HiveError::NotFound(format!("agent '{name}'")))?;
        if agent.status == AgentStatus::Offline {
            return Err(HiveError::Routing(format!("agent '{name}' is offline")));
        }
        if agent.current_load >= agent.max_load {
            return Err(HiveError::Capacity(format!(
                "agent '{name}' is at max load {}",
                agent.max_load
            )));
        }
        agent.assign(task_id);
        Ok(())
    }

    /// Record the outcome of a finished task and release its load.
    pub fn complete_task(
        &self,
        name: &str,
        success: bool,
        response_time: Duration,
    ) -> HiveResult<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(name)
            .ok_or_else(|| HiveError::NotFound(format!("agent '{name}'")))?;
        agent.record_completion(success, response_time);
        debug!(
            agent = %name,
            success,
            performance = agent.performance_score,
            success_rate = agent.success_rate,
            "Agent task completed"
        );
        Ok(())
    }

    /// Release one unit of load without scoring, for cancelled work.
    pub fn release_task(&self, name: &str) {
        if let Some(agent) = self.agents.write().get_mut(name) {
            agent.release();
        }
    }

    /// Override an agent's status, e.g. to take it offline for maintenance.
    pub fn set_status(&self, name: &str, status: AgentStatus) -> HiveResult<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(name)
            .ok_or_else(|| HiveError::NotFound(format!("agent '{name}'")))?;
        agent.status = status;
        Ok(())
    }

    /// Mark working agents that have been silent longer than `threshold` as
    /// stuck. Returns the names that changed.
    pub fn detect_stuck(&self, threshold: Duration) -> Vec<String> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(threshold)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let mut stuck = Vec::new();
        for agent in self.agents.write().values_mut() {
            if agent.status == AgentStatus::Working && now - agent.last_active > threshold {
                warn!(agent = %agent.name, "Agent appears stuck");
                agent.status = AgentStatus::Stuck;
                stuck.push(agent.name.clone());
            }
        }
        stuck.sort();
        stuck
    }

    /// Bring the registry in line with the ledger.
    ///
    /// New ledger agents are registered, known ones refreshed, and agents
    /// missing from the ledger are marked offline rather than dropped so
    /// their history survives.
    pub async fn sync_from_ledger(&self, ledger: &dyn AgentLedger) -> HiveResult<SyncReport> {
        let entries = ledger.list_agents().await?;
        let mut report = SyncReport::default();
        let listed: HashSet<String> = entries.iter().map(|e| e.name.clone()).collect();

        for entry in entries {
            let known = self.contains(&entry.name);
            let capability = AgentCapability::new(&entry.name, &entry.role, entry.expertise)
                .with_max_load(entry.max_load.unwrap_or(self.config.default_max_load));
            self.register(capability)?;
            if known {
                report.updated.push(entry.name);
            } else {
                report.added.push(entry.name);
            }
        }

        for agent in self.agents.write().values_mut() {
            if !listed.contains(&agent.name) && agent.status != AgentStatus::Offline {
                agent.status = AgentStatus::Offline;
                report.offlined.push(agent.name.clone());
            }
        }

        report.added.sort();
        report.updated.sort();
        report.offlined.sort();
        info!(
            added = report.added.len(),
            updated = report.updated.len(),
            offlined = report.offlined.len(),
            "Directory synced from ledger"
        );
        Ok(report)
    }

    /// Serializable view of every registered agent.
    pub fn snapshot(&self) -> DirectorySnapshot {
        let agents = self.agents.read();
        let mut summaries: Vec<AgentSummary> = agents.values().map(AgentSummary::from).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        DirectorySnapshot {
            total_load: summaries.iter().map(|a| a.current_load).sum(),
            total_capacity: summaries
                .iter()
                .filter(|a| a.status != AgentStatus::Offline)
                .map(|a| a.max_load)
                .sum(),
            agents: summaries,
        }
    }

    /// Serialize the current state as JSON for external telemetry.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_default()
    }
}

impl Default for AgentDirectory {
    fn default() -> Self {
        Self::new(DirectoryConfig::default())
    }
}
