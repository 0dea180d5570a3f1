use crate::backend::{ExecutionBackend, ExecutionOutcome, ExecutionRequest};
use crate::graph::DependencyGraph;
use crate::resources::{PoolSnapshot, ResourcePool};
use crate::task_queue::TaskQueue;
use crate::types::{Task, TaskEvent, TaskRequest, TaskStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskhive_agents::{AgentDirectory, DirectorySnapshot, StrategyKind};
use taskhive_core::{HiveError, HiveResult, Priority, TaskId};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// What to do when a new dependency closes a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePolicy {
    /// Delete the last edge of each detected cycle and log a warning.
    #[default]
    BreakLastEdge,
    /// Roll back the offending edge and return a topology error.
    Reject,
}

/// Coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Retry budget for tasks that do not set their own.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pause after failing to get an agent slot.
    #[serde(default = "default_dispatch_backoff_ms")]
    pub dispatch_backoff_ms: u64,
    /// Poll interval of an idle dispatch loop.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Upper bound on one backend execution.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// How long a dispatched task waits for its resource keys before it is
    /// re-queued.
    #[serde(default = "default_resource_timeout_ms")]
    pub resource_timeout_ms: u64,
    /// Base delay before a failed task is retried; doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Cap on the doubled retry delay.
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// Reaction to a dependency that closes a cycle.
    #[serde(default)]
    pub cycle_policy: CyclePolicy,
    /// Capacity of the task event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Strategy used for tasks without an owner. `None` uses the directory default.
    #[serde(default)]
    pub strategy: Option<StrategyKind>,
    /// How long shutdown waits for in-flight executions.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_dispatch_backoff_ms() -> u64 {
    50
}
fn default_idle_poll_ms() -> u64 {
    250
}
fn default_task_timeout_secs() -> u64 {
    600
}
fn default_resource_timeout_ms() -> u64 {
    30_000
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_retry_backoff_max_ms() -> u64 {
    10_000
}
fn default_event_capacity() -> usize {
    256
}
fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            dispatch_backoff_ms: default_dispatch_backoff_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            task_timeout_secs: default_task_timeout_secs(),
            resource_timeout_ms: default_resource_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            cycle_policy: CyclePolicy::default(),
            event_capacity: default_event_capacity(),
            strategy: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl SchedulerConfig {
    /// [`task_timeout_secs`](Self::task_timeout_secs) as a `Duration`.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// [`resource_timeout_ms`](Self::resource_timeout_ms) as a `Duration`.
    pub fn resource_timeout(&self) -> Duration {
        Duration::from_millis(self.resource_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self
            .retry_backoff_ms
            .saturating_mul(2u64.saturating_pow(exp));
        Duration::from_millis(delay.min(self.retry_backoff_max_ms))
    }
}

/// Counters kept by the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    /// Tasks accepted by `submit_task`.
    pub tasks_created: u64,
    pub tasks_completed: u64,
    /// Tasks that ran out of retries.
    pub tasks_failed: u64,
    /// Failed attempts sent back for another try.
    pub tasks_retried: u64,
    pub tasks_cancelled: u64,
    /// Tasks stranded behind a failed or cancelled dependency.
    pub tasks_blocked: u64,
    /// Running average over completed tasks.
    pub average_duration_ms: f64,
    /// Fraction of agent slots held, sampled when the status is read.
    pub resource_utilization: f64,
    /// Dependency cycles detected.
    pub dependency_violations: u64,
    /// Dispatch attempts that found no capable agent.
    pub routing_failures: u64,
    /// Resource acquisitions that timed out.
    pub capacity_rejections: u64,
}

/// Compact view of a task for status reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub agent: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            description: task.description.clone(),
            priority: task.priority,
            status: task.status.clone(),
            agent: task.assigned_agent.clone().or_else(|| task.agent.clone()),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            last_error: task.last_error.clone(),
        }
    }
}

/// Everything `status()` reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub tasks: Vec<TaskSummary>,
    /// Task counts keyed by status label.
    pub counts: BTreeMap<String, usize>,
    pub ready_queue_depth: usize,
    /// Tasks holding an agent slot.
    pub in_flight: usize,
    /// Ready tasks waiting for a capable agent to appear.
    pub unroutable: usize,
    pub metrics: SchedulerMetrics,
    pub resources: PoolSnapshot,
    pub agents: Option<DirectorySnapshot>,
}

/// Capacity charged to a dispatched task.
#[derive(Debug, Clone)]
struct Lease {
    agent: String,
    resources: Vec<String>,
    resources_held: bool,
    /// Whether the agent directory was charged one unit of load.
    tracked: bool,
}

#[derive(Debug, Default)]
struct SchedulerState {
    tasks: TaskQueue,
    graph: DependencyGraph,
    leases: HashMap<TaskId, Lease>,
    deferred: Vec<TaskId>,
    metrics: SchedulerMetrics,
}

impl SchedulerState {
    /// Block every non-terminal task downstream of `root`.
    fn block_dependents(&mut self, root: TaskId, events: &mut Vec<TaskEvent>) {
        for dependent in self.graph.dependents_transitive(root) {
            let open = self
                .tasks
                .get(dependent)
                .is_some_and(|t| !t.status.is_terminal());
            if open && !self.leases.contains_key(&dependent) {
                self.tasks.mark_blocked(dependent, root);
                self.metrics.tasks_blocked += 1;
                warn!(task_id = %dependent, by = %root, "Task blocked by upstream failure");
                events.push(TaskEvent::Blocked {
                    task_id: dependent,
                    by: root,
                });
            }
        }
    }

    fn dead_dependency(&self, id: TaskId) -> Option<TaskId> {
        self.tasks.get(id).and_then(|task| {
            task.dependencies.iter().copied().find(|dep| {
                self.tasks
                    .get(*dep)
                    .is_some_and(|t| t.status.is_dead_end())
            })
        })
    }

    /// Re-evaluate a task's state after its edges changed.
    fn refresh_readiness(&mut self, id: TaskId, events: &mut Vec<TaskEvent>) {
        let Some(status) = self.tasks.get(id).map(|t| t.status.clone()) else {
            return;
        };
        if self.leases.contains_key(&id) {
            return;
        }
        match status {
            TaskStatus::Pending | TaskStatus::Ready => {
                if let Some(by) = self.dead_dependency(id) {
                    self.tasks.mark_blocked(id, by);
                    self.metrics.tasks_blocked += 1;
                    events.push(TaskEvent::Blocked { task_id: id, by });
                } else if status == TaskStatus::Pending && self.graph.is_ready(id) {
                    self.tasks.mark_ready(id);
                    events.push(TaskEvent::Ready { task_id: id });
                } else if status == TaskStatus::Ready && !self.graph.is_ready(id) {
                    self.tasks.mark_pending(id);
                }
            }
            _ => {}
        }
    }

    fn unlink(&mut self, task: TaskId, depends_on: TaskId) {
        self.graph.remove_dependency(task, depends_on);
        if let Some(t) = self.tasks.get_mut(task) {
            t.dependencies.retain(|d| *d != depends_on);
        }
    }

    fn link(
        &mut self,
        task: TaskId,
        depends_on: TaskId,
        policy: CyclePolicy,
        events: &mut Vec<TaskEvent>,
    ) -> HiveResult<()> {
        if task == depends_on {
            return Err(HiveError::Topology(format!(
                "task {task} cannot depend on itself"
            )));
        }
        let status = self
            .tasks
            .get(task)
            .map(|t| t.status.clone())
            .ok_or_else(|| HiveError::NotFound(format!("task {task}")))?;
        if !self.tasks.contains(depends_on) {
            return Err(HiveError::NotFound(format!("task {depends_on}")));
        }
        if !matches!(status, TaskStatus::Pending | TaskStatus::Ready)
            || self.leases.contains_key(&task)
        {
            return Err(HiveError::Topology(format!(
                "task {task} is already {status}; dependencies can no longer change"
            )));
        }

        // Only an edge that closes a cycle needs the full scan.
        let closes_cycle = self.graph.would_close_cycle(task, depends_on);
        self.graph.add_dependency(task, depends_on);
        if let Some(t) = self.tasks.get_mut(task) {
            if !t.dependencies.contains(&depends_on) {
                t.dependencies.push(depends_on);
                t.dependencies.sort();
            }
        }

        let mut touched = vec![task];
        if closes_cycle {
            while let Some(cycle) = self.graph.detect_cycles().into_iter().next() {
                self.metrics.dependency_violations += 1;
                let (Some(&first), Some(&last)) = (cycle.first(), cycle.last()) else {
                    break;
                };
                match policy {
                    CyclePolicy::Reject => {
                        self.unlink(task, depends_on);
                        warn!(
                            task_id = %task,
                            depends_on = %depends_on,
                            cycle_len = cycle.len(),
                            "Dependency rejected: it would create a cycle"
                        );
                        return Err(HiveError::Topology(format!(
                            "dependency {task} -> {depends_on} closes a cycle of {} tasks",
                            cycle.len()
                        )));
                    }
                    CyclePolicy::BreakLastEdge => {
                        warn!(
                            task_id = %last,
                            depends_on = %first,
                            cycle_len = cycle.len(),
                            "Dependency cycle detected, dropping its last edge"
                        );
                        self.unlink(last, first);
                        touched.push(last);
                    }
                }
            }
        }

        for id in touched {
            self.refresh_readiness(id, events);
        }
        Ok(())
    }
}

enum DispatchStep {
    Dispatched,
    Deferred,
    Backoff,
    Idle,
}

struct Inner {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    pool: Arc<ResourcePool>,
    directory: Option<Arc<AgentDirectory>>,
    backend: Arc<dyn ExecutionBackend>,
    events: broadcast::Sender<TaskEvent>,
    /// Signals the dispatch loop that new work may be ready.
    wake: Notify,
    /// Signals `wait_idle` that a task reached a terminal state.
    settled: Notify,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Inner {
    fn emit(&self, events: Vec<TaskEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        info!(backend = %self.backend.name(), "Dispatch loop started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.dispatch_next() {
                DispatchStep::Dispatched | DispatchStep::Deferred => {
                    tokio::task::yield_now().await;
                }
                DispatchStep::Backoff => {
                    let backoff = Duration::from_millis(self.config.dispatch_backoff_ms);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.pool.wait_for_release(backoff) => {}
                    }
                }
                DispatchStep::Idle => {
                    let poll = Duration::from_millis(self.config.idle_poll_ms);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(poll) => {}
                    }
                    self.requeue_deferred();
                }
            }
        }
        info!("Dispatch loop stopped");
    }

    /// Pop one ready task and try to hand it to an agent.
    fn dispatch_next(self: &Arc<Self>) -> DispatchStep {
        let popped = {
            let mut state = self.state.lock();
            state.tasks.pop_ready().and_then(|id| {
                state
                    .tasks
                    .get(id)
                    .map(|t| (id, t.agent.clone(), t.requirements.clone()))
            })
        };
        let Some((id, owner, requirements)) = popped else {
            return DispatchStep::Idle;
        };

        let agent = owner.or_else(|| {
            self.directory
                .as_ref()
                .and_then(|d| d.find_best_agent(&requirements, self.config.strategy))
        });
        let Some(agent) = agent else {
            self.defer_unroutable(id, "no capable agent");
            return DispatchStep::Deferred;
        };

        if !self.pool.acquire_agent_slot(&agent) {
            self.state.lock().tasks.requeue(id);
            debug!(task_id = %id, agent = %agent, "No agent slot free, backing off");
            return DispatchStep::Backoff;
        }

        let tracked = match self.charge_agent(&agent, id) {
            Ok(tracked) => tracked,
            Err(HiveError::Capacity(reason)) => {
                self.pool.release_agent_slot(&agent);
                self.state.lock().tasks.requeue(id);
                debug!(task_id = %id, agent = %agent, reason = %reason, "Agent busy, backing off");
                return DispatchStep::Backoff;
            }
            Err(e) => {
                self.pool.release_agent_slot(&agent);
                self.defer_unroutable(id, &e.to_string());
                return DispatchStep::Deferred;
            }
        };

        let leased = {
            let mut state = self.state.lock();
            let resources = state
                .tasks
                .get(id)
                .filter(|t| t.status == TaskStatus::Ready)
                .map(|t| t.resources.clone());
            match resources {
                Some(resources) => {
                    state.leases.insert(
                        id,
                        Lease {
                            agent: agent.clone(),
                            resources,
                            resources_held: false,
                            tracked,
                        },
                    );
                    true
                }
                None => false,
            }
        };
        if !leased {
            // Cancelled between pop and lease.
            self.pool.release_agent_slot(&agent);
            if tracked {
                if let Some(directory) = &self.directory {
                    directory.release_task(&agent);
                }
            }
            return DispatchStep::Dispatched;
        }

        debug!(task_id = %id, agent = %agent, "Task dispatched");
        let inner = Arc::clone(self);
        self.tracker.spawn(async move { inner.run_task(id, agent).await });
        DispatchStep::Dispatched
    }

    /// Charge the directory for an agent it knows about.
    fn charge_agent(&self, agent: &str, id: TaskId) -> HiveResult<bool> {
        match &self.directory {
            Some(directory) if directory.contains(agent) => {
                directory.assign_task(agent, Some(id)).map(|()| true)
            }
            _ => Ok(false),
        }
    }

    fn defer_unroutable(&self, id: TaskId, reason: &str) {
        let mut state = self.state.lock();
        state.metrics.routing_failures += 1;
        state.deferred.push(id);
        warn!(task_id = %id, reason = %reason, "Routing failure, task deferred");
    }

    fn requeue_deferred(&self) {
        let mut state = self.state.lock();
        let deferred = std::mem::take(&mut state.deferred);
        for id in deferred {
            state.tasks.requeue(id);
        }
    }

    /// Give back everything a lease holds.
    fn release_lease(&self, lease: &Lease, outcome: Option<(bool, Duration)>) {
        if lease.resources_held {
            self.pool.release_resources(&lease.agent, &lease.resources);
        }
        self.pool.release_agent_slot(&lease.agent);
        if !lease.tracked {
            return;
        }
        if let Some(directory) = &self.directory {
            match outcome {
                Some((success, elapsed)) => {
                    if let Err(e) = directory.complete_task(&lease.agent, success, elapsed) {
                        debug!(agent = %lease.agent, error = %e, "Agent left before task finished");
                    }
                }
                None => directory.release_task(&lease.agent),
            }
        }
    }

    async fn run_task(self: Arc<Self>, id: TaskId, agent: String) {
        let resources = match self.state.lock().leases.get(&id) {
            Some(lease) => lease.resources.clone(),
            None => return,
        };

        if !resources.is_empty() {
            let acquired = tokio::select! {
                _ = self.cancel.cancelled() => {
                    Err(HiveError::Cancelled("coordinator shutting down".into()))
                }
                result = self.pool.acquire_resources(
                    &agent,
                    &resources,
                    self.config.resource_timeout(),
                ) => result,
            };
            if let Err(e) = acquired {
                self.return_to_queue(id, &e);
                return;
            }
        }

        let request = {
            let mut state = self.state.lock();
            let leased = match state.leases.get_mut(&id) {
                Some(lease) => {
                    lease.resources_held = true;
                    true
                }
                None => false,
            };
            if leased {
                state.tasks.mark_running(id, &agent);
                state.tasks.get(id).map(|t| ExecutionRequest {
                    task_id: id,
                    agent: agent.clone(),
                    description: t.description.clone(),
                    model: t.model.clone(),
                    attempt: t.retry_count,
                })
            } else {
                None
            }
        };
        let Some(request) = request else {
            // Cancelled while waiting for resources.
            self.pool.release_resources(&agent, &resources);
            return;
        };

        info!(task_id = %id, agent = %agent, attempt = request.attempt, "Task started");
        self.emit(vec![TaskEvent::Started {
            task_id: id,
            agent: agent.clone(),
        }]);

        let started = Instant::now();
        let result: HiveResult<ExecutionOutcome> = match tokio::time::timeout(
            self.config.task_timeout(),
            self.backend.execute(&request),
        )
        .await
        {
            Ok(Ok(outcome)) if outcome.success => Ok(outcome),
            Ok(Ok(outcome)) => Err(HiveError::Execution(outcome.output)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(HiveError::Timeout(format!(
                "task ran past {}s",
                self.config.task_timeout_secs
            ))),
        };
        let elapsed = match &result {
            Ok(outcome) => outcome.duration,
            Err(_) => started.elapsed(),
        };

        let lease = self.state.lock().leases.remove(&id);
        let Some(lease) = lease else {
            debug!(task_id = %id, "Discarding result of cancelled task");
            return;
        };
        self.release_lease(&lease, Some((result.is_ok(), elapsed)));

        match result {
            Ok(_) => self.finish_success(id, &agent, elapsed),
            Err(e) => self.finish_failure(id, &agent, e),
        }
    }

    /// Resource wait failed: drop the lease and put the task back.
    fn return_to_queue(&self, id: TaskId, error: &HiveError) {
        let lease = {
            let mut state = self.state.lock();
            if matches!(error, HiveError::Timeout(_)) {
                state.metrics.capacity_rejections += 1;
            }
            let lease = state.leases.remove(&id);
            if lease.is_some() {
                state.tasks.requeue(id);
            }
            lease
        };
        if let Some(lease) = lease {
            warn!(task_id = %id, agent = %lease.agent, error = %error, "Resources unavailable, task re-queued");
            self.release_lease(&lease, None);
        }
        self.wake.notify_one();
    }

    fn finish_success(&self, id: TaskId, agent: &str, elapsed: Duration) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if !state
                .tasks
                .get(id)
                .is_some_and(|t| t.status == TaskStatus::Running)
            {
                return;
            }
            state.tasks.mark_completed(id);

            let metrics = &mut state.metrics;
            metrics.tasks_completed += 1;
            let ms = elapsed.as_secs_f64() * 1000.0;
            metrics.average_duration_ms +=
                (ms - metrics.average_duration_ms) / metrics.tasks_completed as f64;

            events.push(TaskEvent::Completed {
                task_id: id,
                agent: agent.to_string(),
                duration_ms: elapsed.as_millis() as u64,
            });
            for dependent in state.graph.mark_completed(id) {
                let pending = state
                    .tasks
                    .get(dependent)
                    .is_some_and(|t| t.status == TaskStatus::Pending);
                if pending && state.tasks.mark_ready(dependent) {
                    events.push(TaskEvent::Ready { task_id: dependent });
                }
            }
        }

        info!(
            task_id = %id,
            agent = %agent,
            duration_ms = elapsed.as_millis() as u64,
            unlocked = events.len() - 1,
            "Task completed"
        );
        self.emit(events);
        self.wake.notify_one();
        self.settled.notify_waiters();
    }

    fn finish_failure(self: &Arc<Self>, id: TaskId, agent: &str, error: HiveError) {
        let mut events = Vec::new();
        let mut retry_in = None;
        {
            let mut state = self.state.lock();
            let Some(task) = state.tasks.get_mut(id) else {
                return;
            };
            if task.status != TaskStatus::Running {
                return;
            }
            task.retry_count += 1;
            task.last_error = Some(error.to_string());
            let attempt = task.retry_count;

            if error.is_retryable() && attempt < task.max_retries {
                // Ready but off the queue until the backoff elapses.
                task.status = TaskStatus::Ready;
                state.metrics.tasks_retried += 1;
                let delay = self.config.retry_backoff(attempt);
                warn!(
                    task_id = %id,
                    agent = %agent,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Task failed, retrying"
                );
                events.push(TaskEvent::Retrying {
                    task_id: id,
                    attempt,
                    error: error.to_string(),
                });
                retry_in = Some(delay);
            } else {
                state.tasks.mark_failed(id, error.to_string());
                state.metrics.tasks_failed += 1;
                error!(task_id = %id, agent = %agent, attempts = attempt, error = %error, "Task failed");
                events.push(TaskEvent::Failed {
                    task_id: id,
                    reason: error.to_string(),
                });
                state.block_dependents(id, &mut events);
            }
        }

        self.emit(events);
        match retry_in {
            Some(delay) => {
                let inner = Arc::clone(self);
                self.tracker.spawn(async move {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if inner.state.lock().tasks.requeue(id) {
                        inner.wake.notify_one();
                    }
                });
            }
            None => self.settled.notify_waiters(),
        }
    }
}

/// Owns every task record and drives them through their lifecycle.
///
/// All task, graph and lease state lives behind one lock that is only held
/// for short critical sections; backend calls and resource waits happen
/// outside it. Ready tasks are dispatched by a background loop started with
/// [`start`](Self::start), and each dispatched task runs in its own spawned
/// future so a slow task never stalls the loop.
pub struct Coordinator {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Build a coordinator. Without a directory, every task must name its
    /// owning agent.
    pub fn new(
        config: SchedulerConfig,
        pool: Arc<ResourcePool>,
        backend: Arc<dyn ExecutionBackend>,
        directory: Option<Arc<AgentDirectory>>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(SchedulerState::default()),
                pool,
                directory,
                backend,
                events,
                wake: Notify::new(),
                settled: Notify::new(),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Settings this coordinator was built with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// The shared slot and resource pool.
    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.inner.pool
    }

    /// Directory used to pick agents for unowned tasks, if any.
    pub fn directory(&self) -> Option<&Arc<AgentDirectory>> {
        self.inner.directory.as_ref()
    }

    /// Register a task.
    ///
    /// Every dependency must already be known. A task whose dependencies are
    /// all complete goes straight to Ready; one that depends on a failed or
    /// cancelled task is Blocked immediately.
    pub fn submit_task(&self, request: TaskRequest) -> HiveResult<TaskId> {
        let task = Task::from_request(request, self.inner.config.max_retries);
        let id = task.id;
        let priority = task.priority;
        let mut events = vec![TaskEvent::Submitted { task_id: id }];

        {
            let mut state = self.inner.state.lock();
            if let Some(unknown) = task
                .dependencies
                .iter()
                .find(|d| !state.tasks.contains(**d) && !state.graph.is_completed(**d))
            {
                return Err(HiveError::Topology(format!(
                    "task depends on unknown task {unknown}"
                )));
            }
            for dep in &task.dependencies {
                state.graph.add_dependency(id, *dep);
            }
            state.tasks.add(task);
            state.metrics.tasks_created += 1;
            state.refresh_readiness(id, &mut events);
        }

        info!(task_id = %id, priority = %priority, "Task submitted");
        self.inner.emit(events);
        self.inner.wake.notify_one();
        self.inner.settled.notify_waiters();
        Ok(id)
    }

    /// Add an edge after submission. Cycles are handled per the configured
    /// [`CyclePolicy`].
    pub fn add_dependency(&self, task: TaskId, depends_on: TaskId) -> HiveResult<()> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.inner.state.lock();
            state.link(task, depends_on, self.inner.config.cycle_policy, &mut events)
        };
        self.inner.emit(events);
        self.inner.wake.notify_one();
        self.inner.settled.notify_waiters();
        result
    }

    /// Stop a task and give back its slot and resources.
    ///
    /// An in-flight backend call keeps running; its result is discarded.
    /// Downstream tasks become Blocked. Cancelling a finished task is a no-op.
    pub fn cancel_task(&self, id: TaskId) -> HiveResult<()> {
        let mut events = Vec::new();
        let lease = {
            let mut state = self.inner.state.lock();
            let status = state
                .tasks
                .get(id)
                .map(|t| t.status.clone())
                .ok_or_else(|| HiveError::NotFound(format!("task {id}")))?;
            if status.is_terminal() {
                debug!(task_id = %id, status = %status, "Cancel ignored for finished task");
                return Ok(());
            }
            state.tasks.mark_cancelled(id);
            state.metrics.tasks_cancelled += 1;
            state.deferred.retain(|d| *d != id);
            events.push(TaskEvent::Cancelled { task_id: id });
            state.block_dependents(id, &mut events);
            state.leases.remove(&id)
        };

        if let Some(lease) = &lease {
            self.inner.release_lease(lease, None);
        }
        info!(task_id = %id, released = lease.is_some(), "Task cancelled");
        self.inner.emit(events);
        self.inner.wake.notify_one();
        self.inner.settled.notify_waiters();
        Ok(())
    }

    /// Snapshot of one task.
    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.inner.state.lock().tasks.get(id).cloned()
    }

    /// Current counters, with resource utilization sampled now.
    pub fn metrics(&self) -> SchedulerMetrics {
        let mut metrics = self.inner.state.lock().metrics.clone();
        metrics.resource_utilization = self.inner.pool.utilization();
        metrics
    }

    pub fn status(&self) -> CoordinatorStatus {
        let state = self.inner.state.lock();
        let tasks: Vec<TaskSummary> = state
            .tasks
            .all_tasks()
            .into_iter()
            .map(TaskSummary::from)
            .collect();
        let counts: BTreeMap<String, usize> = state
            .tasks
            .status_counts()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let ready_queue_depth = state.tasks.ready_len();
        let in_flight = state.leases.len();
        let unroutable = state.deferred.len();
        let mut metrics = state.metrics.clone();
        drop(state);

        metrics.resource_utilization = self.inner.pool.utilization();
        CoordinatorStatus {
            tasks,
            counts,
            ready_queue_depth,
            in_flight,
            unroutable,
            metrics,
            resources: self.inner.pool.snapshot(),
            agents: self.inner.directory.as_ref().map(|d| d.snapshot()),
        }
    }

    /// Status as JSON.
    pub fn to_json(&self) -> HiveResult<serde_json::Value> {
        Ok(serde_json::to_value(self.status())?)
    }

    /// Receive task lifecycle events from now on. A slow receiver lags and
    /// loses the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until every known task is terminal. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.state.lock().tasks.is_done() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Spawn the dispatch loop. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() || self.inner.cancel.is_cancelled() {
            warn!("Coordinator already started or shut down");
            return;
        }
        let inner = Arc::clone(&self.inner);
        *handle = Some(tokio::spawn(inner.dispatch_loop()));
        info!(
            max_concurrent_agents = self.inner.pool.config().max_concurrent_agents,
            "Coordinator started"
        );
    }

    /// Stop dispatching and wait for in-flight executions, up to the
    /// configured grace period.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatch loop terminated abnormally");
            }
        }

        self.inner.tracker.close();
        let grace = Duration::from_secs(self.inner.config.shutdown_grace_secs);
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.inner.tracker.len(),
                "Executions still running after shutdown grace period"
            );
        }
        info!("Coordinator stopped");
    }
}
