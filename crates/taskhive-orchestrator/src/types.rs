use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskhive_agents::TaskRequirements;
use taskhive_core::{Priority, TaskId};
use uuid::Uuid;

/// Status of a task in the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting on at least one dependency.
    Pending,
    /// Dependencies satisfied; waiting for an agent slot.
    Ready,
    /// Slot and resources granted; the backend is executing it.
    Running,
    Completed,
    /// Retries exhausted or the failure was not retryable.
    Failed { reason: String },
    /// A dependency failed or was cancelled, so this task can never run.
    Blocked { by: TaskId },
    Cancelled,
}

impl TaskStatus {
    /// Whether the task will never be scheduled again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed { .. }
                | TaskStatus::Blocked { .. }
                | TaskStatus::Cancelled
        )
    }

    /// Terminal and unsuccessful: dependents of such a task are blocked.
    pub fn is_dead_end(&self) -> bool {
        self.is_terminal() && *self != TaskStatus::Completed
    }

    /// Short lowercase label for counters and logs.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Blocked { .. } => "blocked",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// What a submitter hands to the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Owning agent. `None` lets the agent directory choose at dispatch time.
    #[serde(default)]
    pub agent: Option<String>,
    pub description: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub requirements: TaskRequirements,
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
    /// Overrides the scheduler's default retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TaskRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn for_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Tasks that must complete first. They must already be submitted.
    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_resources(mut self, resources: Vec<String>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_requirements(mut self, requirements: TaskRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A task record owned by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Owning agent requested at submission.
    pub agent: Option<String>,
    /// Agent the task was last dispatched to.
    pub assigned_agent: Option<String>,
    pub description: String,
    pub model: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub dependencies: Vec<TaskId>,
    pub resources: Vec<String>,
    pub requirements: TaskRequirements,
    pub estimated_duration_ms: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a pending task from a request, deduplicating dependencies and
    /// resource keys.
    pub fn from_request(request: TaskRequest, default_max_retries: u32) -> Self {
        let mut dependencies = request.dependencies;
        dependencies.sort();
        dependencies.dedup();
        let mut resources = request.resources;
        resources.sort();
        resources.dedup();

        Self {
            id: Uuid::new_v4(),
            agent: request.agent,
            assigned_agent: None,
            description: request.description,
            model: request.model,
            priority: request.priority,
            status: TaskStatus::Pending,
            dependencies,
            resources,
            requirements: request.requirements,
            estimated_duration_ms: request.estimated_duration_ms,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Lifecycle notifications published by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum TaskEvent {
    /// Accepted into the arena.
    Submitted { task_id: TaskId },
    /// Every dependency has completed; the task is queued for dispatch.
    Ready { task_id: TaskId },
    /// An attempt began on `agent`.
    Started { task_id: TaskId, agent: String },
    Completed { task_id: TaskId, agent: String, duration_ms: u64 },
    /// Attempt `attempt` failed and the task will run again.
    Retrying { task_id: TaskId, attempt: u32, error: String },
    /// Retries exhausted.
    Failed { task_id: TaskId, reason: String },
    /// A dependency failed or was cancelled, so this task will never run.
    Blocked { task_id: TaskId, by: TaskId },
    Cancelled { task_id: TaskId },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Submitted { task_id }
            | TaskEvent::Ready { task_id }
            | TaskEvent::Started { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Retrying { task_id, .. }
            | TaskEvent::Failed { task_id, .. }
            | TaskEvent::Blocked { task_id, .. }
            | TaskEvent::Cancelled { task_id } => *task_id,
        }
    }

    /// Notification priority when the event is forwarded as a message.
    pub fn priority(&self) -> Priority {
        match self {
            TaskEvent::Failed { .. } | TaskEvent::Blocked { .. } => Priority::High,
            TaskEvent::Completed { .. } | TaskEvent::Cancelled { .. } => Priority::Normal,
            _ => Priority::Low,
        }
    }
}
