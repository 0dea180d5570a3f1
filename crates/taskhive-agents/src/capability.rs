use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;
use taskhive_core::TaskId;

/// Number of recent response times kept for the performance adjustment.
pub const RESPONSE_WINDOW: usize = 20;
/// Number of finished tasks kept per agent.
pub const HISTORY_LIMIT: usize = 100;

const PERFORMANCE_CAP: f64 = 2.0;
const PERFORMANCE_FLOOR: f64 = 0.1;
const FAST_RESPONSE_SECS: f64 = 1.0;
const SLOW_RESPONSE_SECS: f64 = 5.0;

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Working,
    Stuck,
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Working => write!(f, "working"),
            AgentStatus::Stuck => write!(f, "stuck"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// One finished unit of work in an agent's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Option<TaskId>,
    pub success: bool,
    pub response_time_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// Capability, load and performance record for a single agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapability {
    pub name: String,
    pub role: String,
    pub expertise: BTreeSet<String>,
    pub current_load: u32,
    pub max_load: u32,
    /// Multiplicative performance score in `0.1..=2.0`.
    pub performance_score: f64,
    /// Exponential moving average of task outcomes in `0.0..=1.0`.
    pub success_rate: f64,
    pub status: AgentStatus,
    /// Recent response times in seconds, oldest first.
    pub response_times: VecDeque<f64>,
    pub task_history: VecDeque<TaskRecord>,
    pub current_task: Option<TaskId>,
    pub last_active: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl AgentCapability {
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        expertise: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            role: role.into(),
            expertise: expertise
                .into_iter()
                .map(|e| Into::<String>::into(e).to_lowercase())
                .collect(),
            current_load: 0,
            max_load: 1,
            performance_score: 1.0,
            success_rate: 1.0,
            status: AgentStatus::Idle,
            response_times: VecDeque::with_capacity(RESPONSE_WINDOW),
            task_history: VecDeque::new(),
            current_task: None,
            last_active: now,
            registered_at: now,
        }
    }

    /// Set the maximum concurrent load. Values below one are raised to one.
    pub fn with_max_load(mut self, max_load: u32) -> Self {
        self.max_load = max_load.max(1);
        self
    }

    /// Whether the agent can take another task right now.
    pub fn is_available(&self) -> bool {
        self.status != AgentStatus::Offline && self.current_load < self.max_load
    }

    /// Whether the agent may be considered for a task of the given type.
    ///
    /// A task type matches the agent's role or one of its expertise tags
    /// (case-insensitive). No task type matches every available agent.
    pub fn can_handle(&self, task_type: Option<&str>) -> bool {
        if !self.is_available() {
            return false;
        }
        match task_type {
            None => true,
            Some(t) => {
                let t = t.to_lowercase();
                self.role.to_lowercase() == t || self.expertise.contains(&t)
            }
        }
    }

    /// Fraction of the required expertise this agent covers.
    pub fn expertise_overlap(&self, required: &[String]) -> f64 {
        if required.is_empty() {
            return 0.0;
        }
        let matched = required
            .iter()
            .filter(|r| self.expertise.contains(&r.to_lowercase()))
            .count();
        matched as f64 / required.len() as f64
    }

    /// Composite score ranking this agent for a task, evaluated now.
    pub fn suitability(&self, task_type: Option<&str>, required: &[String]) -> f64 {
        self.suitability_at(Utc::now(), task_type, required)
    }

    /// Composite score ranking this agent for a task at `now`.
    ///
    /// Zero when offline or at max load. Otherwise
    /// `performance × success_rate`, scaled by `1 + overlap` when expertise
    /// is required, by the load penalty `1 − load/max_load`, and by a
    /// recency factor (×1.2 active within five minutes, ×0.8 idle over an
    /// hour).
    pub fn suitability_at(
        &self,
        now: DateTime<Utc>,
        task_type: Option<&str>,
        required: &[String],
    ) -> f64 {
        if !self.can_handle(task_type) {
            return 0.0;
        }

        let mut score = self.performance_score * self.success_rate;

        if !required.is_empty() {
            score *= 1.0 + self.expertise_overlap(required);
        }

        let load_ratio = f64::from(self.current_load) / f64::from(self.max_load);
        score *= 1.0 - load_ratio;

        let idle = now - self.last_active;
        if idle < ChronoDuration::minutes(5) {
            score *= 1.2;
        } else if idle > ChronoDuration::hours(1) {
            score *= 0.8;
        }

        score
    }

    /// Mean of the response-time window, in seconds.
    pub fn average_response_time(&self) -> Option<f64> {
        if self.response_times.is_empty() {
            return None;
        }
        Some(self.response_times.iter().sum::<f64>() / self.response_times.len() as f64)
    }

    /// Take one unit of load.
    pub fn assign(&mut self, task_id: Option<TaskId>) {
        self.current_load = self.current_load.saturating_add(1);
        self.current_task = task_id.or(self.current_task);
        self.status = AgentStatus::Working;
        self.last_active = Utc::now();
    }

    /// Give back one unit of load without scoring the outcome.
    pub fn release(&mut self) {
        self.current_load = self.current_load.saturating_sub(1);
        if self.current_load == 0 {
            self.current_task = None;
            if self.status != AgentStatus::Offline {
                self.status = AgentStatus::Idle;
            }
        }
    }

    /// Fold a finished task into the moving averages and release its load.
    pub fn record_completion(&mut self, success: bool, response_time: Duration) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = 0.9 * self.success_rate + 0.1 * outcome;

        let secs = response_time.as_secs_f64();
        if self.response_times.len() == RESPONSE_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(secs);

        if let Some(avg) = self.average_response_time() {
            if avg < FAST_RESPONSE_SECS {
                self.performance_score = (self.performance_score * 1.05).min(PERFORMANCE_CAP);
            } else if avg > SLOW_RESPONSE_SECS {
                self.performance_score = (self.performance_score * 0.95).max(PERFORMANCE_FLOOR);
            }
        }

        if self.task_history.len() == HISTORY_LIMIT {
            self.task_history.pop_front();
        }
        self.task_history.push_back(TaskRecord {
            task_id: self.current_task,
            success,
            response_time_ms: response_time.as_millis() as u64,
            finished_at: Utc::now(),
        });

        self.last_active = Utc::now();
        self.release();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn agent() -> AgentCapability {
        AgentCapability::new("alice", "coder", ["rust", "sql"]).with_max_load(4)
    }

    #[test]
    fn test_new_defaults() {
        let a = agent();
        assert_eq!(a.status, AgentStatus::Idle);
        assert_eq!(a.current_load, 0);
        assert_eq!(a.max_load, 4);
        assert!((a.performance_score - 1.0).abs() < f64::EPSILON);
        assert!(a.expertise.contains("rust"));
    }

    #[test]
    fn test_max_load_floor() {
        let a = AgentCapability::new("x", "r", Vec::<String>::new()).with_max_load(0);
        assert_eq!(a.max_load, 1);
    }

    #[test]
    fn test_suitability_zero_when_offline_or_full() {
        let mut a = agent();
        a.status = AgentStatus::Offline;
        assert_eq!(a.suitability(None, &[]), 0.0);

        let mut b = agent();
        b.current_load = 4;
        assert_eq!(b.suitability(None, &[]), 0.0);
    }

    #[test]
    fn test_suitability_formula() {
        let now = Utc::now();
        let mut a = agent();
        a.last_active = now;
        a.current_load = 1;
        // 1.0 * 1.0 * (1 + 0.5) * (1 - 1/4) * 1.2
        let required = vec!["rust".to_string(), "go".to_string()];
        let score = a.suitability_at(now, None, &required);
        assert!((score - 1.5 * 0.75 * 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_recency_factors() {
        let now = Utc::now();
        let mut a = agent();

        a.last_active = now - ChronoDuration::minutes(30);
        assert!((a.suitability_at(now, None, &[]) - 1.0).abs() < 1e-9);

        a.last_active = now - ChronoDuration::hours(2);
        assert!((a.suitability_at(now, None, &[]) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_can_handle_matches_role_or_expertise() {
        let a = agent();
        assert!(a.can_handle(Some("Coder")));
        assert!(a.can_handle(Some("sql")));
        assert!(!a.can_handle(Some("design")));
        assert!(a.can_handle(None));
    }

    #[test]
    fn test_success_rate_ema() {
        let mut a = agent();
        a.assign(None);
        a.record_completion(false, Duration::from_secs(2));
        assert!((a.success_rate - 0.9).abs() < 1e-9);
        a.assign(None);
        a.record_completion(true, Duration::from_secs(2));
        assert!((a.success_rate - 0.91).abs() < 1e-9);
    }

    #[test]
    fn test_performance_adjusts_with_response_time() {
        let mut fast = agent();
        fast.record_completion(true, Duration::from_millis(200));
        assert!((fast.performance_score - 1.05).abs() < 1e-9);

        let mut slow = agent();
        slow.record_completion(true, Duration::from_secs(8));
        assert!((slow.performance_score - 0.95).abs() < 1e-9);

        let mut middling = agent();
        middling.record_completion(true, Duration::from_secs(3));
        assert!((middling.performance_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_performance_bounds() {
        let mut a = agent();
        for _ in 0..100 {
            a.record_completion(true, Duration::from_millis(10));
        }
        assert!((a.performance_score - 2.0).abs() < 1e-9);

        let mut b = agent();
        for _ in 0..200 {
            b.record_completion(true, Duration::from_secs(30));
        }
        assert!((b.performance_score - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_windows_are_bounded() {
        let mut a = agent();
        for _ in 0..(HISTORY_LIMIT + 10) {
            a.record_completion(true, Duration::from_secs(2));
        }
        assert_eq!(a.response_times.len(), RESPONSE_WINDOW);
        assert_eq!(a.task_history.len(), HISTORY_LIMIT);
    }

    #[test]
    fn test_load_never_underflows() {
        let mut a = agent();
        a.record_completion(true, Duration::from_secs(1));
        assert_eq!(a.current_load, 0);
        assert_eq!(a.status, AgentStatus::Idle);
    }
}
