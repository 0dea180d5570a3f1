use crate::capability::AgentCapability;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

/// What a task needs from the agent that runs it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequirements {
    /// Matched against an agent's role or expertise tags.
    #[serde(default)]
    pub task_type: Option<String>,
    /// Expertise tags that raise an agent's score when covered.
    #[serde(default)]
    pub expertise: Vec<String>,
}

impl TaskRequirements {
    pub fn new(task_type: Option<String>, expertise: Vec<String>) -> Self {
        Self {
            task_type,
            expertise,
        }
    }
}

/// Picks one agent from a pool of candidates.
///
/// Candidates are pre-filtered by the directory to agents able to take the
/// task and are passed sorted by name, so ties resolve deterministically to
/// the earliest name.
pub trait AgentSelector {
    fn select<'a>(
        &self,
        pool: &[&'a AgentCapability],
        requirements: &TaskRequirements,
    ) -> Option<&'a AgentCapability>;
}

/// Serializable strategy name used in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RoundRobin,
    LeastLoaded,
    BestFit,
    #[default]
    PerformanceBased,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::RoundRobin => write!(f, "round_robin"),
            StrategyKind::LeastLoaded => write!(f, "least_loaded"),
            StrategyKind::BestFit => write!(f, "best_fit"),
            StrategyKind::PerformanceBased => write!(f, "performance_based"),
        }
    }
}

/// Cycles through the pool with a shared counter.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl AgentSelector for RoundRobin {
    fn select<'a>(
        &self,
        pool: &[&'a AgentCapability],
        _requirements: &TaskRequirements,
    ) -> Option<&'a AgentCapability> {
        if pool.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, AtomicOrdering::Relaxed) % pool.len();
        Some(pool[idx])
    }
}

/// Lowest current load wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoaded;

impl AgentSelector for LeastLoaded {
    fn select<'a>(
        &self,
        pool: &[&'a AgentCapability],
        _requirements: &TaskRequirements,
    ) -> Option<&'a AgentCapability> {
        pool.iter().copied().min_by_key(|a| a.current_load)
    }
}

/// Highest expertise overlap wins; ties go to the lower load.
#[derive(Debug, Default, Clone, Copy)]
pub struct BestFit;

impl AgentSelector for BestFit {
    fn select<'a>(
        &self,
        pool: &[&'a AgentCapability],
        requirements: &TaskRequirements,
    ) -> Option<&'a AgentCapability> {
        pool.iter().copied().min_by(|a, b| {
            let oa = a.expertise_overlap(&requirements.expertise);
            let ob = b.expertise_overlap(&requirements.expertise);
            ob.partial_cmp(&oa)
                .unwrap_or(Ordering::Equal)
                .then(a.current_load.cmp(&b.current_load))
        })
    }
}

/// Highest suitability score wins. Agents scoring zero are never picked.
#[derive(Debug, Default, Clone, Copy)]
pub struct PerformanceBased;

impl PerformanceBased {
    pub(crate) fn select_at<'a>(
        now: DateTime<Utc>,
        pool: &[&'a AgentCapability],
        requirements: &TaskRequirements,
    ) -> Option<&'a AgentCapability> {
        let task_type = requirements.task_type.as_deref();
        pool.iter()
            .copied()
            .map(|a| (a, a.suitability_at(now, task_type, &requirements.expertise)))
            .filter(|(_, score)| *score > 0.0)
            .min_by(|(_, sa), (_, sb)| sb.partial_cmp(sa).unwrap_or(Ordering::Equal))
            .map(|(a, _)| a)
    }
}

impl AgentSelector for PerformanceBased {
    fn select<'a>(
        &self,
        pool: &[&'a AgentCapability],
        requirements: &TaskRequirements,
    ) -> Option<&'a AgentCapability> {
        Self::select_at(Utc::now(), pool, requirements)
    }
}

/// Enum-dispatched selection strategy.
#[derive(Debug)]
pub enum SelectionStrategy {
    RoundRobin(RoundRobin),
    LeastLoaded(LeastLoaded),
    BestFit(BestFit),
    PerformanceBased(PerformanceBased),
}

impl SelectionStrategy {
    pub fn new(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::RoundRobin => SelectionStrategy::RoundRobin(RoundRobin::default()),
            StrategyKind::LeastLoaded => SelectionStrategy::LeastLoaded(LeastLoaded),
            StrategyKind::BestFit => SelectionStrategy::BestFit(BestFit),
            StrategyKind::PerformanceBased => {
                SelectionStrategy::PerformanceBased(PerformanceBased)
            }
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            SelectionStrategy::RoundRobin(_) => StrategyKind::RoundRobin,
            SelectionStrategy::LeastLoaded(_) => StrategyKind::LeastLoaded,
            SelectionStrategy::BestFit(_) => StrategyKind::BestFit,
            SelectionStrategy::PerformanceBased(_) => StrategyKind::PerformanceBased,
        }
    }
}

impl AgentSelector for SelectionStrategy {
    fn select<'a>(
        &self,
        pool: &[&'a AgentCapability],
        requirements: &TaskRequirements,
    ) -> Option<&'a AgentCapability> {
        match self {
            SelectionStrategy::RoundRobin(s) => s.select(pool, requirements),
            SelectionStrategy::LeastLoaded(s) => s.select(pool, requirements),
            SelectionStrategy::BestFit(s) => s.select(pool, requirements),
            SelectionStrategy::PerformanceBased(s) => s.select(pool, requirements),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn make(name: &str, expertise: &[&str], load: u32) -> AgentCapability {
        let mut a = AgentCapability::new(name, "worker", expertise.iter().copied()).with_max_load(5);
        a.current_load = load;
        a
    }

    #[test]
    fn test_round_robin_cycles() {
        let a = make("a", &[], 0);
        let b = make("b", &[], 0);
        let pool = vec![&a, &b];
        let rr = SelectionStrategy::new(StrategyKind::RoundRobin);
        let req = TaskRequirements::default();
        let picks: Vec<&str> = (0..4)
            .map(|_| rr.select(&pool, &req).unwrap().name.as_str())
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_least_loaded() {
        let a = make("a", &[], 3);
        let b = make("b", &[], 1);
        let c = make("c", &[], 1);
        let pool = vec![&a, &b, &c];
        let picked = LeastLoaded.select(&pool, &TaskRequirements::default()).unwrap();
        assert_eq!(picked.name, "b");
    }

    #[test]
    fn test_best_fit_prefers_overlap_then_load() {
        let a = make("a", &["rust"], 0);
        let b = make("b", &["rust", "sql"], 2);
        let c = make("c", &["rust", "sql"], 1);
        let pool = vec![&a, &b, &c];
        let req = TaskRequirements::new(None, vec!["rust".into(), "sql".into()]);
        assert_eq!(BestFit.select(&pool, &req).unwrap().name, "c");
    }

    #[test]
    fn test_performance_based_skips_zero_scores() {
        let mut a = make("a", &[], 0);
        a.status = crate::AgentStatus::Offline;
        let pool = vec![&a];
        assert!(PerformanceBased
            .select(&pool, &TaskRequirements::default())
            .is_none());
    }

    #[test]
    fn test_performance_based_prefers_expertise() {
        let a = make("a", &[], 0);
        let b = make("b", &["rust"], 0);
        let pool = vec![&a, &b];
        let req = TaskRequirements::new(None, vec!["rust".into()]);
        assert_eq!(PerformanceBased.select(&pool, &req).unwrap().name, "b");
    }

    #[test]
    fn test_empty_pool() {
        let req = TaskRequirements::default();
        for kind in [
            StrategyKind::RoundRobin,
            StrategyKind::LeastLoaded,
            StrategyKind::BestFit,
            StrategyKind::PerformanceBased,
        ] {
            assert!(SelectionStrategy::new(kind).select(&[], &req).is_none());
            assert_eq!(SelectionStrategy::new(kind).kind(), kind);
        }
    }

    #[test]
    fn test_strategy_kind_serde() {
        let kind: StrategyKind = serde_json::from_str("\"least_loaded\"").unwrap();
        assert_eq!(kind, StrategyKind::LeastLoaded);
        assert_eq!(StrategyKind::default(), StrategyKind::PerformanceBased);
    }
}
