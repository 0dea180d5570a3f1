use std::collections::{HashMap, HashSet, VecDeque};
use taskhive_core::TaskId;

/// Task dependency DAG.
///
/// Edges point from a task to the task it depends on. Forward and reverse
/// adjacency are both kept so readiness checks are a set lookup and
/// completion propagation only touches direct dependents. Completed ids are
/// never removed, so late-arriving tasks can depend on long-finished work.
///
/// The graph itself is not synchronized; the coordinator keeps it behind
/// its single arena lock.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    forward: HashMap<TaskId, HashSet<TaskId>>,
    reverse: HashMap<TaskId, HashSet<TaskId>>,
    completed: HashSet<TaskId>,
}

impl DependencyGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `task` depends on `depends_on`.
    ///
    /// Returns `false` for self-edges, which are never stored.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) -> bool {
        if task == depends_on {
            return false;
        }
        self.forward.entry(task).or_default().insert(depends_on);
        self.reverse.entry(depends_on).or_default().insert(task);
        true
    }

    /// Drop an edge. Returns whether it existed.
    pub fn remove_dependency(&mut self, task: TaskId, depends_on: TaskId) -> bool {
        let removed = self
            .forward
            .get_mut(&task)
            .is_some_and(|deps| deps.remove(&depends_on));
        if let Some(dependents) = self.reverse.get_mut(&depends_on) {
            dependents.remove(&task);
        }
        removed
    }

    /// True iff every dependency of `task` has completed.
    pub fn is_ready(&self, task: TaskId) -> bool {
        self.forward
            .get(&task)
            .map_or(true, |deps| deps.iter().all(|d| self.completed.contains(d)))
    }

    /// Whether `task` has been marked completed.
    pub fn is_completed(&self, task: TaskId) -> bool {
        self.completed.contains(&task)
    }

    /// Record completion and return dependents that just became ready.
    ///
    /// Calling this twice for the same task returns nothing the second time.
    pub fn mark_completed(&mut self, task: TaskId) -> Vec<TaskId> {
        if !self.completed.insert(task) {
            return Vec::new();
        }
        let mut ready: Vec<TaskId> = self
            .reverse
            .get(&task)
            .map(|dependents| {
                dependents
                    .iter()
                    .copied()
                    .filter(|d| !self.completed.contains(d) && self.is_ready(*d))
                    .collect()
            })
            .unwrap_or_default();
        ready.sort();
        ready
    }

    /// Direct dependencies of `task`.
    pub fn dependencies_of(&self, task: TaskId) -> Vec<TaskId> {
        let mut deps: Vec<TaskId> = self
            .forward
            .get(&task)
            .map(|d| d.iter().copied().collect())
            .unwrap_or_default();
        deps.sort();
        deps
    }

    /// Direct dependents of `task`.
    pub fn dependents_of(&self, task: TaskId) -> Vec<TaskId> {
        let mut deps: Vec<TaskId> = self
            .reverse
            .get(&task)
            .map(|d| d.iter().copied().collect())
            .unwrap_or_default();
        deps.sort();
        deps
    }

    /// Every task that transitively depends on `task`, nearest first.
    pub fn dependents_transitive(&self, task: TaskId) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([task]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(current) {
                if dependent != task && seen.insert(dependent) {
                    order.push(dependent);
                    queue.push_back(dependent);
                }
            }
        }
        order
    }

    /// Number of stored edges.
    pub fn edge_count(&self) -> usize {
        self.forward.values().map(HashSet::len).sum()
    }

    /// Number of completed tasks.
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Whether `depends_on` can already reach `task` through forward edges,
    /// i.e. whether adding `task → depends_on` would close a cycle.
    ///
    /// Only walks what `depends_on` reaches, so it is cheap to run on every
    /// new edge.
    pub fn would_close_cycle(&self, task: TaskId, depends_on: TaskId) -> bool {
        if task == depends_on {
            return true;
        }
        let mut seen = HashSet::from([depends_on]);
        let mut pending = vec![depends_on];
        while let Some(current) = pending.pop() {
            let Some(deps) = self.forward.get(&current) else {
                continue;
            };
            for &next in deps {
                if next == task {
                    return true;
                }
                if seen.insert(next) {
                    pending.push(next);
                }
            }
        }
        false
    }

    /// Find cycles with a depth-first search over forward edges.
    ///
    /// Each revisit of a node on the search path yields one cycle, listed in
    /// edge order: for `[a, b, c]` the edges are `a → b → c → a`, so the
    /// last edge is `c → a`. The search keeps its own frame stack, so chain
    /// length is bounded by memory rather than the thread stack.
    pub fn detect_cycles(&self) -> Vec<Vec<TaskId>> {
        let mut roots: Vec<TaskId> = self.forward.keys().copied().collect();
        roots.sort();

        let mut state: HashMap<TaskId, Visit> = HashMap::new();
        let mut cycles = Vec::new();
        for root in roots {
            if state.contains_key(&root) {
                continue;
            }
            // (node, its sorted dependencies, index of the next one to visit)
            let mut frames: Vec<(TaskId, Vec<TaskId>, usize)> = Vec::new();
            let mut path: Vec<TaskId> = Vec::new();
            state.insert(root, Visit::InProgress);
            path.push(root);
            frames.push((root, self.dependencies_of(root), 0));

            while let Some((node, deps, next_index)) = frames.last_mut() {
                let Some(&next) = deps.get(*next_index) else {
                    state.insert(*node, Visit::Done);
                    path.pop();
                    frames.pop();
                    continue;
                };
                *next_index += 1;
                match state.get(&next) {
                    Some(Visit::InProgress) => {
                        if let Some(pos) = path.iter().position(|n| *n == next) {
                            cycles.push(path[pos..].to_vec());
                        }
                    }
                    Some(Visit::Done) => {}
                    None => {
                        state.insert(next, Visit::InProgress);
                        path.push(next);
                        frames.push((next, self.dependencies_of(next), 0));
                    }
                }
            }
        }
        cycles
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ids(n: usize) -> Vec<TaskId> {
        let mut v: Vec<TaskId> = (0..n).map(|_| Uuid::new_v4()).collect();
        v.sort();
        v
    }

    #[test]
    fn test_self_edge_rejected() {
        let mut g = DependencyGraph::new();
        let a = Uuid::new_v4();
        assert!(!g.add_dependency(a, a));
        assert_eq!(g.edge_count(), 0);
        assert!(g.is_ready(a));
    }

    #[test]
    fn test_ready_only_after_last_dependency() {
        let mut g = DependencyGraph::new();
        let v = ids(4);
        let (t, deps) = (v[0], &v[1..]);
        for d in deps {
            g.add_dependency(t, *d);
        }
        for (i, d) in deps.iter().enumerate() {
            assert!(!g.is_ready(t));
            let newly = g.mark_completed(*d);
            if i + 1 == deps.len() {
                assert_eq!(newly, vec![t]);
            } else {
                assert!(newly.is_empty());
            }
        }
        assert!(g.is_ready(t));
    }

    #[test]
    fn test_fan_out_released_together() {
        let mut g = DependencyGraph::new();
        let v = ids(3);
        g.add_dependency(v[1], v[0]);
        g.add_dependency(v[2], v[0]);
        let mut newly = g.mark_completed(v[0]);
        newly.sort();
        assert_eq!(newly, vec![v[1], v[2]]);
        assert!(g.mark_completed(v[0]).is_empty());
    }

    #[test]
    fn test_remove_dependency() {
        let mut g = DependencyGraph::new();
        let v = ids(2);
        g.add_dependency(v[0], v[1]);
        assert!(!g.is_ready(v[0]));
        assert!(g.remove_dependency(v[0], v[1]));
        assert!(!g.remove_dependency(v[0], v[1]));
        assert!(g.is_ready(v[0]));
        assert!(g.dependents_of(v[1]).is_empty());
    }

    #[test]
    fn test_dependents_transitive() {
        let mut g = DependencyGraph::new();
        let v = ids(4);
        g.add_dependency(v[1], v[0]);
        g.add_dependency(v[2], v[1]);
        g.add_dependency(v[3], v[1]);
        let mut all = g.dependents_transitive(v[0]);
        assert_eq!(all[0], v[1]);
        all.sort();
        assert_eq!(all, vec![v[1], v[2], v[3]]);
    }

    #[test]
    fn test_no_cycle() {
        let mut g = DependencyGraph::new();
        let v = ids(3);
        g.add_dependency(v[1], v[0]);
        g.add_dependency(v[2], v[1]);
        assert!(g.detect_cycles().is_empty());
    }

    #[test]
    fn test_three_node_cycle() {
        let mut g = DependencyGraph::new();
        let v = ids(3);
        g.add_dependency(v[0], v[1]);
        g.add_dependency(v[1], v[2]);
        g.add_dependency(v[2], v[0]);

        let cycles = g.detect_cycles();
        assert_eq!(cycles.len(), 1);
        let mut members = cycles[0].clone();
        members.sort();
        assert_eq!(members, v);

        // Consecutive members are joined by forward edges.
        let cycle = &cycles[0];
        for i in 0..cycle.len() {
            let from = cycle[i];
            let to = cycle[(i + 1) % cycle.len()];
            assert!(g.dependencies_of(from).contains(&to));
        }
    }

    #[test]
    fn test_breaking_last_edge_clears_cycle() {
        let mut g = DependencyGraph::new();
        let v = ids(3);
        g.add_dependency(v[0], v[1]);
        g.add_dependency(v[1], v[2]);
        g.add_dependency(v[2], v[0]);

        let cycle = g.detect_cycles().remove(0);
        let last = cycle[cycle.len() - 1];
        assert!(g.remove_dependency(last, cycle[0]));
        assert!(g.detect_cycles().is_empty());
        assert!(g.is_ready(last));
    }

    #[test]
    fn test_would_close_cycle() {
        let mut g = DependencyGraph::new();
        let v = ids(3);
        g.add_dependency(v[0], v[1]);
        g.add_dependency(v[1], v[2]);
        assert!(g.would_close_cycle(v[2], v[0]));
        assert!(g.would_close_cycle(v[1], v[0]));
        assert!(!g.would_close_cycle(v[0], v[2]));
        assert!(g.would_close_cycle(v[0], v[0]));
    }

    #[test]
    fn test_deep_chain_does_not_exhaust_stack() {
        let mut g = DependencyGraph::new();
        let v: Vec<TaskId> = (0..200_000).map(|_| Uuid::new_v4()).collect();
        for pair in v.windows(2) {
            g.add_dependency(pair[0], pair[1]);
        }
        assert_eq!(g.edge_count(), 199_999);
        assert!(g.detect_cycles().is_empty());
        assert!(!g.would_close_cycle(v[0], v[199_999]));

        g.add_dependency(v[199_999], v[0]);
        let cycles = g.detect_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 200_000);
    }
}
