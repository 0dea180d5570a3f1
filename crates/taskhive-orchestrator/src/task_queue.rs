use crate::types::{Task, TaskStatus};
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use taskhive_core::{Priority, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyEntry {
    priority: Priority,
    seq: u64,
    id: TaskId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then the older sequence number.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Task arena plus a priority ready-queue.
///
/// Ready tasks come out strictly by priority and FIFO within a level. A task
/// keeps the sequence number it got when it first became ready, so one that
/// is put back after failing to get a slot does not lose its place.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: HashMap<TaskId, Task>,
    ready: BinaryHeap<ReadyEntry>,
    queued: HashSet<TaskId>,
    ready_seq: HashMap<TaskId, u64>,
    next_seq: u64,
}

impl TaskQueue {
    /// Empty arena and queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task to the arena. It is not queued until [`mark_ready`](Self::mark_ready).
    pub fn add(&mut self, task: Task) -> TaskId {
        let id = task.id;
        self.tasks.insert(id, task);
        id
    }

    /// Look up a task by id.
    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Mutable lookup. Status changes should go through the `mark_*` methods
    /// so the ready-queue stays consistent.
    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// Whether `id` is in the arena.
    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// Move a non-terminal task to Ready and push it onto the ready-queue.
    ///
    /// Returns `false` if the task is unknown or terminal. A task already in
    /// the queue is not pushed twice.
    pub fn mark_ready(&mut self, id: TaskId) -> bool {
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        task.status = TaskStatus::Ready;
        let priority = task.priority;

        if self.queued.insert(id) {
            let seq = match self.ready_seq.get(&id) {
                Some(seq) => *seq,
                None => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.ready_seq.insert(id, seq);
                    seq
                }
            };
            self.ready.push(ReadyEntry { priority, seq, id });
        }
        true
    }

    /// Move a Ready task back to Pending after it gained an unmet dependency.
    pub fn mark_pending(&mut self, id: TaskId) -> bool {
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        if task.status != TaskStatus::Ready {
            return false;
        }
        task.status = TaskStatus::Pending;
        self.queued.remove(&id);
        true
    }

    /// Put a task back on the ready-queue after a failed dispatch attempt.
    pub fn requeue(&mut self, id: TaskId) -> bool {
        self.mark_ready(id)
    }

    /// Pop the highest-priority Ready task.
    ///
    /// Entries whose task has since left the Ready state (cancelled, for
    /// instance) are discarded on the way.
    pub fn pop_ready(&mut self) -> Option<TaskId> {
        while let Some(entry) = self.ready.pop() {
            if !self.queued.remove(&entry.id) {
                continue;
            }
            if self
                .tasks
                .get(&entry.id)
                .is_some_and(|t| t.status == TaskStatus::Ready)
            {
                return Some(entry.id);
            }
        }
        None
    }

    /// Number of live entries in the ready-queue.
    pub fn ready_len(&self) -> usize {
        self.queued.len()
    }

    /// Record the start of an attempt on `agent`. Returns `false` for an
    /// unknown id.
    pub fn mark_running(&mut self, id: TaskId, agent: &str) -> bool {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.status = TaskStatus::Running;
            task.assigned_agent = Some(agent.to_string());
            task.started_at = Some(Utc::now());
            true
        } else {
            false
        }
    }

    pub fn mark_completed(&mut self, id: TaskId) -> bool {
        self.finish(id, TaskStatus::Completed)
    }

    pub fn mark_failed(&mut self, id: TaskId, reason: String) -> bool {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.last_error = Some(reason.clone());
        }
        self.finish(id, TaskStatus::Failed { reason })
    }

    pub fn mark_blocked(&mut self, id: TaskId, by: TaskId) -> bool {
        self.finish(id, TaskStatus::Blocked { by })
    }

    pub fn mark_cancelled(&mut self, id: TaskId) -> bool {
        self.finish(id, TaskStatus::Cancelled)
    }

    fn finish(&mut self, id: TaskId, status: TaskStatus) -> bool {
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        task.status = status;
        task.completed_at = Some(Utc::now());
        self.queued.remove(&id);
        self.ready_seq.remove(&id);
        true
    }

    /// Task counts keyed by status label.
    pub fn status_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status.label()).or_insert(0) += 1;
        }
        counts
    }

    pub fn count(&self, label: &str) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status.label() == label)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    /// Whether every task is in a terminal state.
    pub fn is_done(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }
}
