//! Task coordination for TaskHive.
//!
//! Owns task records, the dependency DAG between them, and the capacity
//! gates that decide when a ready task may run. Ready tasks leave a priority
//! queue, take an agent slot and their named resources from the
//! [`ResourcePool`], and execute through a pluggable [`ExecutionBackend`].
//!
//! # Main types
//!
//! - [`Coordinator`] — Dispatch loop, retry policy and task lifecycle.
//! - [`DependencyGraph`] — Forward/reverse adjacency with cycle detection.
//! - [`ResourcePool`] — Agent slot gate plus all-or-nothing resource locks.
//! - [`TaskQueue`] — Task arena with a priority ready-queue.
//! - [`CommandBackend`] — Runs an external program per task.

/// Execution backends.
pub mod backend;
/// The task coordinator.
pub mod coordinator;
/// Task dependency graph.
pub mod graph;
/// Agent slots and resource locks.
pub mod resources;
/// Task arena and ready-queue.
pub mod task_queue;
/// Task records, requests and events.
pub mod types;

pub use backend::{
    CommandBackend, CommandBackendConfig, ExecutionBackend, ExecutionOutcome, ExecutionRequest,
};
pub use coordinator::{
    Coordinator, CoordinatorStatus, CyclePolicy, SchedulerConfig, SchedulerMetrics, TaskSummary,
};
pub use graph::DependencyGraph;
pub use resources::{PoolSnapshot, ResourceConfig, ResourcePool};
pub use task_queue::TaskQueue;
pub use types::{Task, TaskEvent, TaskRequest, TaskStatus};
