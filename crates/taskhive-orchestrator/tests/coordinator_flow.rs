//! End-to-end coordinator tests.
//!
//! Runs the real dispatch loop against a scripted backend and checks
//! ordering, resource exclusivity, retries, cycle mitigation, cancellation
//! and directory routing.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskhive_agents::{AgentDirectory, DirectoryConfig, TaskRequirements};
use taskhive_core::{HiveResult, Priority, TaskId};
use taskhive_orchestrator::*;

// ---------------------------------------------------------------------------
// Scripted backend: behaviour keyed by task description
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Call {
    description: String,
    agent: String,
    started: Instant,
    finished: Instant,
}

#[derive(Default)]
struct ScriptedBackend {
    delay: Duration,
    /// Remaining failures per description.
    failures: Mutex<HashMap<String, u32>>,
    /// Per-description delay overrides.
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedBackend {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn fail(self, description: &str, times: u32) -> Self {
        self.failures.lock().insert(description.to_string(), times);
        self
    }

    fn slow(self, description: &str, delay: Duration) -> Self {
        self.delays.lock().insert(description.to_string(), delay);
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn order(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.description).collect()
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, request: &ExecutionRequest) -> HiveResult<ExecutionOutcome> {
        let started = Instant::now();
        let delay = self
            .delays
            .lock()
            .get(&request.description)
            .copied()
            .unwrap_or(self.delay);
        tokio::time::sleep(delay).await;

        let fail = {
            let mut failures = self.failures.lock();
            match failures.get_mut(&request.description) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };

        self.calls.lock().push(Call {
            description: request.description.clone(),
            agent: request.agent.clone(),
            started,
            finished: Instant::now(),
        });

        if fail {
            Ok(ExecutionOutcome::failure("scripted failure", started.elapsed()))
        } else {
            Ok(ExecutionOutcome::success("ok", started.elapsed()))
        }
    }
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        dispatch_backoff_ms: 5,
        idle_poll_ms: 20,
        retry_backoff_ms: 5,
        retry_backoff_max_ms: 20,
        resource_timeout_ms: 5_000,
        shutdown_grace_secs: 5,
        ..SchedulerConfig::default()
    }
}

fn coordinator(
    slots: usize,
    backend: Arc<ScriptedBackend>,
    directory: Option<Arc<AgentDirectory>>,
) -> Coordinator {
    let pool = Arc::new(ResourcePool::new(ResourceConfig {
        max_concurrent_agents: slots,
        ..ResourceConfig::default()
    }));
    Coordinator::new(fast_config(), pool, backend, directory)
}

fn submit(c: &Coordinator, description: &str, deps: Vec<TaskId>) -> TaskId {
    c.submit_task(
        TaskRequest::new(description)
            .for_agent("worker")
            .with_dependencies(deps),
    )
    .unwrap()
}

const IDLE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// 1. Dependencies and priority
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dependency_chain_runs_in_order() {
    let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_millis(5)));
    let c = coordinator(4, backend.clone(), None);

    let spec = submit(&c, "spec", vec![]);
    let code = submit(&c, "code", vec![spec]);
    let test = submit(&c, "test", vec![code]);
    let review = submit(&c, "review", vec![code, test]);

    c.start();
    assert!(c.wait_idle(IDLE).await);
    c.shutdown().await;

    assert_eq!(backend.order(), vec!["spec", "code", "test", "review"]);
    for id in [spec, code, test, review] {
        assert_eq!(c.task(id).unwrap().status, TaskStatus::Completed);
    }
    let metrics = c.metrics();
    assert_eq!(metrics.tasks_created, 4);
    assert_eq!(metrics.tasks_completed, 4);
    assert!(metrics.average_duration_ms > 0.0);
}

#[tokio::test]
async fn critical_dispatched_before_earlier_normal() {
    let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_millis(5)));
    let c = coordinator(1, backend.clone(), None);

    c.submit_task(TaskRequest::new("normal").for_agent("worker"))
        .unwrap();
    c.submit_task(
        TaskRequest::new("critical")
            .for_agent("worker")
            .with_priority(Priority::Critical),
    )
    .unwrap();

    c.start();
    assert!(c.wait_idle(IDLE).await);
    c.shutdown().await;

    assert_eq!(backend.order(), vec!["critical", "normal"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_out_runs_after_root() {
    let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_millis(20)));
    let c = coordinator(4, backend.clone(), None);

    let t1 = submit(&c, "t1", vec![]);
    submit(&c, "t2", vec![t1]);
    submit(&c, "t3", vec![t1]);

    c.start();
    assert!(c.wait_idle(IDLE).await);
    c.shutdown().await;

    let calls = backend.calls();
    let root = calls.iter().find(|c| c.description == "t1").unwrap();
    for leaf in calls.iter().filter(|c| c.description != "t1") {
        assert!(leaf.started >= root.finished);
    }
}

// ---------------------------------------------------------------------------
// 2. Resource exclusivity
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_resources_never_run_together() {
    let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_millis(40)));
    let c = coordinator(4, backend.clone(), None);

    c.submit_task(
        TaskRequest::new("xy")
            .for_agent("a")
            .with_resources(vec!["x".into(), "y".into()]),
    )
    .unwrap();
    c.submit_task(
        TaskRequest::new("y")
            .for_agent("b")
            .with_resources(vec!["y".into()]),
    )
    .unwrap();
    c.submit_task(
        TaskRequest::new("z")
            .for_agent("c")
            .with_resources(vec!["z".into()]),
    )
    .unwrap();

    c.start();
    assert!(c.wait_idle(IDLE).await);
    c.shutdown().await;

    let calls = backend.calls();
    let xy = calls.iter().find(|c| c.description == "xy").unwrap();
    let y = calls.iter().find(|c| c.description == "y").unwrap();
    assert!(xy.finished <= y.started || y.finished <= xy.started);

    let snapshot = c.pool().snapshot();
    assert!(snapshot.locked_resources.is_empty());
    assert_eq!(snapshot.held_slots, 0);
}

// ---------------------------------------------------------------------------
// 3. Retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_retries_end_in_failed() {
    let backend = Arc::new(
        ScriptedBackend::with_delay(Duration::from_millis(1)).fail("doomed", u32::MAX),
    );
    let c = coordinator(2, backend.clone(), None);
    let id = c
        .submit_task(
            TaskRequest::new("doomed")
                .for_agent("worker")
                .with_max_retries(3),
        )
        .unwrap();
    let downstream = submit(&c, "downstream", vec![id]);

    c.start();
    assert!(c.wait_idle(IDLE).await);
    c.shutdown().await;

    let task = c.task(id).unwrap();
    assert_eq!(task.retry_count, 3);
    assert!(matches!(task.status, TaskStatus::Failed { .. }));
    assert_eq!(backend.calls().len(), 3);
    assert_eq!(
        c.task(downstream).unwrap().status,
        TaskStatus::Blocked { by: id }
    );

    let metrics = c.metrics();
    assert_eq!(metrics.tasks_retried, 2);
    assert_eq!(metrics.tasks_failed, 1);
    assert_eq!(metrics.tasks_blocked, 1);
}

#[tokio::test]
async fn flaky_task_recovers() {
    let backend =
        Arc::new(ScriptedBackend::with_delay(Duration::from_millis(1)).fail("flaky", 2));
    let c = coordinator(2, backend.clone(), None);
    let id = submit(&c, "flaky", vec![]);

    c.start();
    assert!(c.wait_idle(IDLE).await);
    c.shutdown().await;

    let task = c.task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.last_error.as_deref(), Some("Execution error: scripted failure"));
}

// ---------------------------------------------------------------------------
// 4. Cycle mitigation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broken_cycle_does_not_deadlock() {
    let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_millis(1)));
    let c = coordinator(2, backend.clone(), None);

    let a = submit(&c, "a", vec![]);
    let b = submit(&c, "b", vec![]);
    let d = submit(&c, "c", vec![]);
    c.add_dependency(a, b).unwrap();
    c.add_dependency(b, d).unwrap();
    c.add_dependency(d, a).unwrap();
    assert_eq!(c.metrics().dependency_violations, 1);

    c.start();
    assert!(c.wait_idle(IDLE).await);
    c.shutdown().await;

    for id in [a, b, d] {
        assert_eq!(c.task(id).unwrap().status, TaskStatus::Completed);
    }
    assert_eq!(backend.calls().len(), 3);
}

// ---------------------------------------------------------------------------
// 5. Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_releases_slot_and_resources() {
    let backend = Arc::new(
        ScriptedBackend::with_delay(Duration::from_millis(5))
            .slow("slow", Duration::from_millis(800)),
    );
    let c = coordinator(1, backend.clone(), None);
    let mut events = c.subscribe();

    let slow = c
        .submit_task(
            TaskRequest::new("slow")
                .for_agent("a")
                .with_resources(vec!["x".into()]),
        )
        .unwrap();
    c.start();

    loop {
        match tokio::time::timeout(IDLE, events.recv()).await.unwrap() {
            Ok(TaskEvent::Started { task_id, .. }) if task_id == slow => break,
            _ => {}
        }
    }
    assert_eq!(c.pool().held_slots(), 1);
    assert_eq!(c.pool().holder_of("x").as_deref(), Some("a"));

    c.cancel_task(slow).unwrap();
    assert_eq!(c.pool().held_slots(), 0);
    assert!(c.pool().holder_of("x").is_none());

    // The freed slot and key are usable while the cancelled call still runs.
    let fast = c
        .submit_task(
            TaskRequest::new("fast")
                .for_agent("b")
                .with_resources(vec!["x".into()]),
        )
        .unwrap();
    assert!(c.wait_idle(Duration::from_millis(500)).await);
    assert_eq!(c.task(fast).unwrap().status, TaskStatus::Completed);
    assert_eq!(backend.order(), vec!["fast"]);

    c.shutdown().await;
    // The slow call finished during shutdown; its result was discarded.
    assert_eq!(c.task(slow).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(c.metrics().tasks_completed, 1);
}

// ---------------------------------------------------------------------------
// 6. Directory routing
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unowned_tasks_are_routed_by_the_directory() {
    let directory = Arc::new(AgentDirectory::new(DirectoryConfig::default()));
    directory
        .register_agent("carol", "coder", &["rust".to_string()])
        .unwrap();
    directory
        .register_agent("rita", "reviewer", &["review".to_string()])
        .unwrap();

    let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_millis(5)));
    let c = coordinator(4, backend.clone(), Some(directory.clone()));

    let code = c
        .submit_task(TaskRequest::new("code").with_requirements(TaskRequirements::new(
            Some("coder".into()),
            vec!["rust".into()],
        )))
        .unwrap();
    let review = c
        .submit_task(
            TaskRequest::new("review")
                .with_dependencies(vec![code])
                .with_requirements(TaskRequirements::new(Some("reviewer".into()), vec![])),
        )
        .unwrap();

    c.start();
    assert!(c.wait_idle(IDLE).await);
    c.shutdown().await;

    assert_eq!(c.task(code).unwrap().assigned_agent.as_deref(), Some("carol"));
    assert_eq!(c.task(review).unwrap().assigned_agent.as_deref(), Some("rita"));

    let calls = backend.calls();
    assert!(calls.iter().all(|call| call.agent != "worker"));

    // Load was charged and released; outcomes were scored.
    for name in ["carol", "rita"] {
        let agent = directory.get(name).unwrap();
        assert_eq!(agent.current_load, 0);
        assert_eq!(agent.task_history.len(), 1);
    }
}

#[tokio::test]
async fn unroutable_task_is_counted_and_kept() {
    let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_millis(1)));
    let c = coordinator(2, backend.clone(), None);
    let id = c.submit_task(TaskRequest::new("orphan")).unwrap();

    c.start();
    assert!(!c.wait_idle(Duration::from_millis(100)).await);
    c.shutdown().await;

    let status = c.status();
    assert!(status.metrics.routing_failures >= 1);
    assert_eq!(c.task(id).unwrap().status, TaskStatus::Ready);
    assert!(backend.calls().is_empty());
}

// ---------------------------------------------------------------------------
// 7. Events, status and lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lifecycle_events_are_published() {
    let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_millis(1)));
    let c = coordinator(1, backend, None);
    let mut events = c.subscribe();

    let id = submit(&c, "one", vec![]);
    c.start();
    assert!(c.wait_idle(IDLE).await);
    c.shutdown().await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.task_id(), id);
        seen.push(serde_json::to_value(&event).unwrap()["event"].clone());
    }
    assert_eq!(seen, vec!["submitted", "ready", "started", "completed"]);
}

#[tokio::test]
async fn status_reports_counts_and_json() {
    let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_millis(1)));
    let c = coordinator(1, backend, None);
    let t1 = submit(&c, "one", vec![]);
    submit(&c, "two", vec![t1]);

    let status = c.status();
    assert_eq!(status.tasks.len(), 2);
    assert_eq!(status.counts.get("ready"), Some(&1));
    assert_eq!(status.counts.get("pending"), Some(&1));
    assert_eq!(status.ready_queue_depth, 1);

    let json = c.to_json().unwrap();
    assert_eq!(json["metrics"]["tasks_created"], 2);
    assert_eq!(json["resources"]["max_concurrent_agents"], 1);
}

#[tokio::test]
async fn nothing_dispatches_after_shutdown() {
    let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_millis(1)));
    let c = coordinator(1, backend.clone(), None);
    c.start();
    c.shutdown().await;

    let id = submit(&c, "late", vec![]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(c.task(id).unwrap().status, TaskStatus::Ready);
    assert!(backend.calls().is_empty());

    // Restarting a shut-down coordinator is refused.
    c.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(backend.calls().is_empty());
}
