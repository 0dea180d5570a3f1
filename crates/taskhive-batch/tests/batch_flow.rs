//! Batch processor tests against a recording model client.
//!
//! Checks batching across concurrent callers, prompt coalescing, grouping
//! by model, failure fan-out, cache eviction and the coordinator wiring.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskhive_batch::*;
use taskhive_core::{HiveError, HiveResult};
use taskhive_orchestrator::{
    Coordinator, ResourceConfig, ResourcePool, SchedulerConfig, TaskRequest, TaskStatus,
};

// ---------------------------------------------------------------------------
// Recording client
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingClient {
    delay: Duration,
    fail: bool,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingClient {
    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    fn broken() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ModelClient for RecordingClient {
    fn name(&self) -> &str {
        "recording"
    }

    async fn complete_batch(&self, model: &str, prompts: &[String]) -> HiveResult<Vec<String>> {
        self.calls.lock().push((model.to_string(), prompts.to_vec()));
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(HiveError::Execution("endpoint unavailable".into()));
        }
        Ok(prompts.iter().map(|p| format!("{model}<{p}>")).collect())
    }
}

fn config() -> BatchConfig {
    BatchConfig {
        batch_size: 16,
        drain_timeout_ms: 30,
        rate_limit_per_sec: 0.0,
        ..BatchConfig::default()
    }
}

async fn fan_in(
    processor: &Arc<BatchProcessor>,
    requests: &[(&str, &str)],
) -> Vec<HiveResult<String>> {
    let handles: Vec<_> = requests
        .iter()
        .enumerate()
        .map(|(i, (prompt, model))| {
            let processor = processor.clone();
            let prompt = prompt.to_string();
            let model = model.to_string();
            tokio::spawn(async move { processor.process(format!("req-{i}"), prompt, model).await })
        })
        .collect();
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_prompts_are_sent_once() {
    let client = RecordingClient::slow(Duration::from_millis(5));
    let processor = Arc::new(BatchProcessor::new(config(), client.clone()));
    processor.start();

    let results = fan_in(
        &processor,
        &[("status?", "sonnet"), ("status?", "sonnet"), ("status?", "sonnet"), ("plan", "sonnet")],
    )
    .await;
    processor.shutdown().await;

    for result in &results[..3] {
        assert_eq!(result.as_ref().unwrap(), "sonnet<status?>");
    }
    assert_eq!(results[3].as_ref().unwrap(), "sonnet<plan>");

    let calls = client.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.len(), 2);
    let stats = processor.stats();
    assert_eq!(stats.coalesced, 2);
    assert_eq!(stats.model_calls, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_call_per_model_in_a_batch() {
    let client = RecordingClient::slow(Duration::from_millis(5));
    let processor = Arc::new(BatchProcessor::new(config(), client.clone()));
    processor.start();

    let results = fan_in(
        &processor,
        &[("a", "sonnet"), ("b", "haiku"), ("c", "sonnet"), ("d", "haiku")],
    )
    .await;
    processor.shutdown().await;

    assert!(results.iter().all(Result::is_ok));
    let mut calls = client.calls();
    calls.sort();
    assert_eq!(
        calls,
        vec![
            ("haiku".to_string(), vec!["b".to_string(), "d".to_string()]),
            ("sonnet".to_string(), vec!["a".to_string(), "c".to_string()]),
        ]
    );
    assert_eq!(processor.stats().batches, 1);
}

#[tokio::test]
async fn batch_size_caps_each_call() {
    let client = RecordingClient::slow(Duration::ZERO);
    let processor = Arc::new(BatchProcessor::new(
        BatchConfig {
            batch_size: 2,
            ..config()
        },
        client.clone(),
    ));
    processor.start();
    let results = fan_in(&processor, &[("1", "m"), ("2", "m"), ("3", "m"), ("4", "m"), ("5", "m")]).await;
    processor.shutdown().await;

    assert_eq!(results.len(), 5);
    assert!(client.calls().iter().all(|(_, prompts)| prompts.len() <= 2));
    assert!(client.calls().len() >= 3);
}

#[tokio::test]
async fn client_failure_reaches_every_waiter() {
    let client = RecordingClient::broken();
    let processor = Arc::new(BatchProcessor::new(config(), client.clone()));
    processor.start();

    let results = fan_in(&processor, &[("x", "m"), ("y", "m")]).await;
    processor.shutdown().await;

    for result in results {
        let err = result.unwrap_err();
        assert!(matches!(err, HiveError::Execution(_)));
        assert!(err.is_retryable());
    }
    let stats = processor.stats();
    assert_eq!(stats.failed_calls, 1);
    assert_eq!(stats.cache_entries, 0);
}

// ---------------------------------------------------------------------------
// Cache and rate limit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cache_evicts_oldest_past_capacity() {
    let client = RecordingClient::slow(Duration::ZERO);
    let processor = BatchProcessor::new(
        BatchConfig {
            cache_capacity: 10,
            drain_timeout_ms: 1,
            ..config()
        },
        client.clone(),
    );
    processor.start();
    for i in 0..11 {
        processor.process(format!("r{i}"), format!("p{i}"), "m").await.unwrap();
    }
    let stats = processor.stats();
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.cache_entries, 10);

    // p0 was evicted and goes back to the model; p10 is still cached.
    processor.process("again-0", "p0", "m").await.unwrap();
    processor.process("again-10", "p10", "m").await.unwrap();
    processor.shutdown().await;
    assert_eq!(client.calls().len(), 12);
}

#[tokio::test]
async fn rate_limit_spaces_model_calls() {
    let client = RecordingClient::slow(Duration::ZERO);
    let processor = BatchProcessor::new(
        BatchConfig {
            drain_timeout_ms: 1,
            rate_limit_burst: 1.0,
            rate_limit_per_sec: 20.0,
            ..config()
        },
        client.clone(),
    );
    processor.start();
    let started = Instant::now();
    processor.process("r1", "one", "m").await.unwrap();
    processor.process("r2", "two", "m").await.unwrap();
    processor.process("r3", "three", "m").await.unwrap();
    processor.shutdown().await;

    assert!(started.elapsed() >= Duration::from_millis(80));
    assert_eq!(client.calls().len(), 3);
}

// ---------------------------------------------------------------------------
// Coordinator wiring
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn coordinator_tasks_share_model_calls() {
    let client = RecordingClient::slow(Duration::from_millis(10));
    let processor = Arc::new(BatchProcessor::new(
        BatchConfig {
            drain_timeout_ms: 100,
            ..config()
        },
        client.clone(),
    ));
    processor.start();

    let pool = Arc::new(ResourcePool::new(ResourceConfig {
        max_concurrent_agents: 4,
        ..ResourceConfig::default()
    }));
    let coordinator = Coordinator::new(
        SchedulerConfig {
            dispatch_backoff_ms: 5,
            idle_poll_ms: 20,
            ..SchedulerConfig::default()
        },
        pool,
        Arc::new(BatchedModelBackend::new(processor.clone())),
        None,
    );

    let ids: Vec<_> = ["lint the repo", "lint the repo", "write release notes"]
        .iter()
        .enumerate()
        .map(|(i, d)| {
            coordinator
                .submit_task(
                    TaskRequest::new(*d)
                        .for_agent(format!("agent-{i}"))
                        .with_model("sonnet"),
                )
                .unwrap()
        })
        .collect();

    coordinator.start();
    assert!(coordinator.wait_idle(Duration::from_secs(10)).await);
    coordinator.shutdown().await;
    processor.shutdown().await;

    for id in ids {
        assert_eq!(coordinator.task(id).unwrap().status, TaskStatus::Completed);
    }
    let prompts: usize = client.calls().iter().map(|(_, p)| p.len()).sum();
    assert!(prompts <= 2, "identical task prompts should be answered once");
}
