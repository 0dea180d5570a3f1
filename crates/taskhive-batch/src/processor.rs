use crate::cache::{cache_key, ResponseCache};
use crate::client::ModelClient;
use crate::rate_limit::RateLimiter;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use taskhive_core::{HiveError, HiveResult};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Batch processor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum requests collected into one batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long to wait for each further request once a batch is open.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Burst size of each model's token bucket.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: f64,
    /// Model calls per second per model. Zero disables limiting.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: f64,
    /// Upper bound on a caller's wait for its answer.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_model")]
    pub default_model: String,
}

fn default_batch_size() -> usize {
    10
}
fn default_drain_timeout_ms() -> u64 {
    10
}
fn default_cache_capacity() -> usize {
    1000
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_rate_limit_burst() -> f64 {
    5.0
}
fn default_rate_limit_per_sec() -> f64 {
    2.0
}
fn default_request_timeout_secs() -> u64 {
    300
}
fn default_model() -> String {
    "sonnet".to_string()
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            drain_timeout_ms: default_drain_timeout_ms(),
            cache_capacity: default_cache_capacity(),
            queue_capacity: default_queue_capacity(),
            rate_limit_burst: default_rate_limit_burst(),
            rate_limit_per_sec: default_rate_limit_per_sec(),
            request_timeout_secs: default_request_timeout_secs(),
            default_model: default_model(),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> HiveResult<()> {
        if self.batch_size == 0 {
            return Err(HiveError::Config("batch.batch_size must be at least 1".into()));
        }
        if self.cache_capacity == 0 {
            return Err(HiveError::Config(
                "batch.cache_capacity must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(HiveError::Config(
                "batch.queue_capacity must be at least 1".into(),
            ));
        }
        if self.rate_limit_per_sec < 0.0 {
            return Err(HiveError::Config(
                "batch.rate_limit_per_sec must not be negative".into(),
            ));
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Counters for the batch processor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchStats {
    pub requests: u64,
    pub cache_hits: u64,
    /// Requests answered by another request's identical prompt.
    pub coalesced: u64,
    pub batches: u64,
    pub model_calls: u64,
    pub failed_calls: u64,
    pub evictions: u64,
    pub cache_entries: usize,
}

struct PendingRequest {
    request_id: String,
    model: String,
    prompt: String,
    key: String,
    reply: oneshot::Sender<HiveResult<String>>,
}

struct ProcessorInner {
    config: BatchConfig,
    client: Arc<dyn ModelClient>,
    cache: Mutex<ResponseCache>,
    limiter: RateLimiter,
    stats: Mutex<BatchStats>,
    cancel: CancellationToken,
}

const IDLE_BUCKET_TTL: Duration = Duration::from_secs(600);

impl ProcessorInner {
    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<PendingRequest>) {
        loop {
            let first = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(request) => request,
                    None => break,
                },
            };

            let mut batch = vec![first];
            while batch.len() < self.config.batch_size {
                match tokio::time::timeout(self.config.drain_timeout(), rx.recv()).await {
                    Ok(Some(request)) => batch.push(request),
                    _ => break,
                }
            }
            self.process_batch(batch).await;
            self.limiter.cleanup(IDLE_BUCKET_TTL).await;
        }

        // Answer whatever was queued before the channel closed.
        rx.close();
        let mut rest = Vec::new();
        while let Ok(request) = rx.try_recv() {
            rest.push(request);
            if rest.len() == self.config.batch_size {
                self.process_batch(std::mem::take(&mut rest)).await;
            }
        }
        if !rest.is_empty() {
            self.process_batch(rest).await;
        }
    }

    async fn process_batch(&self, batch: Vec<PendingRequest>) {
        let size = batch.len();
        let mut groups: BTreeMap<String, Vec<PendingRequest>> = BTreeMap::new();
        for request in batch {
            groups.entry(request.model.clone()).or_default().push(request);
        }
        debug!(size, models = groups.len(), "Processing batch");
        self.stats.lock().batches += 1;

        join_all(
            groups
                .into_iter()
                .map(|(model, requests)| self.process_group(model, requests)),
        )
        .await;
    }

    async fn process_group(&self, model: String, requests: Vec<PendingRequest>) {
        // A previous batch may have answered some of these already.
        let mut waiting = Vec::with_capacity(requests.len());
        for request in requests {
            let cached = self.cache.lock().get(&request.key);
            match cached {
                Some(response) => {
                    self.stats.lock().cache_hits += 1;
                    let _ = request.reply.send(Ok(response));
                }
                None => waiting.push(request),
            }
        }
        if waiting.is_empty() {
            return;
        }

        let mut prompts: Vec<String> = Vec::new();
        let mut slot_of: HashMap<String, usize> = HashMap::new();
        let mut slots = Vec::with_capacity(waiting.len());
        for request in &waiting {
            let slot = *slot_of.entry(request.key.clone()).or_insert_with(|| {
                prompts.push(request.prompt.clone());
                prompts.len() - 1
            });
            slots.push(slot);
        }
        let coalesced = (waiting.len() - prompts.len()) as u64;

        self.limiter.acquire(&model).await;
        let result = self.client.complete_batch(&model, &prompts).await;
        {
            let mut stats = self.stats.lock();
            stats.model_calls += 1;
            stats.coalesced += coalesced;
        }

        let responses = match result {
            Ok(responses) if responses.len() == prompts.len() => responses,
            Ok(responses) => {
                self.fail_group(
                    waiting,
                    &model,
                    &format!(
                        "model returned {} responses for {} prompts",
                        responses.len(),
                        prompts.len()
                    ),
                );
                return;
            }
            Err(e) => {
                self.fail_group(waiting, &model, &e.to_string());
                return;
            }
        };

        {
            let mut cache = self.cache.lock();
            let mut evicted = 0;
            for (request, &slot) in waiting.iter().zip(&slots) {
                evicted += cache.insert(request.key.clone(), responses[slot].clone());
            }
            let entries = cache.len();
            drop(cache);
            let mut stats = self.stats.lock();
            stats.evictions += evicted as u64;
            stats.cache_entries = entries;
        }

        info!(
            model = %model,
            requests = waiting.len(),
            prompts = prompts.len(),
            client = %self.client.name(),
            "Model batch completed"
        );
        for (request, slot) in waiting.into_iter().zip(slots) {
            if request.reply.send(Ok(responses[slot].clone())).is_err() {
                debug!(request_id = %request.request_id, "Caller gone before answer");
            }
        }
    }

    fn fail_group(&self, waiting: Vec<PendingRequest>, model: &str, reason: &str) {
        self.stats.lock().failed_calls += 1;
        error!(model, requests = waiting.len(), error = %reason, "Model batch failed");
        for request in waiting {
            let _ = request.reply.send(Err(HiveError::Execution(format!(
                "batch call to model '{model}' failed: {reason}"
            ))));
        }
    }
}

/// Collects single prompts from many callers into per-model batch calls.
///
/// Call [`start`](Self::start) once inside a Tokio runtime before sending
/// requests; [`shutdown`](Self::shutdown) answers everything already queued
/// and then stops the loop.
pub struct BatchProcessor {
    inner: Arc<ProcessorInner>,
    tx: mpsc::Sender<PendingRequest>,
    rx: Mutex<Option<mpsc::Receiver<PendingRequest>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig, client: Arc<dyn ModelClient>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let inner = ProcessorInner {
            cache: Mutex::new(ResponseCache::new(config.cache_capacity)),
            limiter: RateLimiter::new(config.rate_limit_burst, config.rate_limit_per_sec),
            stats: Mutex::new(BatchStats::default()),
            cancel: CancellationToken::new(),
            client,
            config,
        };
        Self {
            inner: Arc::new(inner),
            tx,
            rx: Mutex::new(Some(rx)),
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Answer `prompt` with `model`, from cache or through the next batch.
    pub async fn process(
        &self,
        request_id: impl Into<String>,
        prompt: impl Into<String>,
        model: impl Into<String>,
    ) -> HiveResult<String> {
        let request_id = request_id.into();
        let prompt = prompt.into();
        let model = model.into();
        let key = cache_key(&model, &prompt);

        self.inner.stats.lock().requests += 1;
        let cached = self.inner.cache.lock().get(&key);
        if let Some(response) = cached {
            self.inner.stats.lock().cache_hits += 1;
            debug!(request_id = %request_id, model = %model, "Cache hit");
            return Ok(response);
        }
        if self.inner.cancel.is_cancelled() {
            return Err(HiveError::Cancelled("batch processor stopped".into()));
        }

        let (reply, answer) = oneshot::channel();
        let pending = PendingRequest {
            request_id: request_id.clone(),
            model,
            prompt,
            key,
            reply,
        };
        self.tx
            .send(pending)
            .await
            .map_err(|_| HiveError::Cancelled("batch processor stopped".into()))?;

        match tokio::time::timeout(self.inner.config.request_timeout(), answer).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HiveError::Cancelled(format!(
                "request {request_id} dropped by batch processor"
            ))),
            Err(_) => Err(HiveError::Timeout(format!(
                "request {request_id} not answered within {}s",
                self.inner.config.request_timeout_secs
            ))),
        }
    }

    /// Counters plus the current cache size.
    pub fn stats(&self) -> BatchStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.cache_entries = self.inner.cache.lock().len();
        stats
    }

    pub fn clear_cache(&self) {
        self.inner.cache.lock().clear();
    }

    /// Spawn the batching loop.
    pub fn start(&self) {
        let Some(rx) = self.rx.lock().take() else {
            warn!("Batch processor already started");
            return;
        };
        let inner = Arc::clone(&self.inner);
        *self.handle.lock() = Some(tokio::spawn(inner.run(rx)));
        info!(
            batch_size = self.inner.config.batch_size,
            client = %self.inner.client.name(),
            "Batch processor started"
        );
    }

    /// Stop the loop once it has answered everything already queued.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Batch loop terminated abnormally");
            }
        }
        info!("Batch processor stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Upper;

    #[async_trait]
    impl ModelClient for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        async fn complete_batch(&self, _model: &str, prompts: &[String]) -> HiveResult<Vec<String>> {
            Ok(prompts.iter().map(|p| p.to_uppercase()).collect())
        }
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config: BatchConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, BatchConfig::default());
        assert!(config.validate().is_ok());
        let bad = BatchConfig {
            batch_size: 0,
            ..BatchConfig::default()
        };
        assert!(matches!(bad.validate(), Err(HiveError::Config(_))));
    }

    #[tokio::test]
    async fn test_second_request_served_from_cache() {
        let processor = BatchProcessor::new(BatchConfig::default(), Arc::new(Upper));
        processor.start();
        assert_eq!(processor.process("r1", "hi", "m").await.unwrap(), "HI");
        assert_eq!(processor.process("r2", "hi", "m").await.unwrap(), "HI");
        let stats = processor.stats();
        assert_eq!((stats.requests, stats.cache_hits, stats.model_calls), (2, 1, 1));
        assert_eq!(stats.cache_entries, 1);
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_process_after_shutdown_is_cancelled() {
        let processor = BatchProcessor::new(BatchConfig::default(), Arc::new(Upper));
        processor.start();
        processor.shutdown().await;
        let err = processor.process("r1", "hi", "m").await.unwrap_err();
        assert!(matches!(err, HiveError::Cancelled(_)));
    }
}
