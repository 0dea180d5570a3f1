use crate::balancer::{LoadBalancer, Route};
use crate::batcher::{Batch, Batcher};
use crate::dedup::DedupCache;
use crate::handler::MessageHandler;
use crate::mailbox::Mailbox;
use crate::message::Message;
use crate::middleware::Middleware;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskhive_agents::AgentSummary;
use taskhive_core::{HiveError, HiveResult, Priority};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Message router configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Concurrent delivery workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Mailbox capacity across all priority levels.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Content longer than this many bytes is stored compressed.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    /// Concurrent deliveries after which a handler scores zero.
    #[serde(default = "default_handler_max_in_flight")]
    pub handler_max_in_flight: u32,
    /// How long [`MessageRouter::send`] waits for mailbox room.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_workers() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_dedup_window_ms() -> u64 {
    60_000
}
fn default_dedup_capacity() -> usize {
    10_000
}
fn default_compression_threshold() -> usize {
    1024
}
fn default_batch_size() -> usize {
    10
}
fn default_batch_window_ms() -> u64 {
    100
}
fn default_handler_max_in_flight() -> u32 {
    8
}
fn default_send_timeout_ms() -> u64 {
    1000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            dedup_window_ms: default_dedup_window_ms(),
            dedup_capacity: default_dedup_capacity(),
            compression_threshold: default_compression_threshold(),
            batch_size: default_batch_size(),
            batch_window_ms: default_batch_window_ms(),
            handler_max_in_flight: default_handler_max_in_flight(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl RouterConfig {
    /// Every size and limit must be at least 1.
    pub fn validate(&self) -> HiveResult<()> {
        if self.workers == 0 {
            return Err(HiveError::Config("router.workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(HiveError::Config(
                "router.queue_capacity must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(HiveError::Config("router.batch_size must be at least 1".into()));
        }
        if self.handler_max_in_flight == 0 {
            return Err(HiveError::Config(
                "router.handler_max_in_flight must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// What happened to a message handed to [`MessageRouter::send_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    Accepted,
    /// Same sender, recipient and content seen inside the dedup window.
    Duplicate,
    /// Dropped by a middleware.
    Vetoed,
    /// The mailbox stayed full for the whole timeout.
    QueueFull,
}

impl SendOutcome {
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: u64,
    delivered: u64,
    duplicates: u64,
    vetoed: u64,
    rejected: u64,
    retried: u64,
    failed: u64,
    routing_failures: u64,
    batches_flushed: u64,
    compressed: u64,
}

/// Snapshot of router counters and queue state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterMetrics {
    pub sent: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub vetoed: u64,
    pub rejected: u64,
    pub retried: u64,
    /// Messages dropped after exhausting their retries.
    pub failed: u64,
    pub routing_failures: u64,
    /// Batches handed to a handler, whether or not every message in them
    /// was delivered.
    pub batches_flushed: u64,
    pub compressed: u64,
    /// Mailbox depth per level, Critical first.
    pub queue_depths: [usize; 4],
    pub pending_batched: usize,
    pub handlers: BTreeMap<String, AgentSummary>,
}

struct RouterInner {
    config: RouterConfig,
    mailbox: Mailbox,
    dedup: Mutex<DedupCache>,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    routes: RwLock<HashMap<String, Route>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    balancer: LoadBalancer,
    batcher: Batcher,
    counters: Mutex<Counters>,
    cancel: CancellationToken,
}

enum Target {
    Handler(String, Arc<dyn MessageHandler>),
    Batched,
    Unroutable,
}

impl RouterInner {
    fn apply_middleware(&self, message: Message) -> Option<Message> {
        let chain = self.middleware.read().clone();
        let mut message = message;
        for step in &chain {
            match step.process(message) {
                Some(next) => message = next,
                None => {
                    debug!(middleware = %step.name(), "Message vetoed");
                    return None;
                }
            }
        }
        Some(message)
    }

    /// Route for a recipient, or a handler registered under its name.
    fn resolve(&self, recipient: &str, batching: bool) -> Target {
        let route = self.routes.read().get(recipient).cloned();
        let name = match route {
            Some(route) if route.batched && !batching => return Target::Batched,
            Some(route) => self.balancer.select(&route),
            None => Some(recipient.to_string()),
        };
        let handler = name.and_then(|n| self.handlers.read().get(&n).cloned().map(|h| (n, h)));
        match handler {
            Some((name, handler)) => Target::Handler(name, handler),
            None => Target::Unroutable,
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "Router worker started");
        while let Some(message) = self.mailbox.pop_wait(&self.cancel).await {
            self.deliver(message).await;
        }
        debug!(worker, "Router worker stopped");
    }

    async fn flush_loop(self: Arc<Self>) {
        let tick = (self.batcher.window() / 2).max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    for batch in self.batcher.take_expired(Instant::now()) {
                        self.deliver_batch(batch).await;
                    }
                }
            }
        }
    }

    async fn deliver(&self, message: Message) {
        let (name, handler) = match self.resolve(&message.recipient, false) {
            Target::Handler(name, handler) => (name, handler),
            Target::Batched => {
                if let Some(batch) = self.batcher.push(message) {
                    self.deliver_batch(batch).await;
                }
                return;
            }
            Target::Unroutable => {
                self.counters.lock().routing_failures += 1;
                warn!(
                    message_id = %message.id,
                    recipient = %message.recipient,
                    "No route or handler for recipient, message dropped"
                );
                return;
            }
        };

        self.balancer.begin(&name);
        let started = Instant::now();
        let result = handler.handle(&message).await;
        self.balancer.finish(&name, result.is_ok(), started.elapsed());

        match result {
            Ok(()) => {
                self.counters.lock().delivered += 1;
                debug!(message_id = %message.id, handler = %name, "Message delivered");
            }
            Err(e) => self.retry_or_fail(message, &name, &e),
        }
    }

    async fn deliver_batch(&self, batch: Batch) {
        if batch.messages.is_empty() {
            return;
        }
        let (name, handler) = match self.resolve(&batch.recipient, true) {
            Target::Handler(name, handler) => (name, handler),
            Target::Batched | Target::Unroutable => {
                self.counters.lock().routing_failures += batch.messages.len() as u64;
                warn!(
                    recipient = %batch.recipient,
                    count = batch.messages.len(),
                    "No handler for batched route, batch dropped"
                );
                return;
            }
        };

        let count = batch.messages.len();
        self.balancer.begin(&name);
        let started = Instant::now();
        let results = handler.handle_batch(&batch.messages).await;
        let failures = (0..count)
            .filter(|&i| !matches!(results.get(i), Some(Ok(()))))
            .count();
        self.balancer.finish(&name, failures == 0, started.elapsed());

        {
            let mut counters = self.counters.lock();
            counters.delivered += (count - failures) as u64;
            counters.batches_flushed += 1;
        }
        debug!(
            recipient = %batch.recipient,
            handler = %name,
            count,
            failures,
            "Batch delivered"
        );
        if failures == 0 {
            return;
        }

        let missing = HiveError::Execution(format!("handler '{name}' returned no result"));
        for (i, message) in batch.messages.into_iter().enumerate() {
            match results.get(i) {
                Some(Ok(())) => {}
                Some(Err(e)) => self.retry_or_fail(message, &name, e),
                None => self.retry_or_fail(message, &name, &missing),
            }
        }
    }

    fn retry_or_fail(&self, mut message: Message, handler: &str, err: &HiveError) {
        if message.can_retry() {
            message.retry_count += 1;
            self.counters.lock().retried += 1;
            warn!(
                message_id = %message.id,
                handler,
                retry = message.retry_count,
                max_retries = message.max_retries,
                error = %err,
                "Delivery failed, re-queued"
            );
            self.mailbox.requeue(message);
        } else {
            self.counters.lock().failed += 1;
            error!(
                message_id = %message.id,
                handler,
                retries = message.retry_count,
                error = %err,
                "Delivery failed, retries exhausted"
            );
        }
    }
}

/// Prioritised, deduplicating, load-balanced delivery of messages to
/// handlers.
///
/// Senders go through [`send_message`](Self::send_message); a pool of
/// workers started by [`start`](Self::start) drains the mailbox and
/// delivers. Handler failures are retried through the mailbox until the
/// message's retry budget runs out.
pub struct MessageRouter {
    inner: Arc<RouterInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageRouter {
    pub fn new(config: RouterConfig) -> Self {
        let inner = RouterInner {
            mailbox: Mailbox::new(config.queue_capacity),
            dedup: Mutex::new(DedupCache::new(
                Duration::from_millis(config.dedup_window_ms),
                config.dedup_capacity,
            )),
            handlers: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            middleware: RwLock::new(Vec::new()),
            balancer: LoadBalancer::new(config.handler_max_in_flight),
            batcher: Batcher::new(
                config.batch_size,
                Duration::from_millis(config.batch_window_ms),
            ),
            counters: Mutex::new(Counters::default()),
            cancel: CancellationToken::new(),
            config,
        };
        Self {
            inner: Arc::new(inner),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register_handler(&self, handler: Arc<dyn MessageHandler>) {
        let name = handler.name().to_string();
        self.inner.balancer.track(&name);
        self.inner.handlers.write().insert(name.clone(), handler);
        info!(handler = %name, "Handler registered");
    }

    /// Remove a handler. Routes naming it fall through to their other
    /// targets. Returns whether it was registered.
    pub fn unregister_handler(&self, name: &str) -> bool {
        self.inner.balancer.untrack(name);
        self.inner.handlers.write().remove(name).is_some()
    }

    /// Install or replace the route for a recipient.
    pub fn add_route(&self, route: Route) -> HiveResult<()> {
        if route.targets.is_empty() {
            return Err(HiveError::Config(format!(
                "route for '{}' has no targets",
                route.recipient
            )));
        }
        info!(
            recipient = %route.recipient,
            targets = route.targets.len(),
            batched = route.batched,
            "Route added"
        );
        self.inner
            .routes
            .write()
            .insert(route.recipient.clone(), route);
        Ok(())
    }

    /// Append a middleware; the chain runs in insertion order.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner.middleware.write().push(middleware);
    }

    /// Accept a message for delivery.
    ///
    /// Runs the middleware chain, drops duplicates, compresses large
    /// content and enqueues, waiting up to `timeout` for mailbox room.
    pub async fn send_message(&self, message: Message, timeout: Duration) -> SendOutcome {
        let inner = &self.inner;
        let Some(mut message) = inner.apply_middleware(message) else {
            inner.counters.lock().vetoed += 1;
            return SendOutcome::Vetoed;
        };

        let key = message.fingerprint();
        if inner
            .dedup
            .lock()
            .check_and_insert(key.clone(), Instant::now())
        {
            inner.counters.lock().duplicates += 1;
            debug!(message_id = %message.id, "Duplicate message dropped");
            return SendOutcome::Duplicate;
        }

        if message.content.len() > inner.config.compression_threshold {
            match message.compress() {
                Ok(()) => inner.counters.lock().compressed += 1,
                Err(e) => warn!(message_id = %message.id, error = %e, "Compression failed, sending as is"),
            }
        }

        let id = message.id;
        if !inner.mailbox.push(message, timeout).await {
            inner.dedup.lock().forget(&key);
            inner.counters.lock().rejected += 1;
            warn!(message_id = %id, capacity = inner.mailbox.capacity(), "Mailbox full, message rejected");
            return SendOutcome::QueueFull;
        }
        inner.counters.lock().sent += 1;
        SendOutcome::Accepted
    }

    /// Build and send a message with the configured send timeout.
    pub async fn send(
        &self,
        content: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        priority: Priority,
    ) -> SendOutcome {
        let message = Message::new(content, sender, recipient).with_priority(priority);
        self.send_message(message, self.inner.config.send_timeout())
            .await
    }

    /// Counters, queue depths and per-handler figures.
    pub fn metrics(&self) -> RouterMetrics {
        let c = self.inner.counters.lock();
        RouterMetrics {
            sent: c.sent,
            delivered: c.delivered,
            duplicates: c.duplicates,
            vetoed: c.vetoed,
            rejected: c.rejected,
            retried: c.retried,
            failed: c.failed,
            routing_failures: c.routing_failures,
            batches_flushed: c.batches_flushed,
            compressed: c.compressed,
            queue_depths: self.inner.mailbox.depths(),
            pending_batched: self.inner.batcher.pending(),
            handlers: self.inner.balancer.snapshot(),
        }
    }

    /// Queued plus batched messages not yet handed to a handler.
    pub fn backlog(&self) -> usize {
        self.inner.mailbox.len() + self.inner.batcher.pending()
    }

    /// Spawn the delivery workers and the batch flusher.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() || self.inner.cancel.is_cancelled() {
            warn!("Message router already started or shut down");
            return;
        }
        for worker in 0..self.inner.config.workers {
            let inner = Arc::clone(&self.inner);
            handles.push(tokio::spawn(inner.worker_loop(worker)));
        }
        let inner = Arc::clone(&self.inner);
        handles.push(tokio::spawn(inner.flush_loop()));
        info!(workers = self.inner.config.workers, "Message router started");
    }

    /// Stop accepting work, drain the mailbox and flush open batches.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Router task terminated abnormally");
            }
        }
        for batch in self.inner.batcher.drain_all() {
            self.inner.deliver_batch(batch).await;
        }
        let left = self.inner.mailbox.len();
        if left > 0 {
            warn!(left, "Messages left undelivered at shutdown");
        }
        info!("Message router stopped");
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}
