use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, max_tokens: f64, refill_rate: f64) {
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * refill_rate).min(max_tokens);
        self.last_refill = now;
    }
}

/// Token bucket rate limiter per model.
pub struct RateLimiter {
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    /// - `max_tokens`: maximum burst size
    /// - `refill_rate`: tokens added per second
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            max_tokens: max_tokens.max(1.0),
            refill_rate,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to consume one token for the given model.
    /// Returns `true` if allowed, `false` if rate limited.
    pub async fn try_acquire(&self, model: &str) -> bool {
        self.reserve(model).await.is_none()
    }

    /// Consume one token for `model`, sleeping until one is available.
    ///
    /// A non-positive refill rate disables limiting.
    pub async fn acquire(&self, model: &str) {
        if self.refill_rate <= 0.0 {
            return;
        }
        while let Some(wait) = self.reserve(model).await {
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token, or report how long until one refills.
    async fn reserve(&self, model: &str) -> Option<Duration> {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();

        let bucket = buckets.entry(model.to_string()).or_insert(Bucket {
            tokens: self.max_tokens,
            last_refill: now,
        });
        bucket.refill(now, self.max_tokens, self.refill_rate);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else if self.refill_rate > 0.0 {
            Some(Duration::from_secs_f64(
                (1.0 - bucket.tokens) / self.refill_rate,
            ))
        } else {
            Some(Duration::MAX)
        }
    }

    /// Remove buckets with no activity for `max_idle`.
    pub async fn cleanup(&self, max_idle: Duration) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, b| now.duration_since(b.last_refill) < max_idle);
    }

    pub async fn tracked_models(&self) -> usize {
        self.buckets.lock().await.len()
    }
}
