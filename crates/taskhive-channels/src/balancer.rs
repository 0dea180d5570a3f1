use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use taskhive_agents::{AgentCapability, AgentSummary};

/// One handler a route may deliver to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteTarget {
    /// Registered handler name.
    pub handler: String,
    /// Multiplier on the handler's live score. Zero keeps it as a last
    /// resort only.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Delivery plan for one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Recipient name this route answers for.
    pub recipient: String,
    pub targets: Vec<RouteTarget>,
    /// Buffer messages and deliver them in batches.
    #[serde(default)]
    pub batched: bool,
}

impl Route {
    /// Route with no targets yet; [`MessageRouter::add_route`](crate::MessageRouter::add_route)
    /// rejects it until one is added.
    pub fn new(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            targets: Vec::new(),
            batched: false,
        }
    }

    /// Add a handler with its weight.
    pub fn with_target(mut self, handler: impl Into<String>, weight: f64) -> Self {
        self.targets.push(RouteTarget {
            handler: handler.into(),
            weight,
        });
        self
    }

    /// Deliver through the batcher instead of one message at a time.
    pub fn batched(mut self) -> Self {
        self.batched = true;
        self
    }
}

/// Picks a handler per delivery from live success and latency figures.
///
/// Each handler is tracked with the same capability record agents use, so
/// its score is `performance × success_rate × (1 − in_flight/max)` with the
/// recency factor, scaled by the route weight.
pub struct LoadBalancer {
    max_in_flight: u32,
    stats: Mutex<HashMap<String, AgentCapability>>,
}

impl LoadBalancer {
    /// `max_in_flight` is the per-handler concurrency at which a handler
    /// scores zero.
    pub fn new(max_in_flight: u32) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Start scoring `handler`. Existing figures are kept on re-registration.
    pub fn track(&self, handler: &str) {
        self.stats
            .lock()
            .entry(handler.to_string())
            .or_insert_with(|| {
                AgentCapability::new(handler, "handler", Vec::<String>::new())
                    .with_max_load(self.max_in_flight)
            });
    }

    /// Forget `handler` and its figures.
    pub fn untrack(&self, handler: &str) {
        self.stats.lock().remove(handler);
    }

    /// Best tracked handler for `route`.
    ///
    /// The highest weighted score wins, earliest target on ties. When every
    /// target is saturated the least busy one is used.
    pub fn select(&self, route: &Route) -> Option<String> {
        let stats = self.stats.lock();
        let candidates: Vec<(&RouteTarget, &AgentCapability)> = route
            .targets
            .iter()
            .filter_map(|t| stats.get(&t.handler).map(|s| (t, s)))
            .collect();

        let mut best: Option<(&str, f64)> = None;
        for (target, stat) in &candidates {
            let score = stat.suitability(None, &[]) * target.weight.max(0.0);
            if score > 0.0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((&target.handler, score));
            }
        }
        if let Some((name, _)) = best {
            return Some(name.to_string());
        }
        candidates
            .iter()
            .min_by_key(|(_, s)| s.current_load)
            .map(|(t, _)| t.handler.clone())
    }

    /// Charge one in-flight delivery to `handler`.
    pub fn begin(&self, handler: &str) {
        if let Some(stat) = self.stats.lock().get_mut(handler) {
            stat.assign(None);
        }
    }

    /// Release the in-flight delivery and fold its outcome into the score.
    pub fn finish(&self, handler: &str, success: bool, elapsed: Duration) {
        if let Some(stat) = self.stats.lock().get_mut(handler) {
            stat.record_completion(success, elapsed);
        }
    }

    /// Per-handler figures, keyed by name.
    pub fn snapshot(&self) -> BTreeMap<String, AgentSummary> {
        self.stats
            .lock()
            .iter()
            .map(|(name, stat)| (name.clone(), AgentSummary::from(stat)))
            .collect()
    }
}
