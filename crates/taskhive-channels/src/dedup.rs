use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Bounded, time-windowed set of recently seen message fingerprints.
#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    capacity: usize,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl DedupCache {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `key` at `now`. Returns `true` if it was already seen inside
    /// the window, in which case nothing is recorded.
    pub fn check_and_insert(&mut self, key: String, now: Instant) -> bool {
        self.expire(now);
        if self.seen.contains_key(&key) {
            return true;
        }
        self.seen.insert(key.clone(), now);
        self.order.push_back((key, now));
        while self.seen.len() > self.capacity {
            self.pop_oldest();
        }
        false
    }

    /// Drop a key, e.g. after the message it belonged to was rejected.
    pub fn forget(&mut self, key: &str) {
        self.seen.remove(key);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((_, at)) = self.order.front() {
            if now.duration_since(*at) < self.window {
                break;
            }
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        if let Some((key, at)) = self.order.pop_front() {
            // A forgotten-then-reinserted key has a newer entry further back.
            if self.seen.get(&key) == Some(&at) {
                self.seen.remove(&key);
            }
        }
    }
}
