use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};

/// Cache key for a prompt sent to a model: SHA-256 over both, hex-encoded.
pub fn cache_key(model: &str, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(prompt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Insertion-ordered response cache with bulk eviction.
///
/// Once the number of entries exceeds the capacity, the oldest tenth of the
/// capacity (at least one entry) is dropped in one go.
#[derive(Debug)]
pub struct ResponseCache {
    capacity: usize,
    entries: HashMap<String, String>,
    order: VecDeque<String>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    /// Store a response. Returns the number of entries evicted.
    pub fn insert(&mut self, key: String, value: String) -> usize {
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = value;
            return 0;
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);

        if self.entries.len() <= self.capacity {
            return 0;
        }
        let target = (self.capacity / 10).max(1);
        let mut evicted = 0;
        while evicted < target {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
