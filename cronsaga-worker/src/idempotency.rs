use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

/// Remembers which dedupe keys already produced their effect.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn contains(&self, key: &str) -> bool;

    async fn remember(&self, key: &str);
}

#[derive(Default)]
struct Seen {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

/// Bounded in-process store; the oldest keys are forgotten first.
pub struct InMemoryIdempotencyStore {
    capacity: usize,
    seen: Mutex<Seen>,
}

impl InMemoryIdempotencyStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: Mutex::new(Seen::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn contains(&self, key: &str) -> bool {
        self.seen.lock().keys.contains(key)
    }

    async fn remember(&self, key: &str) {
        let mut seen = self.seen.lock();
        if !seen.keys.insert(key.to_string()) {
            return;
        }
        seen.order.push_back(key.to_string());
        while seen.order.len() > self.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.keys.remove(&oldest);
            }
        }
    }
}
