//! Idempotency result cache
//!
//! Caches the first successful result of a mutation keyed by its idempotency
//! key for a bounded window. A retry within the window returns the cached
//! result without re-executing the mutation. Used by both the adapter
//! decorator and the durable order store.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct IdemCache<T: Clone> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, T)>>,
}

impl<T: Clone> IdemCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached result for `key`, if it has not expired.
    pub fn get(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((at, value)) if at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: &str, value: T) {
        let mut entries = self.entries.lock();
        // Opportunistic expiry sweep to bound memory.
        if entries.len() % 1024 == 0 {
            let ttl = self.ttl;
            entries.retain(|_, (at, _)| at.elapsed() < ttl);
        }
        entries.entry(key.to_string()).or_insert((Instant::now(), value));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
