//! Bounded in-process TTL cache.
//!
//! Consulted before the remote cache on every get and written on every set,
//! so hot keys stay sub-millisecond and the engine keeps absorbing repeats
//! during a remote outage. Capacity eviction is oldest-insertion-first;
//! expiry is passive (checked on read, swept on write).

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    expires_at: Instant,
}

struct Inner {
    map: HashMap<String, Entry>,
    /// Insertion order for capacity eviction. May contain stale keys; they
    /// are skipped during eviction.
    order: VecDeque<String>,
}

pub struct FallbackCache {
    capacity: usize,
    ttl: Duration,
    inner: RwLock<Inner>,
}

impl FallbackCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.read().unwrap();
        let entry = inner.map.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn insert(&self, key: &str, value: &str) {
        let mut inner = self.inner.write().unwrap();
        let now = Instant::now();

        // Sweep expired entries before enforcing capacity.
        inner.map.retain(|_, e| e.expires_at > now);

        let fresh = inner
            .map
            .insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: now + self.ttl,
                },
            )
            .is_none();
        if fresh {
            inner.order.push_back(key.to_string());
        }

        while inner.map.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.map.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.map.remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.map.clear();
        inner.order.clear();
    }
}
