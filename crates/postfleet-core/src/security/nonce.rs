//! Replay-detection cache.
//!
//! Maps `"{task_id}:{nonce}"` to the first time it was seen. The cache is
//! per-process and deliberately not persisted: anything older than the
//! signature max-age is rejected by the age check before the cache is
//! consulted, so a restart cannot readmit a stale replay.

use dashmap::{DashMap, Entry};

#[derive(Default)]
pub struct NonceCache {
    seen: DashMap<String, i64>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, task_id: &str, nonce: &str) -> bool {
        self.seen.contains_key(&key(task_id, nonce))
    }

    /// Record the pair if unseen. Returns `false` on a replay.
    pub fn insert(&self, task_id: &str, nonce: &str, now_ms: i64) -> bool {
        match self.seen.entry(key(task_id, nonce)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(now_ms);
                true
            }
        }
    }

    /// Drop entries older than `max_age_ms`. Returns how many were removed.
    pub fn gc(&self, max_age_ms: i64, now_ms: i64) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, first_seen| now_ms - *first_seen <= max_age_ms);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn key(task_id: &str, nonce: &str) -> String {
    format!("{}:{}", task_id, nonce)
}
