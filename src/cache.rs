use crate::openai::ChatMessage;
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

/// Cache for finished non-streaming responses, keyed by request
/// fingerprint. Streaming responses are never cached.
pub trait ResponseCache: Send + Sync {
    fn get(&self, fingerprint: &str) -> Option<Value>;
    fn insert(&self, fingerprint: &str, response: Value);
}

/// Stable hash of (model, messages) with `stream` forced false, so the
/// streaming flag never splits the key space.
pub fn fingerprint(model: &str, messages: &[ChatMessage]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    for message in messages {
        hasher.update(message.role.as_bytes());
        hasher.update([0u8]);
        hasher.update(message.content.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(b"stream=false");
    hex::encode(hasher.finalize())
}

pub struct MemoryCache {
    entries: DashMap<String, CachedEntry>,
    ttl: Duration,
    max_entries: usize,
}

struct CachedEntry {
    response: Value,
    stored_at: Instant,
}

impl MemoryCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
        }
    }

    fn prune_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| entry.stored_at.elapsed() < ttl);
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, fingerprint: &str) -> Option<Value> {
        let entry = self.entries.get(fingerprint)?;
        if entry.stored_at.elapsed() >= self.ttl {
            drop(entry);
            self.entries.remove(fingerprint);
            return None;
        }
        Some(entry.response.clone())
    }

    fn insert(&self, fingerprint: &str, response: Value) {
        if self.entries.len() >= self.max_entries {
            self.prune_expired();
            if self.entries.len() >= self.max_entries {
                return;
            }
        }
        self.entries.insert(
            fingerprint.to_string(),
            CachedEntry {
                response,
                stored_at: Instant::now(),
            },
        );
    }
}

/// Disabled-state stand-in: always misses, never stores.
pub struct NoopCache;

impl ResponseCache for NoopCache {
    fn get(&self, _fingerprint: &str) -> Option<Value> {
        None
    }

    fn insert(&self, _fingerprint: &str, _response: Value) {}
}
