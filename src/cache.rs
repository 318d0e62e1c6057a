//! Per-matter query-result cache with TTL and wildcard invalidation.
//!
//! Keys hash the normalized query together with the matter id, so entries
//! can never be read across matters. Any document state change on a matter
//! drops every entry for that matter.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Default TTL for cached query results (1 hour).
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: serde_json::Value, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Query cache scoped by matter.
pub struct MatterQueryCache {
    /// matter_id -> (key -> entry)
    entries: RwLock<HashMap<String, HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl MatterQueryCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Cache key: hash of the normalized query bound to the matter.
    pub fn key(matter_id: &str, query: &str) -> String {
        let normalized = query.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut hasher = Sha256::new();
        hasher.update(matter_id.as_bytes());
        hasher.update(b"\x00");
        hasher.update(normalized.to_lowercase().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, matter_id: &str, query: &str) -> Option<serde_json::Value> {
        let key = Self::key(matter_id, query);
        let entries = self.entries.read().ok()?;
        let entry = entries.get(matter_id)?.get(&key)?;
        if entry.is_expired() {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put(&self, matter_id: &str, query: &str, value: serde_json::Value) {
        let key = Self::key(matter_id, query);
        if let Ok(mut entries) = self.entries.write() {
            let matter = entries.entry(matter_id.to_string()).or_default();
            matter.insert(key, CacheEntry::new(value, self.ttl));
            if matter.len() > 256 {
                matter.retain(|_, entry| !entry.is_expired());
            }
        }
    }

    /// Drop every cached entry for a matter. Called on any document state
    /// change or insert for that matter.
    pub fn invalidate_matter(&self, matter_id: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(matter_id);
        }
    }
}

impl Default for MatterQueryCache {
    fn default() -> Self {
        Self::new()
    }
}
