//! Process-local TTL cache.
//!
//! Coalesces hot reads (config list, history ranges, stats, log queries) in
//! front of the KV store. Entries hold serialized JSON bytes, so callers get
//! value copies back; the cache is lossy and callers must tolerate arbitrary
//! eviction.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Key for the cached full config list; mutations clear this prefix.
pub const ALL_MONITOR_CONFIGS: &str = "all_monitor_configs";

/// Per-use TTLs.
pub const CONFIGS_TTL: Duration = Duration::from_secs(120);
pub const HISTORY_TTL: Duration = Duration::from_secs(300);
pub const STATS_TTL: Duration = Duration::from_secs(300);
pub const LOGS_TTL: Duration = Duration::from_secs(180);

/// Background sweep cadence.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

struct CacheEntry {
    data: Vec<u8>,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// TTL cache mapping string keys to JSON-serialized values.
#[derive(Clone)]
pub struct Cache {
    entries: Arc<DashMap<String, CacheEntry>>,
    stats: Arc<RwLock<CacheStats>>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            stats: Arc::new(RwLock::new(CacheStats::default())),
        }
    }

    /// Get a value copy, or None when absent or expired.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = match self.entries.get(key) {
            Some(e) => e,
            None => {
                self.stats.write().misses += 1;
                return None;
            }
        };
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            self.stats.write().misses += 1;
            return None;
        }
        let value = serde_json::from_slice(&entry.data).ok();
        drop(entry);
        self.stats.write().hits += 1;
        value
    }

    /// Store a value with a per-entry TTL. Serialization failures drop the
    /// write silently; the cache is best-effort by contract.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if let Ok(data) = serde_json::to_vec(value) {
            self.entries.insert(
                key.to_string(),
                CacheEntry {
                    data,
                    created_at: Instant::now(),
                    ttl,
                },
            );
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| !e.is_expired())
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn clear_by_prefix(&self, prefix: &str) {
        self.entries.retain(|key, _| !key.starts_with(prefix));
    }

    /// Evict expired entries.
    pub fn cleanup(&self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    /// Spawn the background sweeper that evicts expired entries.
    pub fn start_sweeper(&self) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let before = cache.len();
                cache.cleanup();
                let evicted = before.saturating_sub(cache.len());
                if evicted > 0 {
                    tracing::debug!("Cache: evicted {} expired entries", evicted);
                }
            }
        });
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let cache = Cache::new();

        cache.set("key1", &"value1", Duration::from_secs(60));
        assert_eq!(cache.get::<String>("key1"), Some("value1".to_string()));
        assert!(cache.has("key1"));

        assert_eq!(cache.get::<String>("nonexistent"), None);
        assert!(!cache.has("nonexistent"));

        assert!(cache.delete("key1"));
        assert_eq!(cache.get::<String>("key1"), None);
        assert!(!cache.delete("key1"));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = Cache::new();

        cache.set("key1", &42u32, Duration::from_millis(50));
        assert_eq!(cache.get::<u32>("key1"), Some(42));

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.get::<u32>("key1"), None);
        assert!(!cache.has("key1"));
    }

    #[test]
    fn test_clear_by_prefix() {
        let cache = Cache::new();
        cache.set("monitor_stats_a_24h", &1u32, Duration::from_secs(60));
        cache.set("monitor_stats_b_7d", &2u32, Duration::from_secs(60));
        cache.set("all_monitor_configs", &3u32, Duration::from_secs(60));

        cache.clear_by_prefix("monitor_stats_");
        assert_eq!(cache.get::<u32>("monitor_stats_a_24h"), None);
        assert_eq!(cache.get::<u32>("monitor_stats_b_7d"), None);
        assert_eq!(cache.get::<u32>("all_monitor_configs"), Some(3));
    }

    #[test]
    fn test_clear_empties_everything() {
        let cache = Cache::new();
        cache.set("a", &1u32, Duration::from_secs(60));
        cache.set("b", &2u32, Duration::from_secs(60));
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get::<u32>("a"), None);
        assert_eq!(cache.get::<u32>("b"), None);
    }

    #[test]
    fn test_cleanup_evicts_only_expired() {
        let cache = Cache::new();
        cache.set("short", &1u32, Duration::from_millis(20));
        cache.set("long", &2u32, Duration::from_secs(60));

        std::thread::sleep(Duration::from_millis(50));
        cache.cleanup();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get::<u32>("long"), Some(2));
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let cache = Cache::new();
        cache.set("k", &1u32, Duration::from_secs(60));
        cache.get::<u32>("k");
        cache.get::<u32>("k");
        cache.get::<u32>("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }
}
