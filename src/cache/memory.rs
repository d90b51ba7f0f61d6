//! DashMap-backed TTL cache.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::{cache_key, ProgressCache};

/// In-memory [`ProgressCache`]. Entries expire lazily on read.
#[derive(Debug, Default)]
pub struct MemoryProgressCache {
    entries: DashMap<String, (Value, Instant)>,
}

impl MemoryProgressCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ProgressCache for MemoryProgressCache {
    async fn get(&self, model: &str, id: Uuid, attribute: &str) -> Option<Value> {
        let key = cache_key(model, id, attribute);
        let expired = match self.entries.get(&key) {
            Some(entry) => {
                let (value, deadline) = entry.value();
                if Instant::now() < *deadline {
                    return Some(value.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.entries.remove(&key);
        }
        None
    }

    async fn set(&self, model: &str, id: Uuid, attribute: &str, value: Value, ttl: Duration) {
        let key = cache_key(model, id, attribute);
        self.entries.insert(key, (value, Instant::now() + ttl));
    }

    async fn delete(&self, model: &str, id: Uuid, attribute: &str) {
        self.entries.remove(&cache_key(model, id, attribute));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = MemoryProgressCache::new();
        let id = Uuid::new_v4();
        cache
            .set("ExportTaskRecord", id, "progress", serde_json::json!(42), Duration::from_secs(60))
            .await;
        let value = cache.get("ExportTaskRecord", id, "progress").await;
        assert_eq!(value, Some(serde_json::json!(42)));
    }

    #[tokio::test]
    async fn test_expiry() {
        let cache = MemoryProgressCache::new();
        let id = Uuid::new_v4();
        cache
            .set("ExportTaskRecord", id, "progress", serde_json::json!(10), Duration::from_millis(10))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("ExportTaskRecord", id, "progress").await, None);
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let cache = MemoryProgressCache::new();
        let id = Uuid::new_v4();
        for value in [1, 2, 3] {
            cache
                .set("ExportTaskRecord", id, "progress", serde_json::json!(value), Duration::from_secs(60))
                .await;
        }
        assert_eq!(
            cache.get("ExportTaskRecord", id, "progress").await,
            Some(serde_json::json!(3))
        );
    }
}
