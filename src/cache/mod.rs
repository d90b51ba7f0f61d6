//! # Progress Cache
//!
//! Fast, TTL-based key/value store for progress percentages, ETA hints, and
//! ephemeral cancellation flags. Deliberately decoupled from the state store
//! to avoid write-amplifying durable storage from many concurrent
//! conversions. Last-write-wins is acceptable here: the cache is advisory
//! (UI progress bars, cooperative cancel checks), never a correctness input.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

pub use memory::MemoryProgressCache;

/// Cache key layout: `{model}.{id}.{attribute}`.
pub fn cache_key(model: &str, id: Uuid, attribute: &str) -> String {
    format!("{model}.{id}.{attribute}")
}

/// Advisory key/value cache with per-entry TTL.
#[async_trait]
pub trait ProgressCache: Send + Sync {
    async fn get(&self, model: &str, id: Uuid, attribute: &str) -> Option<Value>;
    async fn set(&self, model: &str, id: Uuid, attribute: &str, value: Value, ttl: Duration);
    async fn delete(&self, model: &str, id: Uuid, attribute: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_layout() {
        let id = Uuid::nil();
        assert_eq!(
            cache_key("ExportTaskRecord", id, "progress"),
            format!("ExportTaskRecord.{id}.progress")
        );
    }
}
