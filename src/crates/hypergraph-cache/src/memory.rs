//! In-memory cache backend for development and testing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::traits::{CacheBackend, CacheKey};

/// Thread-safe in-memory cache.
///
/// All entries live in a `HashMap` behind an async `RwLock`. Data is lost on
/// process exit; use [`DiskCache`](crate::DiskCache) when entries must
/// survive restarts.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<RwLock<HashMap<CacheKey, Value>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop all entries. Useful for test isolation.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &CacheKey, value: Value) -> Result<()> {
        self.entries.write().await.insert(key.clone(), value);
        Ok(())
    }
}
