//! The cache backend protocol consumed by the scheduler.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Cache key for a memoized node execution.
///
/// The key pairs the node's deterministic definition hash with a canonical
/// digest over its input names and serialized values. Both components are
/// 64-character lowercase hex SHA-256 digests produced by `hypergraph-core`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Definition hash of the node being memoized.
    pub definition_hash: String,
    /// Canonical digest of the input values the node consumed.
    pub input_digest: String,
}

impl CacheKey {
    pub fn new(definition_hash: impl Into<String>, input_digest: impl Into<String>) -> Self {
        Self {
            definition_hash: definition_hash.into(),
            input_digest: input_digest.into(),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.definition_hash, self.input_digest)
    }
}

/// Protocol for cache backends.
///
/// Implementations must be safe for concurrent `get`/`put` calls from
/// parallel node executions within a superstep.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Look up a previously stored result. `Ok(None)` is a miss.
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>>;

    /// Store the output map of a successful node execution.
    async fn put(&self, key: &CacheKey, value: Value) -> Result<()>;
}
