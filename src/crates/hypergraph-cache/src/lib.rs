//! # hypergraph-cache - Node Result Caching for Graph Execution
//!
//! **Trait-based cache abstractions and reference backends** for memoizing
//! node executions across runs. The scheduler in `hypergraph-core` consults a
//! [`CacheBackend`] before invoking any node that opted into caching, keyed by
//! the node's definition hash and a canonical digest of its input values.
//!
//! ## Overview
//!
//! A cache entry maps `(node_definition_hash, canonical_input_digest)` to the
//! output map the node produced. Because the definition hash changes whenever
//! the node's callable identity, declared outputs, or rename chain change,
//! stale entries can never be replayed against a different node version.
//!
//! ## Core Concepts
//!
//! ### 1. CacheBackend Trait
//!
//! The [`CacheBackend`] trait defines the protocol the scheduler calls:
//!
//! - **`get()`** - Look up a prior result by key (`None` on miss)
//! - **`put()`** - Store a result after a successful execution
//!
//! Backends must be safe for concurrent lookups and stores; it is the
//! backend's responsibility to protect itself.
//!
//! ### 2. Reference Backends
//!
//! - [`InMemoryCache`] - Thread-safe map, ephemeral, ideal for tests and
//!   single-process runs
//! - [`DiskCache`] - JSON files under a directory, survives restarts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hypergraph_cache::{CacheBackend, CacheKey, InMemoryCache};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = InMemoryCache::new();
//!
//!     let key = CacheKey::new("a".repeat(64), "b".repeat(64));
//!     cache.put(&key, json!({"doubled": 10})).await?;
//!
//!     assert_eq!(cache.get(&key).await?, Some(json!({"doubled": 10})));
//!     Ok(())
//! }
//! ```

pub mod disk;
pub mod error;
pub mod memory;
pub mod traits;

pub use disk::DiskCache;
pub use error::{CacheError, Result};
pub use memory::InMemoryCache;
pub use traits::{CacheBackend, CacheKey};
