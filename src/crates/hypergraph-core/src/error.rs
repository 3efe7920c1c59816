//! Error types for graph construction and execution.
//!
//! Every error display string names the offending nodes or parameters and
//! ends with a short "how to fix" hint. The strings are part of the public
//! API: tests match on substrings, so wording changes are breaking changes.
//!
//! # Taxonomy
//!
//! ```text
//! HypergraphError
//! ├── GraphConfig          - invalid graph structure, caught at build time
//! ├── MissingInput         - required inputs absent at run time
//! ├── AmbiguousEntrypoint  - provided values match several cycle entrypoints
//! ├── IncompatibleRunner   - graph capabilities exceed the runner's
//! ├── Rename               - rename of a name that is no longer current
//! ├── InfiniteLoop         - superstep budget exhausted without stability
//! ├── HashUnavailable      - node has no definition key, hash-based features refused
//! ├── InvalidOptions       - bad run/map option combination
//! ├── NodeExecution        - a user node failed (original error preserved)
//! └── Cache                - cache backend failure
//! ```

use std::sync::Arc;

use thiserror::Error;

/// Convenience result type using [`HypergraphError`].
pub type Result<T> = std::result::Result<T, HypergraphError>;

/// Error type carried by user node callables.
///
/// The scheduler never inspects it; under the `raise` policy it reaches the
/// caller inside [`HypergraphError::NodeExecution`] with the original error
/// as the `source`, and under the `continue` policy it is stored on
/// `RunResult::error` untouched.
pub type NodeError = Box<dyn std::error::Error + Send + Sync>;

/// All errors produced by graph construction, validation, and execution.
#[derive(Error, Debug, Clone)]
pub enum HypergraphError {
    /// Graph structure is invalid. Raised at build time, always halts
    /// construction.
    #[error("graph configuration error: {0}")]
    GraphConfig(String),

    /// Required inputs were not provided at run time.
    #[error(
        "missing required inputs: [{}]. Provide them in `values` or bind them on the graph.",
        inputs.join(", ")
    )]
    MissingInput {
        /// The full list of missing input names.
        inputs: Vec<String>,
    },

    /// Run-time inputs match several candidate cycle entrypoints.
    #[error(
        "provided values match multiple cycle entrypoints: [{}]. Pass `entrypoint=` to pick one.",
        candidates.join(", ")
    )]
    AmbiguousEntrypoint {
        /// Candidate entrypoint node names, sorted.
        candidates: Vec<String>,
    },

    /// The graph needs a capability this runner does not have.
    #[error("graph requires {capability} but the {runner} runner does not support it. Use Runner::concurrent().")]
    IncompatibleRunner {
        /// Capability the graph needs (e.g. "async nodes").
        capability: String,
        /// Name of the refusing runner.
        runner: String,
    },

    /// Attempt to rename a name that is not current on the node.
    #[error(
        "cannot rename '{name}' on node '{node}': not a current name. Rename chain: {chain}. Use the newest name."
    )]
    Rename {
        /// Node the rename was attempted on.
        node: String,
        /// The stale name.
        name: String,
        /// Human-readable rename chain (e.g. "a -> b -> c").
        chain: String,
    },

    /// The superstep budget was exhausted without reaching stability.
    #[error(
        "exceeded {max_iterations} supersteps without quiescence. Check cycle gates for a missing END, or raise `max_iterations`."
    )]
    InfiniteLoop {
        /// The budget that was exceeded.
        max_iterations: usize,
    },

    /// A node has no definition key, so no deterministic hash exists for it.
    #[error(
        "node '{node}' has no definition key, so its definition hash is unavailable. Set one with `.with_definition_key(..)` to use caching or hashing."
    )]
    HashUnavailable {
        /// The node missing a definition key.
        node: String,
    },

    /// Invalid run/map option combination.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// A user node failed. The original error is the `source`.
    #[error("node '{node}' execution failed: {source}")]
    NodeExecution {
        /// Name of the failing node (dot-joined path for nested graphs).
        node: String,
        /// The original, unwrapped user error.
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// Cache backend failure surfaced to the caller.
    #[error("cache error: {0}")]
    Cache(Arc<hypergraph_cache::CacheError>),
}

impl HypergraphError {
    /// Wrap a user node error, preserving the original as `source`.
    pub fn node_execution(node: impl Into<String>, source: NodeError) -> Self {
        Self::NodeExecution {
            node: node.into(),
            source: Arc::from(source),
        }
    }

    /// Build-time configuration error with the standard prefix.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::GraphConfig(msg.into())
    }
}

impl From<hypergraph_cache::CacheError> for HypergraphError {
    fn from(e: hypergraph_cache::CacheError) -> Self {
        Self::Cache(Arc::new(e))
    }
}
