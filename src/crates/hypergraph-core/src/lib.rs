//! # hypergraph-core - Name-Matched Workflow Orchestration
//!
//! Express a computation as a set of named functions ("nodes") whose data
//! dependencies are inferred from parameter-name / output-name matching,
//! then execute it with a superstep scheduler supporting DAGs, feedback
//! cycles, conditional routing, nested sub-graphs, batch map, and
//! human-in-the-loop pauses.
//!
//! ## Core Concepts
//!
//! ### 1. Nodes and Edge Inference
//!
//! A node declares inputs and outputs by name. An edge `A -> B` exists
//! exactly when an output of `A` shares its name with an input of `B`;
//! nothing is wired explicitly:
//!
//! ```rust,ignore
//! use hypergraph_core::{FunctionNode, Graph, Runner, ValueMap};
//! use serde_json::json;
//!
//! let double = FunctionNode::new("double", "x", "doubled", |v: &ValueMap| {
//!     Ok(json!(v["x"].as_i64().unwrap() * 2))
//! })?;
//! let addone = FunctionNode::new("addone", "doubled", "result", |v: &ValueMap| {
//!     Ok(json!(v["doubled"].as_i64().unwrap() + 1))
//! })?;
//!
//! let graph = Graph::from_nodes([double.into(), addone.into()])?;
//! let result = Runner::sequential()
//!     .run(&graph, [("x".to_string(), json!(5))].into())
//!     .await?;
//! assert_eq!(result["result"], json!(11));
//! ```
//!
//! ### 2. Superstep Execution
//!
//! Each superstep applies pending gate decisions, selects every ready node,
//! executes the batch (concurrently under [`Runner::concurrent`]), and
//! merges outputs into a versioned value store. All nodes in a batch see
//! the same input snapshot; writes become visible together at the
//! superstep boundary.
//!
//! ### 3. Routing and Cycles
//!
//! Gates ([`RouteNode`], [`RouteNode::if_else`]) choose which declared
//! targets may run, or return [`END`] to terminate their path. Cycles are
//! legal: the validator detects them and reports which parameters need a
//! bootstrap value (cycle entrypoints); staleness tracking re-runs a cycle
//! node only when an input actually changed.
//!
//! ### 4. Pauses
//!
//! An [`InterruptNode`] suspends the run, surfacing a value and a response
//! key. Re-running with the original inputs plus `{response_key: answer}`
//! resumes where the run paused.
//!
//! ## Module Organization
//!
//! - [`node`] - Function, graph, gate, and interrupt nodes; rename API
//! - [`graph`] - [`GraphBuilder`], the immutable [`Graph`], transforms
//! - [`topology`] - Edge inference, cycles, mutex regions, [`InputSpec`]
//! - [`typecheck`] - Optional build-time type compatibility
//! - [`scheduler`] - The superstep engine, [`RunResult`], [`RunOptions`]
//! - [`runner`] - [`Runner`] facade: `run` and `map`
//! - [`event`] - Structured events and processors
//! - [`ident`] - Identifier rules and deterministic hashing
//! - [`viz`] - DOT / Mermaid rendering
//!
//! Cache backends live in the `hypergraph-cache` crate; the scheduler
//! consults one whenever a node opted into caching.

pub mod error;
pub mod event;
pub mod graph;
pub mod ident;
pub mod node;
pub mod runner;
pub mod scheduler;
pub mod topology;
pub mod typecheck;
pub mod viz;

// Re-export main types
pub use error::{HypergraphError, NodeError, Result};
pub use event::{
    CollectingProcessor, Event, EventDispatcher, EventKind, EventProcessor, LogProcessor,
};
pub use graph::{Graph, GraphBuilder};
pub use ident::{hash_definition, input_digest, is_valid_identifier, END};
pub use node::{
    FunctionNode, GateChoice, GraphNode, InterruptNode, Node, RouteNode, ValueMap,
};
pub use runner::{MapOptions, MapResult, Runner};
pub use scheduler::types::{
    ErrorPolicy, MapMode, MissingPolicy, OverridePolicy, PauseInfo, RunOptions, RunResult,
    RunStatus, StepRecord, StepSink, StepStatus, StopHandle,
};
pub use topology::{Edge, EdgeKind, InputSpec};
pub use typecheck::{TypeExpr, TypeRegistry};
pub use viz::{visualize, VizFormat};

pub use hypergraph_cache::{CacheBackend, CacheKey, DiskCache, InMemoryCache};
