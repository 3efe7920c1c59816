//! The immutable graph: construction, validation, and pure transforms.
//!
//! A [`Graph`] is built once from a list of nodes via [`GraphBuilder`] and
//! never mutates afterwards. Every transform (`bind`, `unbind`, `select`,
//! `with_entrypoint`, `as_node`) returns a new graph; the receiver is left
//! untouched. Validation and edge inference happen at construction, so a
//! `Graph` value is always well-formed.
//!
//! # Examples
//!
//! ```rust,ignore
//! use hypergraph_core::{FunctionNode, GraphBuilder, ValueMap};
//! use serde_json::json;
//!
//! let double = FunctionNode::new("double", "x", "doubled", |v: &ValueMap| {
//!     Ok(json!(v["x"].as_i64().unwrap() * 2))
//! })?;
//! let addone = FunctionNode::new("addone", "doubled", "result", |v: &ValueMap| {
//!     Ok(json!(v["doubled"].as_i64().unwrap() + 1))
//! })?;
//!
//! let graph = GraphBuilder::new().node(double).node(addone).build()?;
//! assert_eq!(graph.input_spec().required, vec!["x"]);
//! ```

use std::sync::Arc;

use serde_json::Value;

use crate::error::{HypergraphError, Result};
use crate::ident::{self, IntoNames};
use crate::node::{GraphNode, Node, ValueMap};
use crate::topology::{analyze, Edge, EdgeKind, InputSpec, Topology};
use crate::typecheck::{TypeExpr, TypeRegistry};

/// Collects nodes and settings, validating everything on [`build`].
///
/// [`build`]: GraphBuilder::build
pub struct GraphBuilder {
    name: Option<String>,
    nodes: Vec<Node>,
    strict_types: bool,
    registry: TypeRegistry,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            nodes: Vec::new(),
            strict_types: false,
            registry: TypeRegistry::new(),
        }
    }

    /// Name the graph; required to nest it as a node later.
    pub fn named(name: impl Into<String>) -> Self {
        let mut builder = Self::new();
        builder.name = Some(name.into());
        builder
    }

    /// Turn on build-time edge type checking.
    pub fn strict_types(mut self, strict: bool) -> Self {
        self.strict_types = strict;
        self
    }

    /// Type registry used by the strict-types check.
    pub fn registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn node(mut self, node: impl Into<Node>) -> Self {
        self.nodes.push(node.into());
        self
    }

    pub fn nodes(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    /// Validate and freeze into an immutable [`Graph`].
    pub fn build(self) -> Result<Graph> {
        if let Some(name) = &self.name {
            ident::validate_identifier(name, "graph name")?;
        }
        Graph::construct(
            self.name,
            self.nodes,
            ValueMap::new(),
            None,
            None,
            self.strict_types,
            self.registry,
        )
    }
}

/// A validated, immutable graph of nodes.
#[derive(Debug, Clone)]
pub struct Graph {
    name: Option<String>,
    /// Insertion order is preserved and drives deterministic execution
    /// order.
    nodes: Vec<Node>,
    bindings: ValueMap,
    selection: Option<Vec<String>>,
    entrypoint_override: Option<String>,
    strict_types: bool,
    registry: TypeRegistry,
    topology: Topology,
    input_spec: InputSpec,
}

impl Graph {
    /// Build an unnamed graph from nodes with default settings.
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Result<Self> {
        GraphBuilder::new().nodes(nodes).build()
    }

    fn construct(
        name: Option<String>,
        nodes: Vec<Node>,
        bindings: ValueMap,
        selection: Option<Vec<String>>,
        entrypoint_override: Option<String>,
        strict_types: bool,
        registry: TypeRegistry,
    ) -> Result<Self> {
        let (topology, input_spec) = analyze(
            &nodes,
            &bindings,
            selection.as_deref(),
            entrypoint_override.as_deref(),
            strict_types,
            &registry,
        )?;
        Ok(Self {
            name,
            nodes,
            bindings,
            selection,
            entrypoint_override,
            strict_types,
            registry,
            topology,
            input_spec,
        })
    }

    /// Re-run analysis with changed settings; used by all transforms.
    fn rebuild(
        &self,
        bindings: ValueMap,
        selection: Option<Vec<String>>,
        entrypoint_override: Option<String>,
    ) -> Result<Self> {
        Self::construct(
            self.name.clone(),
            self.nodes.clone(),
            bindings,
            selection,
            entrypoint_override,
            self.strict_types,
            self.registry.clone(),
        )
    }

    // -- accessors ---------------------------------------------------------

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Active nodes in declaration order.
    pub fn active_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|n| self.topology.active.contains(n.name()))
    }

    pub fn input_spec(&self) -> &InputSpec {
        &self.input_spec
    }

    pub fn bindings(&self) -> &ValueMap {
        &self.bindings
    }

    pub fn selection(&self) -> Option<&[String]> {
        self.selection.as_deref()
    }

    pub fn entrypoint_override(&self) -> Option<&str> {
        self.entrypoint_override.as_deref()
    }

    pub fn strict_types(&self) -> bool {
        self.strict_types
    }

    pub fn has_cycles(&self) -> bool {
        !self.topology.cycles.is_empty()
    }

    pub fn has_async_nodes(&self) -> bool {
        self.active_nodes().any(Node::is_async)
    }

    /// Whether a run of this graph can pause: an active handler-less
    /// interrupt here or in any nested graph.
    pub fn has_interrupts(&self) -> bool {
        self.active_nodes().any(|n| match n {
            Node::Interrupt(i) => !i.has_handler(),
            Node::Graph(g) => g.graph().has_interrupts(),
            _ => false,
        })
    }

    /// Edges among active nodes.
    pub fn edges(&self) -> &[Edge] {
        &self.topology.edges
    }

    /// Response keys of handler-less interrupts here and in nested graphs.
    pub fn response_keys(&self) -> std::collections::BTreeSet<String> {
        let mut keys = std::collections::BTreeSet::new();
        for node in self.active_nodes() {
            match node {
                Node::Interrupt(i) if !i.has_handler() => {
                    keys.insert(i.output().to_string());
                }
                Node::Graph(g) => keys.extend(g.graph().response_keys()),
                _ => {}
            }
        }
        keys
    }

    /// Response keys that belong to nested graphs only. Values provided
    /// under these names are threaded into the nested run instead of being
    /// treated as injected outputs of the wrapping node.
    pub(crate) fn nested_response_keys(&self) -> std::collections::BTreeSet<String> {
        let mut keys = std::collections::BTreeSet::new();
        for node in self.active_nodes() {
            if let Node::Graph(g) = node {
                keys.extend(g.graph().response_keys());
            }
        }
        keys
    }

    pub(crate) fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Externally visible outputs: the selection when one applies, else
    /// every data output of active nodes in declaration order.
    pub fn output_names(&self) -> Vec<String> {
        if let Some(selection) = &self.selection {
            return selection.clone();
        }
        let mut names = Vec::new();
        for node in self.active_nodes() {
            for output in node.outputs() {
                if !names.contains(&output) {
                    names.push(output);
                }
            }
        }
        names
    }

    /// Declared type of a data output, from its active producer.
    pub fn output_type(&self, name: &str) -> Option<TypeExpr> {
        let producer = self.topology.producers_of(name).first()?;
        self.node(producer)?.output_type(name)
    }

    /// Declared type of an external input, from the first active node
    /// consuming it.
    pub fn input_type(&self, name: &str) -> Option<TypeExpr> {
        self.active_nodes()
            .filter(|n| n.inputs().contains(&name.to_string()))
            .find_map(|n| n.input_type(name))
    }

    /// Binding value or parameter default for `param`, if any.
    pub fn resolved_default(&self, param: &str) -> Option<Value> {
        if let Some(value) = self.bindings.get(param) {
            return Some(value.clone());
        }
        self.active_nodes().find_map(|n| n.default_value(param))
    }

    /// Merkle hash over sorted node hashes and the canonical edge set.
    ///
    /// Bindings, selection, and the entrypoint override are excluded: they
    /// configure a run of the graph, not the graph itself.
    pub fn definition_hash(&self) -> Result<String> {
        let mut node_hashes: Vec<String> = self
            .nodes
            .iter()
            .map(Node::definition_hash)
            .collect::<Result<_>>()?;
        node_hashes.sort();

        let mut edge_parts: Vec<String> = self
            .topology
            .full_edges
            .iter()
            .map(|e| {
                let kind = match e.kind {
                    EdgeKind::Data => "data",
                    EdgeKind::Control => "control",
                    EdgeKind::Signal => "signal",
                };
                format!("{kind}:{}:{}:{}", e.from, e.name, e.to)
            })
            .collect();
        edge_parts.sort();

        let mut parts = vec!["graph".to_string()];
        parts.extend(node_hashes);
        parts.push("edges".to_string());
        parts.extend(edge_parts);
        Ok(ident::hash_definition(parts))
    }

    // -- transforms --------------------------------------------------------

    /// Pre-fill parameter values. Shadows defaults, overridable at run time.
    pub fn bind(&self, values: impl IntoIterator<Item = (impl Into<String>, Value)>) -> Result<Self> {
        let mut bindings = self.bindings.clone();
        for (name, value) in values {
            bindings.insert(name.into(), value);
        }
        self.rebuild(
            bindings,
            self.selection.clone(),
            self.entrypoint_override.clone(),
        )
    }

    /// Remove bindings by name.
    pub fn unbind(&self, names: impl IntoNames) -> Result<Self> {
        let names = names.into_names()?;
        let mut bindings = self.bindings.clone();
        for name in &names {
            if bindings.remove(name).is_none() {
                return Err(HypergraphError::config(format!(
                    "cannot unbind '{name}': not bound. Bound: [{}].",
                    self.bindings.keys().cloned().collect::<Vec<_>>().join(", ")
                )));
            }
        }
        self.rebuild(
            bindings,
            self.selection.clone(),
            self.entrypoint_override.clone(),
        )
    }

    /// Narrow the graph to the subgraph contributing to `outputs`. Runtime
    /// results are filtered to the selection as well.
    pub fn select(&self, outputs: impl IntoNames) -> Result<Self> {
        let outputs = outputs.into_names()?;
        self.rebuild(
            self.bindings.clone(),
            Some(outputs),
            self.entrypoint_override.clone(),
        )
    }

    /// Start execution at `name`, dropping its ancestors. Their outputs
    /// become required inputs.
    pub fn with_entrypoint(&self, name: impl Into<String>) -> Result<Self> {
        self.rebuild(
            self.bindings.clone(),
            self.selection.clone(),
            Some(name.into()),
        )
    }

    /// Wrap this graph as a node, using the graph's own name.
    pub fn as_node(&self) -> Result<GraphNode> {
        let name = self.name.clone().ok_or_else(|| {
            HypergraphError::config(
                "cannot nest an unnamed graph. Build it with GraphBuilder::named() or use as_node_named().".to_string(),
            )
        })?;
        GraphNode::from_graph(name, Arc::new(self.clone()))
    }

    /// Wrap this graph as a node under an explicit name.
    pub fn as_node_named(&self, name: impl Into<String>) -> Result<GraphNode> {
        GraphNode::from_graph(name.into(), Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::FunctionNode;
    use serde_json::json;

    fn double() -> Node {
        FunctionNode::new("double", "x", "doubled", |v: &ValueMap| {
            Ok(json!(v["x"].as_i64().unwrap() * 2))
        })
        .unwrap()
        .with_definition_key("double-v1")
        .into()
    }

    fn addone() -> Node {
        FunctionNode::new("addone", "doubled", "result", |v: &ValueMap| {
            Ok(json!(v["doubled"].as_i64().unwrap() + 1))
        })
        .unwrap()
        .with_definition_key("addone-v1")
        .into()
    }

    #[test]
    fn test_build_and_spec() {
        let graph = Graph::from_nodes([double(), addone()]).unwrap();
        assert_eq!(graph.input_spec().required, vec!["x"]);
        assert_eq!(graph.output_names(), vec!["doubled", "result"]);
        assert!(!graph.has_cycles());
        assert!(!graph.has_async_nodes());
    }

    #[test]
    fn test_hash_independent_of_insertion_order() {
        let a = Graph::from_nodes([double(), addone()]).unwrap();
        let b = Graph::from_nodes([addone(), double()]).unwrap();
        assert_eq!(a.definition_hash().unwrap(), b.definition_hash().unwrap());
        assert_eq!(a.input_spec(), b.input_spec());
    }

    #[test]
    fn test_bind_does_not_change_hash() {
        let graph = Graph::from_nodes([double(), addone()]).unwrap();
        let bound = graph.bind([("x", json!(5))]).unwrap();
        assert_eq!(
            graph.definition_hash().unwrap(),
            bound.definition_hash().unwrap()
        );
        assert_eq!(bound.input_spec().bound["x"], json!(5));
        assert!(bound.input_spec().optional.contains(&"x".to_string()));
        assert!(!bound.input_spec().required.contains(&"x".to_string()));
    }

    #[test]
    fn test_renaming_node_changes_hash() {
        let graph = Graph::from_nodes([double(), addone()]).unwrap();
        let renamed = Graph::from_nodes([double().with_name("twice").unwrap(), addone()]).unwrap();
        assert_ne!(
            graph.definition_hash().unwrap(),
            renamed.definition_hash().unwrap()
        );
    }

    #[test]
    fn test_transforms_leave_receiver_untouched() {
        let graph = Graph::from_nodes([double(), addone()]).unwrap();
        let before_spec = graph.input_spec().clone();
        let before_hash = graph.definition_hash().unwrap();

        let _ = graph.bind([("x", json!(1))]).unwrap();
        let _ = graph.select("result").unwrap();
        let _ = graph.with_entrypoint("addone").unwrap();

        assert_eq!(graph.input_spec(), &before_spec);
        assert_eq!(graph.definition_hash().unwrap(), before_hash);
        assert!(graph.bindings().is_empty());
        assert!(graph.selection().is_none());
    }

    #[test]
    fn test_unbind_round_trip() {
        let graph = Graph::from_nodes([double(), addone()]).unwrap();
        let bound = graph.bind([("x", json!(5))]).unwrap();
        let unbound = bound.unbind("x").unwrap();
        assert!(unbound.bindings().is_empty());
        assert!(unbound.input_spec().required.contains(&"x".to_string()));
        assert!(bound.unbind("doubled").is_err());
    }

    #[test]
    fn test_selection_filters_outputs_and_hash_unchanged() {
        let graph = Graph::from_nodes([double(), addone()]).unwrap();
        let selected = graph.select("result").unwrap();
        assert_eq!(selected.output_names(), vec!["result"]);
        assert_eq!(
            graph.definition_hash().unwrap(),
            selected.definition_hash().unwrap()
        );
    }

    #[test]
    fn test_with_entrypoint_requires_mid_values() {
        let graph = Graph::from_nodes([double(), addone()]).unwrap();
        let narrowed = graph.with_entrypoint("addone").unwrap();
        assert_eq!(narrowed.input_spec().required, vec!["doubled"]);
    }

    #[test]
    fn test_as_node_requires_name() {
        let graph = Graph::from_nodes([double()]).unwrap();
        assert!(graph.as_node().is_err());
        let named = GraphBuilder::named("doubler").node(double()).build().unwrap();
        let node = named.as_node().unwrap();
        let node = Node::from(node);
        assert_eq!(node.name(), "doubler");
        assert_eq!(node.inputs(), vec!["x"]);
        assert_eq!(node.outputs(), vec!["doubled"]);
    }

    #[test]
    fn test_nested_node_hash_delegates_to_inner_graph() {
        let inner = GraphBuilder::named("doubler").node(double()).build().unwrap();
        let node = Node::from(inner.as_node().unwrap());
        assert_eq!(node.definition_hash().unwrap().len(), 64);

        let renamed_inner = GraphBuilder::named("doubler")
            .node(double().with_name("twice").unwrap())
            .build()
            .unwrap();
        let renamed_node = Node::from(renamed_inner.as_node().unwrap());
        assert_ne!(
            node.definition_hash().unwrap(),
            renamed_node.definition_hash().unwrap()
        );
    }
}
