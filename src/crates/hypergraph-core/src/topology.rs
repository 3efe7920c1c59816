//! Graph analysis: edge inference, cycles, mutex regions, and input
//! classification.
//!
//! Everything here runs at build time. [`analyze`] turns a node list plus
//! narrowing settings into a [`Topology`] (edges, cycles, gate wiring, the
//! active subgraph) and an [`InputSpec`] (required / optional / entrypoint /
//! bound classification), enforcing every structural invariant along the way.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::{HypergraphError, Result};
use crate::ident::END;
use crate::node::{Node, ValueMap};
use crate::typecheck::{is_compatible, TypeExpr, TypeRegistry};

/// How an inferred edge carries its dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Output name matches input name; carries a value.
    Data,
    /// Gate to declared target; carries activation only.
    Control,
    /// Emit to wait_for; carries ordering only.
    Signal,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub to: String,
    /// The matched output/input name, gate target, or signal name.
    pub name: String,
    pub kind: EdgeKind,
}

/// Classification of a graph's external inputs.
///
/// Every parameter of every active node falls into exactly one of:
/// edge-fed (not listed here), `required`, `optional` (default or binding),
/// or entrypoint-fed (listed under the cycle node that consumes it).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSpec {
    /// No edge, no default, not bound. Sorted by name.
    pub required: Vec<String>,
    /// No edge, but a default or a binding exists. Sorted by name.
    pub optional: Vec<String>,
    /// Cycle node -> parameters that receive values from within its cycle
    /// and therefore need a bootstrap value.
    pub entrypoints: BTreeMap<String, Vec<String>>,
    /// Values filled in by `bind(..)`, overridable at run time.
    pub bound: ValueMap,
}

/// Build-time analysis of a node list.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// Edges among active nodes.
    pub edges: Vec<Edge>,
    /// Edges among all nodes, for definition hashing (selection and
    /// entrypoint narrowing never change the hash).
    pub full_edges: Vec<Edge>,
    /// Active data-output name -> producing node names.
    pub producers: BTreeMap<String, Vec<String>>,
    /// Cyclic strongly connected components among active nodes.
    pub cycles: Vec<BTreeSet<String>>,
    /// Node -> index into `cycles`, for nodes inside a cycle.
    pub cycle_of: BTreeMap<String, usize>,
    /// Gate target -> gates declaring it (active only).
    pub gates_for_target: BTreeMap<String, Vec<String>>,
    /// Node -> gates that must fire before it may run (mutex regions with a
    /// shared output).
    pub mutex_blocked: BTreeMap<String, Vec<String>>,
    /// The active subgraph after entrypoint/select narrowing.
    pub active: BTreeSet<String>,
}

impl Topology {
    pub fn same_cycle(&self, a: &str, b: &str) -> bool {
        match (self.cycle_of.get(a), self.cycle_of.get(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// Active producers of a data name.
    pub fn producers_of(&self, name: &str) -> &[String] {
        self.producers.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Run the full analysis. `selection` and `entrypoint` narrow the active
/// subgraph; `strict_types` turns on edge type checking.
pub fn analyze(
    nodes: &[Node],
    bindings: &ValueMap,
    selection: Option<&[String]>,
    entrypoint: Option<&str>,
    strict_types: bool,
    registry: &TypeRegistry,
) -> Result<(Topology, InputSpec)> {
    validate_unique_names(nodes)?;
    validate_graph_node_names(nodes)?;
    validate_gate_targets(nodes)?;
    validate_default_consistency(nodes)?;

    let full_edges = infer_edges(nodes, None);

    let mut active: BTreeSet<String> = nodes.iter().map(|n| n.name().to_string()).collect();
    if let Some(name) = entrypoint {
        active = narrow_to_entrypoint(nodes, &full_edges, &active, name)?;
    }
    if let Some(outputs) = selection {
        active = narrow_to_selection(nodes, &active, outputs)?;
    }

    let edges = infer_edges(nodes, Some(&active));
    let producers = active_producers(nodes, &active);
    validate_output_conflicts(nodes, &active, &producers)?;
    validate_bindings(nodes, bindings, &producers)?;

    let (cycles, cycle_of) = cyclic_sccs(&active, &edges);

    let mut gates_for_target: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for node in nodes.iter().filter(|n| active.contains(n.name())) {
        if let Node::Route(gate) = node {
            for target in gate.targets() {
                if target != END && active.contains(target) {
                    gates_for_target
                        .entry(target.clone())
                        .or_default()
                        .push(node.name().to_string());
                }
            }
        }
    }

    let mutex_blocked = mutex_blocked_nodes(nodes, &active, &producers);

    if strict_types {
        validate_edge_types(nodes, &edges, registry)?;
    }

    let spec = classify_inputs(nodes, bindings, &active, &producers, &cycle_of);

    let topology = Topology {
        edges,
        full_edges,
        producers,
        cycles,
        cycle_of,
        gates_for_target,
        mutex_blocked,
        active,
    };
    Ok((topology, spec))
}

fn node_by_name<'a>(nodes: &'a [Node], name: &str) -> Option<&'a Node> {
    nodes.iter().find(|n| n.name() == name)
}

fn validate_unique_names(nodes: &[Node]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for node in nodes {
        if !seen.insert(node.name().to_string()) {
            return Err(HypergraphError::config(format!(
                "duplicate node name '{}'. Rename one of the nodes with with_name().",
                node.name()
            )));
        }
    }
    Ok(())
}

fn validate_graph_node_names(nodes: &[Node]) -> Result<()> {
    let output_names: BTreeSet<String> = nodes.iter().flat_map(|n| n.outputs()).collect();
    for node in nodes {
        if matches!(node, Node::Graph(_)) && output_names.contains(node.name()) {
            return Err(HypergraphError::config(format!(
                "graph node '{}' collides with a data output of the same name. Rename the node or the output.",
                node.name()
            )));
        }
    }
    Ok(())
}

fn validate_gate_targets(nodes: &[Node]) -> Result<()> {
    let names: BTreeSet<&str> = nodes.iter().map(|n| n.name()).collect();
    for node in nodes {
        if let Node::Route(gate) = node {
            for target in gate.targets() {
                if target != END && !names.contains(target.as_str()) {
                    return Err(HypergraphError::config(format!(
                        "gate '{}' targets unknown node '{target}'. Targets must name nodes in the graph or END.",
                        node.name()
                    )));
                }
            }
            if gate.is_multi_target() {
                // Distinct targets of a multi-target gate can activate
                // together, so they may not share outputs.
                let mut produced: BTreeMap<String, String> = BTreeMap::new();
                for target in gate.targets() {
                    if let Some(t) = node_by_name(nodes, target) {
                        for output in t.outputs() {
                            if let Some(other) = produced.insert(output.clone(), target.clone()) {
                                return Err(HypergraphError::config(format!(
                                    "multi-target gate '{}' lists '{other}' and '{target}', which both produce '{output}'. Multi-target siblings may not share outputs.",
                                    node.name()
                                )));
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn validate_default_consistency(nodes: &[Node]) -> Result<()> {
    // param -> (node with default, value) and set of nodes lacking one.
    let mut defaults: BTreeMap<String, (String, Value)> = BTreeMap::new();
    let mut missing: BTreeMap<String, String> = BTreeMap::new();
    for node in nodes {
        for param in node.inputs() {
            match node.default_value(&param) {
                Some(value) => {
                    if let Some((other, existing)) = defaults.get(&param) {
                        if existing != &value {
                            return Err(HypergraphError::config(format!(
                                "parameter '{param}' has conflicting defaults on '{other}' and '{}'. Align the defaults or rename one parameter.",
                                node.name()
                            )));
                        }
                    }
                    defaults.insert(param.clone(), (node.name().to_string(), value));
                }
                None => {
                    missing.entry(param.clone()).or_insert_with(|| node.name().to_string());
                }
            }
        }
    }
    for (param, (with_default, _)) in &defaults {
        if let Some(without) = missing.get(param) {
            return Err(HypergraphError::config(format!(
                "parameter '{param}' has a default on '{with_default}' but none on '{without}'. Give every use the same default or none.",
            )));
        }
    }
    Ok(())
}

/// Infer edges by name matching, optionally restricted to an active set.
fn infer_edges(nodes: &[Node], active: Option<&BTreeSet<String>>) -> Vec<Edge> {
    let included = |name: &str| active.map(|a| a.contains(name)).unwrap_or(true);
    let mut edges = Vec::new();
    for producer in nodes.iter().filter(|n| included(n.name())) {
        for output in producer.outputs() {
            for consumer in nodes.iter().filter(|n| included(n.name())) {
                if consumer.inputs().contains(&output) {
                    edges.push(Edge {
                        from: producer.name().to_string(),
                        to: consumer.name().to_string(),
                        name: output.clone(),
                        kind: EdgeKind::Data,
                    });
                }
            }
        }
        for signal in producer.emits() {
            for consumer in nodes.iter().filter(|n| included(n.name())) {
                if consumer.waits_for().contains(signal) {
                    edges.push(Edge {
                        from: producer.name().to_string(),
                        to: consumer.name().to_string(),
                        name: signal.clone(),
                        kind: EdgeKind::Signal,
                    });
                }
            }
        }
    }
    for node in nodes.iter().filter(|n| included(n.name())) {
        if let Node::Route(gate) = node {
            for target in gate.targets() {
                if target != END && included(target) {
                    edges.push(Edge {
                        from: node.name().to_string(),
                        to: target.clone(),
                        name: target.clone(),
                        kind: EdgeKind::Control,
                    });
                }
            }
        }
    }
    edges
}

fn active_producers(nodes: &[Node], active: &BTreeSet<String>) -> BTreeMap<String, Vec<String>> {
    let mut producers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for node in nodes.iter().filter(|n| active.contains(n.name())) {
        for output in node.outputs() {
            producers.entry(output).or_default().push(node.name().to_string());
        }
    }
    producers
}

/// Duplicate data outputs are rejected unless all producers are mutually
/// exclusive targets of one single-target gate.
fn validate_output_conflicts(
    nodes: &[Node],
    active: &BTreeSet<String>,
    producers: &BTreeMap<String, Vec<String>>,
) -> Result<()> {
    for (output, names) in producers {
        if names.len() < 2 {
            continue;
        }
        let covered = nodes.iter().any(|node| match node {
            Node::Route(gate) if active.contains(node.name()) && !gate.is_multi_target() => {
                names.iter().all(|n| gate.targets().contains(n))
            }
            _ => false,
        });
        if !covered {
            return Err(HypergraphError::config(format!(
                "output '{output}' is produced by multiple nodes [{}] that are not mutually exclusive targets of one gate. Rename the outputs or route the producers through a single-target gate.",
                names.join(", ")
            )));
        }
    }
    Ok(())
}

/// Bindings may fill plain inputs, bootstrap cycle parameters, or bypass a
/// producer by covering its complete output set. Partial injection is
/// rejected.
fn validate_bindings(
    nodes: &[Node],
    bindings: &ValueMap,
    producers: &BTreeMap<String, Vec<String>>,
) -> Result<()> {
    let inputs: BTreeSet<String> = nodes.iter().flat_map(|n| n.inputs()).collect();
    for name in bindings.keys() {
        let produced = producers.contains_key(name);
        if !produced {
            if !inputs.contains(name) {
                return Err(HypergraphError::config(format!(
                    "binding '{name}' matches no input of any node. Remove it or fix the name."
                )));
            }
            continue;
        }
        // Produced names: allowed when the whole producer output set is
        // bound (bypass) or when the value seeds a cycle.
        for producer in &producers[name] {
            let node = node_by_name(nodes, producer).expect("producer exists");
            let all_bound = node.outputs().iter().all(|o| bindings.contains_key(o));
            let in_cycle = consumers_in_same_cycle(nodes, producer, name);
            if !all_bound && !in_cycle {
                return Err(HypergraphError::config(format!(
                    "binding '{name}' shadows an output of node '{producer}' without bypassing it. Bind all of its outputs [{}] or remove the binding.",
                    node.outputs().join(", ")
                )));
            }
        }
    }
    Ok(())
}

/// Whether some consumer of `name` sits in a cycle with `producer`, which
/// makes a binding on `name` a legitimate cycle seed.
fn consumers_in_same_cycle(nodes: &[Node], producer: &str, name: &str) -> bool {
    let all: BTreeSet<String> = nodes.iter().map(|n| n.name().to_string()).collect();
    let edges = infer_edges(nodes, Some(&all));
    let (_, cycle_of) = cyclic_sccs(&all, &edges);
    let Some(producer_cycle) = cycle_of.get(producer) else {
        return false;
    };
    nodes.iter().any(|n| {
        n.inputs().contains(&name.to_string()) && cycle_of.get(n.name()) == Some(producer_cycle)
    })
}

/// Iterative Tarjan, keeping only cyclic components (size >= 2 or a
/// self-edge).
fn cyclic_sccs(
    active: &BTreeSet<String>,
    edges: &[Edge],
) -> (Vec<BTreeSet<String>>, BTreeMap<String, usize>) {
    let names: Vec<String> = active.iter().cloned().collect();
    let index_of: BTreeMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); names.len()];
    let mut self_edges: BTreeSet<usize> = BTreeSet::new();
    for edge in edges {
        let (Some(&from), Some(&to)) = (index_of.get(edge.from.as_str()), index_of.get(edge.to.as_str())) else {
            continue;
        };
        if from == to {
            self_edges.insert(from);
        }
        adjacency[from].push(to);
    }

    let n = names.len();
    let mut index = vec![usize::MAX; n];
    let mut lowlink = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = 0usize;
    let mut components: Vec<Vec<usize>> = Vec::new();

    // Explicit DFS stack: (node, next child position).
    for start in 0..n {
        if index[start] != usize::MAX {
            continue;
        }
        let mut work: Vec<(usize, usize)> = vec![(start, 0)];
        while let Some(&mut (v, ref mut child)) = work.last_mut() {
            if *child == 0 {
                index[v] = next_index;
                lowlink[v] = next_index;
                next_index += 1;
                stack.push(v);
                on_stack[v] = true;
            }
            if *child < adjacency[v].len() {
                let w = adjacency[v][*child];
                *child += 1;
                if index[w] == usize::MAX {
                    work.push((w, 0));
                } else if on_stack[w] {
                    lowlink[v] = lowlink[v].min(index[w]);
                }
            } else {
                if lowlink[v] == index[v] {
                    let mut component = Vec::new();
                    loop {
                        let w = stack.pop().expect("tarjan stack");
                        on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    components.push(component);
                }
                work.pop();
                if let Some(&mut (parent, _)) = work.last_mut() {
                    lowlink[parent] = lowlink[parent].min(lowlink[v]);
                }
            }
        }
    }

    let mut cycles = Vec::new();
    let mut cycle_of = BTreeMap::new();
    for component in components {
        let cyclic = component.len() > 1 || self_edges.contains(&component[0]);
        if cyclic {
            let id = cycles.len();
            let members: BTreeSet<String> =
                component.iter().map(|&i| names[i].clone()).collect();
            for member in &members {
                cycle_of.insert(member.clone(), id);
            }
            cycles.push(members);
        }
    }
    (cycles, cycle_of)
}

/// Nodes blocked until a gate fires: members of a single-target gate's
/// target set that share a data output with a sibling.
fn mutex_blocked_nodes(
    nodes: &[Node],
    active: &BTreeSet<String>,
    producers: &BTreeMap<String, Vec<String>>,
) -> BTreeMap<String, Vec<String>> {
    let mut blocked: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for node in nodes.iter().filter(|n| active.contains(n.name())) {
        let Node::Route(gate) = node else { continue };
        if gate.is_multi_target() {
            continue;
        }
        let members: Vec<&String> = gate
            .targets()
            .iter()
            .filter(|t| t.as_str() != END && active.contains(t.as_str()))
            .collect();
        let shares_output = |member: &str| {
            producers.iter().any(|(_, names)| {
                names.iter().any(|n| n == member)
                    && names.iter().any(|n| n != member && members.iter().any(|m| m.as_str() == n))
            })
        };
        for member in &members {
            if shares_output(member) {
                blocked
                    .entry((*member).clone())
                    .or_default()
                    .push(node.name().to_string());
            }
        }
    }
    blocked
}

fn validate_edge_types(nodes: &[Node], edges: &[Edge], registry: &TypeRegistry) -> Result<()> {
    for edge in edges.iter().filter(|e| e.kind == EdgeKind::Data) {
        let producer = node_by_name(nodes, &edge.from).expect("edge producer exists");
        let consumer = node_by_name(nodes, &edge.to).expect("edge consumer exists");
        let out_ty = producer.output_type(&edge.name).ok_or_else(|| {
            HypergraphError::config(format!(
                "strict types: output '{}' of node '{}' has no type annotation. Declare one with with_output_type().",
                edge.name, edge.from
            ))
        })?;
        let in_ty = consumer.input_type(&edge.name).ok_or_else(|| {
            HypergraphError::config(format!(
                "strict types: input '{}' of node '{}' has no type annotation. Declare one with with_input_type().",
                edge.name, edge.to
            ))
        })?;
        if !is_compatible(&out_ty, &in_ty, registry) {
            return Err(HypergraphError::config(format!(
                "type mismatch on edge '{}' from '{}' ({}) to '{}' ({}). Change one annotation or insert an adapter node.",
                edge.name,
                edge.from,
                out_ty.render(),
                edge.to,
                in_ty.render()
            )));
        }
    }
    Ok(())
}

fn classify_inputs(
    nodes: &[Node],
    bindings: &ValueMap,
    active: &BTreeSet<String>,
    producers: &BTreeMap<String, Vec<String>>,
    cycle_of: &BTreeMap<String, usize>,
) -> InputSpec {
    let mut required = BTreeSet::new();
    let mut optional = BTreeSet::new();
    let mut entrypoints: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut bound = ValueMap::new();

    for node in nodes.iter().filter(|n| active.contains(n.name())) {
        for param in node.inputs() {
            let param_producers = producers.get(&param).map(Vec::as_slice).unwrap_or(&[]);
            if !param_producers.is_empty() {
                // Edge-fed. When every producer lives in this node's own
                // cycle the parameter needs a bootstrap value.
                let node_cycle = cycle_of.get(node.name());
                let all_in_cycle = node_cycle.is_some()
                    && param_producers
                        .iter()
                        .all(|p| cycle_of.get(p.as_str()) == node_cycle);
                if all_in_cycle && !node.is_gate() {
                    entrypoints
                        .entry(node.name().to_string())
                        .or_default()
                        .push(param.clone());
                }
                continue;
            }
            if let Some(value) = bindings.get(&param) {
                optional.insert(param.clone());
                bound.insert(param.clone(), value.clone());
            } else if node.has_default(&param) {
                optional.insert(param.clone());
            } else {
                required.insert(param.clone());
            }
        }
    }

    // Cycle seeds supplied via bind() surface in `bound` too.
    for params in entrypoints.values() {
        for param in params {
            if let Some(value) = bindings.get(param) {
                bound.insert(param.clone(), value.clone());
            }
        }
    }

    InputSpec {
        required: required.into_iter().collect(),
        optional: optional.into_iter().collect(),
        entrypoints,
        bound,
    }
}

/// Drop strict ancestors of `name`: nodes that can reach it but that it
/// cannot reach back.
fn narrow_to_entrypoint(
    nodes: &[Node],
    edges: &[Edge],
    active: &BTreeSet<String>,
    name: &str,
) -> Result<BTreeSet<String>> {
    if !active.contains(name) {
        return Err(HypergraphError::config(format!(
            "entrypoint '{name}' is not a node in the graph. Pick one of: [{}].",
            nodes.iter().map(Node::name).collect::<Vec<_>>().join(", ")
        )));
    }
    let reaches = |from: &str| -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from.to_string()];
        while let Some(current) = stack.pop() {
            for edge in edges.iter().filter(|e| e.from == current) {
                if active.contains(&edge.to) && seen.insert(edge.to.clone()) {
                    stack.push(edge.to.clone());
                }
            }
        }
        seen
    };
    let from_name = reaches(name);
    let mut kept = BTreeSet::new();
    for node in active {
        let is_ancestor = reaches(node).contains(name) && !from_name.contains(node) && node != name;
        if !is_ancestor {
            kept.insert(node.clone());
        }
    }
    Ok(kept)
}

/// Keep only nodes contributing to the selected outputs: producers of the
/// selection, transitively their input and signal producers, and gates
/// controlling anything kept.
fn narrow_to_selection(
    nodes: &[Node],
    active: &BTreeSet<String>,
    outputs: &[String],
) -> Result<BTreeSet<String>> {
    let mut kept: BTreeSet<String> = BTreeSet::new();
    for output in outputs {
        let mut found = false;
        for node in nodes.iter().filter(|n| active.contains(n.name())) {
            if node.outputs().contains(output) {
                kept.insert(node.name().to_string());
                found = true;
            }
        }
        if !found {
            return Err(HypergraphError::config(format!(
                "selected output '{output}' is not produced by any node. Check the selection."
            )));
        }
    }
    loop {
        let before = kept.len();
        let snapshot: Vec<String> = kept.iter().cloned().collect();
        for name in &snapshot {
            let node = node_by_name(nodes, name).expect("active node exists");
            for param in node.inputs() {
                for producer in nodes.iter().filter(|n| active.contains(n.name())) {
                    if producer.outputs().contains(&param) {
                        kept.insert(producer.name().to_string());
                    }
                }
            }
            for signal in node.waits_for() {
                for emitter in nodes.iter().filter(|n| active.contains(n.name())) {
                    if emitter.emits().contains(signal) {
                        kept.insert(emitter.name().to_string());
                    }
                }
            }
        }
        for node in nodes.iter().filter(|n| active.contains(n.name())) {
            if let Node::Route(gate) = node {
                if gate.targets().iter().any(|t| kept.contains(t)) {
                    kept.insert(node.name().to_string());
                }
            }
        }
        if kept.len() == before {
            break;
        }
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{FunctionNode, GateChoice, RouteNode};
    use crate::typecheck::TypeRegistry;
    use serde_json::json;

    fn f(name: &str, inputs: &[&str], outputs: &[&str]) -> Node {
        FunctionNode::new(name, inputs, outputs, |_| Ok(json!(0)))
            .unwrap()
            .into()
    }

    fn run_analysis(nodes: &[Node]) -> (Topology, InputSpec) {
        analyze(nodes, &ValueMap::new(), None, None, false, &TypeRegistry::new()).unwrap()
    }

    #[test]
    fn test_linear_edges_and_required() {
        let nodes = vec![f("double", &["x"], &["doubled"]), f("addone", &["doubled"], &["result"])];
        let (topo, spec) = run_analysis(&nodes);
        assert_eq!(spec.required, vec!["x"]);
        assert!(spec.optional.is_empty());
        assert!(topo
            .edges
            .iter()
            .any(|e| e.from == "double" && e.to == "addone" && e.name == "doubled"));
        assert!(topo.cycles.is_empty());
    }

    #[test]
    fn test_edge_cancels_default() {
        let producer = f("a", &["x"], &["y"]);
        let consumer: Node = FunctionNode::new("b", "y", "z", |_| Ok(json!(0)))
            .unwrap()
            .with_default("y", json!(1))
            .unwrap()
            .into();
        let (_, spec) = run_analysis(&[producer, consumer]);
        assert!(!spec.required.contains(&"y".to_string()));
        assert!(!spec.optional.contains(&"y".to_string()));
    }

    #[test]
    fn test_duplicate_node_names_rejected() {
        let nodes = vec![f("a", &["x"], &["y"]), f("a", &["y"], &["z"])];
        let err = analyze(&nodes, &ValueMap::new(), None, None, false, &TypeRegistry::new())
            .unwrap_err();
        assert!(err.to_string().contains("duplicate node name 'a'"));
    }

    #[test]
    fn test_duplicate_output_rejected_without_gate() {
        let nodes = vec![f("a", &["x"], &["y"]), f("b", &["x"], &["y"])];
        let err = analyze(&nodes, &ValueMap::new(), None, None, false, &TypeRegistry::new())
            .unwrap_err();
        assert!(err.to_string().contains("output 'y'"));
    }

    #[test]
    fn test_mutex_exception_allows_shared_output() {
        let gate: Node = RouteNode::if_else("check", "q", "fast", "slow", |_| Ok(true))
            .unwrap()
            .into();
        let nodes = vec![
            gate,
            f("fast", &["q"], &["result"]),
            f("slow", &["q"], &["result"]),
        ];
        let (topo, _) = run_analysis(&nodes);
        assert_eq!(topo.mutex_blocked["fast"], vec!["check"]);
        assert_eq!(topo.mutex_blocked["slow"], vec!["check"]);
    }

    #[test]
    fn test_cycle_detection_and_entrypoints() {
        let generate = f("generate", &["messages"], &["response"]);
        let accumulate = f("accumulate", &["messages", "response"], &["messages"]);
        let gate: Node = RouteNode::new("should_continue", "messages", ["generate"], |_| {
            Ok(GateChoice::End)
        })
        .unwrap()
        .into();
        let (topo, spec) = run_analysis(&[generate, accumulate, gate]);
        assert_eq!(topo.cycles.len(), 1);
        assert!(topo.cycle_of.contains_key("generate"));
        assert!(topo.cycle_of.contains_key("accumulate"));
        assert_eq!(spec.entrypoints["generate"], vec!["messages"]);
        assert_eq!(spec.entrypoints["accumulate"], vec!["messages", "response"]);
        assert!(!spec.entrypoints.contains_key("should_continue"));
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let nodes = vec![f("acc", &["total", "item"], &["total"])];
        let (topo, spec) = run_analysis(&nodes);
        assert_eq!(topo.cycles.len(), 1);
        assert_eq!(spec.entrypoints["acc"], vec!["total"]);
        assert_eq!(spec.required, vec!["item"]);
    }

    #[test]
    fn test_default_consistency_enforced() {
        let a: Node = FunctionNode::new("a", "p", "x", |_| Ok(json!(0)))
            .unwrap()
            .with_default("p", json!(1))
            .unwrap()
            .into();
        let b: Node = FunctionNode::new("b", "p", "y", |_| Ok(json!(0)))
            .unwrap()
            .with_default("p", json!(2))
            .unwrap()
            .into();
        let err = analyze(&[a, b], &ValueMap::new(), None, None, false, &TypeRegistry::new())
            .unwrap_err();
        assert!(err.to_string().contains("conflicting defaults"));
    }

    #[test]
    fn test_mixed_default_presence_rejected() {
        let a: Node = FunctionNode::new("a", "p", "x", |_| Ok(json!(0)))
            .unwrap()
            .with_default("p", json!(1))
            .unwrap()
            .into();
        let b = f("b", &["p"], &["y"]);
        let err = analyze(&[a, b], &ValueMap::new(), None, None, false, &TypeRegistry::new())
            .unwrap_err();
        assert!(err.to_string().contains("default"));
    }

    #[test]
    fn test_selection_narrows_active_set() {
        let nodes = vec![
            f("a", &["x"], &["x1"]),
            f("b", &["x"], &["x2"]),
            f("use_a", &["x1"], &["out_a"]),
            f("use_b", &["x2"], &["out_b"]),
        ];
        let (topo, _) = analyze(
            &nodes,
            &ValueMap::new(),
            Some(&["out_a".to_string()]),
            None,
            false,
            &TypeRegistry::new(),
        )
        .unwrap();
        assert!(topo.active.contains("a"));
        assert!(topo.active.contains("use_a"));
        assert!(!topo.active.contains("b"));
        assert!(!topo.active.contains("use_b"));
    }

    #[test]
    fn test_unknown_selection_rejected() {
        let nodes = vec![f("a", &["x"], &["y"])];
        let err = analyze(
            &nodes,
            &ValueMap::new(),
            Some(&["nope".to_string()]),
            None,
            false,
            &TypeRegistry::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("'nope'"));
    }

    #[test]
    fn test_entrypoint_drops_ancestors_and_requires_their_outputs() {
        let nodes = vec![
            f("first", &["x"], &["mid"]),
            f("second", &["mid"], &["out"]),
        ];
        let (topo, spec) = analyze(
            &nodes,
            &ValueMap::new(),
            None,
            Some("second"),
            false,
            &TypeRegistry::new(),
        )
        .unwrap();
        assert!(!topo.active.contains("first"));
        assert_eq!(spec.required, vec!["mid"]);
    }

    #[test]
    fn test_binding_unknown_name_rejected() {
        let nodes = vec![f("a", &["x"], &["y"])];
        let mut bindings = ValueMap::new();
        bindings.insert("zzz".to_string(), json!(1));
        let err = analyze(&nodes, &bindings, None, None, false, &TypeRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("'zzz'"));
    }

    #[test]
    fn test_binding_partial_injection_rejected() {
        let nodes = vec![f("p", &["x"], &["a", "b"]), f("c", &["a", "b"], &["out"])];
        let mut bindings = ValueMap::new();
        bindings.insert("a".to_string(), json!(1));
        let err = analyze(&nodes, &bindings, None, None, false, &TypeRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("without bypassing"));

        bindings.insert("b".to_string(), json!(2));
        assert!(analyze(&nodes, &bindings, None, None, false, &TypeRegistry::new()).is_ok());
    }

    #[test]
    fn test_binding_cycle_seed_allowed() {
        let nodes = vec![
            f("generate", &["messages"], &["response"]),
            f("accumulate", &["messages", "response"], &["messages"]),
        ];
        let mut bindings = ValueMap::new();
        bindings.insert("messages".to_string(), json!([]));
        let (_, spec) = analyze(&nodes, &bindings, None, None, false, &TypeRegistry::new()).unwrap();
        assert_eq!(spec.bound["messages"], json!([]));
    }

    #[test]
    fn test_strict_types_missing_annotation() {
        let nodes = vec![f("a", &["x"], &["y"]), f("b", &["y"], &["z"])];
        let err = analyze(&nodes, &ValueMap::new(), None, None, true, &TypeRegistry::new())
            .unwrap_err();
        assert!(err.to_string().contains("no type annotation"));
    }

    #[test]
    fn test_strict_types_mismatch_names_both_nodes() {
        use crate::typecheck::TypeExpr;
        let a: Node = FunctionNode::new("a", "x", "y", |_| Ok(json!(0)))
            .unwrap()
            .with_output_type("y", TypeExpr::named("str"))
            .unwrap()
            .into();
        let b: Node = FunctionNode::new("b", "y", "z", |_| Ok(json!(0)))
            .unwrap()
            .with_input_type("y", TypeExpr::named("int"))
            .unwrap()
            .with_output_type("z", TypeExpr::named("int"))
            .unwrap()
            .into();
        let err = analyze(&[a, b], &ValueMap::new(), None, None, true, &TypeRegistry::new())
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'a'") && msg.contains("'b'"));
        assert!(msg.contains("str") && msg.contains("int"));
    }
}
