//! Readiness and activation: the pure analysis half of a superstep.
//!
//! [`compute_ready`] selects the execution batch for the current superstep
//! from version staleness, value resolution, gate activation, and signal
//! generations. [`apply_decision`] interprets one gate decision, activating
//! chosen targets, deactivating siblings, and computing the END termination
//! closure.

use std::collections::{BTreeMap, BTreeSet};

use crate::graph::Graph;
use crate::ident::END;
use crate::node::{GateChoice, Node, ValueMap};

use super::store::VersionedStore;

/// Activation state of one gate.
#[derive(Debug, Clone, Default)]
pub(crate) struct GateState {
    /// Whether the gate has fired at least once this run.
    pub fired: bool,
    /// Input versions the gate consumed at its last firing; staleness
    /// against these defines the gate's current generation.
    pub consumed: BTreeMap<String, u64>,
    pub activated: BTreeSet<String>,
    pub deactivated: BTreeSet<String>,
}

/// Mutable run bookkeeping shared across supersteps.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecState {
    /// Bypassed producers: their outputs were injected by the caller.
    pub excluded: BTreeSet<String>,
    /// Nodes terminated by a gate returning END.
    pub terminated: BTreeSet<String>,
    /// Nodes that failed under the `continue` policy.
    pub failed: BTreeSet<String>,
    pub gates: BTreeMap<String, GateState>,
}

impl ExecState {
    fn is_live(&self, name: &str) -> bool {
        !self.excluded.contains(name) && !self.terminated.contains(name) && !self.failed.contains(name)
    }
}

/// A node selected for execution with its input snapshot.
#[derive(Debug, Clone)]
pub(crate) struct ReadyNode {
    pub name: String,
    pub inputs: ValueMap,
    pub consumed: BTreeMap<String, u64>,
    pub seen_signals: BTreeMap<String, u64>,
}

/// Resolve one input of `node` by the precedence rules: a produced edge
/// value wins; otherwise the version-0 seed (provided, binding, or default)
/// applies when no live producer is pending, or when the pending producers
/// all sit in the node's own cycle (bootstrap).
fn resolve_input(
    graph: &Graph,
    store: &VersionedStore,
    state: &ExecState,
    node: &Node,
    param: &str,
) -> Option<u64> {
    let topo = graph.topology();
    let live_producers: Vec<&String> = topo
        .producers_of(param)
        .iter()
        .filter(|p| state.is_live(p))
        .collect();

    let version = store.version(param);
    if live_producers.is_empty() {
        // Pure seed (or injected) value.
        return version;
    }
    match version {
        Some(v) if v >= 1 => Some(v),
        Some(0) => {
            let bootstrap = live_producers
                .iter()
                .all(|p| topo.same_cycle(p, node.name()));
            if bootstrap {
                Some(0)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Resolve the full input snapshot of a node, or `None` when some input is
/// not yet available.
fn resolve_all(
    graph: &Graph,
    store: &VersionedStore,
    state: &ExecState,
    node: &Node,
) -> Option<(ValueMap, BTreeMap<String, u64>)> {
    let mut values = ValueMap::new();
    let mut consumed = BTreeMap::new();
    for param in node.inputs() {
        let version = resolve_input(graph, store, state, node, &param)?;
        let value = store.get(&param)?.clone();
        values.insert(param.clone(), value);
        consumed.insert(param, version);
    }
    Some((values, consumed))
}

/// Whether a node that already executed sees anything new: a fresher input
/// version or a fresher awaited signal.
fn is_stale(
    store: &VersionedStore,
    node: &Node,
    consumed_now: &BTreeMap<String, u64>,
) -> bool {
    let Some(last) = store.consumed_versions(node.name()) else {
        return true;
    };
    let inputs_stale = consumed_now
        .iter()
        .any(|(param, version)| last.get(param).map(|v| version > v).unwrap_or(true));
    let signals_stale = node
        .waits_for()
        .iter()
        .any(|s| store.signal_generation(s) > store.seen_signal(node.name(), s));
    inputs_stale || signals_stale
}

/// Whether gates controlling `node` permit it to run right now.
///
/// A gate's decision is current while the gate itself is not stale. Before
/// a current decision exists, `default_open` gates let targets run
/// preemptively, except inside mutex regions, which always wait for their
/// gate.
fn gates_allow(
    graph: &Graph,
    store: &VersionedStore,
    state: &ExecState,
    resolutions: &BTreeMap<String, BTreeMap<String, u64>>,
    node: &str,
) -> bool {
    let topo = graph.topology();
    let Some(gates) = topo.gates_for_target.get(node) else {
        return true;
    };
    let mutex_gates: &[String] = topo
        .mutex_blocked
        .get(node)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    for gate_name in gates {
        if !state.is_live(gate_name) {
            // A terminated gate neither activates nor blocks; its END
            // decision already did the blocking.
            continue;
        }
        let Some(Node::Route(gate)) = graph.node(gate_name) else {
            continue;
        };
        let gate_state = state.gates.get(gate_name);
        let decision_current = gate_state
            .map(|gs| {
                gs.fired && {
                    // The decision stays current until the gate's own inputs
                    // move past what it consumed.
                    match resolutions.get(gate_name) {
                        Some(now) => now
                            .iter()
                            .all(|(param, version)| gs.consumed.get(param) == Some(version)),
                        None => true,
                    }
                }
            })
            .unwrap_or(false);

        if decision_current {
            let gs = gate_state.expect("fired gate has state");
            if gs.deactivated.contains(node) {
                return false;
            }
            if gs.activated.contains(node) {
                continue;
            }
            // Declared target absent from both sets: fall through to the
            // pre-fire rules below.
        }
        if mutex_gates.contains(gate_name) {
            return false;
        }
        if !gate.is_default_open() {
            return false;
        }
    }
    true
}

/// Phase 1: the execution batch, in declaration order.
pub(crate) fn compute_ready(
    graph: &Graph,
    store: &VersionedStore,
    state: &ExecState,
) -> Vec<ReadyNode> {
    // Resolve everything first so gate staleness is known when deciding
    // target readiness.
    let mut resolutions: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
    let mut snapshots: BTreeMap<String, ValueMap> = BTreeMap::new();
    for node in graph.active_nodes() {
        if let Some((values, consumed)) = resolve_all(graph, store, state, node) {
            resolutions.insert(node.name().to_string(), consumed);
            snapshots.insert(node.name().to_string(), values);
        }
    }

    let mut batch = Vec::new();
    for node in graph.active_nodes() {
        let name = node.name();
        if !state.is_live(name) {
            continue;
        }
        let Some(consumed) = resolutions.get(name) else {
            continue;
        };
        // Signals must have reached a newer generation than this node saw.
        let signals_ready = node
            .waits_for()
            .iter()
            .all(|s| store.signal_generation(s) > store.seen_signal(name, s));
        if !signals_ready {
            continue;
        }
        if store.has_executed(name) && !is_stale(store, node, consumed) {
            continue;
        }
        if !gates_allow(graph, store, state, &resolutions, name) {
            continue;
        }
        let seen_signals = node
            .waits_for()
            .iter()
            .map(|s| (s.clone(), store.signal_generation(s)))
            .collect();
        batch.push(ReadyNode {
            name: name.to_string(),
            inputs: snapshots[name].clone(),
            consumed: consumed.clone(),
            seen_signals,
        });
    }
    batch
}

/// Phase 2: interpret one gate decision.
///
/// Chosen targets are activated for the gate's new generation, unchosen
/// declared targets are deactivated, and an END decision terminates the
/// gate's exclusive downstream closure.
pub(crate) fn apply_decision(
    graph: &Graph,
    state: &mut ExecState,
    gate_name: &str,
    choice: &GateChoice,
    consumed: BTreeMap<String, u64>,
) {
    let Some(Node::Route(gate)) = graph.node(gate_name) else {
        return;
    };
    let declared: BTreeSet<String> = gate
        .targets()
        .iter()
        .filter(|t| t.as_str() != END)
        .cloned()
        .collect();

    let (chosen, ended): (BTreeSet<String>, bool) = match choice {
        GateChoice::To(target) if target == END => (BTreeSet::new(), true),
        GateChoice::To(target) => ([target.clone()].into(), false),
        GateChoice::Many(targets) => {
            let chosen: BTreeSet<String> =
                targets.iter().filter(|t| t.as_str() != END).cloned().collect();
            let ended = targets.iter().any(|t| t == END);
            (chosen, ended)
        }
        GateChoice::End => (BTreeSet::new(), true),
        // Skip without fallback was already rejected at execution time.
        GateChoice::Skip => (BTreeSet::new(), false),
    };

    let gate_state = state.gates.entry(gate_name.to_string()).or_default();
    gate_state.fired = true;
    gate_state.consumed = consumed;
    gate_state.activated = chosen.clone();
    gate_state.deactivated = declared.difference(&chosen).cloned().collect();

    if ended {
        terminate_closure(graph, state, gate_name, &declared);
    }
}

/// Mark the gate's targets terminated, then grow the set over nodes whose
/// every incoming edge originates inside it (self-edges count as inside).
/// Nodes fed from outside the closure survive.
fn terminate_closure(
    graph: &Graph,
    state: &mut ExecState,
    gate_name: &str,
    targets: &BTreeSet<String>,
) {
    let topo = graph.topology();
    let mut closed: BTreeSet<String> = targets
        .iter()
        .filter(|t| topo.active.contains(t.as_str()))
        .cloned()
        .collect();

    loop {
        let mut grew = false;
        for node in graph.active_nodes() {
            let name = node.name();
            if closed.contains(name) || name == gate_name {
                continue;
            }
            let in_edges: Vec<_> = topo.edges.iter().filter(|e| e.to == name).collect();
            if in_edges.is_empty() {
                continue;
            }
            let reachable_from_closure = in_edges.iter().any(|e| closed.contains(&e.from));
            let fully_enclosed = in_edges.iter().all(|e| {
                closed.contains(&e.from) || e.from == gate_name || e.from == name
            });
            if reachable_from_closure && fully_enclosed {
                closed.insert(name.to_string());
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    state.terminated.extend(closed);
    state.terminated.insert(gate_name.to_string());
}
