//! Node model: function nodes, nested graph nodes, routing gates, and
//! interrupts.
//!
//! A node declares a name, an ordered tuple of input names, and an ordered
//! tuple of output names. Edges between nodes are never declared explicitly;
//! the graph infers them by matching output names to input names. All node
//! values are immutable: the rename API (`with_name`, `with_inputs`,
//! `with_outputs`) returns a new node and records the rename so that a later
//! rename of a stale name can point at the current one.
//!
//! Runtime values are [`serde_json::Value`]; a node's callable receives a
//! [`ValueMap`] keyed by its parameter names and returns a single value that
//! is coerced onto its declared outputs (single output: the value itself,
//! multiple outputs: an array assigned positionally).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::{HypergraphError, NodeError, Result};
use crate::graph::Graph;
use crate::ident::{self, IntoNames, END};
use crate::scheduler::types::{ErrorPolicy, MapMode};
use crate::typecheck::TypeExpr;

/// Named runtime values flowing along edges.
pub type ValueMap = BTreeMap<String, Value>;

/// Synchronous node callable.
pub type SyncFn = Arc<dyn Fn(&ValueMap) -> std::result::Result<Value, NodeError> + Send + Sync>;

/// Asynchronous node callable.
pub type AsyncFn =
    Arc<dyn Fn(ValueMap) -> BoxFuture<'static, std::result::Result<Value, NodeError>> + Send + Sync>;

/// Streaming node callable; the scheduler drains the stream and hands the
/// collected chunks downstream as a list.
pub type StreamFn =
    Arc<dyn Fn(ValueMap) -> BoxStream<'static, std::result::Result<Value, NodeError>> + Send + Sync>;

/// Pure synchronous gate function.
pub type GateFn =
    Arc<dyn Fn(&ValueMap) -> std::result::Result<GateChoice, NodeError> + Send + Sync>;

/// Pre-bound interrupt auto-handler: receives the surfaced value, produces
/// the response.
pub type HandlerFn = Arc<dyn Fn(&Value) -> std::result::Result<Value, NodeError> + Send + Sync>;

/// The wrapped user callable of a [`FunctionNode`].
#[derive(Clone)]
pub enum Callable {
    Sync(SyncFn),
    Async(AsyncFn),
    Stream(StreamFn),
}

/// What a gate function decided.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateChoice {
    /// Route to a single declared target.
    To(String),
    /// Activate several targets (requires `multi_target`).
    Many(Vec<String>),
    /// Terminate the path through this gate.
    End,
    /// No decision; the gate's fallback applies.
    Skip,
}

/// Which name space a rename touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameKind {
    Name,
    Input,
    Output,
}

impl fmt::Display for RenameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenameKind::Name => write!(f, "name"),
            RenameKind::Input => write!(f, "input"),
            RenameKind::Output => write!(f, "output"),
        }
    }
}

/// One entry in a node's rename history. Excluded from definition hashes.
#[derive(Debug, Clone)]
pub struct RenameRecord {
    pub kind: RenameKind,
    pub old: String,
    pub new: String,
    /// Renames applied in one call share a batch id.
    pub batch: u32,
}

fn next_batch(history: &[RenameRecord]) -> u32 {
    history.last().map(|r| r.batch + 1).unwrap_or(0)
}

/// Follow `name` through the history and render the chain, e.g. `a -> b -> c`.
fn rename_chain(history: &[RenameRecord], kind: RenameKind, name: &str) -> String {
    let mut chain = vec![name.to_string()];
    let mut current = name.to_string();
    loop {
        match history
            .iter()
            .find(|r| r.kind == kind && r.old == current)
        {
            Some(record) => {
                current = record.new.clone();
                chain.push(current.clone());
            }
            None => break,
        }
    }
    chain.join(" -> ")
}

fn rename_error(node: &str, history: &[RenameRecord], kind: RenameKind, name: &str) -> HypergraphError {
    HypergraphError::Rename {
        node: node.to_string(),
        name: name.to_string(),
        chain: rename_chain(history, kind, name),
    }
}

fn check_no_duplicates(names: &[String], what: &str, node: &str) -> Result<()> {
    for (i, name) in names.iter().enumerate() {
        if names[i + 1..].contains(name) {
            return Err(HypergraphError::config(format!(
                "duplicate {what} '{name}' on node '{node}'. Each name may appear once."
            )));
        }
    }
    Ok(())
}

fn validate_names(names: &[String], what: &str) -> Result<()> {
    for name in names {
        ident::validate_identifier(name, what)?;
    }
    Ok(())
}

/// Coerce a callable's return value onto declared outputs.
///
/// Zero outputs ignore the returned value, one output takes it whole, and
/// `n` outputs require an array of exactly `n` elements assigned
/// positionally.
pub(crate) fn coerce_outputs(outputs: &[String], value: Value) -> std::result::Result<ValueMap, NodeError> {
    match outputs.len() {
        0 => Ok(ValueMap::new()),
        1 => {
            let mut map = ValueMap::new();
            map.insert(outputs[0].clone(), value);
            Ok(map)
        }
        n => match value {
            Value::Array(items) if items.len() == n => Ok(outputs
                .iter()
                .cloned()
                .zip(items)
                .collect()),
            Value::Array(items) => Err(format!(
                "expected {n} output values for outputs [{}], got {}",
                outputs.join(", "),
                items.len()
            )
            .into()),
            other => Err(format!(
                "expected an array of {n} values for outputs [{}], got {other}",
                outputs.join(", ")
            )
            .into()),
        },
    }
}

// ---------------------------------------------------------------------------
// FunctionNode
// ---------------------------------------------------------------------------

/// A node wrapping one user callable.
#[derive(Clone)]
pub struct FunctionNode {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    callable: Callable,
    /// Canonical input name (after renames) to the callable's parameter name.
    param_map: BTreeMap<String, String>,
    defaults: BTreeMap<String, Value>,
    cache: bool,
    emits: Vec<String>,
    waits_for: Vec<String>,
    definition_key: Option<String>,
    input_types: BTreeMap<String, TypeExpr>,
    output_types: BTreeMap<String, TypeExpr>,
    rename_history: Vec<RenameRecord>,
}

impl FunctionNode {
    fn build(
        name: impl Into<String>,
        inputs: impl IntoNames,
        outputs: impl IntoNames,
        callable: Callable,
    ) -> Result<Self> {
        let name = name.into();
        let inputs = inputs.into_names()?;
        let outputs = outputs.into_names()?;
        ident::validate_identifier(&name, "node name")?;
        validate_names(&inputs, "input name")?;
        validate_names(&outputs, "output name")?;
        check_no_duplicates(&inputs, "input", &name)?;
        check_no_duplicates(&outputs, "output", &name)?;
        let param_map = inputs.iter().map(|i| (i.clone(), i.clone())).collect();
        Ok(Self {
            name,
            inputs,
            outputs,
            callable,
            param_map,
            defaults: BTreeMap::new(),
            cache: false,
            emits: Vec::new(),
            waits_for: Vec::new(),
            definition_key: None,
            input_types: BTreeMap::new(),
            output_types: BTreeMap::new(),
            rename_history: Vec::new(),
        })
    }

    /// Node over a synchronous callable.
    pub fn new<F>(
        name: impl Into<String>,
        inputs: impl IntoNames,
        outputs: impl IntoNames,
        f: F,
    ) -> Result<Self>
    where
        F: Fn(&ValueMap) -> std::result::Result<Value, NodeError> + Send + Sync + 'static,
    {
        Self::build(name, inputs, outputs, Callable::Sync(Arc::new(f)))
    }

    /// Node over an async callable.
    pub fn new_async<F, Fut>(
        name: impl Into<String>,
        inputs: impl IntoNames,
        outputs: impl IntoNames,
        f: F,
    ) -> Result<Self>
    where
        F: Fn(ValueMap) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<Value, NodeError>> + Send + 'static,
    {
        Self::build(
            name,
            inputs,
            outputs,
            Callable::Async(Arc::new(move |vm| Box::pin(f(vm)))),
        )
    }

    /// Node over a streaming callable. The scheduler drains every chunk and
    /// merges the collected list downstream, so a streaming node declares
    /// exactly one output.
    pub fn streaming<F>(
        name: impl Into<String>,
        inputs: impl IntoNames,
        outputs: impl IntoNames,
        f: F,
    ) -> Result<Self>
    where
        F: Fn(ValueMap) -> BoxStream<'static, std::result::Result<Value, NodeError>>
            + Send
            + Sync
            + 'static,
    {
        let node = Self::build(name, inputs, outputs, Callable::Stream(Arc::new(f)))?;
        if node.outputs.len() != 1 {
            return Err(HypergraphError::config(format!(
                "streaming node '{}' must declare exactly one output; the collected chunk list is its value.",
                node.name
            )));
        }
        Ok(node)
    }

    /// Default value for a parameter, preserved across renames.
    pub fn with_default(mut self, param: &str, value: Value) -> Result<Self> {
        if !self.inputs.iter().any(|i| i == param) {
            return Err(HypergraphError::config(format!(
                "cannot set default for '{param}' on node '{}': not an input. Inputs: [{}].",
                self.name,
                self.inputs.join(", ")
            )));
        }
        self.defaults.insert(param.to_string(), value);
        Ok(self)
    }

    /// Opt this node into result caching.
    pub fn cached(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    /// Ordering-only signals this node emits after executing.
    pub fn emits(mut self, names: impl IntoNames) -> Result<Self> {
        let names = names.into_names()?;
        validate_names(&names, "emit name")?;
        self.emits = names;
        Ok(self)
    }

    /// Ordering-only signals this node waits for before becoming ready.
    pub fn waits_for(mut self, names: impl IntoNames) -> Result<Self> {
        let names = names.into_names()?;
        validate_names(&names, "wait_for name")?;
        self.waits_for = names;
        Ok(self)
    }

    /// Identity string standing in for the callable's source text. Required
    /// for definition hashing and therefore for caching across processes.
    pub fn with_definition_key(mut self, key: impl Into<String>) -> Self {
        self.definition_key = Some(key.into());
        self
    }

    pub fn with_input_type(mut self, param: &str, ty: TypeExpr) -> Result<Self> {
        if !self.inputs.iter().any(|i| i == param) {
            return Err(HypergraphError::config(format!(
                "cannot type '{param}' on node '{}': not an input.",
                self.name
            )));
        }
        self.input_types.insert(param.to_string(), ty);
        Ok(self)
    }

    pub fn with_output_type(mut self, output: &str, ty: TypeExpr) -> Result<Self> {
        if !self.outputs.iter().any(|o| o == output) {
            return Err(HypergraphError::config(format!(
                "cannot type '{output}' on node '{}': not an output.",
                self.name
            )));
        }
        self.output_types.insert(output.to_string(), ty);
        Ok(self)
    }

    pub fn is_async(&self) -> bool {
        matches!(self.callable, Callable::Async(_) | Callable::Stream(_))
    }

    pub fn is_generator(&self) -> bool {
        matches!(self.callable, Callable::Stream(_))
    }

    pub(crate) fn callable(&self) -> &Callable {
        &self.callable
    }

    /// Re-key canonical input names to the callable's parameter names.
    pub(crate) fn to_callable_params(&self, values: &ValueMap) -> ValueMap {
        values
            .iter()
            .map(|(name, value)| {
                let param = self.param_map.get(name).cloned().unwrap_or_else(|| name.clone());
                (param, value.clone())
            })
            .collect()
    }

    fn with_name_inner(mut self, new: &str) -> Result<Self> {
        ident::validate_identifier(new, "node name")?;
        let batch = next_batch(&self.rename_history);
        self.rename_history.push(RenameRecord {
            kind: RenameKind::Name,
            old: self.name.clone(),
            new: new.to_string(),
            batch,
        });
        self.name = new.to_string();
        Ok(self)
    }

    fn with_inputs_inner(mut self, renames: &[(&str, &str)]) -> Result<Self> {
        let batch = next_batch(&self.rename_history);
        for (old, new) in renames {
            ident::validate_identifier(new, "input name")?;
            let idx = self
                .inputs
                .iter()
                .position(|i| i == old)
                .ok_or_else(|| rename_error(&self.name, &self.rename_history, RenameKind::Input, old))?;
            if self.inputs.iter().any(|i| i == new) {
                return Err(HypergraphError::config(format!(
                    "cannot rename input '{old}' to '{new}' on node '{}': '{new}' already exists.",
                    self.name
                )));
            }
            self.inputs[idx] = new.to_string();
            if let Some(param) = self.param_map.remove(*old) {
                self.param_map.insert(new.to_string(), param);
            }
            if let Some(default) = self.defaults.remove(*old) {
                self.defaults.insert(new.to_string(), default);
            }
            if let Some(ty) = self.input_types.remove(*old) {
                self.input_types.insert(new.to_string(), ty);
            }
            self.rename_history.push(RenameRecord {
                kind: RenameKind::Input,
                old: old.to_string(),
                new: new.to_string(),
                batch,
            });
        }
        Ok(self)
    }

    fn with_outputs_inner(mut self, renames: &[(&str, &str)]) -> Result<Self> {
        let batch = next_batch(&self.rename_history);
        for (old, new) in renames {
            ident::validate_identifier(new, "output name")?;
            let idx = self
                .outputs
                .iter()
                .position(|o| o == old)
                .ok_or_else(|| rename_error(&self.name, &self.rename_history, RenameKind::Output, old))?;
            if self.outputs.iter().any(|o| o == new) {
                return Err(HypergraphError::config(format!(
                    "cannot rename output '{old}' to '{new}' on node '{}': '{new}' already exists.",
                    self.name
                )));
            }
            self.outputs[idx] = new.to_string();
            if let Some(ty) = self.output_types.remove(*old) {
                self.output_types.insert(new.to_string(), ty);
            }
            self.rename_history.push(RenameRecord {
                kind: RenameKind::Output,
                old: old.to_string(),
                new: new.to_string(),
                batch,
            });
        }
        Ok(self)
    }

    fn hash(&self) -> Result<String> {
        let key = self.definition_key.as_ref().ok_or_else(|| {
            HypergraphError::HashUnavailable {
                node: self.name.clone(),
            }
        })?;
        let mut parts: Vec<String> = vec!["function".into(), self.name.clone(), key.clone()];
        parts.push("inputs".into());
        parts.extend(self.inputs.iter().cloned());
        parts.push("outputs".into());
        parts.extend(self.outputs.iter().cloned());
        parts.push(format!("cache:{}", self.cache));
        parts.push("emits".into());
        parts.extend(self.emits.iter().cloned());
        parts.push("waits".into());
        parts.extend(self.waits_for.iter().cloned());
        Ok(ident::hash_definition(parts))
    }
}

impl fmt::Debug for FunctionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionNode")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("cache", &self.cache)
            .field("is_async", &self.is_async())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// GraphNode
// ---------------------------------------------------------------------------

/// Batch-map configuration on a nested graph node.
#[derive(Debug, Clone)]
pub struct MapSpec {
    /// Canonical input names fanned out over.
    pub params: Vec<String>,
    pub mode: MapMode,
    pub error_handling: ErrorPolicy,
}

/// A node wrapping a validated inner graph.
///
/// Built with [`Graph::as_node`]. The inner graph is owned by this node; the
/// outer graph owns the node, so ownership is a tree.
#[derive(Clone)]
pub struct GraphNode {
    name: String,
    graph: Arc<Graph>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    /// Canonical outer input name to inner parameter name.
    param_map: BTreeMap<String, String>,
    /// Canonical outer output name to inner output name.
    output_map: BTreeMap<String, String>,
    map_spec: Option<MapSpec>,
    rename_history: Vec<RenameRecord>,
}

impl GraphNode {
    pub(crate) fn from_graph(name: String, graph: Arc<Graph>) -> Result<Self> {
        ident::validate_identifier(&name, "node name")?;
        let spec = graph.input_spec();
        let mut inputs: Vec<String> = spec.required.to_vec();
        inputs.extend(spec.optional.iter().cloned());
        for params in spec.entrypoints.values() {
            for p in params {
                if !inputs.contains(p) {
                    inputs.push(p.clone());
                }
            }
        }
        let outputs = graph.output_names();
        let param_map = inputs.iter().map(|i| (i.clone(), i.clone())).collect();
        let output_map = outputs.iter().map(|o| (o.clone(), o.clone())).collect();
        Ok(Self {
            name,
            graph,
            inputs,
            outputs,
            param_map,
            output_map,
            map_spec: None,
            rename_history: Vec::new(),
        })
    }

    /// Fan each run out over list-valued `params`.
    ///
    /// In `zip` mode all mapped lists must have equal length; `product` mode
    /// iterates their Cartesian product. Mapped outputs become parallel
    /// lists, so their declared types are wrapped as `list[T]` for the
    /// strict-types check.
    pub fn map_over(
        mut self,
        params: impl IntoNames,
        mode: MapMode,
        error_handling: ErrorPolicy,
    ) -> Result<Self> {
        let params = params.into_names()?;
        for p in &params {
            if !self.inputs.iter().any(|i| i == p) {
                return Err(HypergraphError::config(format!(
                    "cannot map over '{p}' on node '{}': not an input. Inputs: [{}].",
                    self.name,
                    self.inputs.join(", ")
                )));
            }
        }
        if params.is_empty() {
            return Err(HypergraphError::config(format!(
                "map_over on node '{}' needs at least one parameter.",
                self.name
            )));
        }
        self.map_spec = Some(MapSpec {
            params,
            mode,
            error_handling,
        });
        Ok(self)
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn map_spec(&self) -> Option<&MapSpec> {
        self.map_spec.as_ref()
    }

    /// Re-key canonical outer inputs to inner parameter names.
    pub(crate) fn to_inner_params(&self, values: &ValueMap) -> ValueMap {
        values
            .iter()
            .map(|(name, value)| {
                let inner = self.param_map.get(name).cloned().unwrap_or_else(|| name.clone());
                (inner, value.clone())
            })
            .collect()
    }

    /// Re-key inner outputs to canonical outer output names.
    pub(crate) fn from_inner_outputs(&self, values: ValueMap) -> ValueMap {
        self.output_map
            .iter()
            .filter_map(|(outer, inner)| values.get(inner).map(|v| (outer.clone(), v.clone())))
            .collect()
    }

    pub fn is_async(&self) -> bool {
        self.graph.has_async_nodes()
    }

    fn has_default(&self, param: &str) -> bool {
        let inner = self.param_map.get(param).cloned().unwrap_or_else(|| param.to_string());
        let spec = self.graph.input_spec();
        spec.optional.contains(&inner)
    }

    fn default_value(&self, param: &str) -> Option<Value> {
        let inner = self.param_map.get(param).cloned().unwrap_or_else(|| param.to_string());
        self.graph.resolved_default(&inner)
    }

    fn with_name_inner(mut self, new: &str) -> Result<Self> {
        ident::validate_identifier(new, "node name")?;
        let batch = next_batch(&self.rename_history);
        self.rename_history.push(RenameRecord {
            kind: RenameKind::Name,
            old: self.name.clone(),
            new: new.to_string(),
            batch,
        });
        self.name = new.to_string();
        Ok(self)
    }

    fn with_inputs_inner(mut self, renames: &[(&str, &str)]) -> Result<Self> {
        let batch = next_batch(&self.rename_history);
        for (old, new) in renames {
            ident::validate_identifier(new, "input name")?;
            let idx = self
                .inputs
                .iter()
                .position(|i| i == old)
                .ok_or_else(|| rename_error(&self.name, &self.rename_history, RenameKind::Input, old))?;
            self.inputs[idx] = new.to_string();
            if let Some(inner) = self.param_map.remove(*old) {
                self.param_map.insert(new.to_string(), inner);
            }
            if let Some(spec) = self.map_spec.as_mut() {
                for p in spec.params.iter_mut() {
                    if p == old {
                        *p = new.to_string();
                    }
                }
            }
            self.rename_history.push(RenameRecord {
                kind: RenameKind::Input,
                old: old.to_string(),
                new: new.to_string(),
                batch,
            });
        }
        Ok(self)
    }

    fn with_outputs_inner(mut self, renames: &[(&str, &str)]) -> Result<Self> {
        let batch = next_batch(&self.rename_history);
        for (old, new) in renames {
            ident::validate_identifier(new, "output name")?;
            let idx = self
                .outputs
                .iter()
                .position(|o| o == old)
                .ok_or_else(|| rename_error(&self.name, &self.rename_history, RenameKind::Output, old))?;
            self.outputs[idx] = new.to_string();
            if let Some(inner) = self.output_map.remove(*old) {
                self.output_map.insert(new.to_string(), inner);
            }
            self.rename_history.push(RenameRecord {
                kind: RenameKind::Output,
                old: old.to_string(),
                new: new.to_string(),
                batch,
            });
        }
        Ok(self)
    }

    fn hash(&self) -> Result<String> {
        let mut parts: Vec<String> = vec!["graph-node".into(), self.name.clone()];
        parts.push(self.graph.definition_hash()?);
        parts.push("inputs".into());
        parts.extend(self.inputs.iter().cloned());
        parts.push("outputs".into());
        parts.extend(self.outputs.iter().cloned());
        if let Some(spec) = &self.map_spec {
            parts.push(format!("map:{:?}:{:?}", spec.mode, spec.error_handling));
            parts.extend(spec.params.iter().cloned());
        }
        Ok(ident::hash_definition(parts))
    }
}

impl fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphNode")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("mapped", &self.map_spec.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RouteNode
// ---------------------------------------------------------------------------

/// A routing gate: a pure synchronous function choosing which declared
/// targets may run in the current generation.
#[derive(Clone)]
pub struct RouteNode {
    name: String,
    inputs: Vec<String>,
    gate: GateFn,
    param_map: BTreeMap<String, String>,
    targets: Vec<String>,
    fallback: Option<String>,
    multi_target: bool,
    default_open: bool,
    cache: bool,
    binary: bool,
    defaults: BTreeMap<String, Value>,
    definition_key: Option<String>,
    input_types: BTreeMap<String, TypeExpr>,
    rename_history: Vec<RenameRecord>,
}

impl RouteNode {
    /// N-way gate over `targets` (node names, or [`END`]).
    pub fn new<F>(
        name: impl Into<String>,
        inputs: impl IntoNames,
        targets: impl IntoNames,
        f: F,
    ) -> Result<Self>
    where
        F: Fn(&ValueMap) -> std::result::Result<GateChoice, NodeError> + Send + Sync + 'static,
    {
        let name = name.into();
        let inputs = inputs.into_names()?;
        let targets = targets.into_names()?;
        ident::validate_identifier(&name, "node name")?;
        validate_names(&inputs, "input name")?;
        check_no_duplicates(&inputs, "input", &name)?;
        check_no_duplicates(&targets, "target", &name)?;
        if targets.is_empty() {
            return Err(HypergraphError::config(format!(
                "gate '{name}' declares no targets. Declare at least one target or END."
            )));
        }
        for target in &targets {
            if target == &name {
                return Err(HypergraphError::config(format!(
                    "gate '{name}' targets itself. Remove the self-target."
                )));
            }
            if target != END {
                ident::validate_identifier(target, "gate target")?;
            }
        }
        let param_map = inputs.iter().map(|i| (i.clone(), i.clone())).collect();
        Ok(Self {
            name,
            inputs,
            gate: Arc::new(f),
            param_map,
            targets,
            fallback: None,
            multi_target: false,
            default_open: true,
            cache: false,
            binary: false,
            defaults: BTreeMap::new(),
            definition_key: None,
            input_types: BTreeMap::new(),
            rename_history: Vec::new(),
        })
    }

    /// Binary gate: the predicate picks `when_true` or `when_false`.
    pub fn if_else<F>(
        name: impl Into<String>,
        inputs: impl IntoNames,
        when_true: impl Into<String>,
        when_false: impl Into<String>,
        predicate: F,
    ) -> Result<Self>
    where
        F: Fn(&ValueMap) -> std::result::Result<bool, NodeError> + Send + Sync + 'static,
    {
        let when_true = when_true.into();
        let when_false = when_false.into();
        let (t, f_) = (when_true.clone(), when_false.clone());
        let mut gate = Self::new(
            name,
            inputs,
            vec![when_true, when_false],
            move |values: &ValueMap| {
                let choice = predicate(values)?;
                Ok(GateChoice::To(if choice { t.clone() } else { f_.clone() }))
            },
        )?;
        gate.binary = true;
        Ok(gate)
    }

    /// Target used when the gate function returns [`GateChoice::Skip`].
    pub fn with_fallback(mut self, target: impl Into<String>) -> Result<Self> {
        let target = target.into();
        if !self.targets.contains(&target) {
            return Err(HypergraphError::config(format!(
                "fallback '{target}' of gate '{}' is not a declared target. Targets: [{}].",
                self.name,
                self.targets.join(", ")
            )));
        }
        self.fallback = Some(target);
        Ok(self)
    }

    /// Allow the gate function to return several targets at once.
    pub fn multi_target(mut self, multi: bool) -> Self {
        self.multi_target = multi;
        self
    }

    /// Whether targets may run before this gate has fired in the current
    /// generation. Targets inside a mutex region are always blocked until
    /// the gate fires, regardless of this flag.
    pub fn default_open(mut self, open: bool) -> Self {
        self.default_open = open;
        self
    }

    pub fn cached(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_default(mut self, param: &str, value: Value) -> Result<Self> {
        if !self.inputs.iter().any(|i| i == param) {
            return Err(HypergraphError::config(format!(
                "cannot set default for '{param}' on gate '{}': not an input.",
                self.name
            )));
        }
        self.defaults.insert(param.to_string(), value);
        Ok(self)
    }

    pub fn with_definition_key(mut self, key: impl Into<String>) -> Self {
        self.definition_key = Some(key.into());
        self
    }

    pub fn with_input_type(mut self, param: &str, ty: TypeExpr) -> Result<Self> {
        if !self.inputs.iter().any(|i| i == param) {
            return Err(HypergraphError::config(format!(
                "cannot type '{param}' on gate '{}': not an input.",
                self.name
            )));
        }
        self.input_types.insert(param.to_string(), ty);
        Ok(self)
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn fallback(&self) -> Option<&str> {
        self.fallback.as_deref()
    }

    pub fn is_multi_target(&self) -> bool {
        self.multi_target
    }

    pub fn is_default_open(&self) -> bool {
        self.default_open
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Run the gate function and validate its decision against the declared
    /// targets. Does not interpret fallbacks; the scheduler applies those.
    pub(crate) fn decide(&self, values: &ValueMap) -> std::result::Result<GateChoice, NodeError> {
        let params: ValueMap = values
            .iter()
            .map(|(name, value)| {
                let p = self.param_map.get(name).cloned().unwrap_or_else(|| name.clone());
                (p, value.clone())
            })
            .collect();
        let choice = (self.gate)(&params)?;
        match &choice {
            GateChoice::To(target) => {
                if target != END && !self.targets.contains(target) {
                    return Err(format!(
                        "gate '{}' chose undeclared target '{target}'. Targets: [{}].",
                        self.name,
                        self.targets.join(", ")
                    )
                    .into());
                }
            }
            GateChoice::Many(targets) => {
                if !self.multi_target {
                    return Err(format!(
                        "gate '{}' returned multiple targets but is not multi_target.",
                        self.name
                    )
                    .into());
                }
                for target in targets {
                    if target != END && !self.targets.contains(target) {
                        return Err(format!(
                            "gate '{}' chose undeclared target '{target}'. Targets: [{}].",
                            self.name,
                            self.targets.join(", ")
                        )
                        .into());
                    }
                }
            }
            GateChoice::End | GateChoice::Skip => {}
        }
        Ok(choice)
    }

    fn with_name_inner(mut self, new: &str) -> Result<Self> {
        ident::validate_identifier(new, "node name")?;
        if self.targets.iter().any(|t| t == new) {
            return Err(HypergraphError::config(format!(
                "renaming gate '{}' to '{new}' would make it target itself.",
                self.name
            )));
        }
        let batch = next_batch(&self.rename_history);
        self.rename_history.push(RenameRecord {
            kind: RenameKind::Name,
            old: self.name.clone(),
            new: new.to_string(),
            batch,
        });
        self.name = new.to_string();
        Ok(self)
    }

    fn with_inputs_inner(mut self, renames: &[(&str, &str)]) -> Result<Self> {
        let batch = next_batch(&self.rename_history);
        for (old, new) in renames {
            ident::validate_identifier(new, "input name")?;
            let idx = self
                .inputs
                .iter()
                .position(|i| i == old)
                .ok_or_else(|| rename_error(&self.name, &self.rename_history, RenameKind::Input, old))?;
            self.inputs[idx] = new.to_string();
            if let Some(p) = self.param_map.remove(*old) {
                self.param_map.insert(new.to_string(), p);
            }
            if let Some(d) = self.defaults.remove(*old) {
                self.defaults.insert(new.to_string(), d);
            }
            if let Some(ty) = self.input_types.remove(*old) {
                self.input_types.insert(new.to_string(), ty);
            }
            self.rename_history.push(RenameRecord {
                kind: RenameKind::Input,
                old: old.to_string(),
                new: new.to_string(),
                batch,
            });
        }
        Ok(self)
    }

    fn hash(&self) -> Result<String> {
        let key = self.definition_key.as_ref().ok_or_else(|| {
            HypergraphError::HashUnavailable {
                node: self.name.clone(),
            }
        })?;
        let mut parts: Vec<String> = vec!["gate".into(), self.name.clone(), key.clone()];
        parts.push("inputs".into());
        parts.extend(self.inputs.iter().cloned());
        parts.push("targets".into());
        parts.extend(self.targets.iter().cloned());
        parts.push(format!(
            "multi:{} open:{} cache:{} binary:{} fallback:{}",
            self.multi_target,
            self.default_open,
            self.cache,
            self.binary,
            self.fallback.as_deref().unwrap_or("-")
        ));
        Ok(ident::hash_definition(parts))
    }
}

impl fmt::Debug for RouteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteNode")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("targets", &self.targets)
            .field("multi_target", &self.multi_target)
            .field("default_open", &self.default_open)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// InterruptNode
// ---------------------------------------------------------------------------

/// A declarative pause point.
///
/// Exactly one input (the value surfaced to the caller) and exactly one
/// output (the response injected on resume). With a pre-bound handler the
/// node resolves inline and never pauses. Never cached; its identity is the
/// pause point, so the handler is excluded from the hash.
#[derive(Clone)]
pub struct InterruptNode {
    name: String,
    input: String,
    output: String,
    response_type: Option<TypeExpr>,
    handler: Option<HandlerFn>,
    rename_history: Vec<RenameRecord>,
}

impl InterruptNode {
    pub fn new(
        name: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let input = input.into();
        let output = output.into();
        ident::validate_identifier(&name, "node name")?;
        ident::validate_identifier(&input, "input name")?;
        ident::validate_identifier(&output, "output name")?;
        if input == output {
            return Err(HypergraphError::config(format!(
                "interrupt '{name}' uses '{input}' as both input and output. Use distinct names."
            )));
        }
        Ok(Self {
            name,
            input,
            output,
            response_type: None,
            handler: None,
            rename_history: Vec::new(),
        })
    }

    /// Declared type of the response, checked at build time under
    /// strict types.
    pub fn with_response_type(mut self, ty: TypeExpr) -> Self {
        self.response_type = Some(ty);
        self
    }

    /// Auto-handler: resolves the pause inline instead of suspending the run.
    pub fn with_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<Value, NodeError> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(f));
        self
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn response_type(&self) -> Option<&TypeExpr> {
        self.response_type.as_ref()
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub(crate) fn resolve(&self, value: &Value) -> Option<std::result::Result<Value, NodeError>> {
        self.handler.as_ref().map(|h| h(value))
    }

    fn with_name_inner(mut self, new: &str) -> Result<Self> {
        ident::validate_identifier(new, "node name")?;
        let batch = next_batch(&self.rename_history);
        self.rename_history.push(RenameRecord {
            kind: RenameKind::Name,
            old: self.name.clone(),
            new: new.to_string(),
            batch,
        });
        self.name = new.to_string();
        Ok(self)
    }

    fn with_inputs_inner(mut self, renames: &[(&str, &str)]) -> Result<Self> {
        let batch = next_batch(&self.rename_history);
        for (old, new) in renames {
            ident::validate_identifier(new, "input name")?;
            if *old != self.input {
                return Err(rename_error(&self.name, &self.rename_history, RenameKind::Input, old));
            }
            self.rename_history.push(RenameRecord {
                kind: RenameKind::Input,
                old: old.to_string(),
                new: new.to_string(),
                batch,
            });
            self.input = new.to_string();
        }
        Ok(self)
    }

    fn with_outputs_inner(mut self, renames: &[(&str, &str)]) -> Result<Self> {
        let batch = next_batch(&self.rename_history);
        for (old, new) in renames {
            ident::validate_identifier(new, "output name")?;
            if *old != self.output {
                return Err(rename_error(&self.name, &self.rename_history, RenameKind::Output, old));
            }
            self.rename_history.push(RenameRecord {
                kind: RenameKind::Output,
                old: old.to_string(),
                new: new.to_string(),
                batch,
            });
            self.output = new.to_string();
        }
        Ok(self)
    }

    fn hash(&self) -> Result<String> {
        let ty = self
            .response_type
            .as_ref()
            .map(TypeExpr::render)
            .unwrap_or_else(|| "-".to_string());
        Ok(ident::hash_definition([
            "interrupt",
            &self.name,
            &self.input,
            &self.output,
            &ty,
        ]))
    }
}

impl fmt::Debug for InterruptNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptNode")
            .field("name", &self.name)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Any node a graph can hold.
#[derive(Debug, Clone)]
pub enum Node {
    Function(FunctionNode),
    Graph(GraphNode),
    Route(RouteNode),
    Interrupt(InterruptNode),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Function(n) => &n.name,
            Node::Graph(n) => &n.name,
            Node::Route(n) => &n.name,
            Node::Interrupt(n) => &n.name,
        }
    }

    pub fn inputs(&self) -> Vec<String> {
        match self {
            Node::Function(n) => n.inputs.clone(),
            Node::Graph(n) => n.inputs.clone(),
            Node::Route(n) => n.inputs.clone(),
            Node::Interrupt(n) => vec![n.input.clone()],
        }
    }

    /// Data outputs. Empty for gates.
    pub fn outputs(&self) -> Vec<String> {
        match self {
            Node::Function(n) => n.outputs.clone(),
            Node::Graph(n) => n.outputs.clone(),
            Node::Route(_) => Vec::new(),
            Node::Interrupt(n) => vec![n.output.clone()],
        }
    }

    pub fn is_async(&self) -> bool {
        match self {
            Node::Function(n) => n.is_async(),
            Node::Graph(n) => n.is_async(),
            Node::Route(_) | Node::Interrupt(_) => false,
        }
    }

    pub fn is_generator(&self) -> bool {
        match self {
            Node::Function(n) => n.is_generator(),
            _ => false,
        }
    }

    pub fn is_gate(&self) -> bool {
        matches!(self, Node::Route(_))
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Node::Interrupt(_))
    }

    pub fn cache_enabled(&self) -> bool {
        match self {
            Node::Function(n) => n.cache,
            Node::Route(n) => n.cache,
            Node::Graph(_) | Node::Interrupt(_) => false,
        }
    }

    pub fn has_default(&self, param: &str) -> bool {
        match self {
            Node::Function(n) => n.defaults.contains_key(param),
            Node::Graph(n) => n.has_default(param),
            Node::Route(n) => n.defaults.contains_key(param),
            Node::Interrupt(_) => false,
        }
    }

    pub fn default_value(&self, param: &str) -> Option<Value> {
        match self {
            Node::Function(n) => n.defaults.get(param).cloned(),
            Node::Graph(n) => n.default_value(param),
            Node::Route(n) => n.defaults.get(param).cloned(),
            Node::Interrupt(_) => None,
        }
    }

    pub fn emits(&self) -> &[String] {
        match self {
            Node::Function(n) => &n.emits,
            _ => &[],
        }
    }

    pub fn waits_for(&self) -> &[String] {
        match self {
            Node::Function(n) => &n.waits_for,
            _ => &[],
        }
    }

    pub fn input_type(&self, param: &str) -> Option<TypeExpr> {
        match self {
            Node::Function(n) => n.input_types.get(param).cloned(),
            Node::Route(n) => n.input_types.get(param).cloned(),
            Node::Graph(n) => {
                let inner = n.param_map.get(param)?;
                n.graph.input_type(inner)
            }
            // The surfaced value is opaque to the pause point.
            Node::Interrupt(_) => Some(TypeExpr::Any),
        }
    }

    pub fn output_type(&self, output: &str) -> Option<TypeExpr> {
        match self {
            Node::Function(n) => n.output_types.get(output).cloned(),
            Node::Interrupt(n) if output == n.output => n.response_type.clone(),
            Node::Graph(n) => {
                // Mapped outputs surface as lists of the inner type.
                let inner = n.output_map.get(output)?;
                let ty = n.graph.output_type(inner)?;
                if n.map_spec.is_some() {
                    Some(TypeExpr::list_of(ty))
                } else {
                    Some(ty)
                }
            }
            _ => None,
        }
    }

    pub fn rename_history(&self) -> &[RenameRecord] {
        match self {
            Node::Function(n) => &n.rename_history,
            Node::Graph(n) => &n.rename_history,
            Node::Route(n) => &n.rename_history,
            Node::Interrupt(n) => &n.rename_history,
        }
    }

    /// Deterministic 64-hex digest over the node's semantic identity.
    ///
    /// Fails with [`HypergraphError::HashUnavailable`] when the node wraps a
    /// callable with no definition key.
    pub fn definition_hash(&self) -> Result<String> {
        match self {
            Node::Function(n) => n.hash(),
            Node::Graph(n) => n.hash(),
            Node::Route(n) => n.hash(),
            Node::Interrupt(n) => n.hash(),
        }
    }

    /// Rename the node, returning a new node.
    pub fn with_name(&self, new: &str) -> Result<Node> {
        match self.clone() {
            Node::Function(n) => Ok(Node::Function(n.with_name_inner(new)?)),
            Node::Graph(n) => Ok(Node::Graph(n.with_name_inner(new)?)),
            Node::Route(n) => Ok(Node::Route(n.with_name_inner(new)?)),
            Node::Interrupt(n) => Ok(Node::Interrupt(n.with_name_inner(new)?)),
        }
    }

    /// Rename inputs, returning a new node. Every `(old, new)` pair must
    /// name a current input.
    pub fn with_inputs(&self, renames: &[(&str, &str)]) -> Result<Node> {
        match self.clone() {
            Node::Function(n) => Ok(Node::Function(n.with_inputs_inner(renames)?)),
            Node::Graph(n) => Ok(Node::Graph(n.with_inputs_inner(renames)?)),
            Node::Route(n) => Ok(Node::Route(n.with_inputs_inner(renames)?)),
            Node::Interrupt(n) => Ok(Node::Interrupt(n.with_inputs_inner(renames)?)),
        }
    }

    /// Rename outputs, returning a new node.
    pub fn with_outputs(&self, renames: &[(&str, &str)]) -> Result<Node> {
        match self.clone() {
            Node::Function(n) => Ok(Node::Function(n.with_outputs_inner(renames)?)),
            Node::Graph(n) => Ok(Node::Graph(n.with_outputs_inner(renames)?)),
            Node::Route(n) => Err(HypergraphError::config(format!(
                "gate '{}' has no outputs to rename.",
                n.name
            ))),
            Node::Interrupt(n) => Ok(Node::Interrupt(n.with_outputs_inner(renames)?)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Node::Function(_) => "function",
            Node::Graph(_) => "graph",
            Node::Route(_) => "route",
            Node::Interrupt(_) => "interrupt",
        }
    }
}

impl From<FunctionNode> for Node {
    fn from(n: FunctionNode) -> Self {
        Node::Function(n)
    }
}

impl From<GraphNode> for Node {
    fn from(n: GraphNode) -> Self {
        Node::Graph(n)
    }
}

impl From<RouteNode> for Node {
    fn from(n: RouteNode) -> Self {
        Node::Route(n)
    }
}

impl From<InterruptNode> for Node {
    fn from(n: InterruptNode) -> Self {
        Node::Interrupt(n)
    }
}
