//! The superstep loop.
//!
//! One run proceeds as: normalize and validate inputs, seed the versioned
//! store, then loop { apply gate decisions, compute the ready set, execute
//! the batch, merge outputs under a new version } until quiescence, END
//! termination, a pause, a failure under the raise policy, a stop request,
//! or the superstep budget. Nodes in one batch all observe the snapshot
//! taken when the batch was selected; their outputs become visible together
//! at the superstep boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::StreamExt;
use hypergraph_cache::{CacheBackend, CacheKey};
use serde_json::Value;

use crate::error::{HypergraphError, NodeError, Result};
use crate::event::{Event, EventDispatcher, EventKind};
use crate::graph::Graph;
use crate::ident::{self, END};
use crate::node::{Callable, GateChoice, Node, ValueMap};

use super::algo::{apply_decision, compute_ready, ExecState, ReadyNode};
use super::store::VersionedStore;
use super::types::{
    ErrorPolicy, MapMode, MissingPolicy, OverridePolicy, PauseInfo, RunOptions, RunResult,
    RunStatus, StepRecord, StepSink, StepStatus,
};

/// Scheduling mode of the runner driving this scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerMode {
    /// One node at a time, declaration order; rejects async nodes.
    Sequential,
    /// Independent nodes within a superstep run concurrently.
    Concurrent,
}

impl RunnerMode {
    fn name(self) -> &'static str {
        match self {
            RunnerMode::Sequential => "sequential",
            RunnerMode::Concurrent => "concurrent",
        }
    }
}

/// Outcome of one node execution.
enum Outcome {
    Produced(ValueMap),
    Decision { choice: GateChoice, cached: bool },
    Pause(PauseInfo),
    Failure(Arc<dyn std::error::Error + Send + Sync>),
}

struct Executed {
    name: String,
    consumed: BTreeMap<String, u64>,
    seen_signals: BTreeMap<String, u64>,
    outcome: Outcome,
    child_run_id: Option<String>,
}

/// Validated inputs, ready for seeding.
struct Prepared {
    seeds: ValueMap,
    excluded: BTreeSet<String>,
    /// Response keys destined for nested graphs.
    resume: ValueMap,
}

pub(crate) struct Scheduler {
    pub mode: RunnerMode,
    pub cache: Option<Arc<dyn CacheBackend>>,
    pub dispatcher: EventDispatcher,
    pub step_sink: Option<Arc<dyn StepSink>>,
}

impl Scheduler {
    /// Entry point; boxed so nested graph nodes can recurse.
    pub(crate) fn run<'a>(
        &'a self,
        graph: &'a Graph,
        provided: ValueMap,
        opts: &'a RunOptions,
        parent_span: Option<String>,
        path: String,
    ) -> BoxFuture<'a, Result<RunResult>> {
        Box::pin(self.run_inner(graph, provided, opts, parent_span, path))
    }

    async fn run_inner(
        &self,
        graph: &Graph,
        provided: ValueMap,
        opts: &RunOptions,
        parent_span: Option<String>,
        path: String,
    ) -> Result<RunResult> {
        // Run-time select/entrypoint compose with the graph's own narrowing.
        let mut narrowed: Option<Graph> = None;
        if let Some(selection) = &opts.select {
            narrowed = Some(graph.select(selection.clone())?);
        }
        if let Some(entry) = &opts.entrypoint {
            let base = narrowed.as_ref().unwrap_or(graph);
            if base.node(entry).is_some() {
                narrowed = Some(base.with_entrypoint(entry.clone())?);
            } else {
                return Err(HypergraphError::InvalidOptions(format!(
                    "entrypoint '{entry}' is not a node in the graph."
                )));
            }
        }
        let graph = narrowed.as_ref().unwrap_or(graph);

        if self.mode == RunnerMode::Sequential && graph.has_async_nodes() {
            return Err(HypergraphError::IncompatibleRunner {
                capability: "async nodes".to_string(),
                runner: self.mode.name().to_string(),
            });
        }
        if self.cache.is_some() {
            for node in graph.active_nodes().filter(|n| n.cache_enabled()) {
                node.definition_hash()?;
            }
        }

        let prepared = prepare_inputs(graph, provided, opts)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let run_span = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();

        let mut store = VersionedStore::new();
        for (name, value) in &prepared.seeds {
            store.seed(name.clone(), value.clone());
        }
        let mut state = ExecState {
            excluded: prepared.excluded.clone(),
            ..ExecState::default()
        };

        self.emit(
            &run_id,
            &run_span,
            parent_span.clone(),
            EventKind::RunStart {
                graph_name: graph.name().map(str::to_string),
            },
        )
        .await;

        let max_iterations = opts.effective_max_iterations();
        let mut pending: Vec<(String, GateChoice, BTreeMap<String, u64>)> = Vec::new();
        let mut superstep: usize = 0;
        let mut run_error: Option<Arc<dyn std::error::Error + Send + Sync>> = None;
        let mut pause: Option<PauseInfo> = None;
        let mut stopped = false;

        loop {
            if let Some(stop) = &opts.stop {
                if stop.is_requested() {
                    self.emit(&run_id, &run_span, parent_span.clone(), EventKind::StopRequested)
                        .await;
                    self.sink_step(StepRecord {
                        node_name: path.trim_end_matches('.').to_string(),
                        superstep,
                        consumed_input_versions: BTreeMap::new(),
                        produced_output_versions: BTreeMap::new(),
                        status: StepStatus::Stopped,
                        partial_outputs: ValueMap::new(),
                        error: None,
                        pause: None,
                        child_run_id: None,
                    });
                    stopped = true;
                    break;
                }
            }

            for (gate, choice, consumed) in pending.drain(..) {
                apply_decision(graph, &mut state, &gate, &choice, consumed);
            }

            let batch = compute_ready(graph, &store, &state);
            if batch.is_empty() {
                break;
            }
            if superstep >= max_iterations {
                self.finish(&run_id, &run_span, parent_span.clone(), RunStatus::Failed, path.is_empty())
                    .await;
                return Err(HypergraphError::InfiniteLoop { max_iterations });
            }
            superstep += 1;
            tracing::debug!(superstep, batch = ?batch.iter().map(|r| &r.name).collect::<Vec<_>>(), "superstep");

            let outcomes = self
                .execute_batch(graph, batch, &prepared.resume, opts, &run_id, &run_span, &path)
                .await;

            for executed in outcomes {
                let node = graph.node(&executed.name).expect("executed node exists");
                store.record_consumed(&executed.name, executed.consumed.clone());
                store.record_seen_signals(&executed.name, executed.seen_signals.clone());
                match executed.outcome {
                    Outcome::Produced(outputs) => {
                        let version = superstep as u64;
                        let mut produced_versions = BTreeMap::new();
                        for (name, value) in &outputs {
                            store.merge(name.clone(), value.clone(), version);
                            produced_versions.insert(name.clone(), version);
                        }
                        for signal in node.emits() {
                            store.bump_signal(signal);
                        }
                        // A node never observes its own write as staleness:
                        // self-edge inputs advance to the version just
                        // produced.
                        let inputs = node.inputs();
                        let mut consumed_final = executed.consumed.clone();
                        for (name, version) in &produced_versions {
                            if inputs.contains(name) {
                                consumed_final.insert(name.clone(), *version);
                            }
                        }
                        store.record_consumed(&executed.name, consumed_final);
                        self.sink_step(StepRecord {
                            node_name: executed.name.clone(),
                            superstep,
                            consumed_input_versions: executed.consumed,
                            produced_output_versions: produced_versions,
                            status: StepStatus::Completed,
                            partial_outputs: outputs,
                            error: None,
                            pause: None,
                            child_run_id: executed.child_run_id,
                        });
                    }
                    Outcome::Decision { choice, .. } => {
                        pending.push((executed.name.clone(), choice, executed.consumed.clone()));
                        self.sink_step(StepRecord {
                            node_name: executed.name.clone(),
                            superstep,
                            consumed_input_versions: executed.consumed,
                            produced_output_versions: BTreeMap::new(),
                            status: StepStatus::Completed,
                            partial_outputs: ValueMap::new(),
                            error: None,
                            pause: None,
                            child_run_id: None,
                        });
                    }
                    Outcome::Pause(info) => {
                        self.sink_step(StepRecord {
                            node_name: executed.name.clone(),
                            superstep,
                            consumed_input_versions: executed.consumed,
                            produced_output_versions: BTreeMap::new(),
                            status: StepStatus::Paused,
                            partial_outputs: ValueMap::new(),
                            error: None,
                            pause: Some(info.clone()),
                            child_run_id: executed.child_run_id,
                        });
                        pause.get_or_insert(info);
                    }
                    Outcome::Failure(err) => {
                        self.sink_step(StepRecord {
                            node_name: executed.name.clone(),
                            superstep,
                            consumed_input_versions: executed.consumed,
                            produced_output_versions: BTreeMap::new(),
                            status: StepStatus::Failed,
                            partial_outputs: ValueMap::new(),
                            error: Some(err.to_string()),
                            pause: None,
                            child_run_id: executed.child_run_id,
                        });
                        match opts.error_handling {
                            ErrorPolicy::Raise => {
                                self.finish(&run_id, &run_span, parent_span.clone(), RunStatus::Failed, path.is_empty())
                                    .await;
                                return Err(HypergraphError::NodeExecution {
                                    node: format!("{path}{}", executed.name),
                                    source: err,
                                });
                            }
                            ErrorPolicy::Continue => {
                                state.failed.insert(executed.name.clone());
                                run_error.get_or_insert(err);
                            }
                        }
                    }
                }
            }

            if pause.is_some() {
                break;
            }
        }

        let values = store.select_values(&graph.output_names());
        let status = if run_error.is_some() {
            RunStatus::Failed
        } else if pause.is_some() {
            RunStatus::Paused
        } else if stopped && !graph.output_names().iter().all(|o| store.contains(o)) {
            RunStatus::Stopped
        } else {
            RunStatus::Completed
        };
        self.finish(&run_id, &run_span, parent_span, status, path.is_empty()).await;

        Ok(RunResult {
            run_id,
            status,
            values,
            error: run_error,
            pause,
            supersteps: superstep,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn execute_batch(
        &self,
        graph: &Graph,
        batch: Vec<ReadyNode>,
        resume: &ValueMap,
        opts: &RunOptions,
        run_id: &str,
        run_span: &str,
        path: &str,
    ) -> Vec<Executed> {
        match self.mode {
            RunnerMode::Sequential => {
                let mut outcomes = Vec::with_capacity(batch.len());
                for ready in batch {
                    outcomes.push(
                        self.execute_node(graph, ready, resume, opts, run_id, run_span, path)
                            .await,
                    );
                }
                outcomes
            }
            RunnerMode::Concurrent => {
                let limit = opts.max_concurrency.unwrap_or(batch.len().max(1));
                futures::stream::iter(
                    batch
                        .into_iter()
                        .map(|ready| self.execute_node(graph, ready, resume, opts, run_id, run_span, path)),
                )
                .buffered(limit)
                .collect()
                .await
            }
        }
    }

    async fn execute_node(
        &self,
        graph: &Graph,
        ready: ReadyNode,
        resume: &ValueMap,
        opts: &RunOptions,
        run_id: &str,
        run_span: &str,
        path: &str,
    ) -> Executed {
        let node = graph.node(&ready.name).expect("ready node exists");
        let span = uuid::Uuid::new_v4().to_string();
        let parent = Some(run_span.to_string());

        let outcome = match node {
            Node::Function(_) => {
                self.run_function(node, &ready, run_id, &span, parent.clone())
                    .await
            }
            Node::Route(_) => {
                self.run_gate(node, &ready, run_id, &span, parent.clone()).await
            }
            Node::Interrupt(_) => {
                self.run_interrupt(node, &ready, run_id, &span, parent.clone(), path)
                    .await
            }
            Node::Graph(_) => {
                return self
                    .run_graph_node(node, ready, resume, opts, run_id, run_span, &span, path)
                    .await;
            }
        };

        Executed {
            name: ready.name,
            consumed: ready.consumed,
            seen_signals: ready.seen_signals,
            outcome,
            child_run_id: None,
        }
    }

    async fn run_function(
        &self,
        node: &Node,
        ready: &ReadyNode,
        run_id: &str,
        span: &str,
        parent: Option<String>,
    ) -> Outcome {
        let Node::Function(func) = node else { unreachable!() };
        self.emit(run_id, span, parent.clone(), EventKind::NodeStart {
            node: ready.name.clone(),
        })
        .await;

        let cache_key = self.cache_key_for(node, &ready.inputs);
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache_get(key).await {
                if let Ok(outputs) = serde_json::from_value::<ValueMap>(hit) {
                    self.emit(run_id, span, parent.clone(), EventKind::CacheHit {
                        node: ready.name.clone(),
                    })
                    .await;
                    self.emit(run_id, span, parent, EventKind::NodeEnd {
                        node: ready.name.clone(),
                        duration_ms: 0,
                        cached: true,
                    })
                    .await;
                    return Outcome::Produced(outputs);
                }
            }
        }

        let started = Instant::now();
        let params = func.to_callable_params(&ready.inputs);
        let result: std::result::Result<Value, NodeError> = match func.callable() {
            // Sequential runs inline; the concurrent runner moves sync
            // callables to the blocking pool so they cannot stall the
            // superstep's async siblings.
            Callable::Sync(f) => match self.mode {
                RunnerMode::Sequential => f(&params),
                RunnerMode::Concurrent => {
                    let f = Arc::clone(f);
                    match tokio::task::spawn_blocking(move || f(&params)).await {
                        Ok(result) => result,
                        Err(e) => Err(format!("node task panicked: {e}").into()),
                    }
                }
            },
            Callable::Async(f) => f(params).await,
            Callable::Stream(f) => {
                let mut chunks: Vec<Value> = Vec::new();
                let mut stream = f(params);
                let mut failed: Option<NodeError> = None;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(chunk) => {
                            self.emit(run_id, span, parent.clone(), EventKind::NodeStream {
                                node: ready.name.clone(),
                                chunk: chunk.clone(),
                            })
                            .await;
                            chunks.push(chunk);
                        }
                        Err(e) => {
                            failed = Some(e);
                            break;
                        }
                    }
                }
                match failed {
                    Some(e) => Err(e),
                    None => Ok(Value::Array(chunks)),
                }
            }
        };

        match result.and_then(|value| crate::node::coerce_outputs(&node.outputs(), value)) {
            Ok(outputs) => {
                self.emit(run_id, span, parent, EventKind::NodeEnd {
                    node: ready.name.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    cached: false,
                })
                .await;
                if let Some(key) = &cache_key {
                    if let Ok(value) = serde_json::to_value(&outputs) {
                        self.cache_put(key, value).await;
                    }
                }
                Outcome::Produced(outputs)
            }
            Err(e) => {
                self.emit(run_id, span, parent, EventKind::NodeError {
                    node: ready.name.clone(),
                    error: e.to_string(),
                })
                .await;
                Outcome::Failure(Arc::from(e))
            }
        }
    }

    async fn run_gate(
        &self,
        node: &Node,
        ready: &ReadyNode,
        run_id: &str,
        span: &str,
        parent: Option<String>,
    ) -> Outcome {
        let Node::Route(gate) = node else { unreachable!() };
        self.emit(run_id, span, parent.clone(), EventKind::NodeStart {
            node: ready.name.clone(),
        })
        .await;

        let cache_key = self.cache_key_for(node, &ready.inputs);
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache_get(key).await {
                if let Ok(choice) = serde_json::from_value::<GateChoice>(hit) {
                    self.emit(run_id, span, parent.clone(), EventKind::RouteDecision {
                        node: ready.name.clone(),
                        targets: decision_targets(&choice),
                        cached: true,
                    })
                    .await;
                    self.emit(run_id, span, parent, EventKind::NodeEnd {
                        node: ready.name.clone(),
                        duration_ms: 0,
                        cached: true,
                    })
                    .await;
                    return Outcome::Decision { choice, cached: true };
                }
            }
        }

        let started = Instant::now();
        let decided = gate.decide(&ready.inputs).and_then(|choice| match choice {
            GateChoice::Skip => match gate.fallback() {
                Some(fb) => Ok(GateChoice::To(fb.to_string())),
                None => Err(format!(
                    "gate '{}' returned no decision and has no fallback.",
                    ready.name
                )
                .into()),
            },
            other => Ok(other),
        });

        match decided {
            Ok(choice) => {
                self.emit(run_id, span, parent.clone(), EventKind::RouteDecision {
                    node: ready.name.clone(),
                    targets: decision_targets(&choice),
                    cached: false,
                })
                .await;
                self.emit(run_id, span, parent, EventKind::NodeEnd {
                    node: ready.name.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    cached: false,
                })
                .await;
                if let Some(key) = &cache_key {
                    if let Ok(value) = serde_json::to_value(&choice) {
                        self.cache_put(key, value).await;
                    }
                }
                Outcome::Decision { choice, cached: false }
            }
            Err(e) => {
                self.emit(run_id, span, parent, EventKind::NodeError {
                    node: ready.name.clone(),
                    error: e.to_string(),
                })
                .await;
                Outcome::Failure(Arc::from(e))
            }
        }
    }

    async fn run_interrupt(
        &self,
        node: &Node,
        ready: &ReadyNode,
        run_id: &str,
        span: &str,
        parent: Option<String>,
        path: &str,
    ) -> Outcome {
        let Node::Interrupt(interrupt) = node else { unreachable!() };
        let surfaced = ready.inputs[interrupt.input()].clone();

        if let Some(result) = interrupt.resolve(&surfaced) {
            self.emit(run_id, span, parent.clone(), EventKind::NodeStart {
                node: ready.name.clone(),
            })
            .await;
            let started = Instant::now();
            return match result {
                Ok(response) => {
                    self.emit(run_id, span, parent, EventKind::NodeEnd {
                        node: ready.name.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                        cached: false,
                    })
                    .await;
                    let mut outputs = ValueMap::new();
                    outputs.insert(interrupt.output().to_string(), response);
                    Outcome::Produced(outputs)
                }
                Err(e) => {
                    self.emit(run_id, span, parent, EventKind::NodeError {
                        node: ready.name.clone(),
                        error: e.to_string(),
                    })
                    .await;
                    Outcome::Failure(Arc::from(e))
                }
            };
        }

        let response_key = interrupt.output().to_string();
        self.emit(run_id, span, parent, EventKind::Interrupt {
            node: ready.name.clone(),
            value: surfaced.clone(),
            response_key: response_key.clone(),
        })
        .await;
        Outcome::Pause(PauseInfo {
            node: format!("{path}{}", ready.name),
            value: surfaced,
            response_key,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_graph_node(
        &self,
        node: &Node,
        ready: ReadyNode,
        resume: &ValueMap,
        opts: &RunOptions,
        run_id: &str,
        run_span: &str,
        span: &str,
        path: &str,
    ) -> Executed {
        let Node::Graph(graph_node) = node else { unreachable!() };
        let started = Instant::now();
        self.emit(run_id, span, Some(run_span.to_string()), EventKind::NodeStart {
            node: ready.name.clone(),
        })
        .await;

        let inner_opts = RunOptions {
            max_iterations: opts.max_iterations,
            max_concurrency: opts.max_concurrency,
            stop: opts.stop.clone(),
            ..RunOptions::default()
        };
        let inner_path = format!("{path}{}.", ready.name);

        // Thread resume responses addressed to the inner graph.
        let inner_keys = graph_node.graph().response_keys();
        let mut base_inputs = graph_node.to_inner_params(&ready.inputs);
        for (key, value) in resume {
            if inner_keys.contains(key) {
                base_inputs.insert(key.clone(), value.clone());
            }
        }

        let (outcome, child_run_id) = match graph_node.map_spec() {
            None => {
                match self
                    .run(graph_node.graph(), base_inputs, &inner_opts, Some(span.to_string()), inner_path)
                    .await
                {
                    Ok(result) => {
                        let child = result.run_id.clone();
                        match result.status {
                            RunStatus::Paused => {
                                let info = result.pause.expect("paused run carries pause info");
                                (Outcome::Pause(info), Some(child))
                            }
                            _ => {
                                let outputs = graph_node.from_inner_outputs(result.values);
                                (Outcome::Produced(outputs), Some(child))
                            }
                        }
                    }
                    Err(e) => (Outcome::Failure(error_source(e)), None),
                }
            }
            Some(spec) => {
                let outcome = self
                    .run_mapped(graph_node, spec, &base_inputs, &inner_opts, span, &inner_path)
                    .await;
                (outcome, None)
            }
        };

        match &outcome {
            Outcome::Produced(_) => {
                self.emit(run_id, span, Some(run_span.to_string()), EventKind::NodeEnd {
                    node: ready.name.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    cached: false,
                })
                .await;
            }
            Outcome::Failure(e) => {
                self.emit(run_id, span, Some(run_span.to_string()), EventKind::NodeError {
                    node: ready.name.clone(),
                    error: e.to_string(),
                })
                .await;
            }
            _ => {}
        }

        Executed {
            name: ready.name,
            consumed: ready.consumed,
            seen_signals: ready.seen_signals,
            outcome,
            child_run_id,
        }
    }

    /// Fan one graph node out over its mapped parameters.
    async fn run_mapped(
        &self,
        graph_node: &crate::node::GraphNode,
        spec: &crate::node::MapSpec,
        base_inputs: &ValueMap,
        inner_opts: &RunOptions,
        span: &str,
        inner_path: &str,
    ) -> Outcome {
        let iterations = match expand_map_inputs(&spec.params, spec.mode, base_inputs) {
            Ok(iterations) => iterations,
            Err(e) => return Outcome::Failure(Arc::from(e)),
        };

        let runs: Vec<_> = iterations
            .into_iter()
            .map(|inputs| {
                self.run(
                    graph_node.graph(),
                    inputs,
                    inner_opts,
                    Some(span.to_string()),
                    inner_path.to_string(),
                )
            })
            .collect();
        let results: Vec<Result<RunResult>> = match self.mode {
            RunnerMode::Sequential => {
                let mut collected = Vec::with_capacity(runs.len());
                for run in runs {
                    collected.push(run.await);
                }
                collected
            }
            RunnerMode::Concurrent => {
                let limit = inner_opts.max_concurrency.unwrap_or(runs.len().max(1));
                futures::stream::iter(runs).buffered(limit).collect().await
            }
        };

        let output_names = graph_node.graph().output_names();
        let mut columns: BTreeMap<String, Vec<Value>> = output_names
            .iter()
            .map(|n| (n.clone(), Vec::new()))
            .collect();
        for result in results {
            match result {
                Ok(result) if result.status == RunStatus::Paused => {
                    return Outcome::Pause(result.pause.expect("paused run carries pause info"));
                }
                Ok(result) => {
                    for name in &output_names {
                        columns
                            .get_mut(name)
                            .expect("column exists")
                            .push(result.values.get(name).cloned().unwrap_or(Value::Null));
                    }
                }
                Err(e) => match spec.error_handling {
                    ErrorPolicy::Raise => return Outcome::Failure(error_source(e)),
                    ErrorPolicy::Continue => {
                        for name in &output_names {
                            columns.get_mut(name).expect("column exists").push(Value::Null);
                        }
                    }
                },
            }
        }

        let outputs: ValueMap = columns
            .into_iter()
            .map(|(name, column)| (name, Value::Array(column)))
            .collect();
        Outcome::Produced(graph_node.from_inner_outputs(outputs))
    }

    fn cache_key_for(&self, node: &Node, inputs: &ValueMap) -> Option<CacheKey> {
        if self.cache.is_none() || !node.cache_enabled() {
            return None;
        }
        let hash = node.definition_hash().ok()?;
        Some(CacheKey::new(hash, ident::input_digest(inputs.iter())))
    }

    async fn cache_get(&self, key: &CacheKey) -> Option<Value> {
        match self.cache.as_ref()?.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(error = %e, "cache lookup failed; executing node");
                None
            }
        }
    }

    async fn cache_put(&self, key: &CacheKey, value: Value) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(key, value).await {
                tracing::warn!(error = %e, "cache store failed");
            }
        }
    }

    async fn emit(&self, run_id: &str, span: &str, parent: Option<String>, kind: EventKind) {
        let event = Event::new(run_id, span, parent, kind);
        self.dispatcher.dispatch(&event).await;
    }

    fn sink_step(&self, step: StepRecord) {
        if let Some(sink) = &self.step_sink {
            if let Err(e) = sink.record(&step) {
                tracing::warn!(error = %e, node = %step.node_name, "step sink failed");
            }
        }
    }

    /// Emit `RunEnd`; processors shut down only when the root run ends.
    async fn finish(
        &self,
        run_id: &str,
        run_span: &str,
        parent: Option<String>,
        status: RunStatus,
        root: bool,
    ) {
        self.emit(run_id, run_span, parent, EventKind::RunEnd { status })
            .await;
        if root {
            self.dispatcher.shutdown().await;
        }
    }
}

fn error_source(e: HypergraphError) -> Arc<dyn std::error::Error + Send + Sync> {
    match e {
        HypergraphError::NodeExecution { source, .. } => source,
        other => Arc::new(other),
    }
}

fn decision_targets(choice: &GateChoice) -> Vec<String> {
    match choice {
        GateChoice::To(t) => vec![t.clone()],
        GateChoice::Many(ts) => ts.clone(),
        GateChoice::End => vec![END.to_string()],
        GateChoice::Skip => Vec::new(),
    }
}

/// Expand mapped parameters into per-iteration input maps. Shared by graph
/// node `map_over` and the runner's `map`.
pub(crate) fn expand_map_inputs(
    params: &[String],
    mode: MapMode,
    base: &ValueMap,
) -> std::result::Result<Vec<ValueMap>, NodeError> {
    let mut lists: Vec<(String, Vec<Value>)> = Vec::new();
    for param in params {
        let value = base
            .get(param)
            .ok_or_else(|| format!("mapped parameter '{param}' has no value"))?;
        let Value::Array(items) = value else {
            return Err(format!("mapped parameter '{param}' must be a list, got {value}").into());
        };
        lists.push((param.clone(), items.clone()));
    }

    let broadcast: ValueMap = base
        .iter()
        .filter(|(k, _)| !params.contains(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let combos: Vec<Vec<(String, Value)>> = match mode {
        MapMode::Zip => {
            let len = lists.first().map(|(_, l)| l.len()).unwrap_or(0);
            for (param, list) in &lists {
                if list.len() != len {
                    return Err(format!(
                        "zip map requires equal lengths; '{}' has {} item(s), '{param}' has {}.",
                        lists[0].0,
                        len,
                        list.len()
                    )
                    .into());
                }
            }
            (0..len)
                .map(|i| {
                    lists
                        .iter()
                        .map(|(param, list)| (param.clone(), list[i].clone()))
                        .collect()
                })
                .collect()
        }
        MapMode::Product => {
            let mut combos: Vec<Vec<(String, Value)>> = vec![Vec::new()];
            for (param, list) in &lists {
                let mut next = Vec::with_capacity(combos.len() * list.len());
                for combo in &combos {
                    for item in list {
                        let mut extended = combo.clone();
                        extended.push((param.clone(), item.clone()));
                        next.push(extended);
                    }
                }
                combos = next;
            }
            combos
        }
    };

    Ok(combos
        .into_iter()
        .map(|combo| {
            let mut inputs = broadcast.clone();
            inputs.extend(combo);
            inputs
        })
        .collect())
}

/// Normalize and validate run inputs: injection vs override vs cycle seed,
/// missing required inputs, and cycle entrypoint disambiguation.
fn prepare_inputs(graph: &Graph, provided: ValueMap, opts: &RunOptions) -> Result<Prepared> {
    let topo = graph.topology();
    let spec = graph.input_spec();
    let nested_keys = graph.nested_response_keys();
    let active_inputs: BTreeSet<String> = graph
        .active_nodes()
        .flat_map(|n| n.inputs())
        .collect();

    let mut seeds = ValueMap::new();
    let mut excluded: BTreeSet<String> = BTreeSet::new();
    let mut resume = ValueMap::new();
    let mut overridden: Vec<String> = Vec::new();

    // Lowest precedence first: defaults, then bindings, then provided.
    for node in graph.active_nodes() {
        for param in node.inputs() {
            if let Some(default) = node.default_value(&param) {
                seeds.entry(param.clone()).or_insert(default);
            }
        }
    }
    for (name, value) in graph.bindings() {
        seeds.insert(name.clone(), value.clone());
    }

    for (key, value) in &provided {
        if nested_keys.contains(key) {
            resume.insert(key.clone(), value.clone());
            continue;
        }
        let producers: Vec<String> = topo
            .producers_of(key)
            .iter()
            .filter(|p| topo.active.contains(p.as_str()))
            .cloned()
            .collect();
        if producers.is_empty() {
            if !active_inputs.contains(key) {
                return Err(HypergraphError::InvalidOptions(format!(
                    "'{key}' is not an input of any node in the graph. Check the name."
                )));
            }
            seeds.insert(key.clone(), value.clone());
            continue;
        }

        // The name is produced inside the graph.
        for producer_name in &producers {
            let producer = graph.node(producer_name).expect("producer exists");
            if producer.is_interrupt() {
                // Resume protocol: the response satisfies the pause point.
                excluded.insert(producer_name.clone());
                continue;
            }
            let cycle_seed = topo.cycle_of.contains_key(producer_name.as_str())
                && graph.active_nodes().any(|n| {
                    n.inputs().contains(key) && topo.same_cycle(producer_name, n.name())
                });
            if cycle_seed {
                continue;
            }
            if producer_viable(graph, producer, &provided) {
                overridden.push(key.clone());
                continue;
            }
            // Injection: the producer is bypassed entirely.
            let missing: Vec<String> = producer
                .outputs()
                .into_iter()
                .filter(|o| !provided.contains_key(o))
                .collect();
            let consumed_elsewhere: Vec<&String> = missing
                .iter()
                .filter(|o| {
                    graph
                        .active_nodes()
                        .any(|n| n.name() != producer_name && n.inputs().contains(*o))
                })
                .collect();
            if !consumed_elsewhere.is_empty() {
                return Err(HypergraphError::InvalidOptions(format!(
                    "partial injection: '{key}' bypasses node '{producer_name}' but its outputs [{}] are still needed downstream. Provide them too or remove '{key}'.",
                    consumed_elsewhere
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
            excluded.insert(producer_name.clone());
        }
        seeds.insert(key.clone(), value.clone());
    }

    if !overridden.is_empty() {
        match opts.on_internal_override {
            OverridePolicy::Ignore => {}
            OverridePolicy::Warn => {
                tracing::warn!(
                    inputs = ?overridden,
                    "provided values shadow internal edges and will lose to produced values"
                );
            }
            OverridePolicy::Error => {
                return Err(HypergraphError::InvalidOptions(format!(
                    "values provided for internal edges whose producers still run: [{}]. Remove them or pass on_internal_override=ignore.",
                    overridden.join(", ")
                )));
            }
        }
    }

    // A required input only matters while some non-bypassed node consumes
    // it.
    let missing: Vec<String> = spec
        .required
        .iter()
        .filter(|name| !seeds.contains_key(*name))
        .filter(|name| {
            graph
                .active_nodes()
                .any(|n| !excluded.contains(n.name()) && n.inputs().contains(*name))
        })
        .cloned()
        .collect();
    if !missing.is_empty() {
        match opts.on_missing {
            MissingPolicy::Error => {
                return Err(HypergraphError::MissingInput { inputs: missing });
            }
            MissingPolicy::Warn => {
                tracing::warn!(inputs = ?missing, "missing required inputs; affected nodes will not run");
            }
            MissingPolicy::Ignore => {}
        }
    }

    validate_entrypoints(graph, &provided, &seeds, opts)?;

    Ok(Prepared {
        seeds,
        excluded,
        resume,
    })
}

/// A producer is viable when every one of its inputs can eventually be
/// satisfied, which makes a provided value for its output an override
/// rather than an injection.
fn producer_viable(graph: &Graph, producer: &Node, provided: &ValueMap) -> bool {
    let topo = graph.topology();
    producer.inputs().iter().all(|param| {
        !topo.producers_of(param).is_empty()
            || provided.contains_key(param)
            || graph.bindings().contains_key(param)
            || producer.has_default(param)
    })
}

/// Per-cycle entrypoint validation: exactly one candidate may be seeded by
/// the provided values unless `entrypoint=` picks one.
fn validate_entrypoints(
    graph: &Graph,
    provided: &ValueMap,
    seeds: &ValueMap,
    opts: &RunOptions,
) -> Result<()> {
    let topo = graph.topology();
    let spec = graph.input_spec();
    if topo.cycles.is_empty() {
        return Ok(());
    }
    if let Some(entry) = &opts.entrypoint {
        if graph.has_cycles() && !spec.entrypoints.contains_key(entry) {
            return Err(HypergraphError::InvalidOptions(format!(
                "entrypoint '{entry}' is not a cycle entrypoint. Candidates: [{}].",
                spec.entrypoints.keys().cloned().collect::<Vec<_>>().join(", ")
            )));
        }
    }
    for cycle in &topo.cycles {
        let candidates: Vec<&String> = spec
            .entrypoints
            .keys()
            .filter(|name| cycle.contains(name.as_str()))
            .collect();
        if candidates.is_empty() {
            continue;
        }
        let provided_candidates: Vec<&String> = candidates
            .iter()
            .filter(|name| {
                spec.entrypoints[name.as_str()]
                    .iter()
                    .any(|p| provided.contains_key(p))
            })
            .copied()
            .collect();
        if provided_candidates.len() > 1 {
            match &opts.entrypoint {
                Some(entry) if provided_candidates.iter().any(|c| c.as_str() == entry) => {}
                _ => {
                    return Err(HypergraphError::AmbiguousEntrypoint {
                        candidates: provided_candidates.iter().map(|s| s.to_string()).collect(),
                    });
                }
            }
        }
        // The cycle must be seedable from somewhere: provided, bound, or
        // defaulted entry parameters.
        let seedable = candidates.iter().any(|name| {
            spec.entrypoints[name.as_str()]
                .iter()
                .any(|p| seeds.contains_key(p))
        });
        if !seedable && opts.on_missing == MissingPolicy::Error {
            let mut params: BTreeSet<String> = BTreeSet::new();
            for name in &candidates {
                params.extend(spec.entrypoints[name.as_str()].iter().cloned());
            }
            return Err(HypergraphError::MissingInput {
                inputs: params.into_iter().collect(),
            });
        }
    }
    Ok(())
}
