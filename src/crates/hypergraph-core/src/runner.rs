//! The runner facade: the public `run` / `map` surface.
//!
//! A [`Runner`] bundles a scheduling mode (sequential or concurrent), an
//! optional cache backend, default event processors, and an optional step
//! sink. It validates options, opens a fresh run context, and drives the
//! scheduler.
//!
//! # Examples
//!
//! ```rust,ignore
//! use hypergraph_core::{Runner, RunOptions};
//!
//! let runner = Runner::sequential();
//! let result = runner.run(&graph, values([("x", json!(5))])).await?;
//! assert_eq!(result["result"], json!(11));
//! ```

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use hypergraph_cache::CacheBackend;
use serde_json::Value;

use crate::error::{HypergraphError, Result};
use crate::event::{EventDispatcher, EventProcessor};
use crate::graph::Graph;
use crate::ident::IntoNames;
use crate::node::ValueMap;
use crate::scheduler::loop_impl::{expand_map_inputs, RunnerMode, Scheduler};
use crate::scheduler::types::{
    ErrorPolicy, MapMode, PauseInfo, RunOptions, RunResult, RunStatus, StepSink,
};

/// Options for [`Runner::map`].
#[derive(Clone)]
pub struct MapOptions {
    map_over: Vec<String>,
    map_mode: MapMode,
    error_handling: ErrorPolicy,
    run: RunOptions,
}

impl MapOptions {
    /// Fan out over these parameters. Zip mode by default.
    pub fn over(params: impl IntoNames) -> Result<Self> {
        let map_over = params.into_names()?;
        if map_over.is_empty() {
            return Err(HypergraphError::InvalidOptions(
                "map requires at least one mapped parameter.".to_string(),
            ));
        }
        Ok(Self {
            map_over,
            map_mode: MapMode::Zip,
            error_handling: ErrorPolicy::Raise,
            run: RunOptions::default(),
        })
    }

    pub fn mode(mut self, mode: MapMode) -> Self {
        self.map_mode = mode;
        self
    }

    pub fn error_handling(mut self, policy: ErrorPolicy) -> Self {
        self.error_handling = policy;
        self
    }

    /// Per-iteration run options (select, entrypoint, budgets, ...).
    pub fn run_options(mut self, opts: RunOptions) -> Self {
        self.run = opts;
        self
    }
}

/// Aggregated outcome of a batch map.
///
/// A read-only sequence of per-iteration [`RunResult`]s in input positional
/// order, regardless of completion order. String access projects one output
/// name across all iterations.
#[derive(Debug, Clone)]
pub struct MapResult {
    results: Vec<RunResult>,
    status: RunStatus,
    duration_ms: u64,
}

impl MapResult {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Aggregate status: FAILED beats PAUSED beats STOPPED beats COMPLETED.
    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn results(&self) -> &[RunResult] {
        &self.results
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RunResult> {
        self.results.iter()
    }

    /// First pause among the iterations, if any paused.
    pub fn pause(&self) -> Option<&PauseInfo> {
        self.results.iter().find_map(|r| r.pause.as_ref())
    }

    /// Project an output name across iterations; failed iterations yield
    /// `null` placeholders.
    pub fn get(&self, name: &str) -> Vec<Value> {
        self.results
            .iter()
            .map(|r| r.values.get(name).cloned().unwrap_or(Value::Null))
            .collect()
    }

    pub fn summary(&self) -> String {
        let status = match self.status {
            RunStatus::Completed => "completed",
            RunStatus::Paused => "paused",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        };
        format!(
            "map {status}: {} iteration(s) ({} ms)",
            self.results.len(),
            self.duration_ms
        )
    }

    /// JSON-serializable report excluding raw values and error objects.
    pub fn to_dict(&self) -> Value {
        serde_json::json!({
            "status": self.status,
            "iterations": self.results.iter().map(RunResult::to_dict).collect::<Vec<_>>(),
            "duration_ms": self.duration_ms,
        })
    }
}

impl std::ops::Index<usize> for MapResult {
    type Output = RunResult;

    fn index(&self, i: usize) -> &RunResult {
        &self.results[i]
    }
}

fn aggregate_status(results: &[RunResult]) -> RunStatus {
    if results.iter().any(|r| r.status == RunStatus::Failed) {
        RunStatus::Failed
    } else if results.iter().any(|r| r.status == RunStatus::Paused) {
        RunStatus::Paused
    } else if results.iter().any(|r| r.status == RunStatus::Stopped) {
        RunStatus::Stopped
    } else {
        RunStatus::Completed
    }
}

/// Public execution surface over the scheduler.
#[derive(Clone)]
pub struct Runner {
    mode: RunnerMode,
    cache: Option<Arc<dyn CacheBackend>>,
    processors: Vec<Arc<dyn EventProcessor>>,
    step_sink: Option<Arc<dyn StepSink>>,
}

impl Runner {
    /// Single-node-at-a-time runner. Rejects graphs with async nodes.
    pub fn sequential() -> Self {
        Self {
            mode: RunnerMode::Sequential,
            cache: None,
            processors: Vec::new(),
            step_sink: None,
        }
    }

    /// Concurrent runner: independent nodes within a superstep run
    /// together, bounded by `max_concurrency`.
    pub fn concurrent() -> Self {
        Self {
            mode: RunnerMode::Concurrent,
            cache: None,
            processors: Vec::new(),
            step_sink: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Add a default event processor applied to every run.
    pub fn with_processor(mut self, processor: Arc<dyn EventProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn with_step_sink(mut self, sink: Arc<dyn StepSink>) -> Self {
        self.step_sink = Some(sink);
        self
    }

    fn scheduler(&self) -> Scheduler {
        Scheduler {
            mode: self.mode,
            cache: self.cache.clone(),
            dispatcher: EventDispatcher::new(self.processors.clone()),
            step_sink: self.step_sink.clone(),
        }
    }

    /// Execute the graph once with default options.
    pub async fn run(&self, graph: &Graph, values: ValueMap) -> Result<RunResult> {
        self.run_with(graph, values, RunOptions::default()).await
    }

    /// Execute the graph once.
    pub async fn run_with(
        &self,
        graph: &Graph,
        values: ValueMap,
        opts: RunOptions,
    ) -> Result<RunResult> {
        if self.mode == RunnerMode::Sequential && opts.max_concurrency.is_some() {
            return Err(HypergraphError::InvalidOptions(
                "max_concurrency applies to the concurrent runner only.".to_string(),
            ));
        }
        self.scheduler()
            .run(graph, values, &opts, None, String::new())
            .await
    }

    /// Fan the graph out over list-valued parameters.
    ///
    /// Zip mode requires equal lengths; product mode iterates the Cartesian
    /// product in positional order. Non-mapped values broadcast to every
    /// iteration. Results preserve input order regardless of completion
    /// order.
    pub async fn map(&self, graph: &Graph, values: ValueMap, opts: MapOptions) -> Result<MapResult> {
        let started = Instant::now();
        let iterations = expand_map_inputs(&opts.map_over, opts.map_mode, &values)
            .map_err(|e| HypergraphError::InvalidOptions(e.to_string()))?;

        let scheduler = self.scheduler();
        let runs: Vec<_> = iterations
            .into_iter()
            .map(|inputs| scheduler.run(graph, inputs, &opts.run, None, String::new()))
            .collect();

        let raw: Vec<Result<RunResult>> = match self.mode {
            RunnerMode::Sequential => {
                let mut collected = Vec::with_capacity(runs.len());
                for run in runs {
                    collected.push(run.await);
                }
                collected
            }
            RunnerMode::Concurrent => {
                let limit = opts.run.max_concurrency.unwrap_or(runs.len().max(1));
                futures::stream::iter(runs).buffered(limit).collect().await
            }
        };

        let mut results = Vec::with_capacity(raw.len());
        for outcome in raw {
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => match opts.error_handling {
                    ErrorPolicy::Raise => return Err(e),
                    ErrorPolicy::Continue => {
                        // Positional placeholder for the failed iteration.
                        results.push(RunResult {
                            run_id: uuid::Uuid::new_v4().to_string(),
                            status: RunStatus::Failed,
                            values: ValueMap::new(),
                            error: Some(match e {
                                HypergraphError::NodeExecution { source, .. } => source,
                                other => Arc::new(other),
                            }),
                            pause: None,
                            supersteps: 0,
                            duration_ms: 0,
                        });
                    }
                },
            }
        }

        Ok(MapResult {
            status: aggregate_status(&results),
            results,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("mode", &self.mode)
            .field("cache", &self.cache.is_some())
            .field("processors", &self.processors.len())
            .finish()
    }
}
