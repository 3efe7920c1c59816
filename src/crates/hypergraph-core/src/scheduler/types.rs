//! Core scheduler data types.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::ValueMap;

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Reached quiescence or was terminated by a gate returning END.
    Completed,
    /// Stopped at an interrupt; resume with the pause's response key.
    Paused,
    /// A node failed under the `continue` error policy.
    Failed,
    /// A cooperative stop request drained the run before quiescence.
    Stopped,
}

/// What to do when a user node fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Re-raise the original error to the caller (default).
    #[default]
    Raise,
    /// Record the failure, keep completed outputs, continue the superstep
    /// loop for nodes that do not depend on the failed outputs.
    Continue,
}

/// Fan-out shape for batch map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapMode {
    /// Equal-length lists iterated in lockstep.
    Zip,
    /// Cartesian product in positional order.
    Product,
}

/// Policy for values provided for internal edges whose producer still runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverridePolicy {
    Ignore,
    #[default]
    Warn,
    Error,
}

/// Policy for required inputs absent at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPolicy {
    Ignore,
    Warn,
    #[default]
    Error,
}

/// Cooperative stop request shared between the caller and a running
/// scheduler.
///
/// Once requested, the scheduler launches no new nodes, lets in-flight nodes
/// finish, keeps their outputs, and ends the run with [`RunStatus::Stopped`]
/// (or [`RunStatus::Completed`] if nothing was left to do).
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Per-run options.
///
/// These names are the reserved option surface: inputs always travel in the
/// `values` map, never here.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Narrow the run to the subgraph contributing to these outputs.
    pub select: Option<Vec<String>>,
    /// Disambiguate which cycle entrypoint the provided values seed.
    pub entrypoint: Option<String>,
    pub on_missing: MissingPolicy,
    pub on_internal_override: OverridePolicy,
    /// Superstep budget; exceeding it raises `InfiniteLoop`. Default 1000.
    pub max_iterations: Option<usize>,
    /// Concurrent-runner fan-out bound within a superstep.
    pub max_concurrency: Option<usize>,
    pub error_handling: ErrorPolicy,
    pub stop: Option<StopHandle>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, outputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.select = Some(outputs.into_iter().map(Into::into).collect());
        self
    }

    pub fn entrypoint(mut self, node: impl Into<String>) -> Self {
        self.entrypoint = Some(node.into());
        self
    }

    pub fn on_missing(mut self, policy: MissingPolicy) -> Self {
        self.on_missing = policy;
        self
    }

    pub fn on_internal_override(mut self, policy: OverridePolicy) -> Self {
        self.on_internal_override = policy;
        self
    }

    pub fn max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn error_handling(mut self, policy: ErrorPolicy) -> Self {
        self.error_handling = policy;
        self
    }

    pub fn stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = Some(stop);
        self
    }

    pub(crate) fn effective_max_iterations(&self) -> usize {
        self.max_iterations.unwrap_or(1000)
    }
}

/// Pause context surfaced when a run stops at an interrupt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseInfo {
    /// Dot-joined node path (e.g. `review.approval` for a nested pause).
    pub node: String,
    /// The value the interrupt surfaced to the caller.
    pub value: Value,
    /// Key to submit the response under when re-running with the original
    /// inputs.
    pub response_key: String,
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    /// Produced values, filtered to the selection when one applies.
    pub values: ValueMap,
    /// The original user error when a node failed under `continue`.
    pub error: Option<Arc<dyn std::error::Error + Send + Sync>>,
    pub pause: Option<PauseInfo>,
    /// Supersteps executed.
    pub supersteps: usize,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// One-line human description of the run.
    pub fn summary(&self) -> String {
        let status = match self.status {
            RunStatus::Completed => "completed",
            RunStatus::Paused => "paused",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        };
        let short_id: String = self.run_id.chars().take(8).collect();
        format!(
            "run {short_id} {status}: {} value(s) in {} superstep(s) ({} ms)",
            self.values.len(),
            self.supersteps,
            self.duration_ms
        )
    }

    /// JSON-serializable report excluding raw values and error objects.
    pub fn to_dict(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("run_id".into(), Value::String(self.run_id.clone()));
        map.insert(
            "status".into(),
            serde_json::to_value(self.status).expect("status serializes"),
        );
        map.insert(
            "value_names".into(),
            Value::Array(self.values.keys().cloned().map(Value::String).collect()),
        );
        map.insert(
            "supersteps".into(),
            Value::Number(self.supersteps.into()),
        );
        map.insert(
            "duration_ms".into(),
            Value::Number(self.duration_ms.into()),
        );
        if let Some(err) = &self.error {
            map.insert("error".into(), Value::String(err.to_string()));
        }
        if let Some(pause) = &self.pause {
            map.insert(
                "pause".into(),
                serde_json::json!({
                    "node": pause.node,
                    "response_key": pause.response_key,
                }),
            );
        }
        Value::Object(map)
    }
}

impl std::ops::Index<&str> for RunResult {
    type Output = Value;

    fn index(&self, name: &str) -> &Value {
        self.values
            .get(name)
            .unwrap_or_else(|| panic!("no value named '{name}' in run result"))
    }
}

/// Per-node execution status in a step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Paused,
    Stopped,
}

/// Immutable record of one node execution, handed to an external persister.
///
/// The scheduler never reads these back; the schema is fixed for durable
/// execution layers.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub node_name: String,
    pub superstep: usize,
    pub consumed_input_versions: BTreeMap<String, u64>,
    pub produced_output_versions: BTreeMap<String, u64>,
    pub status: StepStatus,
    /// Outputs this step produced (complete on success, partial otherwise).
    pub partial_outputs: ValueMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause: Option<PauseInfo>,
    /// Inner run id when this step delegated to a nested graph.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_run_id: Option<String>,
}

/// External persister protocol.
///
/// Invoked in the scheduler's emission order at every node completion,
/// failure, pause, and stop. Failures are logged and never affect execution.
pub trait StepSink: Send + Sync {
    fn record(&self, step: &StepRecord) -> std::result::Result<(), crate::error::NodeError>;
}
