//! Structured, hierarchical execution events.
//!
//! The scheduler emits one [`Event`] per observable transition: run start
//! and end, node start/end/error, route decisions, interrupts, stop
//! requests, and cache hits. Events form a span tree: every event carries a
//! `span_id`, node events within a run point at the run's span, and events
//! from nested graph runs point at the outer node's span via
//! `parent_span_id`.
//!
//! Processors consume events for progress UIs, logs, or tracing. Delivery
//! is sequential per processor in emission order; a processor failure is
//! logged and swallowed, never affecting execution.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::NodeError;
use crate::scheduler::types::RunStatus;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunStart {
        graph_name: Option<String>,
    },
    RunEnd {
        status: RunStatus,
    },
    NodeStart {
        node: String,
    },
    NodeEnd {
        node: String,
        duration_ms: u64,
        cached: bool,
    },
    NodeError {
        node: String,
        error: String,
    },
    RouteDecision {
        node: String,
        /// Chosen target(s); the END sentinel appears verbatim.
        targets: Vec<String>,
        cached: bool,
    },
    Interrupt {
        node: String,
        value: Value,
        response_key: String,
    },
    StopRequested,
    CacheHit {
        node: String,
    },
    /// One chunk yielded by a streaming node; the collected list is what
    /// flows downstream.
    NodeStream {
        node: String,
        chunk: Value,
    },
}

/// A frozen record of one execution transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub run_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(
        run_id: impl Into<String>,
        span_id: impl Into<String>,
        parent_span_id: Option<String>,
        kind: EventKind,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            span_id: span_id.into(),
            parent_span_id,
            ts: Utc::now(),
            kind,
        }
    }

    /// Node name the event concerns, if any.
    pub fn node(&self) -> Option<&str> {
        match &self.kind {
            EventKind::NodeStart { node }
            | EventKind::NodeEnd { node, .. }
            | EventKind::NodeError { node, .. }
            | EventKind::RouteDecision { node, .. }
            | EventKind::Interrupt { node, .. }
            | EventKind::CacheHit { node } => Some(node),
            _ => None,
        }
    }
}

/// Consumer of execution events.
///
/// Only [`on_event`](Self::on_event) must be implemented; the async variants
/// delegate to the sync ones by default. Errors are logged by the
/// dispatcher and never propagate into the run.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    fn on_event(&self, event: &Event) -> std::result::Result<(), NodeError>;

    async fn on_event_async(&self, event: &Event) -> std::result::Result<(), NodeError> {
        self.on_event(event)
    }

    fn shutdown(&self) -> std::result::Result<(), NodeError> {
        Ok(())
    }

    async fn shutdown_async(&self) -> std::result::Result<(), NodeError> {
        self.shutdown()
    }
}

/// Delivers events to an ordered list of processors.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    processors: Vec<Arc<dyn EventProcessor>>,
}

impl EventDispatcher {
    pub fn new(processors: Vec<Arc<dyn EventProcessor>>) -> Self {
        Self { processors }
    }

    pub fn push(&mut self, processor: Arc<dyn EventProcessor>) {
        self.processors.push(processor);
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Deliver one event to every processor, in order.
    pub async fn dispatch(&self, event: &Event) {
        for processor in &self.processors {
            if let Err(e) = processor.on_event_async(event).await {
                tracing::warn!(error = %e, "event processor failed; continuing");
            }
        }
    }

    /// Called once at the end of a run.
    pub async fn shutdown(&self) {
        for processor in &self.processors {
            if let Err(e) = processor.shutdown_async().await {
                tracing::warn!(error = %e, "event processor shutdown failed");
            }
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("processors", &self.processors.len())
            .finish()
    }
}

/// Buffers every event in memory. Intended for tests and small tools.
#[derive(Debug, Clone, Default)]
pub struct CollectingProcessor {
    events: Arc<Mutex<Vec<Event>>>,
}

impl CollectingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event buffer lock").clone()
    }
}

#[async_trait]
impl EventProcessor for CollectingProcessor {
    fn on_event(&self, event: &Event) -> std::result::Result<(), NodeError> {
        self.events.lock().expect("event buffer lock").push(event.clone());
        Ok(())
    }
}

/// Logs every event through `tracing` at debug level.
#[derive(Debug, Clone, Default)]
pub struct LogProcessor;

#[async_trait]
impl EventProcessor for LogProcessor {
    fn on_event(&self, event: &Event) -> std::result::Result<(), NodeError> {
        tracing::debug!(run_id = %event.run_id, kind = ?event.kind, "event");
        Ok(())
    }
}
