//! End-to-end scheduler scenarios.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::HypergraphError;
use crate::event::{CollectingProcessor, EventKind};
use crate::graph::{Graph, GraphBuilder};
use crate::node::{FunctionNode, GateChoice, InterruptNode, Node, RouteNode, ValueMap};
use crate::runner::{MapOptions, Runner};
use crate::scheduler::types::{
    ErrorPolicy, MapMode, OverridePolicy, RunOptions, RunStatus, StopHandle,
};
use hypergraph_cache::InMemoryCache;

fn values(pairs: Vec<(&str, Value)>) -> ValueMap {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn double() -> Node {
    FunctionNode::new("double", "x", "doubled", |v: &ValueMap| {
        Ok(json!(v["x"].as_i64().unwrap() * 2))
    })
    .unwrap()
    .into()
}

fn addone() -> Node {
    FunctionNode::new("addone", "doubled", "result", |v: &ValueMap| {
        Ok(json!(v["doubled"].as_i64().unwrap() + 1))
    })
    .unwrap()
    .into()
}

fn linear() -> Graph {
    Graph::from_nodes([double(), addone()]).unwrap()
}

#[tokio::test]
async fn test_linear_dag() {
    let graph = linear();
    assert_eq!(graph.input_spec().required, vec!["x"]);

    let result = Runner::sequential()
        .run(&graph, values(vec![("x", json!(5))]))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result["doubled"], json!(10));
    assert_eq!(result["result"], json!(11));
}

#[tokio::test]
async fn test_diamond_runs_merge_after_both_branches() {
    let a = FunctionNode::new("a", "x", "x1", |v: &ValueMap| {
        Ok(json!(v["x"].as_i64().unwrap() + 1))
    })
    .unwrap();
    let b = FunctionNode::new("b", "x", "x2", |v: &ValueMap| {
        Ok(json!(v["x"].as_i64().unwrap() * 10))
    })
    .unwrap();
    let merge = FunctionNode::new("merge", ["x1", "x2"], "y", |v: &ValueMap| {
        Ok(json!(v["x1"].as_i64().unwrap() + v["x2"].as_i64().unwrap()))
    })
    .unwrap();
    let graph = Graph::from_nodes([a.into(), b.into(), merge.into()]).unwrap();

    let collector = CollectingProcessor::new();
    let result = Runner::sequential()
        .with_processor(Arc::new(collector.clone()))
        .run(&graph, values(vec![("x", json!(3))]))
        .await
        .unwrap();

    assert_eq!(result["y"], json!(34));

    // merge starts only after both branch ends.
    let events = collector.events();
    let pos = |pred: &dyn Fn(&EventKind) -> bool| events.iter().position(|e| pred(&e.kind)).unwrap();
    let a_end = pos(&|k| matches!(k, EventKind::NodeEnd { node, .. } if node == "a"));
    let b_end = pos(&|k| matches!(k, EventKind::NodeEnd { node, .. } if node == "b"));
    let merge_start = pos(&|k| matches!(k, EventKind::NodeStart { node } if node == "merge"));
    assert!(merge_start > a_end);
    assert!(merge_start > b_end);
}

fn agentic_graph() -> Graph {
    let generate = FunctionNode::new("generate", "messages", "response", |_| Ok(json!("resp")))
        .unwrap();
    let accumulate = FunctionNode::new(
        "accumulate",
        ["messages", "response"],
        "messages",
        |v: &ValueMap| {
            let mut messages = v["messages"].as_array().unwrap().clone();
            messages.push(json!("q"));
            messages.push(v["response"].clone());
            Ok(Value::Array(messages))
        },
    )
    .unwrap();
    let should_continue = RouteNode::new(
        "should_continue",
        "messages",
        ["generate"],
        |v: &ValueMap| {
            if v["messages"].as_array().unwrap().len() >= 10 {
                Ok(GateChoice::End)
            } else {
                Ok(GateChoice::To("generate".to_string()))
            }
        },
    )
    .unwrap();
    Graph::from_nodes([generate.into(), accumulate.into(), should_continue.into()]).unwrap()
}

#[tokio::test]
async fn test_agentic_loop_terminates_via_end() {
    let graph = agentic_graph();
    let collector = CollectingProcessor::new();

    let result = Runner::sequential()
        .with_processor(Arc::new(collector.clone()))
        .run_with(
            &graph,
            values(vec![("messages", json!([]))]),
            RunOptions::new().entrypoint("accumulate"),
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result["messages"].as_array().unwrap().len(), 10);

    // One accumulate execution per round trip.
    let accumulate_runs = collector
        .events()
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::NodeEnd { node, .. } if node == "accumulate"))
        .count();
    assert_eq!(accumulate_runs, 5);

    // Every round trip is a non-END route decision.
    let non_end_decisions = collector
        .events()
        .iter()
        .filter(
            |e| matches!(&e.kind, EventKind::RouteDecision { targets, .. } if targets != &vec!["END".to_string()]),
        )
        .count();
    assert_eq!(non_end_decisions, 5);
}

#[tokio::test]
async fn test_ambiguous_entrypoint_requires_override() {
    let graph = agentic_graph();
    let err = Runner::sequential()
        .run(&graph, values(vec![("messages", json!([]))]))
        .await
        .unwrap_err();
    match err {
        HypergraphError::AmbiguousEntrypoint { candidates } => {
            assert_eq!(candidates, vec!["accumulate", "generate"]);
        }
        other => panic!("expected AmbiguousEntrypoint, got {other}"),
    }
}

fn branch_graph() -> Graph {
    let check = RouteNode::if_else("check", "query", "fast", "slow", |v: &ValueMap| {
        Ok(v["query"].as_str() == Some("cached"))
    })
    .unwrap();
    let fast = FunctionNode::new("fast", "query", "result", |_| Ok(json!("ok-fast"))).unwrap();
    let slow = FunctionNode::new("slow", "query", "result", |_| Ok(json!("ok-slow"))).unwrap();
    Graph::from_nodes([check.into(), fast.into(), slow.into()]).unwrap()
}

#[tokio::test]
async fn test_binary_gate_mutex_region() {
    let graph = branch_graph();
    let runner = Runner::sequential();

    let fast = runner
        .run(&graph, values(vec![("query", json!("cached"))]))
        .await
        .unwrap();
    assert_eq!(fast["result"], json!("ok-fast"));

    let collector = CollectingProcessor::new();
    let slow = Runner::sequential()
        .with_processor(Arc::new(collector.clone()))
        .run(&graph, values(vec![("query", json!("new"))]))
        .await
        .unwrap();
    assert_eq!(slow["result"], json!("ok-slow"));

    // Mutual exclusion: the unchosen branch never executes.
    let fast_ran = collector
        .events()
        .iter()
        .any(|e| matches!(&e.kind, EventKind::NodeStart { node } if node == "fast"));
    assert!(!fast_ran);
}

fn adder() -> Graph {
    let add = FunctionNode::new("add", ["a", "b"], "sum", |v: &ValueMap| {
        Ok(json!(v["a"].as_i64().unwrap() + v["b"].as_i64().unwrap()))
    })
    .unwrap();
    GraphBuilder::named("adder").node(add).build().unwrap()
}

#[tokio::test]
async fn test_map_over_zip() {
    let node = adder()
        .as_node()
        .unwrap()
        .map_over(["a", "b"], MapMode::Zip, ErrorPolicy::Raise)
        .unwrap();
    let graph = Graph::from_nodes([node.into()]).unwrap();

    let result = Runner::sequential()
        .run(
            &graph,
            values(vec![("a", json!([1, 2, 3])), ("b", json!([10, 20, 30]))]),
        )
        .await
        .unwrap();
    assert_eq!(result["sum"], json!([11, 22, 33]));
}

#[tokio::test]
async fn test_map_over_product_order() {
    let node = adder()
        .as_node()
        .unwrap()
        .map_over(["a", "b"], MapMode::Product, ErrorPolicy::Raise)
        .unwrap();
    let graph = Graph::from_nodes([node.into()]).unwrap();

    let result = Runner::sequential()
        .run(
            &graph,
            values(vec![("a", json!([1, 2])), ("b", json!([10, 20]))]),
        )
        .await
        .unwrap();
    assert_eq!(result["sum"], json!([11, 21, 12, 22]));
}

#[tokio::test]
async fn test_map_over_zip_length_mismatch() {
    let node = adder()
        .as_node()
        .unwrap()
        .map_over(["a", "b"], MapMode::Zip, ErrorPolicy::Raise)
        .unwrap();
    let graph = Graph::from_nodes([node.into()]).unwrap();

    let err = Runner::sequential()
        .run(
            &graph,
            values(vec![("a", json!([1, 2])), ("b", json!([10]))]),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("equal lengths"));
}

#[tokio::test]
async fn test_runner_map_preserves_order() {
    let graph = linear();
    let result = Runner::concurrent()
        .map(
            &graph,
            values(vec![("x", json!([1, 2, 3]))]),
            MapOptions::over("x").unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Completed);
    assert_eq!(result.len(), 3);
    assert_eq!(result.get("result"), vec![json!(3), json!(5), json!(7)]);
}

#[tokio::test]
async fn test_runner_map_continue_collects_failures() {
    let failing = FunctionNode::new("failing", "x", "y", |v: &ValueMap| {
        if v["x"] == json!(2) {
            Err("two is not allowed".into())
        } else {
            Ok(json!(v["x"].as_i64().unwrap() * 2))
        }
    })
    .unwrap();
    let graph = Graph::from_nodes([failing.into()]).unwrap();

    let result = Runner::sequential()
        .map(
            &graph,
            values(vec![("x", json!([1, 2, 3]))]),
            MapOptions::over("x")
                .unwrap()
                .error_handling(ErrorPolicy::Continue),
        )
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Failed);
    assert_eq!(result.get("y"), vec![json!(2), Value::Null, json!(6)]);
    assert!(result[1].error.is_some());
}

fn approval_graph() -> Graph {
    let draft = FunctionNode::new("draft", "prompt", "draft", |v: &ValueMap| {
        Ok(json!(format!("draft-of-{}", v["prompt"].as_str().unwrap())))
    })
    .unwrap();
    let approval = InterruptNode::new("approval", "draft", "decision").unwrap();
    let finalize = FunctionNode::new("finalize", "decision", "final", |v: &ValueMap| {
        Ok(json!(format!("Final: {}", v["decision"].as_str().unwrap())))
    })
    .unwrap();
    Graph::from_nodes([draft.into(), approval.into(), finalize.into()]).unwrap()
}

#[tokio::test]
async fn test_interrupt_pause_and_resume() {
    let graph = approval_graph();
    let runner = Runner::sequential();

    let paused = runner
        .run(&graph, values(vec![("prompt", json!("p"))]))
        .await
        .unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    let pause = paused.pause.clone().unwrap();
    assert_eq!(pause.node, "approval");
    assert_eq!(pause.value, json!("draft-of-p"));
    assert_eq!(pause.response_key, "decision");
    assert!(paused.get("final").is_none());

    let resumed = runner
        .run(
            &graph,
            values(vec![
                ("prompt", json!("p")),
                (pause.response_key.as_str(), json!("approved")),
            ]),
        )
        .await
        .unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed["final"], json!("Final: approved"));
}

#[tokio::test]
async fn test_interrupt_handler_matches_resume_outcome() {
    let draft = FunctionNode::new("draft", "prompt", "draft", |v: &ValueMap| {
        Ok(json!(format!("draft-of-{}", v["prompt"].as_str().unwrap())))
    })
    .unwrap();
    let approval = InterruptNode::new("approval", "draft", "decision")
        .unwrap()
        .with_handler(|_| Ok(json!("approved")));
    let finalize = FunctionNode::new("finalize", "decision", "final", |v: &ValueMap| {
        Ok(json!(format!("Final: {}", v["decision"].as_str().unwrap())))
    })
    .unwrap();
    let graph = Graph::from_nodes([draft.into(), approval.into(), finalize.into()]).unwrap();

    let result = Runner::sequential()
        .run(&graph, values(vec![("prompt", json!("p"))]))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result["final"], json!("Final: approved"));
}

#[tokio::test]
async fn test_nested_pause_propagates_and_resumes() {
    let review = GraphBuilder::named("review")
        .node(InterruptNode::new("approval", "draft", "decision").unwrap())
        .build()
        .unwrap();
    let draft = FunctionNode::new("draft", "prompt", "draft", |v: &ValueMap| {
        Ok(json!(format!("draft-of-{}", v["prompt"].as_str().unwrap())))
    })
    .unwrap();
    let finalize = FunctionNode::new("finalize", "decision", "final", |v: &ValueMap| {
        Ok(json!(format!("Final: {}", v["decision"].as_str().unwrap())))
    })
    .unwrap();
    let graph = Graph::from_nodes([
        draft.into(),
        review.as_node().unwrap().into(),
        finalize.into(),
    ])
    .unwrap();

    let runner = Runner::sequential();
    let paused = runner
        .run(&graph, values(vec![("prompt", json!("p"))]))
        .await
        .unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    let pause = paused.pause.clone().unwrap();
    assert_eq!(pause.node, "review.approval");

    let resumed = runner
        .run(
            &graph,
            values(vec![
                ("prompt", json!("p")),
                (pause.response_key.as_str(), json!("approved")),
            ]),
        )
        .await
        .unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed["final"], json!("Final: approved"));
}

#[tokio::test]
async fn test_error_policy_raise_preserves_original() {
    let boom = FunctionNode::new("boom", "x", "y", |_| Err("user exploded".into())).unwrap();
    let graph = Graph::from_nodes([boom.into()]).unwrap();

    let err = Runner::sequential()
        .run(&graph, values(vec![("x", json!(1))]))
        .await
        .unwrap_err();
    match &err {
        HypergraphError::NodeExecution { node, source } => {
            assert_eq!(node, "boom");
            assert_eq!(source.to_string(), "user exploded");
        }
        other => panic!("expected NodeExecution, got {other}"),
    }
}

#[tokio::test]
async fn test_error_policy_continue_keeps_prior_outputs() {
    let ok = FunctionNode::new("ok", "x", "a", |v: &ValueMap| {
        Ok(json!(v["x"].as_i64().unwrap() + 1))
    })
    .unwrap();
    let fail = FunctionNode::new("fail", "a", "b", |_| Err("boom".into())).unwrap();
    let after = FunctionNode::new("after", "b", "c", |_| Ok(json!(0))).unwrap();
    let graph = Graph::from_nodes([ok.into(), fail.into(), after.into()]).unwrap();

    let result = Runner::sequential()
        .run_with(
            &graph,
            values(vec![("x", json!(1))]),
            RunOptions::new().error_handling(ErrorPolicy::Continue),
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result["a"], json!(2));
    assert!(result.get("b").is_none());
    assert!(result.get("c").is_none());
    assert_eq!(result.error.as_ref().unwrap().to_string(), "boom");
}

#[tokio::test]
async fn test_cache_hit_skips_execution() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let node = FunctionNode::new("double", "x", "doubled", move |v: &ValueMap| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(json!(v["x"].as_i64().unwrap() * 2))
    })
    .unwrap()
    .cached(true)
    .with_definition_key("double-v1");
    let graph = Graph::from_nodes([node.into()]).unwrap();

    let collector = CollectingProcessor::new();
    let runner = Runner::sequential()
        .with_cache(Arc::new(InMemoryCache::new()))
        .with_processor(Arc::new(collector.clone()));

    let first = runner.run(&graph, values(vec![("x", json!(5))])).await.unwrap();
    let second = runner.run(&graph, values(vec![("x", json!(5))])).await.unwrap();

    assert_eq!(first["doubled"], json!(10));
    assert_eq!(second["doubled"], json!(10));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let events = collector.events();
    assert!(events
        .iter()
        .any(|e| matches!(&e.kind, EventKind::CacheHit { node } if node == "double")));
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::NodeEnd { node, cached: true, duration_ms: 0 } if node == "double"
    )));
}

#[tokio::test]
async fn test_cache_requires_definition_key() {
    let node = FunctionNode::new("double", "x", "doubled", |_| Ok(json!(0)))
        .unwrap()
        .cached(true);
    let graph = Graph::from_nodes([node.into()]).unwrap();

    let err = Runner::sequential()
        .with_cache(Arc::new(InMemoryCache::new()))
        .run(&graph, values(vec![("x", json!(5))]))
        .await
        .unwrap_err();
    assert!(matches!(err, HypergraphError::HashUnavailable { .. }));
}

#[tokio::test]
async fn test_cached_route_decision_replays() {
    let gate = RouteNode::if_else("check", "query", "fast", "slow", |v: &ValueMap| {
        Ok(v["query"].as_str() == Some("cached"))
    })
    .unwrap()
    .cached(true)
    .with_definition_key("check-v1");
    let fast = FunctionNode::new("fast", "query", "result", |_| Ok(json!("ok-fast"))).unwrap();
    let slow = FunctionNode::new("slow", "query", "result", |_| Ok(json!("ok-slow"))).unwrap();
    let graph = Graph::from_nodes([gate.into(), fast.into(), slow.into()]).unwrap();

    let collector = CollectingProcessor::new();
    let runner = Runner::sequential()
        .with_cache(Arc::new(InMemoryCache::new()))
        .with_processor(Arc::new(collector.clone()));

    let first = runner
        .run(&graph, values(vec![("query", json!("cached"))]))
        .await
        .unwrap();
    let second = runner
        .run(&graph, values(vec![("query", json!("cached"))]))
        .await
        .unwrap();
    assert_eq!(first["result"], json!("ok-fast"));
    assert_eq!(second["result"], json!("ok-fast"));

    let cached_decisions = collector
        .events()
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::RouteDecision { cached: true, .. }))
        .count();
    assert_eq!(cached_decisions, 1);
}

#[tokio::test]
async fn test_sequential_determinism() {
    let graph = linear();

    let mut kinds: Vec<Vec<String>> = Vec::new();
    for _ in 0..2 {
        let collector = CollectingProcessor::new();
        let result = Runner::sequential()
            .with_processor(Arc::new(collector.clone()))
            .run(&graph, values(vec![("x", json!(5))]))
            .await
            .unwrap();
        assert_eq!(result["result"], json!(11));
        kinds.push(
            collector
                .events()
                .iter()
                .map(|e| format!("{:?}", e.kind))
                .collect(),
        );
    }
    assert_eq!(kinds[0], kinds[1]);
}

#[tokio::test]
async fn test_sequential_rejects_async_nodes() {
    let fetch = FunctionNode::new_async("fetch", "x", "y", |v: ValueMap| async move {
        Ok(json!(v["x"].as_i64().unwrap() + 1))
    })
    .unwrap();
    let graph = Graph::from_nodes([fetch.into()]).unwrap();

    let err = Runner::sequential()
        .run(&graph, values(vec![("x", json!(1))]))
        .await
        .unwrap_err();
    assert!(matches!(err, HypergraphError::IncompatibleRunner { .. }));
    assert!(err.to_string().contains("async nodes"));

    let result = Runner::concurrent()
        .run(&graph, values(vec![("x", json!(1))]))
        .await
        .unwrap();
    assert_eq!(result["y"], json!(2));
}

#[tokio::test]
async fn test_concurrent_runner_batches_async_nodes() {
    let a = FunctionNode::new_async("a", "x", "x1", |v: ValueMap| async move {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        Ok(json!(v["x"].as_i64().unwrap() + 1))
    })
    .unwrap();
    let b = FunctionNode::new_async("b", "x", "x2", |v: ValueMap| async move {
        Ok(json!(v["x"].as_i64().unwrap() * 10))
    })
    .unwrap();
    let merge = FunctionNode::new("merge", ["x1", "x2"], "y", |v: &ValueMap| {
        Ok(json!(v["x1"].as_i64().unwrap() + v["x2"].as_i64().unwrap()))
    })
    .unwrap();
    let graph = Graph::from_nodes([a.into(), b.into(), merge.into()]).unwrap();

    let result = Runner::concurrent()
        .run(&graph, values(vec![("x", json!(3))]))
        .await
        .unwrap();
    assert_eq!(result["y"], json!(34));
}

#[tokio::test]
async fn test_streaming_node_collects_chunks() {
    let stream = FunctionNode::streaming("tokens", "prompt", "text", |_: ValueMap| {
        let chunks: Vec<std::result::Result<Value, crate::error::NodeError>> =
            vec![Ok(json!("hel")), Ok(json!("lo"))];
        Box::pin(futures::stream::iter(chunks))
    })
    .unwrap();
    let join = FunctionNode::new("join", "text", "joined", |v: &ValueMap| {
        let parts: Vec<String> = v["text"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p.as_str().unwrap().to_string())
            .collect();
        Ok(json!(parts.concat()))
    })
    .unwrap();
    let graph = Graph::from_nodes([stream.into(), join.into()]).unwrap();

    let collector = CollectingProcessor::new();
    let result = Runner::concurrent()
        .with_processor(Arc::new(collector.clone()))
        .run(&graph, values(vec![("prompt", json!("hi"))]))
        .await
        .unwrap();

    assert_eq!(result["joined"], json!("hello"));
    let chunks = collector
        .events()
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::NodeStream { .. }))
        .count();
    assert_eq!(chunks, 2);
}

#[tokio::test]
async fn test_missing_input_lists_names() {
    let err = Runner::sequential()
        .run(&linear(), ValueMap::new())
        .await
        .unwrap_err();
    match err {
        HypergraphError::MissingInput { inputs } => assert_eq!(inputs, vec!["x"]),
        other => panic!("expected MissingInput, got {other}"),
    }
}

#[tokio::test]
async fn test_internal_override_loses_to_edge_value() {
    let result = Runner::sequential()
        .run(
            &linear(),
            values(vec![("x", json!(5)), ("doubled", json!(999))]),
        )
        .await
        .unwrap();
    // The provided override is shadowed once the producer runs.
    assert_eq!(result["doubled"], json!(10));
    assert_eq!(result["result"], json!(11));
}

#[tokio::test]
async fn test_internal_override_error_policy() {
    let err = Runner::sequential()
        .run_with(
            &linear(),
            values(vec![("x", json!(5)), ("doubled", json!(999))]),
            RunOptions::new().on_internal_override(OverridePolicy::Error),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("doubled"));
}

#[tokio::test]
async fn test_output_injection_bypasses_producer() {
    let collector = CollectingProcessor::new();
    let result = Runner::sequential()
        .with_processor(Arc::new(collector.clone()))
        .run(&linear(), values(vec![("doubled", json!(10))]))
        .await
        .unwrap();

    assert_eq!(result["result"], json!(11));
    let double_ran = collector
        .events()
        .iter()
        .any(|e| matches!(&e.kind, EventKind::NodeStart { node } if node == "double"));
    assert!(!double_ran);
}

#[tokio::test]
async fn test_partial_injection_rejected() {
    let two = FunctionNode::new("two", "x", ["a", "b"], |_| Ok(json!([1, 2]))).unwrap();
    let use_both = FunctionNode::new("use_both", ["a", "b"], "d", |v: &ValueMap| {
        Ok(json!(v["a"].as_i64().unwrap() + v["b"].as_i64().unwrap()))
    })
    .unwrap();
    let graph = Graph::from_nodes([two.into(), use_both.into()]).unwrap();

    let err = Runner::sequential()
        .run(&graph, values(vec![("a", json!(7))]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("partial injection"));

    let full = Runner::sequential()
        .run(&graph, values(vec![("a", json!(7)), ("b", json!(8))]))
        .await
        .unwrap();
    assert_eq!(full["d"], json!(15));
}

#[tokio::test]
async fn test_wait_for_signal_orders_execution() {
    let writer = FunctionNode::new("writer", "x", Vec::<String>::new(), |_| Ok(Value::Null))
        .unwrap()
        .emits("saved")
        .unwrap();
    let reader = FunctionNode::new("reader", "x", "y", |v: &ValueMap| {
        Ok(json!(v["x"].as_i64().unwrap() + 1))
    })
    .unwrap()
    .waits_for("saved")
    .unwrap();
    let graph = Graph::from_nodes([writer.into(), reader.into()]).unwrap();

    let collector = CollectingProcessor::new();
    let result = Runner::sequential()
        .with_processor(Arc::new(collector.clone()))
        .run(&graph, values(vec![("x", json!(1))]))
        .await
        .unwrap();
    assert_eq!(result["y"], json!(2));

    let events = collector.events();
    let writer_end = events
        .iter()
        .position(|e| matches!(&e.kind, EventKind::NodeEnd { node, .. } if node == "writer"))
        .unwrap();
    let reader_start = events
        .iter()
        .position(|e| matches!(&e.kind, EventKind::NodeStart { node } if node == "reader"))
        .unwrap();
    assert!(reader_start > writer_end);
}

#[tokio::test]
async fn test_stop_handle_drains_run() {
    let stop = StopHandle::new();
    stop.request_stop();

    let result = Runner::sequential()
        .run_with(
            &linear(),
            values(vec![("x", json!(5))]),
            RunOptions::new().stop_handle(stop),
        )
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Stopped);
    assert!(result.values.is_empty());
}

#[tokio::test]
async fn test_runtime_select_narrows_run() {
    let collector = CollectingProcessor::new();
    let result = Runner::sequential()
        .with_processor(Arc::new(collector.clone()))
        .run_with(
            &linear(),
            values(vec![("x", json!(5))]),
            RunOptions::new().select(["doubled"]),
        )
        .await
        .unwrap();

    assert_eq!(result["doubled"], json!(10));
    assert!(result.get("result").is_none());
    let addone_ran = collector
        .events()
        .iter()
        .any(|e| matches!(&e.kind, EventKind::NodeStart { node } if node == "addone"));
    assert!(!addone_ran);
}

#[tokio::test]
async fn test_infinite_loop_budget() {
    let spin = FunctionNode::new("spin", ["count", "tick"], "count", |v: &ValueMap| {
        Ok(json!(v["count"].as_i64().unwrap() + 1))
    })
    .unwrap();
    let ticker = FunctionNode::new("ticker", "count", "tick", |v: &ValueMap| {
        Ok(json!(v["count"].as_i64().unwrap()))
    })
    .unwrap();
    let graph = Graph::from_nodes([spin.into(), ticker.into()]).unwrap();

    let err = Runner::sequential()
        .run_with(
            &graph,
            values(vec![("count", json!(0))]),
            RunOptions::new().max_iterations(10).entrypoint("spin"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HypergraphError::InfiniteLoop { max_iterations: 10 }));
}

#[tokio::test]
async fn test_run_events_bracket_node_events() {
    let collector = CollectingProcessor::new();
    Runner::sequential()
        .with_processor(Arc::new(collector.clone()))
        .run(&linear(), values(vec![("x", json!(5))]))
        .await
        .unwrap();

    let events = collector.events();
    assert!(matches!(events.first().unwrap().kind, EventKind::RunStart { .. }));
    assert!(matches!(events.last().unwrap().kind, EventKind::RunEnd { .. }));

    let starts = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::NodeStart { .. }))
        .count();
    let ends = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::NodeEnd { .. }))
        .count();
    assert_eq!(starts, 2);
    assert_eq!(starts, ends);
}

#[tokio::test]
async fn test_step_records_reach_sink() {
    use crate::scheduler::types::{StepRecord, StepSink, StepStatus};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<StepRecord>>);

    impl StepSink for Recorder {
        fn record(&self, step: &StepRecord) -> std::result::Result<(), crate::error::NodeError> {
            self.0.lock().unwrap().push(step.clone());
            Ok(())
        }
    }

    let recorder = Arc::new(Recorder::default());
    Runner::sequential()
        .with_step_sink(recorder.clone())
        .run(&linear(), values(vec![("x", json!(5))]))
        .await
        .unwrap();

    let steps = recorder.0.lock().unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].node_name, "double");
    assert_eq!(steps[0].superstep, 1);
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[0].produced_output_versions["doubled"], 1);
    assert_eq!(steps[1].node_name, "addone");
    assert_eq!(steps[1].consumed_input_versions["doubled"], 1);
}
