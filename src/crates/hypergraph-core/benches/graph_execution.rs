use criterion::{criterion_group, criterion_main, Criterion};
use hypergraph_core::{FunctionNode, Graph, Runner, ValueMap};
use serde_json::json;

fn pipeline(depth: usize) -> Graph {
    let mut nodes = Vec::with_capacity(depth);
    for i in 0..depth {
        let input = if i == 0 { "x".to_string() } else { format!("v{i}") };
        let output = format!("v{}", i + 1);
        nodes.push(
            FunctionNode::new(format!("step{i}"), vec![input], vec![output], |v: &ValueMap| {
                let value = v.values().next().and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(json!(value + 1))
            })
            .unwrap()
            .into(),
        );
    }
    Graph::from_nodes(nodes).unwrap()
}

fn bench_linear_run(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let graph = pipeline(16);
    let runner = Runner::sequential();

    c.bench_function("linear_16_nodes", |b| {
        b.iter(|| {
            let result = runtime
                .block_on(runner.run(&graph, [("x".to_string(), json!(0))].into()))
                .unwrap();
            assert_eq!(result["v16"], json!(16));
        })
    });
}

fn bench_fanout_run(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let mut nodes: Vec<hypergraph_core::Node> = Vec::new();
    for i in 0..8 {
        nodes.push(
            FunctionNode::new(format!("branch{i}"), "x", format!("out{i}"), |v: &ValueMap| {
                Ok(json!(v["x"].as_i64().unwrap() * 2))
            })
            .unwrap()
            .into(),
        );
    }
    let graph = Graph::from_nodes(nodes).unwrap();
    let runner = Runner::concurrent();

    c.bench_function("fanout_8_branches", |b| {
        b.iter(|| {
            runtime
                .block_on(runner.run(&graph, [("x".to_string(), json!(3))].into()))
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_linear_run, bench_fanout_run);
criterion_main!(benches);
