//! Graph rendering to DOT and Mermaid text.
//!
//! A read-only consumer of the immutable graph model: nodes are drawn by
//! kind, data edges are labeled with the value name they carry, gate edges
//! are dashed with the target as label, and signal edges are dotted.

use std::fmt::Write;

use crate::graph::Graph;
use crate::node::Node;
use crate::topology::EdgeKind;

/// Output format for [`visualize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VizFormat {
    Dot,
    Mermaid,
}

/// Render the active subgraph.
pub fn visualize(graph: &Graph, format: VizFormat) -> String {
    match format {
        VizFormat::Dot => render_dot(graph),
        VizFormat::Mermaid => render_mermaid(graph),
    }
}

fn dot_shape(node: &Node) -> &'static str {
    match node {
        Node::Function(_) => "box",
        Node::Graph(_) => "box3d",
        Node::Route(_) => "diamond",
        Node::Interrupt(_) => "hexagon",
    }
}

fn render_dot(graph: &Graph) -> String {
    let mut out = String::new();
    let name = graph.name().unwrap_or("hypergraph");
    let _ = writeln!(out, "digraph {name} {{");
    let _ = writeln!(out, "    rankdir=LR;");
    for node in graph.active_nodes() {
        let _ = writeln!(
            out,
            "    {} [shape={}];",
            node.name(),
            dot_shape(node)
        );
    }
    for edge in graph.edges() {
        match edge.kind {
            EdgeKind::Data => {
                let _ = writeln!(out, "    {} -> {} [label=\"{}\"];", edge.from, edge.to, edge.name);
            }
            EdgeKind::Control => {
                let _ = writeln!(out, "    {} -> {} [style=dashed];", edge.from, edge.to);
            }
            EdgeKind::Signal => {
                let _ = writeln!(
                    out,
                    "    {} -> {} [style=dotted, label=\"{}\"];",
                    edge.from, edge.to, edge.name
                );
            }
        }
    }
    out.push_str("}\n");
    out
}

fn render_mermaid(graph: &Graph) -> String {
    let mut out = String::from("graph LR\n");
    for node in graph.active_nodes() {
        let line = match node {
            Node::Function(_) => format!("    {0}[{0}]", node.name()),
            Node::Graph(_) => format!("    {0}[[{0}]]", node.name()),
            Node::Route(_) => format!("    {0}{{{0}}}", node.name()),
            Node::Interrupt(_) => format!("    {0}({0})", node.name()),
        };
        out.push_str(&line);
        out.push('\n');
    }
    for edge in graph.edges() {
        let line = match edge.kind {
            EdgeKind::Data => format!("    {} -->|{}| {}", edge.from, edge.name, edge.to),
            EdgeKind::Control => format!("    {} -.-> {}", edge.from, edge.to),
            EdgeKind::Signal => format!("    {} -.->|{}| {}", edge.from, edge.name, edge.to),
        };
        out.push_str(&line);
        out.push('\n');
    }
    out
}
