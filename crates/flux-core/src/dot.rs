// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `.dot` graph emission: one node per registered node, edges by product
//! name between a producer and its consumers.

use std::fmt::Write as _;

use rustc_hash::FxHashMap;

use crate::node::{NodeDescriptor, NodeKind};

/// Renders `nodes` as a Graphviz `digraph`.
///
/// An edge `A -> B [label="x"]` means `A` produces product `x` and `B`
/// declares `x` among its inputs. Products with no declared producer (e.g.
/// from the source) appear as edges from a synthetic `source` node.
pub fn to_dot(nodes: &[NodeDescriptor]) -> String {
    let mut producers: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for node in nodes {
        if let NodeKind::Transform { .. } | NodeKind::Splitter { .. } | NodeKind::Reduction { .. } = node.kind() {
            for name in produced_names(node) {
                producers.entry(name).or_default().push(node.name());
            }
        }
    }

    let mut out = String::new();
    let _ = writeln!(out, "digraph flow {{");
    let _ = writeln!(out, "  source [shape=doublecircle];");
    for node in nodes {
        let shape = match node.kind() {
            NodeKind::Filter { .. } => "diamond",
            NodeKind::Monitor { .. } => "ellipse",
            NodeKind::Transform { .. } => "box",
            NodeKind::Reduction { .. } => "hexagon",
            NodeKind::Splitter { .. } => "trapezium",
        };
        let _ = writeln!(out, "  \"{}\" [shape={shape}];", node.name());
    }
    for node in nodes {
        for input in node.inputs() {
            let from_nodes = producers.get(input.as_str());
            match from_nodes {
                Some(froms) => {
                    for from in froms {
                        let _ = writeln!(out, "  \"{from}\" -> \"{}\" [label=\"{input}\"];", node.name());
                    }
                }
                None => {
                    let _ = writeln!(out, "  source -> \"{}\" [label=\"{input}\"];", node.name());
                }
            }
        }
    }
    let _ = writeln!(out, "}}");
    out
}

fn produced_names(node: &NodeDescriptor) -> Vec<&str> {
    match node.kind() {
        NodeKind::Transform { provides, .. } => provides.iter().map(String::as_str).collect(),
        NodeKind::Reduction { output, .. } => vec![output.as_str()],
        NodeKind::Splitter { provides, .. } => provides.iter().map(String::as_str).collect(),
        _ => Vec::new(),
    }
}
