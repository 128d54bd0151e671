//! Structural validation run at build time.
//!
//! Checks run in order and abort on the first failure: entry present,
//! acyclicity, reachability from entry, then per-edge type compatibility.
//! Validation is stateless; running it twice on the same graph is a no-op.

use rustc_hash::{FxHashMap, FxHashSet};

use super::{BuildError, NodeRole, PipelineGraph};
use crate::events::EventType;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

pub(crate) fn validate(graph: &PipelineGraph) -> Result<(), BuildError> {
    let entry = graph.entry().ok_or(BuildError::NoEntryNode)?;
    if graph.node(entry).is_none() {
        return Err(BuildError::UnknownNode { name: entry.into() });
    }
    detect_cycles(graph)?;
    check_reachability(graph, entry)?;
    check_type_compatibility(graph)?;
    Ok(())
}

/// Three-color depth-first search. Iterative on purpose: graphs may be wide
/// and deep, and an explicit stack keeps the recursion depth flat.
fn detect_cycles(graph: &PipelineGraph) -> Result<(), BuildError> {
    let mut colors: FxHashMap<&str, Color> = graph
        .nodes()
        .map(|node| (node.name(), Color::White))
        .collect();

    let roots: Vec<&str> = graph.nodes().map(|node| node.name()).collect();
    for root in roots {
        if colors[root] != Color::White {
            continue;
        }
        // (node, next outgoing-edge position)
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        colors.insert(root, Color::Gray);

        while let Some(&(name, position)) = stack.last() {
            let node = graph.node(name).expect("node in color map exists");
            if position < node.outputs().len() {
                stack.last_mut().expect("stack is non-empty").1 += 1;
                let edge = graph.edge(node.outputs()[position]);
                match colors[edge.to()] {
                    Color::White => {
                        colors.insert(edge.to(), Color::Gray);
                        stack.push((edge.to(), 0));
                    }
                    // Back edge into the active DFS path.
                    Color::Gray => {
                        return Err(BuildError::CycleDetected {
                            from: edge.from().into(),
                            to: edge.to().into(),
                        });
                    }
                    Color::Black => {}
                }
            } else {
                colors.insert(name, Color::Black);
                stack.pop();
            }
        }
    }
    Ok(())
}

fn check_reachability(graph: &PipelineGraph, entry: &str) -> Result<(), BuildError> {
    let mut reachable: FxHashSet<&str> = FxHashSet::default();
    let mut stack = vec![entry];
    while let Some(name) = stack.pop() {
        if !reachable.insert(name) {
            continue;
        }
        let node = graph.node(name).expect("edges reference existing nodes");
        for &index in node.outputs() {
            let next = graph.edge(index).to();
            if !reachable.contains(next) {
                stack.push(next);
            }
        }
    }
    for node in graph.nodes() {
        if !reachable.contains(node.name()) {
            return Err(BuildError::UnreachableStage {
                name: node.name().into(),
            });
        }
    }
    Ok(())
}

/// An edge is compatible when at least one upstream output type survives the
/// edge filter and is accepted downstream, or when either side declares
/// accept-all / produces-all. Edges touching a synthetic node (fan-out,
/// barrier) are skipped; the primitive enforces its own typing.
fn check_type_compatibility(graph: &PipelineGraph) -> Result<(), BuildError> {
    for edge in graph.edges() {
        let upstream = graph.node(edge.from()).expect("edge endpoints exist");
        let downstream = graph.node(edge.to()).expect("edge endpoints exist");
        if upstream.role() != NodeRole::Stage || downstream.role() != NodeRole::Stage {
            continue;
        }

        let outputs = upstream.stage().output_types();
        let inputs = downstream.stage().input_types();
        if outputs.is_empty() || inputs.is_empty() {
            continue;
        }
        if inputs.contains(&EventType::Wildcard) {
            continue;
        }

        let compatible = outputs
            .iter()
            .filter(|ty| edge.should_forward(**ty))
            .any(|ty| inputs.contains(ty));
        if !compatible {
            return Err(BuildError::TypeIncompatible {
                from: edge.from().into(),
                to: edge.to().into(),
                outputs,
                inputs,
            });
        }
    }
    Ok(())
}
