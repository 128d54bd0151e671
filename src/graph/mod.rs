//! Graph model and assembly for pipeline topologies.
//!
//! A [`PipelineGraph`] is the compiled, frozen form of a pipeline: named
//! nodes (each owning one stage, fan-out, or barrier), directed edges with
//! optional event-type filters, one entry node, and any number of exit
//! nodes. Graphs are produced by [`GraphBuilder`], validated at build time,
//! and then owned exclusively by a
//! [`Pipeline`](crate::runtime::Pipeline).

mod builder;
mod validation;

pub use builder::{BuildError, GraphBuilder};

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::events::EventType;
use crate::stage::Stage;

/// What a node owns. Fan-out and barrier nodes are synthetic: they carry a
/// runtime-provided stage, and the validator skips type checks on their
/// edges because the primitive enforces its own typing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Stage,
    FanOut,
    Barrier,
}

/// A named node in the compiled graph.
pub struct GraphNode {
    name: String,
    stage: Arc<dyn Stage>,
    role: NodeRole,
    /// Indices into [`PipelineGraph::edges`] for outgoing edges.
    outputs: Vec<usize>,
    /// Indices into [`PipelineGraph::edges`] for incoming edges.
    inputs: Vec<usize>,
}

impl GraphNode {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stage(&self) -> &Arc<dyn Stage> {
        &self.stage
    }

    #[must_use]
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Outgoing edge indices.
    #[must_use]
    pub fn outputs(&self) -> &[usize] {
        &self.outputs
    }

    /// Incoming edge indices.
    #[must_use]
    pub fn inputs(&self) -> &[usize] {
        &self.inputs
    }
}

/// A directed edge, the only place where event filtering happens.
#[derive(Clone, Debug)]
pub struct GraphEdge {
    from: String,
    to: String,
    /// `None` forwards every event type.
    filter: Option<FxHashSet<EventType>>,
}

impl GraphEdge {
    #[must_use]
    pub fn from(&self) -> &str {
        &self.from
    }

    #[must_use]
    pub fn to(&self) -> &str {
        &self.to
    }

    #[must_use]
    pub fn filter(&self) -> Option<&FxHashSet<EventType>> {
        self.filter.as_ref()
    }

    /// Whether an event with this tag traverses the edge.
    #[must_use]
    pub fn should_forward(&self, event_type: EventType) -> bool {
        match &self.filter {
            None => true,
            Some(filter) => filter.contains(&event_type),
        }
    }
}

/// The compiled pipeline topology. Frozen after
/// [`GraphBuilder::build`].
pub struct PipelineGraph {
    nodes: FxHashMap<String, GraphNode>,
    edges: Vec<GraphEdge>,
    entry: Option<String>,
    exits: Vec<String>,
}

impl PipelineGraph {
    pub(crate) fn new() -> Self {
        Self {
            nodes: FxHashMap::default(),
            edges: Vec::new(),
            entry: None,
            exits: Vec::new(),
        }
    }

    pub(crate) fn add_node(
        &mut self,
        name: impl Into<String>,
        stage: Arc<dyn Stage>,
        role: NodeRole,
    ) -> Result<(), BuildError> {
        let name = name.into();
        if self.nodes.contains_key(&name) {
            return Err(BuildError::DuplicateNode { name });
        }
        self.nodes.insert(
            name.clone(),
            GraphNode {
                name,
                stage,
                role,
                outputs: Vec::new(),
                inputs: Vec::new(),
            },
        );
        Ok(())
    }

    pub(crate) fn add_edge(
        &mut self,
        from: &str,
        to: &str,
        filter: Option<FxHashSet<EventType>>,
    ) -> Result<(), BuildError> {
        if !self.nodes.contains_key(from) {
            return Err(BuildError::UnknownNode { name: from.into() });
        }
        if !self.nodes.contains_key(to) {
            return Err(BuildError::UnknownNode { name: to.into() });
        }
        let index = self.edges.len();
        self.edges.push(GraphEdge {
            from: from.into(),
            to: to.into(),
            filter,
        });
        self.nodes
            .get_mut(from)
            .expect("source checked above")
            .outputs
            .push(index);
        self.nodes
            .get_mut(to)
            .expect("destination checked above")
            .inputs
            .push(index);
        Ok(())
    }

    pub(crate) fn set_entry(&mut self, name: &str) -> Result<(), BuildError> {
        if !self.nodes.contains_key(name) {
            return Err(BuildError::UnknownNode { name: name.into() });
        }
        self.entry = Some(name.into());
        Ok(())
    }

    pub(crate) fn add_exit(&mut self, name: &str) -> Result<(), BuildError> {
        if !self.nodes.contains_key(name) {
            return Err(BuildError::UnknownNode { name: name.into() });
        }
        self.exits.push(name.into());
        Ok(())
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn edge(&self, index: usize) -> &GraphEdge {
        &self.edges[index]
    }

    pub fn edges(&self) -> impl Iterator<Item = &GraphEdge> {
        self.edges.iter()
    }

    #[must_use]
    pub fn entry(&self) -> Option<&str> {
        self.entry.as_deref()
    }

    #[must_use]
    pub fn exits(&self) -> &[String] {
        &self.exits
    }

    #[must_use]
    pub fn is_exit(&self, name: &str) -> bool {
        self.exits.iter().any(|exit| exit == name)
    }
}
