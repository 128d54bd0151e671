//! Fluent assembly of pipeline graphs.

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashSet;
use thiserror::Error;

use super::validation;
use super::{NodeRole, PipelineGraph};
use crate::barrier::{BarrierConfig, BarrierStage};
use crate::events::EventType;
use crate::fanout::{ErrorPolicy, FanOutConfig, FanOutStage};
use crate::runtime::{Pipeline, PipelineConfig};
use crate::stage::Stage;

/// Errors surfaced while assembling or validating a graph.
///
/// Build-time errors abort [`GraphBuilder::build`]; the pipeline is never
/// materialized.
#[derive(Debug, Error, Diagnostic)]
pub enum BuildError {
    #[error("pipeline must have at least one stage")]
    #[diagnostic(code(eventloom::build::empty_graph))]
    EmptyGraph,

    #[error("node {name:?} already exists in graph")]
    #[diagnostic(
        code(eventloom::build::duplicate_node),
        help("Node names must be unique per graph.")
    )]
    DuplicateNode { name: String },

    #[error("node {name:?} does not exist in graph")]
    #[diagnostic(
        code(eventloom::build::unknown_node),
        help("connect, set_entry, and add_exit may only reference added nodes.")
    )]
    UnknownNode { name: String },

    #[error("entry node must be set")]
    #[diagnostic(code(eventloom::build::no_entry_node))]
    NoEntryNode,

    #[error("cycle detected in pipeline graph: edge {from:?} -> {to:?} closes a cycle")]
    #[diagnostic(code(eventloom::build::cycle_detected))]
    CycleDetected { from: String, to: String },

    #[error("stage {name:?} is unreachable from entry node")]
    #[diagnostic(code(eventloom::build::unreachable_stage))]
    UnreachableStage { name: String },

    #[error(
        "incompatible event types between stage {from:?} (outputs: {outputs:?}) \
         and stage {to:?} (inputs: {inputs:?})"
    )]
    #[diagnostic(
        code(eventloom::build::type_incompatible),
        help("At least one forwarded output type must appear in the downstream input set, \
              or either side must be accept-all/wildcard.")
    )]
    TypeIncompatible {
        from: String,
        to: String,
        outputs: Vec<EventType>,
        inputs: Vec<EventType>,
    },
}

enum NodeSpec {
    Stage(Arc<dyn Stage>),
    FanOut(FanOutConfig),
    Barrier(BarrierConfig),
}

struct EdgeSpec {
    from: String,
    to: String,
    filter: Option<FxHashSet<EventType>>,
}

/// Collects node and edge declarations, then materializes and validates the
/// graph at [`build`](Self::build).
///
/// All methods except `build` are chainable:
///
/// ```rust,no_run
/// # use eventloom::graph::GraphBuilder;
/// # use eventloom::events::EventType;
/// # fn demo(stt: impl eventloom::stage::Stage + 'static,
/// #         llm: impl eventloom::stage::Stage + 'static) -> Result<(), eventloom::graph::BuildError> {
/// let pipeline = GraphBuilder::new()
///     .add_stage("stt", stt)
///     .add_stage("llm", llm)
///     .connect_filtered("stt", "llm", [EventType::STT, EventType::Done])
///     .set_entry("stt")
///     .add_exit("llm")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct GraphBuilder {
    nodes: Vec<(String, NodeSpec)>,
    edges: Vec<EdgeSpec>,
    entry: Option<String>,
    exits: Vec<String>,
    config: PipelineConfig,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            entry: None,
            exits: Vec::new(),
            config: PipelineConfig::default(),
        }
    }

    /// Adds a processing stage node. Duplicate names are rejected at build.
    #[must_use]
    pub fn add_stage(mut self, name: impl Into<String>, stage: impl Stage + 'static) -> Self {
        self.nodes
            .push((name.into(), NodeSpec::Stage(Arc::new(stage))));
        self
    }

    /// Adds a fan-out node that routes events to parallel branches.
    #[must_use]
    pub fn add_fan_out(mut self, name: impl Into<String>, config: FanOutConfig) -> Self {
        self.nodes.push((name.into(), NodeSpec::FanOut(config)));
        self
    }

    /// Adds a barrier node that joins parallel branches back together.
    #[must_use]
    pub fn add_barrier(mut self, name: impl Into<String>, config: BarrierConfig) -> Self {
        self.nodes.push((name.into(), NodeSpec::Barrier(config)));
        self
    }

    /// Connects two nodes with an unfiltered edge (all event types flow).
    #[must_use]
    pub fn connect(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(EdgeSpec {
            from: from.into(),
            to: to.into(),
            filter: None,
        });
        self
    }

    /// Connects two nodes with an edge that forwards only the given types.
    #[must_use]
    pub fn connect_filtered(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        event_filter: impl IntoIterator<Item = EventType>,
    ) -> Self {
        self.edges.push(EdgeSpec {
            from: from.into(),
            to: to.into(),
            filter: Some(event_filter.into_iter().collect()),
        });
        self
    }

    /// Overrides the error policy of a previously added fan-out node.
    ///
    /// Calling this for a node that is not a fan-out is ignored with a
    /// warning.
    #[must_use]
    pub fn set_error_policy(mut self, node: &str, policy: ErrorPolicy) -> Self {
        match self.nodes.iter_mut().find(|(name, _)| name == node) {
            Some((_, NodeSpec::FanOut(config))) => config.error_policy = policy,
            _ => {
                tracing::warn!(
                    node,
                    ?policy,
                    "set_error_policy ignored: node is not a fan-out"
                );
            }
        }
        self
    }

    /// Marks the node fed by the external input sequence.
    #[must_use]
    pub fn set_entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Marks a node whose output feeds the external output sequence.
    #[must_use]
    pub fn add_exit(mut self, name: impl Into<String>) -> Self {
        self.exits.push(name.into());
        self
    }

    /// Overrides runtime tuning (per-edge buffer capacity).
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Materializes the graph, runs validation, and returns a ready
    /// [`Pipeline`].
    ///
    /// # Errors
    ///
    /// Any [`BuildError`]: empty graph, missing entry, duplicate or unknown
    /// node names, cycles, unreachable nodes, or incompatible edge types.
    pub fn build(self) -> Result<Pipeline, BuildError> {
        if self.nodes.is_empty() {
            return Err(BuildError::EmptyGraph);
        }
        let entry = self.entry.ok_or(BuildError::NoEntryNode)?;

        let mut graph = PipelineGraph::new();
        for (name, spec) in self.nodes {
            let (stage, role): (Arc<dyn Stage>, NodeRole) = match spec {
                NodeSpec::Stage(stage) => (stage, NodeRole::Stage),
                NodeSpec::FanOut(config) => (
                    Arc::new(FanOutStage::new(
                        name.clone(),
                        config,
                        self.config.edge_capacity,
                    )),
                    NodeRole::FanOut,
                ),
                NodeSpec::Barrier(config) => (
                    Arc::new(BarrierStage::new(name.clone(), config)),
                    NodeRole::Barrier,
                ),
            };
            graph.add_node(name, stage, role)?;
        }
        for edge in self.edges {
            graph.add_edge(&edge.from, &edge.to, edge.filter)?;
        }
        graph.set_entry(&entry)?;
        for exit in &self.exits {
            graph.add_exit(exit)?;
        }

        validation::validate(&graph)?;

        Ok(Pipeline::new(graph, self.config))
    }
}
