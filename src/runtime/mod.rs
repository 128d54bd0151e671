//! Execution engine for compiled pipelines.
//!
//! A [`Pipeline`] is produced by
//! [`GraphBuilder::build`](crate::graph::GraphBuilder::build) and owns the
//! frozen topology. Each call to [`Pipeline::execute`] spawns a fresh
//! execution: per-node bounded buffers, one worker and one streaming router
//! per node, an input feeder, and a first-error-wins aggregator, all torn
//! down when the run completes or is cancelled.

mod config;
mod execution;

pub use config::{PipelineConfig, DEFAULT_EDGE_CAPACITY};
pub use execution::{Pipeline, PipelineError, PipelineRun};
