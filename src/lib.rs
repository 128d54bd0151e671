//! ```text
//! GraphBuilder ──► build() ─► Pipeline ─► execute(ctx, input)
//!      │             │                        │
//!      │        validation                    ├─► feeder ─► entry worker ─► router ─┐
//!      │   (cycles / reachability /           │                                     │ per-edge
//!      │      type compatibility)             │   FanOutStage ◄─ branches           │ filters
//!      │                                      │   BarrierStage ◄─ Done counting     ▼
//!      └─► stages / fan-outs / barriers       └─► PipelineRun ◄── exit routers ── output
//! ```
//!
//! Eventloom compiles a declared DAG of processing stages into a live,
//! concurrent execution. Heterogeneous [`events::Event`]s flow from a single
//! entry edge, through per-edge type filters, fan-outs, and barrier joins, to
//! one or more exit edges. The runtime owns buffering, routing, lifecycle,
//! failure propagation, and cancellation; the work performed *inside* stages
//! (transcription, model calls, synthesis, sinks) belongs to the embedder.

pub mod barrier;
pub mod events;
pub mod fanout;
pub mod graph;
pub mod runtime;
pub mod stage;
