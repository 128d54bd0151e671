//! Per-execution wiring: buffers, workers, routers, feeder, completion.

use std::sync::Arc;

use futures_util::Stream;
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::PipelineConfig;
use crate::events::{Event, EventType};
use crate::graph::PipelineGraph;
use crate::stage::{panic_message, EventReceiver, EventSender, Stage, StageContext, StageError};

/// Errors an execution can finish with. The first one recorded wins;
/// cancellation is reported only when nothing else took precedence.
#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("stage {stage} failed: {source}")]
    #[diagnostic(code(eventloom::runtime::stage_failed))]
    StageFailed {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("stage {stage} panicked: {message}")]
    #[diagnostic(
        code(eventloom::runtime::stage_panicked),
        help("The panic payload is captured in `message`; the stage's worker was torn down.")
    )]
    StagePanicked { stage: String, message: String },

    #[error("{stage}: barrier expected {expected} DoneEvents, got {got}")]
    #[diagnostic(code(eventloom::runtime::barrier_count_mismatch))]
    BarrierCountMismatch {
        stage: String,
        expected: usize,
        got: usize,
    },

    #[error("pipeline execution cancelled")]
    #[diagnostic(code(eventloom::runtime::cancelled))]
    Cancelled,
}

/// A compiled, validated pipeline. One-shot per execution: every call to
/// [`execute`](Self::execute) builds fresh buffers and workers. The same
/// pipeline may be executed repeatedly only if its stages are re-entrant;
/// the runtime itself keeps no state between runs.
pub struct Pipeline {
    graph: Arc<PipelineGraph>,
    config: PipelineConfig,
}

impl Pipeline {
    pub(crate) fn new(graph: PipelineGraph, config: PipelineConfig) -> Self {
        Self {
            graph: Arc::new(graph),
            config,
        }
    }

    #[must_use]
    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    #[must_use]
    pub fn config(&self) -> PipelineConfig {
        self.config
    }

    /// Starts an execution fed by `input` and returns its handle.
    ///
    /// Closing `input` (dropping the sender) signals end of external events;
    /// the pipeline drains and closes its output. Cancelling `ctx` aborts
    /// promptly; consumers must expect truncation.
    pub fn execute(&self, ctx: CancellationToken, input: EventReceiver) -> PipelineRun {
        let token = ctx.child_token();
        let (output_tx, output_rx) = flume::bounded(self.config.edge_capacity);
        let handle = tokio::spawn(execute_graph(
            Arc::clone(&self.graph),
            self.config,
            token.clone(),
            input,
            output_tx,
        ));
        PipelineRun {
            output: output_rx,
            token,
            handle,
        }
    }
}

/// Handle to one in-flight execution: the output stream, a cancel switch,
/// and the completion result.
pub struct PipelineRun {
    output: EventReceiver,
    token: CancellationToken,
    handle: JoinHandle<Result<(), PipelineError>>,
}

impl PipelineRun {
    /// The bounded channel carrying events from every exit node. Closed once
    /// all exit nodes have finished.
    #[must_use]
    pub fn output(&self) -> &EventReceiver {
        &self.output
    }

    /// The output as an async stream.
    pub fn events(&self) -> impl Stream<Item = Event> + '_ {
        self.output.stream()
    }

    /// Aborts this execution. Workers unwind at their next suspension point
    /// and may drop un-forwarded events.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for every worker to exit and returns the execution result:
    /// the first stage error, panic, or barrier mismatch recorded, else
    /// [`PipelineError::Cancelled`] if cancellation fired, else `Ok(())`.
    pub async fn join(self) -> Result<(), PipelineError> {
        match self.handle.await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                std::panic::resume_unwind(join_error.into_panic())
            }
            Err(_) => Err(PipelineError::Cancelled),
        }
    }
}

struct Ports {
    in_tx: EventSender,
    in_rx: Option<EventReceiver>,
    out_tx: Option<EventSender>,
    out_rx: Option<EventReceiver>,
}

type Destination = (Option<FxHashSet<EventType>>, EventSender);

async fn execute_graph(
    graph: Arc<PipelineGraph>,
    config: PipelineConfig,
    token: CancellationToken,
    input: EventReceiver,
    output_tx: EventSender,
) -> Result<(), PipelineError> {
    tracing::debug!(nodes = graph.node_count(), "pipeline execution started");

    let (errors_tx, errors_rx) = flume::bounded::<PipelineError>(graph.node_count());

    let mut ports: FxHashMap<String, Ports> = graph
        .nodes()
        .map(|node| {
            let (in_tx, in_rx) = flume::bounded(config.edge_capacity);
            let (out_tx, out_rx) = flume::bounded(config.edge_capacity);
            (
                node.name().to_string(),
                Ports {
                    in_tx,
                    in_rx: Some(in_rx),
                    out_tx: Some(out_tx),
                    out_rx: Some(out_rx),
                },
            )
        })
        .collect();

    // Each router owns a sender clone for every downstream input it feeds.
    // A downstream input closes exactly when the last upstream router drops
    // its clone, i.e. when every upstream producer has finished: this is the
    // input-closure protocol, enforced by ownership instead of locks.
    let mut route_table: FxHashMap<String, Vec<Destination>> = FxHashMap::default();
    for node in graph.nodes() {
        let mut destinations: Vec<Destination> = Vec::with_capacity(node.outputs().len() + 1);
        for &edge_index in node.outputs() {
            let edge = graph.edge(edge_index);
            let downstream = ports.get(edge.to()).expect("edges reference existing nodes");
            destinations.push((edge.filter().cloned(), downstream.in_tx.clone()));
        }
        if graph.is_exit(node.name()) {
            // Exit nodes feed the pipeline output as one more unfiltered
            // destination; the output closes when the last exit router exits.
            destinations.push((None, output_tx.clone()));
        }
        route_table.insert(node.name().to_string(), destinations);
    }

    let entry_name = graph.entry().expect("validated graph has an entry");
    let feeder_tx = ports
        .get(entry_name)
        .expect("entry references an existing node")
        .in_tx
        .clone();

    let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(graph.node_count() * 2 + 1);
    for node in graph.nodes() {
        let node_ports = ports
            .get_mut(node.name())
            .expect("every node has allocated ports");
        let in_rx = node_ports.in_rx.take().expect("input taken once");
        let out_tx = node_ports.out_tx.take().expect("output sender taken once");
        let out_rx = node_ports.out_rx.take().expect("output receiver taken once");

        let stage = Arc::clone(node.stage());
        let name = node.name().to_string();
        let ctx = StageContext::new(name.as_str(), token.clone());
        tasks.push(tokio::spawn(run_stage(
            stage,
            name,
            ctx,
            in_rx,
            out_tx,
            errors_tx.clone(),
            token.clone(),
        )));

        let destinations = route_table
            .remove(node.name())
            .expect("route table covers every node");
        tasks.push(tokio::spawn(route_events(
            out_rx,
            destinations,
            token.clone(),
        )));
    }
    tasks.push(tokio::spawn(feed_input(input, feeder_tx, token.clone())));

    // Only workers, routers, and the feeder may keep channel halves alive
    // from here on; the engine's own handles would otherwise hold every
    // input open forever.
    drop(ports);
    drop(output_tx);
    drop(errors_tx);

    for task in tasks {
        let _ = task.await;
    }

    let result = match errors_rx.try_recv() {
        Ok(error) => Err(error),
        Err(_) if token.is_cancelled() => Err(PipelineError::Cancelled),
        Err(_) => Ok(()),
    };
    tracing::debug!(ok = result.is_ok(), "pipeline execution finished");
    result
}

/// Supervises one stage worker: runs `process` in its own task so panics are
/// contained, converts failures into the in-band `Error` event plus an
/// aggregator record, and triggers execution-wide cancellation.
async fn run_stage(
    stage: Arc<dyn Stage>,
    name: String,
    ctx: StageContext,
    input: EventReceiver,
    output: EventSender,
    errors: flume::Sender<PipelineError>,
    token: CancellationToken,
) {
    let report_out = output.clone();
    let worker = tokio::spawn(async move { stage.process(ctx, input, output).await });

    let failure = match worker.await {
        Ok(Ok(())) => None,
        // A clean unwind after cancellation is not a stage failure.
        Ok(Err(StageError::Cancelled)) => None,
        Ok(Err(error)) => {
            emit_error_event(&report_out, &token, error.to_string()).await;
            Some(match error {
                StageError::BarrierCountMismatch { expected, got } => {
                    PipelineError::BarrierCountMismatch {
                        stage: name.clone(),
                        expected,
                        got,
                    }
                }
                other => PipelineError::StageFailed {
                    stage: name.clone(),
                    source: other,
                },
            })
        }
        Err(join_error) if join_error.is_panic() => {
            let message = panic_message(join_error.into_panic());
            emit_error_event(&report_out, &token, format!("stage {name} panicked: {message}")).await;
            Some(PipelineError::StagePanicked {
                stage: name.clone(),
                message,
            })
        }
        Err(_) => None,
    };
    // The worker's sender is gone; dropping ours closes the node output.
    drop(report_out);

    if let Some(error) = failure {
        if errors.try_send(error).is_err() {
            tracing::warn!(stage = %name, "error aggregator full; dropping stage error");
        }
        token.cancel();
    }
}

/// Best-effort in-band failure report; delivered whenever the buffer has
/// room, lost only if the send blocks across cancellation.
async fn emit_error_event(output: &EventSender, token: &CancellationToken, message: String) {
    let event = Event::error(message, false);
    tokio::select! {
        biased;
        sent = output.send_async(event) => {
            let _ = sent;
        }
        _ = token.cancelled() => {}
    }
}

/// Drains one node's output and copies each event to every destination whose
/// filter accepts its tag.
///
/// The drain runs until the output closes; the supervisor closes it in
/// every exit path, including cancellation, so this loop always terminates.
/// Deliveries block on full buffers (bounded backpressure, never a silent
/// drop) and abandon the remainder only if cancellation fires while blocked.
async fn route_events(
    output: EventReceiver,
    destinations: Vec<Destination>,
    token: CancellationToken,
) {
    while let Ok(event) = output.recv_async().await {
        for (filter, tx) in &destinations {
            let forward = match filter {
                None => true,
                Some(types) => types.contains(&event.event_type()),
            };
            if !forward {
                continue;
            }
            tokio::select! {
                biased;
                // A send error means the destination's worker already
                // exited; the execution is unwinding.
                sent = tx.send_async(event.clone()) => {
                    let _ = sent;
                }
                _ = token.cancelled() => return,
            }
        }
    }
}

/// Copies the external input into the entry node's buffer; dropping the
/// sender on exit closes the entry input. Cancellation wins every race here:
/// ingestion stops at the source so in-flight events can drain and the
/// execution unwinds bounded by buffer capacity.
async fn feed_input(input: EventReceiver, entry: EventSender, token: CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = input.recv_async() => match received {
                Ok(event) => event,
                Err(_) => break,
            },
        };
        let delivered = tokio::select! {
            biased;
            _ = token.cancelled() => false,
            sent = entry.send_async(event) => sent.is_ok(),
        };
        if !delivered {
            break;
        }
    }
}
