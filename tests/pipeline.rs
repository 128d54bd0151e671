//! End-to-end execution: routing, filtering, errors, panics, cancellation.

mod common;

use common::*;

use eventloom::events::{Event, EventType, Status, StatusTarget};
use eventloom::graph::GraphBuilder;
use eventloom::runtime::{Pipeline, PipelineError};
use tokio_util::sync::CancellationToken;

fn linear_identity_pipeline() -> Pipeline {
    GraphBuilder::new()
        .add_stage("a", MockStage::new("a"))
        .add_stage("b", MockStage::new("b"))
        .add_stage("c", MockStage::new("c"))
        .connect("a", "b")
        .connect("b", "c")
        .set_entry("a")
        .add_exit("c")
        .build()
        .expect("linear pipeline builds")
}

#[tokio::test]
async fn linear_pass_through_preserves_the_sequence() {
    let pipeline = linear_identity_pipeline();
    let script = vec![Event::llm_delta("hi"), Event::done()];

    let run = pipeline.execute(CancellationToken::new(), event_channel(script.clone()));
    let output = drain(run.output()).await;
    run.join().await.expect("clean completion");

    assert_eq!(output, script);
}

#[tokio::test]
async fn empty_input_terminates_with_empty_output() {
    let pipeline = GraphBuilder::new()
        .add_stage("solo", MockStage::new("solo"))
        .set_entry("solo")
        .add_exit("solo")
        .build()
        .expect("single stage builds");

    let run = pipeline.execute(CancellationToken::new(), event_channel([]));
    let output = drain(run.output()).await;
    run.join().await.expect("clean completion");

    assert!(output.is_empty());
}

#[tokio::test]
async fn filtered_edge_only_delivers_matching_events() {
    let collector = CollectingStage::new("b");
    let collected = collector.events();

    let pipeline = GraphBuilder::new()
        .add_stage("a", MockStage::new("a"))
        .add_stage("b", collector)
        .connect_filtered("a", "b", [EventType::STT])
        .set_entry("a")
        .add_exit("b")
        .build()
        .expect("filtered pipeline builds");

    let input = event_channel([
        Event::status(Status::Listening, StatusTarget::User, "listening"),
        Event::stt_final("hi", 0.9),
        Event::llm_delta("x"),
        Event::done(),
    ]);
    let run = pipeline.execute(CancellationToken::new(), input);
    let output = drain(run.output()).await;
    run.join().await.expect("clean completion");

    let received = collected.lock().unwrap().clone();
    assert_eq!(received, vec![Event::stt_final("hi", 0.9)]);
    assert_eq!(output, received);
}

#[tokio::test]
async fn identity_chain_round_trips_a_long_sequence() {
    let pipeline = linear_identity_pipeline();
    let script: Vec<Event> = (0..50)
        .map(|i| Event::llm_delta(format!("chunk-{i}")))
        .chain([Event::done()])
        .collect();

    let run = pipeline.execute(CancellationToken::new(), event_channel(script.clone()));
    let output = drain(run.output()).await;
    run.join().await.expect("clean completion");

    assert_eq!(output, script);
}

#[tokio::test]
async fn stage_error_is_returned_and_reported_in_band() {
    let pipeline = GraphBuilder::new()
        .add_stage("broken", FailingStage::new("broken", "boom"))
        .set_entry("broken")
        .add_exit("broken")
        .build()
        .expect("single failing stage builds");

    let run = pipeline.execute(CancellationToken::new(), event_channel([]));
    let output = drain(run.output()).await;

    let error = run.join().await.expect_err("stage failure surfaces");
    match &error {
        PipelineError::StageFailed { stage, .. } => assert_eq!(stage, "broken"),
        other => panic!("expected StageFailed, got {other:?}"),
    }
    assert!(error.to_string().contains("boom"));

    // The failure is also observable in-band by downstream consumers.
    assert!(output
        .iter()
        .any(|event| matches!(event, Event::Error(e) if e.message.contains("boom"))));
}

#[tokio::test]
async fn stage_panic_is_captured_with_its_payload() {
    let pipeline = GraphBuilder::new()
        .add_stage("volatile", PanickingStage::new("volatile", "kaboom"))
        .set_entry("volatile")
        .add_exit("volatile")
        .build()
        .expect("single panicking stage builds");

    let run = pipeline.execute(CancellationToken::new(), event_channel([]));
    let _ = drain(run.output()).await;

    let error = run.join().await.expect_err("panic surfaces");
    match &error {
        PipelineError::StagePanicked { stage, message } => {
            assert_eq!(stage, "volatile");
            assert!(message.contains("kaboom"));
        }
        other => panic!("expected StagePanicked, got {other:?}"),
    }
}

#[tokio::test]
async fn downstream_of_a_failed_stage_sees_the_error_event() {
    let collector = CollectingStage::new("sink");
    let collected = collector.events();

    let pipeline = GraphBuilder::new()
        .add_stage("broken", FailingStage::new("broken", "wires crossed"))
        .add_stage("sink", collector)
        .connect("broken", "sink")
        .set_entry("broken")
        .add_exit("sink")
        .build()
        .expect("two stage pipeline builds");

    let run = pipeline.execute(CancellationToken::new(), event_channel([]));
    let _ = drain(run.output()).await;
    let _ = run.join().await;

    let received = collected.lock().unwrap().clone();
    assert!(received
        .iter()
        .any(|event| matches!(event, Event::Error(e) if e.message.contains("wires crossed"))));
}

#[tokio::test]
async fn cancellation_mid_stream_unwinds_promptly() {
    let pipeline = linear_identity_pipeline();

    // Keep the input open so the pipeline would otherwise run forever.
    let (input_tx, input_rx) = flume::bounded(8);
    let token = CancellationToken::new();
    let run = pipeline.execute(token.clone(), input_rx);

    input_tx
        .send_async(Event::llm_delta("first"))
        .await
        .expect("pipeline accepts input");
    let first = run
        .output()
        .recv_async()
        .await
        .expect("first event flows through");
    assert_eq!(first, Event::llm_delta("first"));

    token.cancel();

    let output = run.output().clone();
    let error = run.join().await.expect_err("cancellation surfaces");
    assert!(matches!(error, PipelineError::Cancelled));

    // The input is still open, so only cancellation can have closed the
    // output; drain returns because every worker has exited.
    drain(&output).await;
    assert!(output.is_disconnected());
    drop(input_tx);
}

#[tokio::test]
async fn a_pipeline_can_be_executed_repeatedly() {
    let pipeline = linear_identity_pipeline();
    for round in 0..3 {
        let script = vec![Event::llm_delta(format!("round-{round}")), Event::done()];
        let run = pipeline.execute(CancellationToken::new(), event_channel(script.clone()));
        let output = drain(run.output()).await;
        run.join().await.expect("clean completion");
        assert_eq!(output, script);
    }
}
