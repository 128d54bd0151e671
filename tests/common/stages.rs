//! Shared stage implementations and channel fixtures for integration tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use eventloom::events::{Event, EventType};
use eventloom::stage::{EventReceiver, EventSender, Stage, StageContext, StageError};

/// Identity stage with configurable declared type sets. Forwards every
/// event unchanged.
pub struct MockStage {
    name: String,
    input_types: Vec<EventType>,
    output_types: Vec<EventType>,
}

impl MockStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_types: Vec::new(),
            output_types: Vec::new(),
        }
    }

    pub fn with_input_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.input_types = types.into_iter().collect();
        self
    }

    pub fn with_output_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.output_types = types.into_iter().collect();
        self
    }
}

#[async_trait]
impl Stage for MockStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        ctx: StageContext,
        input: EventReceiver,
        output: EventSender,
    ) -> Result<(), StageError> {
        while let Some(event) = ctx.recv(&input).await? {
            ctx.send(&output, event).await?;
        }
        Ok(())
    }

    fn input_types(&self) -> Vec<EventType> {
        self.input_types.clone()
    }

    fn output_types(&self) -> Vec<EventType> {
        self.output_types.clone()
    }
}

/// Records every event it receives, then forwards it unchanged.
pub struct CollectingStage {
    name: String,
    events: Arc<Mutex<Vec<Event>>>,
}

impl CollectingStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle to the collected events; grab it before moving the stage into
    /// a builder.
    pub fn events(&self) -> Arc<Mutex<Vec<Event>>> {
        Arc::clone(&self.events)
    }
}

#[async_trait]
impl Stage for CollectingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        ctx: StageContext,
        input: EventReceiver,
        output: EventSender,
    ) -> Result<(), StageError> {
        while let Some(event) = ctx.recv(&input).await? {
            self.events.lock().unwrap().push(event.clone());
            ctx.send(&output, event).await?;
        }
        Ok(())
    }

    fn output_types(&self) -> Vec<EventType> {
        Vec::new()
    }
}

/// Emits a scripted sequence of events, then drains its input.
pub struct EmittingStage {
    name: String,
    script: Vec<Event>,
}

impl EmittingStage {
    pub fn new(name: impl Into<String>, script: Vec<Event>) -> Self {
        Self {
            name: name.into(),
            script,
        }
    }
}

#[async_trait]
impl Stage for EmittingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        ctx: StageContext,
        input: EventReceiver,
        output: EventSender,
    ) -> Result<(), StageError> {
        for event in self.script.clone() {
            ctx.send(&output, event).await?;
        }
        while ctx.recv(&input).await?.is_some() {}
        Ok(())
    }

    fn output_types(&self) -> Vec<EventType> {
        Vec::new()
    }
}

/// Fails with the given message after an optional delay, consuming nothing.
pub struct FailingStage {
    name: String,
    delay: Duration,
    message: String,
}

impl FailingStage {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
            message: message.into(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        _ctx: StageContext,
        _input: EventReceiver,
        _output: EventSender,
    ) -> Result<(), StageError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Err(StageError::failed(self.message.clone()))
    }

    fn output_types(&self) -> Vec<EventType> {
        Vec::new()
    }
}

/// Panics as soon as it runs.
pub struct PanickingStage {
    name: String,
    message: String,
}

impl PanickingStage {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Stage for PanickingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        _ctx: StageContext,
        _input: EventReceiver,
        _output: EventSender,
    ) -> Result<(), StageError> {
        panic!("{}", self.message);
    }

    fn output_types(&self) -> Vec<EventType> {
        Vec::new()
    }
}

/// A pre-filled, already-closed input channel.
pub fn event_channel(events: impl IntoIterator<Item = Event>) -> EventReceiver {
    let events: Vec<Event> = events.into_iter().collect();
    let (tx, rx) = flume::bounded(events.len().max(1));
    for event in events {
        tx.send(event).expect("channel sized to fit the script");
    }
    rx
}

/// Drains a receiver to a vec, returning once the channel closes.
pub async fn drain(receiver: &EventReceiver) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.recv_async().await {
        events.push(event);
    }
    events
}

/// The non-terminal subset of a collected sequence.
pub fn non_terminal(events: &[Event]) -> Vec<Event> {
    events
        .iter()
        .filter(|event| !event.is_terminal())
        .cloned()
        .collect()
}
