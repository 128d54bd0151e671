//! N→1 join that consolidates completion across parallel branches.

use async_trait::async_trait;

use crate::events::{Event, EventType};
use crate::stage::{EventReceiver, EventSender, Stage, StageContext, StageError};

/// How a barrier combines events from its upstream branches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Forward every non-terminal event in arrival order.
    #[default]
    Collect,
    /// Reserved: emit only the final event from each branch.
    LastOnly,
}

/// Configuration for a barrier node.
#[derive(Clone, Copy, Debug)]
pub struct BarrierConfig {
    /// Number of upstream branches whose `Done` events must arrive before
    /// the barrier emits its consolidated one.
    pub upstream_count: usize,
    pub merge_strategy: MergeStrategy,
}

impl BarrierConfig {
    #[must_use]
    pub fn new(upstream_count: usize) -> Self {
        Self {
            upstream_count,
            merge_strategy: MergeStrategy::default(),
        }
    }
}

/// Synthetic stage that drains the merged stream of its upstream edges,
/// counts `Done` markers, fails fast on in-band errors, and emits exactly
/// one consolidated `Done` once every branch has finished.
pub struct BarrierStage {
    name: String,
    config: BarrierConfig,
}

impl BarrierStage {
    #[must_use]
    pub fn new(name: impl Into<String>, config: BarrierConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BarrierConfig {
        &self.config
    }
}

#[async_trait]
impl Stage for BarrierStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        ctx: StageContext,
        input: EventReceiver,
        output: EventSender,
    ) -> Result<(), StageError> {
        if self.config.merge_strategy == MergeStrategy::LastOnly {
            return Err(StageError::Unsupported {
                what: "MergeStrategy::LastOnly",
            });
        }

        let mut done_count = 0usize;
        let mut first_error: Option<String> = None;

        while let Some(event) = ctx.recv(&input).await? {
            match event {
                // Fail fast: remember the first failure, keep draining so
                // sibling branches are not left blocked, and still forward
                // the report downstream.
                Event::Error(error) => {
                    if first_error.is_none() {
                        first_error = Some(error.message.clone());
                    }
                    ctx.send(&output, Event::Error(error)).await?;
                }
                // Consumed, never forwarded; one consolidated marker goes
                // out at the end instead.
                Event::Done(_) => done_count += 1,
                other => ctx.send(&output, other).await?,
            }
        }

        if let Some(message) = first_error {
            return Err(StageError::Upstream { message });
        }
        if ctx.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        if done_count != self.config.upstream_count {
            return Err(StageError::BarrierCountMismatch {
                expected: self.config.upstream_count,
                got: done_count,
            });
        }

        ctx.send(&output, Event::done()).await?;
        Ok(())
    }

    fn output_types(&self) -> Vec<EventType> {
        EventType::ALL.to_vec()
    }
}
