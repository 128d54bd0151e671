//! 1→N router that feeds parallel branches with per-branch event filters.

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashSet;

use crate::events::EventType;
use crate::stage::{panic_message, EventReceiver, EventSender, Stage, StageContext, StageError};

/// How a fan-out reacts when one of its branches fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Cancel every sibling branch as soon as one fails.
    #[default]
    CancelAll,
    /// Let the surviving branches run to completion; the error is still
    /// surfaced once the fan-out returns.
    Isolated,
}

/// One parallel branch of a fan-out.
#[derive(Clone)]
pub struct BranchConfig {
    pub stage: Arc<dyn Stage>,
    /// Event types forwarded to this branch. Empty means forward all.
    pub event_filter: Vec<EventType>,
}

impl BranchConfig {
    pub fn new(stage: impl Stage + 'static) -> Self {
        Self {
            stage: Arc::new(stage),
            event_filter: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_filter(mut self, event_filter: impl IntoIterator<Item = EventType>) -> Self {
        self.event_filter = event_filter.into_iter().collect();
        self
    }

    fn accepts(&self, event_type: EventType) -> bool {
        self.event_filter.is_empty() || self.event_filter.contains(&event_type)
    }
}

/// Parallel routing behavior for a fan-out node.
#[derive(Clone, Default)]
pub struct FanOutConfig {
    pub error_policy: ErrorPolicy,
    pub branches: Vec<BranchConfig>,
}

impl FanOutConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a branch that receives every event.
    #[must_use]
    pub fn branch(mut self, stage: impl Stage + 'static) -> Self {
        self.branches.push(BranchConfig::new(stage));
        self
    }

    /// Adds a branch that receives only the given event types.
    #[must_use]
    pub fn branch_filtered(
        mut self,
        stage: impl Stage + 'static,
        event_filter: impl IntoIterator<Item = EventType>,
    ) -> Self {
        self.branches
            .push(BranchConfig::new(stage).with_filter(event_filter));
        self
    }

    #[must_use]
    pub fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }
}

/// Synthetic stage that copies each input event to every branch whose filter
/// accepts it, runs the branch stages concurrently, and merges their outputs
/// back into a single stream (per-branch order preserved, inter-branch order
/// arbitrary).
pub struct FanOutStage {
    name: String,
    config: FanOutConfig,
    capacity: usize,
}

impl FanOutStage {
    #[must_use]
    pub fn new(name: impl Into<String>, config: FanOutConfig, capacity: usize) -> Self {
        Self {
            name: name.into(),
            config,
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub fn config(&self) -> &FanOutConfig {
        &self.config
    }
}

#[async_trait]
impl Stage for FanOutStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        ctx: StageContext,
        input: EventReceiver,
        output: EventSender,
    ) -> Result<(), StageError> {
        if self.config.branches.is_empty() {
            // Degenerate fan-out: drain the input so upstream never blocks.
            while ctx.recv(&input).await?.is_some() {}
            return Ok(());
        }

        let branch_token = ctx.child_token();
        let mut branch_inputs: Vec<(BranchConfig, EventSender)> = Vec::new();
        let mut workers = Vec::with_capacity(self.config.branches.len());
        let mut mergers = Vec::with_capacity(self.config.branches.len());

        for branch in &self.config.branches {
            let (in_tx, in_rx) = flume::bounded(self.capacity);
            let (out_tx, out_rx) = flume::bounded(self.capacity);
            branch_inputs.push((branch.clone(), in_tx));

            let stage = Arc::clone(&branch.stage);
            let branch_ctx = StageContext::new(
                format!("{}/{}", self.name, stage.name()),
                branch_token.clone(),
            );
            let policy = self.config.error_policy;
            let cancel = branch_token.clone();
            workers.push(tokio::spawn(async move {
                let inner = tokio::spawn({
                    let stage = Arc::clone(&stage);
                    async move { stage.process(branch_ctx, in_rx, out_tx).await }
                });
                let result = match inner.await {
                    Ok(result) => result,
                    Err(join_error) if join_error.is_panic() => Err(StageError::failed(format!(
                        "branch {} panicked: {}",
                        stage.name(),
                        panic_message(join_error.into_panic())
                    ))),
                    Err(_) => Err(StageError::Cancelled),
                };
                if let Err(error) = &result {
                    if policy == ErrorPolicy::CancelAll && !matches!(error, StageError::Cancelled) {
                        cancel.cancel();
                    }
                }
                result
            }));

            let merged = output.clone();
            let token = branch_token.clone();
            mergers.push(tokio::spawn(async move {
                // Drain until the branch output closes; branches close it in
                // every exit path, so this always terminates.
                while let Ok(event) = out_rx.recv_async().await {
                    let delivered = tokio::select! {
                        biased;
                        sent = merged.send_async(event) => sent.is_ok(),
                        _ = token.cancelled() => false,
                    };
                    if !delivered {
                        break;
                    }
                }
            }));
        }

        // Distribute until the input drains or the fan-out is cancelled;
        // cancellation wins the races so distribution stops at the source.
        'distribute: loop {
            let event = tokio::select! {
                biased;
                _ = branch_token.cancelled() => break 'distribute,
                received = input.recv_async() => match received {
                    Ok(event) => event,
                    Err(_) => break 'distribute,
                },
            };
            for (branch, tx) in &branch_inputs {
                if !branch.accepts(event.event_type()) {
                    continue;
                }
                tokio::select! {
                    biased;
                    _ = branch_token.cancelled() => break 'distribute,
                    // A send error means that branch already exited; skip it.
                    sent = tx.send_async(event.clone()) => { let _ = sent; }
                }
            }
        }
        // Closes every branch input.
        drop(branch_inputs);

        let mut first_error: Option<StageError> = None;
        for worker in workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(StageError::Cancelled)) | Err(_) => {}
                Ok(Err(error)) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        for merger in mergers {
            let _ = merger.await;
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        if ctx.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        Ok(())
    }

    fn output_types(&self) -> Vec<EventType> {
        let mut seen = FxHashSet::default();
        let mut types = Vec::new();
        for branch in &self.config.branches {
            for ty in branch.stage.output_types() {
                if seen.insert(ty) {
                    types.push(ty);
                }
            }
        }
        types
    }
}
