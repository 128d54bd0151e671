//! The polymorphic worker contract every pipeline node fulfils.
//!
//! A [`Stage`] consumes a lazy sequence of [`Event`]s from its input channel
//! and produces a lazy sequence on its output channel. The runtime owns the
//! channels; a stage never closes its output (closure is ownership-based:
//! the runtime drops the senders once the stage and its supervisor are done).

use std::any::Any;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventType};

/// Sending half of an event edge.
pub type EventSender = flume::Sender<Event>;
/// Receiving half of an event edge.
pub type EventReceiver = flume::Receiver<Event>;

/// Execution context handed to a stage for one pipeline run.
///
/// Carries the stage's node name and the execution's cancellation token, and
/// provides cancellation-aware channel helpers so stage authors get the
/// select-race pattern for free:
///
/// ```rust,no_run
/// # use eventloom::stage::{Stage, StageContext, StageError, EventReceiver, EventSender};
/// # use async_trait::async_trait;
/// struct Passthrough;
///
/// #[async_trait]
/// impl Stage for Passthrough {
///     fn name(&self) -> &str {
///         "passthrough"
///     }
///
///     async fn process(
///         &self,
///         ctx: StageContext,
///         input: EventReceiver,
///         output: EventSender,
///     ) -> Result<(), StageError> {
///         while let Some(event) = ctx.recv(&input).await? {
///             ctx.send(&output, event).await?;
///         }
///         Ok(())
///     }
///
///     fn output_types(&self) -> Vec<eventloom::events::EventType> {
///         Vec::new()
///     }
/// }
/// ```
#[derive(Clone, Debug)]
pub struct StageContext {
    name: String,
    token: CancellationToken,
}

impl StageContext {
    pub fn new(name: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            name: name.into(),
            token,
        }
    }

    /// The node name this context was created for.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the execution has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the execution is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// A token scoped under this execution; cancelling it does not cancel
    /// the parent, but parent cancellation propagates down.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Receive the next event, racing cancellation.
    ///
    /// Returns `Ok(None)` once the channel is drained and closed, and
    /// `Err(StageError::Cancelled)` if cancellation fires while the channel
    /// is empty. Already-buffered events are drained before cancellation is
    /// honored, so in-band reports are not lost to the race.
    pub async fn recv(&self, input: &EventReceiver) -> Result<Option<Event>, StageError> {
        tokio::select! {
            biased;
            received = input.recv_async() => Ok(received.ok()),
            _ = self.token.cancelled() => Err(StageError::Cancelled),
        }
    }

    /// Send an event downstream, racing cancellation.
    ///
    /// A full buffer blocks (bounded backpressure) until space frees or
    /// cancellation fires. A disconnected receiver only happens once the
    /// execution is unwinding, so both failure outcomes map to
    /// [`StageError::Cancelled`].
    pub async fn send(&self, output: &EventSender, event: Event) -> Result<(), StageError> {
        tokio::select! {
            biased;
            sent = output.send_async(event) => sent.map_err(|_| StageError::Cancelled),
            _ = self.token.cancelled() => Err(StageError::Cancelled),
        }
    }
}

/// A processing stage in a pipeline.
///
/// # Contract
///
/// - Return only when `input` is drained, the context is cancelled, or a
///   fatal error occurs.
/// - Never assume responsibility for closing `output`; the runtime owns edge
///   closure.
/// - Every blocking send/receive must race cancellation (use the
///   [`StageContext`] helpers).
/// - Returning `Err` signals fatal failure and cancels the execution;
///   emitting an [`Event::Error`] on `output` is the non-fatal in-band
///   report.
///
/// Type declarations are advisory: the validator uses them to reject
/// incompatible edges at build time, but nothing is enforced at runtime.
#[async_trait]
pub trait Stage: Send + Sync {
    /// The stage's display name, used in error reports.
    fn name(&self) -> &str;

    /// Consume `input` and produce events on `output` until done.
    async fn process(
        &self,
        ctx: StageContext,
        input: EventReceiver,
        output: EventSender,
    ) -> Result<(), StageError>;

    /// Event types this stage accepts. Empty means accept-all; the reserved
    /// [`EventType::Wildcard`] entry means the same thing explicitly.
    fn input_types(&self) -> Vec<EventType> {
        Vec::new()
    }

    /// Event types this stage produces. Empty means "anything".
    fn output_types(&self) -> Vec<EventType>;
}

/// Fatal failures a stage can report from [`Stage::process`].
#[derive(Debug, Error, Diagnostic)]
pub enum StageError {
    /// General fatal failure with a human-readable cause.
    #[error("{message}")]
    #[diagnostic(code(eventloom::stage::failed))]
    Failed { message: String },

    /// An upstream branch reported a failure in-band (barrier fail-fast).
    #[error("upstream branch failed: {message}")]
    #[diagnostic(code(eventloom::stage::upstream))]
    Upstream { message: String },

    /// A barrier drained its input without seeing one `Done` per branch.
    #[error("barrier expected {expected} DoneEvents, got {got}")]
    #[diagnostic(
        code(eventloom::stage::barrier_count),
        help("Every branch feeding a barrier must emit exactly one Done event.")
    )]
    BarrierCountMismatch { expected: usize, got: usize },

    /// The execution was cancelled while this stage was blocked.
    #[error("stage cancelled")]
    #[diagnostic(code(eventloom::stage::cancelled))]
    Cancelled,

    /// A declared-but-reserved capability was requested.
    #[error("not implemented: {what}")]
    #[diagnostic(code(eventloom::stage::unsupported))]
    Unsupported { what: &'static str },

    /// JSON (de)serialization error, for embedder convenience.
    #[error(transparent)]
    #[diagnostic(code(eventloom::stage::serde_json))]
    Serde(#[from] serde_json::Error),
}

impl StageError {
    pub fn failed(message: impl Into<String>) -> Self {
        StageError::Failed {
            message: message.into(),
        }
    }
}

/// Render a captured panic payload as text.
///
/// `JoinError::into_panic` yields the raw payload; string payloads are the
/// overwhelmingly common case.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_reports_cancellation() {
        let token = CancellationToken::new();
        let ctx = StageContext::new("probe", token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn child_token_does_not_cancel_parent() {
        let token = CancellationToken::new();
        let ctx = StageContext::new("probe", token.clone());
        let child = ctx.child_token();
        child.cancel();
        assert!(!token.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn recv_yields_none_on_closed_channel() {
        let ctx = StageContext::new("probe", CancellationToken::new());
        let (tx, rx) = flume::bounded::<Event>(4);
        drop(tx);
        assert!(ctx.recv(&rx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recv_races_cancellation() {
        let token = CancellationToken::new();
        let ctx = StageContext::new("probe", token.clone());
        let (_tx, rx) = flume::bounded::<Event>(4);
        token.cancel();
        assert!(matches!(ctx.recv(&rx).await, Err(StageError::Cancelled)));
    }

    #[test]
    fn panic_payloads_render_as_text() {
        assert_eq!(panic_message(Box::new("static str")), "static str");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(17_u32)), "non-string panic payload");
    }
}
