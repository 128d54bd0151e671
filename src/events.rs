//! The closed event taxonomy that flows through a pipeline.
//!
//! Every value moving along an edge is an [`Event`]; routers and validators
//! never look past its [`EventType`] tag. The set is closed by design: the
//! runtime introduces no variants of its own, and downstream code can match
//! exhaustively.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cheap discriminant tag exposed by every [`Event`] variant.
///
/// [`EventType::Wildcard`] (`*`) is reserved: it never tags a concrete event
/// and is only legal inside a stage's declared *input* set, where it means
/// "accept every type".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Status,
    #[serde(rename = "stt")]
    STT,
    #[serde(rename = "llm")]
    LLM,
    Audio,
    Action,
    Error,
    Done,
    ServiceMessage,
    #[serde(rename = "*")]
    Wildcard,
}

impl EventType {
    /// Every concrete tag, in declaration order. Excludes [`Wildcard`](Self::Wildcard).
    pub const ALL: [EventType; 8] = [
        EventType::Status,
        EventType::STT,
        EventType::LLM,
        EventType::Audio,
        EventType::Action,
        EventType::Error,
        EventType::Done,
        EventType::ServiceMessage,
    ];

    /// The stable wire tag for this type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Status => "status",
            EventType::STT => "stt",
            EventType::LLM => "llm",
            EventType::Audio => "audio",
            EventType::Action => "action",
            EventType::Error => "error",
            EventType::Done => "done",
            EventType::ServiceMessage => "service_message",
            EventType::Wildcard => "*",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse processing state reported by [`StatusEvent`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Listening,
    Transcribing,
    Searching,
    Thinking,
    Speaking,
    Executing,
    #[default]
    Idle,
}

/// Where a status update should surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusTarget {
    User,
    #[default]
    Bot,
}

/// Client-side command categories carried by [`ActionEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    FillForm,
    Click,
    Scroll,
    ShowModal,
    HideModal,
    Notify,
    Download,
    Copy,
    Custom,
}

/// User-visible notice categories carried by [`ServiceMessageEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMessageKind {
    RetryRequest,
    Info,
    Warning,
}

/// Lifecycle hint for consumers (e.g. "the bot is thinking").
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: Status,
    pub target: StatusTarget,
    pub message: String,
    #[serde(default)]
    pub details: FxHashMap<String, Value>,
}

/// One transcription chunk.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct STTEvent {
    pub text: String,
    pub is_final: bool,
    pub confidence: f64,
}

/// One incremental model-output chunk, optionally with the cumulative text.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LLMEvent {
    pub delta: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// One synthesized audio chunk.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioEvent {
    pub data: Vec<u8>,
    pub format: String,
}

/// A command for the client to execute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    pub id: String,
    pub kind: ActionKind,
    pub target: String,
    #[serde(default)]
    pub data: FxHashMap<String, Value>,
    pub required: bool,
}

/// An in-band operational failure report.
///
/// Emitting one of these on a stage's output is the *non-fatal* signal;
/// returning `Err` from `process` is the fatal one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
    pub retryable: bool,
}

/// The terminal marker emitted by a producer once its stream is complete.
///
/// Linear stages forward it; barriers consume one per upstream branch and
/// emit a single consolidated replacement.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DoneEvent {
    pub full_text: String,
    pub tokens_used: u64,
    pub audio_duration: f64,
    pub actions_count: u32,
}

/// A user-visible notice, optionally localized (language code → message).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceMessageEvent {
    pub kind: ServiceMessageKind,
    pub content: String,
    #[serde(default)]
    pub localized: FxHashMap<String, String>,
}

/// Any value that can traverse a pipeline edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Status(StatusEvent),
    STT(STTEvent),
    LLM(LLMEvent),
    Audio(AudioEvent),
    Action(ActionEvent),
    Error(ErrorEvent),
    Done(DoneEvent),
    ServiceMessage(ServiceMessageEvent),
}

impl Event {
    /// The discriminant tag; the only thing routers and validators inspect.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Status(_) => EventType::Status,
            Event::STT(_) => EventType::STT,
            Event::LLM(_) => EventType::LLM,
            Event::Audio(_) => EventType::Audio,
            Event::Action(_) => EventType::Action,
            Event::Error(_) => EventType::Error,
            Event::Done(_) => EventType::Done,
            Event::ServiceMessage(_) => EventType::ServiceMessage,
        }
    }

    /// True for the end-of-stream marker ([`Event::Done`]).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Done(_))
    }

    pub fn status(status: Status, target: StatusTarget, message: impl Into<String>) -> Self {
        Event::Status(StatusEvent {
            status,
            target,
            message: message.into(),
            details: FxHashMap::default(),
        })
    }

    /// A non-final transcription chunk.
    pub fn stt(text: impl Into<String>, confidence: f64) -> Self {
        Event::STT(STTEvent {
            text: text.into(),
            is_final: false,
            confidence,
        })
    }

    /// A final transcription chunk.
    pub fn stt_final(text: impl Into<String>, confidence: f64) -> Self {
        Event::STT(STTEvent {
            text: text.into(),
            is_final: true,
            confidence,
        })
    }

    pub fn llm_delta(delta: impl Into<String>) -> Self {
        Event::LLM(LLMEvent {
            delta: delta.into(),
            content: None,
        })
    }

    pub fn audio(data: Vec<u8>, format: impl Into<String>) -> Self {
        Event::Audio(AudioEvent {
            data,
            format: format.into(),
        })
    }

    pub fn error(message: impl Into<String>, retryable: bool) -> Self {
        Event::Error(ErrorEvent {
            message: message.into(),
            retryable,
        })
    }

    /// A zeroed completion marker, as emitted by barrier consolidation.
    #[must_use]
    pub fn done() -> Self {
        Event::Done(DoneEvent::default())
    }

    pub fn service_message(kind: ServiceMessageKind, content: impl Into<String>) -> Self {
        Event::ServiceMessage(ServiceMessageEvent {
            kind,
            content: content.into(),
            localized: FxHashMap::default(),
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Status(e) => write!(f, "[status] {:?} → {:?}: {}", e.status, e.target, e.message),
            Event::STT(e) => {
                if e.is_final {
                    write!(f, "[stt final] {}", e.text)
                } else {
                    write!(f, "[stt] {}", e.text)
                }
            }
            Event::LLM(e) => write!(f, "[llm] {}", e.delta),
            Event::Audio(e) => write!(f, "[audio] {} bytes ({})", e.data.len(), e.format),
            Event::Action(e) => write!(f, "[action] {:?} {} ({})", e.kind, e.target, e.id),
            Event::Error(e) => write!(f, "[error] {} (retryable: {})", e.message, e.retryable),
            Event::Done(e) => write!(f, "[done] tokens={} actions={}", e.tokens_used, e.actions_count),
            Event::ServiceMessage(e) => write!(f, "[service] {:?}: {}", e.kind, e.content),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_reports_its_own_tag() {
        let cases: Vec<(Event, EventType)> = vec![
            (
                Event::status(Status::Listening, StatusTarget::User, "listening"),
                EventType::Status,
            ),
            (Event::stt("hello", 0.92), EventType::STT),
            (Event::llm_delta("hi"), EventType::LLM),
            (Event::audio(vec![0, 1, 2], "pcm16"), EventType::Audio),
            (
                Event::Action(ActionEvent {
                    id: "a1".into(),
                    kind: ActionKind::Navigate,
                    target: "/home".into(),
                    data: FxHashMap::default(),
                    required: true,
                }),
                EventType::Action,
            ),
            (Event::error("boom", false), EventType::Error),
            (Event::done(), EventType::Done),
            (
                Event::service_message(ServiceMessageKind::Info, "notice"),
                EventType::ServiceMessage,
            ),
        ];
        for (event, expected) in cases {
            assert_eq!(event.event_type(), expected, "mismatched tag for {event}");
        }
    }

    #[test]
    fn wildcard_is_not_a_concrete_tag() {
        for ty in EventType::ALL {
            assert_ne!(ty, EventType::Wildcard);
        }
        assert_eq!(EventType::Wildcard.as_str(), "*");
    }

    #[test]
    fn only_done_is_terminal() {
        assert!(Event::done().is_terminal());
        assert!(!Event::llm_delta("x").is_terminal());
        assert!(!Event::error("x", true).is_terminal());
    }

    #[test]
    fn wire_tags_are_stable() {
        let tags: Vec<&str> = EventType::ALL.iter().map(|t| t.as_str()).collect();
        assert_eq!(
            tags,
            vec![
                "status",
                "stt",
                "llm",
                "audio",
                "action",
                "error",
                "done",
                "service_message"
            ]
        );
    }

    #[test]
    fn event_type_serde_uses_wire_tags() {
        let json = serde_json::to_string(&EventType::ServiceMessage).unwrap();
        assert_eq!(json, "\"service_message\"");
        let back: EventType = serde_json::from_str("\"*\"").unwrap();
        assert_eq!(back, EventType::Wildcard);
    }
}
