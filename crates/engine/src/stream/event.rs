//! Stream event vocabulary
//!
//! Every frame pushed to a session carries an event name and a payload
//! string. Token-bearing kinds (`reasoning`, `answer`, `reference`) are
//! bracketed by `<kind>-start` / `<kind>-done` markers; `connect`,
//! `disconnect` and `exception` are bare lifecycle sentinels.
//!
//! Payloads of token frames are escaped for the push transport: spaces
//! become `&nbsp;` and newlines become the two characters `\n`. Consumers
//! reverse the mapping; marker and sentinel frames are never escaped.

use serde::Serialize;

/// First frame on every stream, before any tokens
pub const CONNECT_EVENT: &str = "connect";

/// Final frame on every stream, all outcomes
pub const DISCONNECT_EVENT: &str = "disconnect";

/// Emitted before `disconnect` when the pipeline failed mid-stream
pub const EXCEPTION_EVENT: &str = "exception";

/// Token-bearing frame kinds, in legal emission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Reasoning,
    Answer,
    Reference,
}

impl EventKind {
    /// Wire name, also the process-frame event name
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Reasoning => "reasoning",
            EventKind::Answer => "answer",
            EventKind::Reference => "reference",
        }
    }

    /// Position in the legal emission order
    pub fn ordinal(&self) -> u8 {
        match self {
            EventKind::Reasoning => 0,
            EventKind::Answer => 1,
            EventKind::Reference => 2,
        }
    }

    fn start_event(&self) -> String {
        format!("{}-start", self.name())
    }

    fn done_event(&self) -> String {
        format!("{}-done", self.name())
    }
}

/// One pushed frame: event name plus payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamFrame {
    pub event: String,
    pub data: String,
}

impl StreamFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    pub fn connect() -> Self {
        Self::new(CONNECT_EVENT, "")
    }

    pub fn disconnect() -> Self {
        Self::new(DISCONNECT_EVENT, "")
    }

    pub fn exception(message: &str) -> Self {
        Self::new(EXCEPTION_EVENT, message)
    }

    /// Opening marker for a kind
    pub fn start(kind: EventKind) -> Self {
        Self::new(kind.start_event(), "")
    }

    /// Token frame; the payload is escaped here, in one place
    pub fn process(kind: EventKind, payload: &str) -> Self {
        Self::new(kind.name(), escape_payload(payload))
    }

    /// Closing marker for a kind
    pub fn done(kind: EventKind) -> Self {
        Self::new(kind.done_event(), "")
    }
}

/// Escape a token payload for the push transport.
///
/// Spaces map to `&nbsp;` and newlines to a literal backslash-n, so the
/// payload survives transports that trim or fold whitespace.
pub fn escape_payload(text: &str) -> String {
    text.replace(' ', "&nbsp;").replace('\n', "\\n")
}
