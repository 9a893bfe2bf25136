//! Session-scoped push streaming
//!
//! `StreamRegistry` owns the per-session queues, `EventChannel` keeps
//! frame ordering legal on the producer side, and `event` defines the
//! wire vocabulary shared by both.

pub mod channel;
pub mod event;
pub mod registry;

pub use channel::EventChannel;
pub use event::{
    escape_payload, EventKind, StreamFrame, CONNECT_EVENT, DISCONNECT_EVENT, EXCEPTION_EVENT,
};
pub use registry::{EventStream, StreamHandle, StreamRegistry};
