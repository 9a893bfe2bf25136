//! Ragline Answer Engine
//!
//! The streaming answer pipeline, independent of any HTTP surface:
//! - Per-session push streams with ordered lifecycle framing
//! - Conversational grounding (history window, query rewrite)
//! - Parallel keyword + vector retrieval with rerank gating
//! - Token streaming on reasoning / answer lanes, plus citations
//! - Post-stream persistence with decision-gated summarization
//!
//! The gateway wires these against the repository and HTTP clients in
//! `ragline-common`; tests here run the full pipeline against the
//! in-memory implementations.

pub mod context;
pub mod decision;
pub mod orchestrator;
pub mod retrieval;
pub mod stream;

pub use context::{ConversationContextResolver, QuestionContext};
pub use decision::DecisionDetector;
pub use orchestrator::{
    AnswerOrchestrator, AskMode, AskReceipt, AskRequest, OrchestratorSettings,
};
pub use retrieval::{RerankGate, RetrievalCoordinator, RetrievalSettings};
pub use stream::{EventChannel, EventKind, EventStream, StreamFrame, StreamHandle, StreamRegistry};
