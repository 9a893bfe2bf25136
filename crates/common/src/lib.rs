//! Ragline Common Library
//!
//! Shared code for the Ragline services including:
//! - Database models and repository patterns
//! - Conversation history port
//! - Collaborator clients (search, rerank, generation)
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod clients;
pub mod config;
pub mod db;
pub mod errors;
pub mod history;
pub mod metrics;

// Re-export commonly used types
pub use clients::{GenerationClient, RerankClient, SearchClient, SourcePassage};
pub use config::AppConfig;
pub use db::Repository;
pub use errors::{AppError, Result};
pub use history::{HistoryStore, MemoryHistory};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bound on persisted passage snapshots per turn
pub const MAX_STORED_PASSAGES: usize = 16;
