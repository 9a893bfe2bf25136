//! HTTP collaborator clients
//!
//! Trait-fronted clients for the three sidecars the answer pipeline talks to:
//! - Search (keyword + vector retrieval legs)
//! - Reranker (cross-encoder ordering)
//! - Generation (streaming and one-shot LLM completions)
//!
//! The engine depends only on the traits; mock implementations live next to
//! the HTTP ones for tests and local development.

pub mod generation;
pub mod rerank;
pub mod search;

pub use generation::{
    GenerationClient, GenerationRequest, GenerationToken, HttpGenerationClient,
    MockGenerationClient, TokenStream,
};
pub use rerank::{HttpRerankClient, MockRerankClient, RankedPassage, RerankClient};
pub use search::{HttpSearchClient, MockSearchClient, ScoredPassage, SearchClient, SearchFilters};

use serde::{Deserialize, Serialize};

/// One retrievable unit of source material
///
/// Identity for dedup across retrieval legs is `chunk_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePassage {
    /// Chunk identity across both retrieval legs
    pub chunk_id: i64,

    /// Source file the chunk was cut from
    pub file_id: i64,

    /// Document title
    pub title: String,

    /// Section heading within the document
    pub section: String,

    /// Full chunk text
    pub content: String,

    /// Compact display form of the chunk
    pub snippet: String,

    /// Origin file name
    pub source: String,

    /// Category code used for retrieval filtering
    pub category: String,

    /// Optional link back to the source
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}
