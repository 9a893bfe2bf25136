//! Search service client
//!
//! Fronts the retrieval sidecar's keyword and vector legs. Both legs share
//! one request/response shape; the pipeline runs them concurrently and
//! merges the results.

use crate::clients::SourcePassage;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A passage with its retrieval score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPassage {
    pub passage: SourcePassage,
    pub score: f64,
}

/// Filters applied inside the search sidecar
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Category codes to restrict retrieval to (empty = all)
    pub categories: Vec<String>,
}

/// Trait for the two retrieval legs
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Lexical (BM25-style) retrieval
    async fn keyword_search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredPassage>>;

    /// Embedding-similarity retrieval
    async fn vector_search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredPassage>>;
}

/// HTTP client for the search sidecar
pub struct HttpSearchClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct SearchApiRequest<'a> {
    query: &'a str,
    top_k: usize,
    categories: &'a [String],
}

#[derive(Deserialize)]
struct SearchApiResponse {
    results: Vec<ScoredPassage>,
}

impl HttpSearchClient {
    /// Create a new search client
    pub fn new(base_url: String, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, base_url }
    }

    async fn search(
        &self,
        leg: &str,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredPassage>> {
        let url = format!("{}/search/{}", self.base_url, leg);

        let request = SearchApiRequest {
            query,
            top_k,
            categories: &filters.categories,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::SearchError {
                message: format!("{} request failed: {}", leg, e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::SearchError {
                message: format!("{} leg returned {}: {}", leg, status, body),
            });
        }

        let result: SearchApiResponse =
            response.json().await.map_err(|e| AppError::SearchError {
                message: format!("Failed to parse {} response: {}", leg, e),
            })?;

        Ok(result.results)
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn keyword_search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredPassage>> {
        self.search("keyword", query, top_k, filters).await
    }

    async fn vector_search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredPassage>> {
        self.search("vector", query, top_k, filters).await
    }
}

/// Scripted search client for tests and local development
pub struct MockSearchClient {
    keyword: Vec<ScoredPassage>,
    vector: Vec<ScoredPassage>,
    fail: bool,
}

impl MockSearchClient {
    /// Create a mock returning the given hits per leg
    pub fn new(keyword: Vec<ScoredPassage>, vector: Vec<ScoredPassage>) -> Self {
        Self {
            keyword,
            vector,
            fail: false,
        }
    }

    /// Create a mock with no hits on either leg
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Create a mock whose legs both fail
    pub fn failing() -> Self {
        Self {
            keyword: Vec::new(),
            vector: Vec::new(),
            fail: true,
        }
    }

    fn check(&self, leg: &str) -> Result<()> {
        if self.fail {
            return Err(AppError::SearchError {
                message: format!("mock {} failure", leg),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SearchClient for MockSearchClient {
    async fn keyword_search(
        &self,
        _query: &str,
        top_k: usize,
        _filters: &SearchFilters,
    ) -> Result<Vec<ScoredPassage>> {
        self.check("keyword")?;
        Ok(self.keyword.iter().take(top_k).cloned().collect())
    }

    async fn vector_search(
        &self,
        _query: &str,
        top_k: usize,
        _filters: &SearchFilters,
    ) -> Result<Vec<ScoredPassage>> {
        self.check("vector")?;
        Ok(self.vector.iter().take(top_k).cloned().collect())
    }
}

/// Build a passage fixture, used across client and pipeline tests
pub fn passage_fixture(chunk_id: i64, title: &str) -> SourcePassage {
    SourcePassage {
        chunk_id,
        file_id: chunk_id * 10,
        title: title.to_string(),
        section: "Overview".to_string(),
        content: format!("Content of {}", title),
        snippet: format!("Snippet of {}", title),
        source: format!("{}.pdf", title),
        category: "general".to_string(),
        url: None,
    }
}
