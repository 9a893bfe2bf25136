//! Reranker service client
//!
//! Submits merged retrieval candidates to the cross-encoder sidecar and maps
//! the returned order back onto full passages. Truncation to the final top-k
//! happens in the pipeline, not here.

use crate::clients::search::ScoredPassage;
use crate::clients::SourcePassage;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A passage with its rerank score, in reranker order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedPassage {
    pub passage: SourcePassage,
    pub score: f64,
}

/// Trait for reranking merged candidates
#[async_trait]
pub trait RerankClient: Send + Sync {
    /// Order candidates by cross-encoder relevance, best first
    async fn rerank(&self, query: &str, candidates: &[ScoredPassage]) -> Result<Vec<RankedPassage>>;
}

/// HTTP client for the reranker sidecar
pub struct HttpRerankClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct RerankApiRequest<'a> {
    query: &'a str,
    documents: Vec<RerankApiDocument<'a>>,
    top_k: usize,
}

#[derive(Serialize)]
struct RerankApiDocument<'a> {
    id: i64,
    content: &'a str,
}

#[derive(Deserialize)]
struct RerankApiResponse {
    documents: Vec<RerankApiResult>,
}

#[derive(Deserialize)]
struct RerankApiResult {
    id: i64,
    score: f64,
}

impl HttpRerankClient {
    /// Create a new reranker client
    pub fn new(base_url: String, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, base_url }
    }
}

#[async_trait]
impl RerankClient for HttpRerankClient {
    async fn rerank(&self, query: &str, candidates: &[ScoredPassage]) -> Result<Vec<RankedPassage>> {
        let url = format!("{}/rerank", self.base_url);

        let request = RerankApiRequest {
            query,
            documents: candidates
                .iter()
                .map(|c| RerankApiDocument {
                    id: c.passage.chunk_id,
                    content: &c.passage.content,
                })
                .collect(),
            // The pipeline truncates after the call; ask for everything back
            top_k: candidates.len(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::RerankError {
                message: format!("Request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::RerankError {
                message: format!("API error {}: {}", status, body),
            });
        }

        let result: RerankApiResponse =
            response.json().await.map_err(|e| AppError::RerankError {
                message: format!("Failed to parse response: {}", e),
            })?;

        // Map ids back onto the full passages we submitted
        let by_id: HashMap<i64, &SourcePassage> = candidates
            .iter()
            .map(|c| (c.passage.chunk_id, &c.passage))
            .collect();

        let mut ranked = Vec::with_capacity(result.documents.len());
        for doc in result.documents {
            match by_id.get(&doc.id) {
                Some(passage) => ranked.push(RankedPassage {
                    passage: (*passage).clone(),
                    score: doc.score,
                }),
                None => {
                    tracing::warn!(chunk_id = doc.id, "Reranker returned unknown chunk id");
                }
            }
        }

        Ok(ranked)
    }
}

/// Scripted reranker for tests: returns candidates in a fixed id order
pub struct MockRerankClient {
    order: Vec<i64>,
    calls: AtomicUsize,
}

impl MockRerankClient {
    /// Create a mock that orders results by the given chunk ids
    pub fn with_order(order: Vec<i64>) -> Self {
        Self {
            order,
            calls: AtomicUsize::new(0),
        }
    }

    /// Create a mock that keeps the submitted order
    pub fn identity() -> Self {
        Self::with_order(Vec::new())
    }

    /// Number of rerank calls made against this mock
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RerankClient for MockRerankClient {
    async fn rerank(&self, _query: &str, candidates: &[ScoredPassage]) -> Result<Vec<RankedPassage>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let by_id: HashMap<i64, &ScoredPassage> = candidates
            .iter()
            .map(|c| (c.passage.chunk_id, c))
            .collect();

        let ordered: Vec<&ScoredPassage> = if self.order.is_empty() {
            candidates.iter().collect()
        } else {
            self.order
                .iter()
                .filter_map(|id| by_id.get(id).copied())
                .collect()
        };

        Ok(ordered
            .into_iter()
            .enumerate()
            .map(|(rank, c)| RankedPassage {
                passage: c.passage.clone(),
                score: 1.0 - rank as f64 * 0.05,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::search::passage_fixture;

    fn candidates(ids: &[i64]) -> Vec<ScoredPassage> {
        ids.iter()
            .map(|&id| ScoredPassage {
                passage: passage_fixture(id, &format!("doc-{}", id)),
                score: 0.5,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_mock_applies_scripted_order() {
        let client = MockRerankClient::with_order(vec![3, 1, 2]);
        let ranked = client.rerank("q", &candidates(&[1, 2, 3])).await.unwrap();

        let ids: Vec<i64> = ranked.iter().map(|r| r.passage.chunk_id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_identity_keeps_submitted_order() {
        let client = MockRerankClient::identity();
        let ranked = client.rerank("q", &candidates(&[5, 4])).await.unwrap();

        let ids: Vec<i64> = ranked.iter().map(|r| r.passage.chunk_id).collect();
        assert_eq!(ids, vec![5, 4]);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn test_response_shape_parses() {
        let body = r#"{"documents": [{"id": 2, "score": 0.91}, {"id": 1, "score": 0.40}]}"#;
        let parsed: RerankApiResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.documents.len(), 2);
        assert_eq!(parsed.documents[0].id, 2);
    }
}
