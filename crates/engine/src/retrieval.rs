//! Parallel retrieval and rerank gating
//!
//! `RetrievalCoordinator` fans one query out to the keyword and vector
//! legs concurrently, merges by chunk id with the vector hit winning
//! collisions, and drops weak scores before anything reaches the
//! reranker. `RerankGate` wraps the rerank sidecar and never calls it
//! with an empty candidate set.

use ragline_common::clients::rerank::{RankedPassage, RerankClient};
use ragline_common::clients::search::{ScoredPassage, SearchClient, SearchFilters};
use ragline_common::errors::Result;
use ragline_common::metrics;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Retrieval knobs, fixed at construction
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub keyword_top_k: usize,
    pub vector_top_k: usize,
    /// Merged candidates scoring below this never reach the reranker
    pub score_min: f64,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            keyword_top_k: 10,
            vector_top_k: 10,
            score_min: 0.2,
        }
    }
}

pub struct RetrievalCoordinator {
    search: Arc<dyn SearchClient>,
    settings: RetrievalSettings,
}

impl RetrievalCoordinator {
    pub fn new(search: Arc<dyn SearchClient>, settings: RetrievalSettings) -> Self {
        Self { search, settings }
    }

    /// Run both legs concurrently and merge the hits. Either leg failing
    /// fails the whole retrieval.
    pub async fn retrieve(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredPassage>> {
        let started = Instant::now();

        let (keyword, vector) = tokio::try_join!(
            self.search
                .keyword_search(query, self.settings.keyword_top_k, filters),
            self.search
                .vector_search(query, self.settings.vector_top_k, filters),
        )?;

        let keyword_count = keyword.len();
        let vector_count = vector.len();

        // Vector hits land second so they win chunk-id collisions
        let mut merged: HashMap<i64, ScoredPassage> = HashMap::new();
        for hit in keyword.into_iter().chain(vector) {
            merged.insert(hit.passage.chunk_id, hit);
        }

        let mut candidates: Vec<ScoredPassage> = merged
            .into_values()
            .filter(|hit| hit.score >= self.settings.score_min)
            .collect();
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

        metrics::record_retrieval(started.elapsed().as_secs_f64(), candidates.len());
        tracing::debug!(
            keyword = keyword_count,
            vector = vector_count,
            kept = candidates.len(),
            "Retrieval legs merged"
        );

        Ok(candidates)
    }
}

pub struct RerankGate {
    rerank: Arc<dyn RerankClient>,
    top_k: usize,
}

impl RerankGate {
    pub fn new(rerank: Arc<dyn RerankClient>, top_k: usize) -> Self {
        Self { rerank, top_k }
    }

    /// Order candidates by cross-encoder relevance and keep the best
    /// `top_k`. An empty candidate set short-circuits without touching
    /// the rerank sidecar.
    pub async fn rank(
        &self,
        query: &str,
        candidates: Vec<ScoredPassage>,
    ) -> Result<Vec<RankedPassage>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let mut ranked = self.rerank.rerank(query, &candidates).await?;
        ranked.truncate(self.top_k);
        metrics::record_rerank(started.elapsed().as_secs_f64());

        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragline_common::clients::rerank::MockRerankClient;
    use ragline_common::clients::search::{passage_fixture, MockSearchClient};

    fn scored(chunk_id: i64, score: f64) -> ScoredPassage {
        ScoredPassage {
            passage: passage_fixture(chunk_id, &format!("doc-{}", chunk_id)),
            score,
        }
    }

    fn coordinator(search: MockSearchClient) -> RetrievalCoordinator {
        RetrievalCoordinator::new(Arc::new(search), RetrievalSettings::default())
    }

    #[tokio::test]
    async fn test_vector_wins_chunk_collisions() {
        let search = MockSearchClient::new(
            vec![scored(1, 0.4), scored(2, 0.8)],
            vec![scored(1, 0.95)],
        );

        let merged = coordinator(search)
            .retrieve("q", &SearchFilters::default())
            .await
            .unwrap();

        assert_eq!(merged.len(), 2);
        let by_id: HashMap<i64, f64> = merged
            .iter()
            .map(|hit| (hit.passage.chunk_id, hit.score))
            .collect();
        assert_eq!(by_id[&1], 0.95);
        assert_eq!(by_id[&2], 0.8);
    }

    #[tokio::test]
    async fn test_weak_scores_dropped_after_merge() {
        // The vector hit overrides chunk 1 with a weak score, so the
        // strong keyword score for the same chunk no longer counts
        let search = MockSearchClient::new(
            vec![scored(1, 0.5), scored(2, 0.1)],
            vec![scored(1, 0.15)],
        );

        let merged = coordinator(search)
            .retrieve("q", &SearchFilters::default())
            .await
            .unwrap();
        assert!(merged.is_empty());
    }

    #[tokio::test]
    async fn test_candidates_sorted_by_score() {
        let search = MockSearchClient::new(
            vec![scored(1, 0.3), scored(2, 0.9)],
            vec![scored(3, 0.6)],
        );

        let merged = coordinator(search)
            .retrieve("q", &SearchFilters::default())
            .await
            .unwrap();
        let ids: Vec<i64> = merged.iter().map(|hit| hit.passage.chunk_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn test_leg_failure_fails_retrieval() {
        let result = coordinator(MockSearchClient::failing())
            .retrieve("q", &SearchFilters::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_gate_skips_rerank_on_empty_candidates() {
        let rerank = Arc::new(MockRerankClient::identity());
        let gate = RerankGate::new(rerank.clone(), 3);

        let ranked = gate.rank("q", Vec::new()).await.unwrap();
        assert!(ranked.is_empty());
        assert_eq!(rerank.call_count(), 0);
    }

    #[tokio::test]
    async fn test_gate_truncates_to_top_k() {
        let rerank = Arc::new(MockRerankClient::identity());
        let gate = RerankGate::new(rerank.clone(), 3);

        let candidates: Vec<ScoredPassage> =
            (1..=10).map(|id| scored(id, 0.5)).collect();
        let ranked = gate.rank("q", candidates).await.unwrap();

        assert_eq!(ranked.len(), 3);
        assert_eq!(rerank.call_count(), 1);
    }

    #[tokio::test]
    async fn test_gate_keeps_reranker_order() {
        let rerank = Arc::new(MockRerankClient::with_order(vec![3, 1, 2]));
        let gate = RerankGate::new(rerank, 2);

        let candidates = vec![scored(1, 0.9), scored(2, 0.8), scored(3, 0.7)];
        let ranked = gate.rank("q", candidates).await.unwrap();

        let ids: Vec<i64> = ranked.iter().map(|r| r.passage.chunk_id).collect();
        assert_eq!(ids, vec![3, 1]);
    }
}
