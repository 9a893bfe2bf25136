//! Conversational context resolution
//!
//! Before a question is answered it gets grounded: recent turns are
//! loaded, the question is rewritten into a standalone form against
//! that history, and retrieval plus reranking turn the rewrite into a
//! small set of evidence passages. The result is an immutable
//! `QuestionContext` the rest of the pipeline reads from.
//!
//! The rewrite is best-effort in one specific way: a blank rewrite
//! falls back to the original question verbatim. Everything else
//! (history load, retrieval, rerank) fails the resolution.

use crate::retrieval::{RerankGate, RetrievalCoordinator};
use ragline_common::clients::generation::{GenerationClient, GenerationRequest};
use ragline_common::clients::rerank::RankedPassage;
use ragline_common::clients::search::SearchFilters;
use ragline_common::errors::Result;
use ragline_common::history::{ChatRecord, ConversationTurn, HistoryStore};
use std::sync::Arc;

const REWRITE_PROMPT: &str = "You rewrite follow-up questions into standalone search queries. \
Resolve pronouns and references using the conversation and the chat summary, keep the user's \
language, and return only the rewritten query with no commentary.";
const REWRITE_TEMPERATURE: f64 = 0.1;
const REWRITE_TOP_P: f64 = 0.9;

const SUMMARY_PROMPT: &str = "You maintain a rolling summary of the decisions made in a \
conversation. Merge the latest exchange into the existing summary, keep confirmed decisions, \
drop superseded ones, and return only the updated summary in under 200 words.";
const SUMMARY_TEMPERATURE: f64 = 0.2;
const SUMMARY_TOP_P: f64 = 0.9;

/// Everything the streaming task needs about one question, resolved
/// up front and immutable afterwards
#[derive(Debug, Clone)]
pub struct QuestionContext {
    pub original_query: String,
    pub rewritten_query: String,
    /// Recent answered turns, oldest first
    pub turns: Vec<ConversationTurn>,
    /// Ranked evidence passages; empty in direct mode
    pub passages: Vec<RankedPassage>,
    /// Passages rendered into the prompt context block
    pub rendered: String,
}

pub struct ConversationContextResolver {
    history: Arc<dyn HistoryStore>,
    generation: Arc<dyn GenerationClient>,
    retrieval: RetrievalCoordinator,
    gate: RerankGate,
    multiturn_turns: usize,
}

impl ConversationContextResolver {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        generation: Arc<dyn GenerationClient>,
        retrieval: RetrievalCoordinator,
        gate: RerankGate,
        multiturn_turns: usize,
    ) -> Self {
        Self {
            history,
            generation,
            retrieval,
            gate,
            multiturn_turns,
        }
    }

    /// Ground one question: history window, query rewrite, then
    /// retrieval and rerank unless `with_retrieval` is off
    pub async fn resolve(
        &self,
        chat: &ChatRecord,
        query: &str,
        filters: &SearchFilters,
        with_retrieval: bool,
    ) -> Result<QuestionContext> {
        let turns = self
            .history
            .recent_turns(chat.chat_id, self.multiturn_turns)
            .await?;

        let rewritten = self
            .rewrite_query(query, &turns, chat.state.as_deref())
            .await?;

        let passages = if with_retrieval {
            let candidates = self.retrieval.retrieve(&rewritten, filters).await?;
            self.gate.rank(&rewritten, candidates).await?
        } else {
            Vec::new()
        };

        let rendered = render_context(&passages);
        tracing::debug!(
            chat_id = chat.chat_id,
            turns = turns.len(),
            passages = passages.len(),
            "Question context resolved"
        );

        Ok(QuestionContext {
            original_query: query.to_string(),
            rewritten_query: rewritten,
            turns,
            passages,
            rendered,
        })
    }

    async fn rewrite_query(
        &self,
        query: &str,
        turns: &[ConversationTurn],
        state: Option<&str>,
    ) -> Result<String> {
        let request = GenerationRequest {
            prompt: REWRITE_PROMPT.to_string(),
            query: query.to_string(),
            context: String::new(),
            chat_state: state.map(str::to_string),
            conversations: turns.to_vec(),
            temperature: REWRITE_TEMPERATURE,
            top_p: REWRITE_TOP_P,
        };

        let rewritten = self.generation.generate(request).await?;
        let rewritten = rewritten.trim();
        if rewritten.is_empty() {
            tracing::debug!("Blank rewrite, keeping the original query");
            return Ok(query.to_string());
        }
        Ok(rewritten.to_string())
    }

    /// Fold the latest exchange into the chat's rolling summary
    pub async fn summarize(&self, chat: &ChatRecord, query: &str, answer: &str) -> Result<String> {
        let request = GenerationRequest {
            prompt: SUMMARY_PROMPT.to_string(),
            query: query.to_string(),
            context: String::new(),
            chat_state: chat.state.clone(),
            conversations: vec![ConversationTurn {
                query: query.to_string(),
                answer: answer.to_string(),
            }],
            temperature: SUMMARY_TEMPERATURE,
            top_p: SUMMARY_TOP_P,
        };

        let summary = self.generation.generate(request).await?;
        Ok(summary.trim().to_string())
    }
}

/// Render ranked passages into the prompt context block
pub fn render_context(passages: &[RankedPassage]) -> String {
    passages
        .iter()
        .map(|ranked| {
            let p = &ranked.passage;
            format!("# {}\n## {}\n{}\n{}", p.title, p.section, p.content, p.snippet)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::RetrievalSettings;
    use ragline_common::clients::generation::MockGenerationClient;
    use ragline_common::clients::rerank::MockRerankClient;
    use ragline_common::clients::search::{passage_fixture, MockSearchClient, ScoredPassage};
    use ragline_common::history::MemoryHistory;

    fn resolver_with(
        history: Arc<MemoryHistory>,
        generation: MockGenerationClient,
        search: MockSearchClient,
        rerank: Arc<MockRerankClient>,
    ) -> ConversationContextResolver {
        ConversationContextResolver::new(
            history,
            Arc::new(generation),
            RetrievalCoordinator::new(Arc::new(search), RetrievalSettings::default()),
            RerankGate::new(rerank, 3),
            3,
        )
    }

    fn chat(chat_id: i64) -> ChatRecord {
        ChatRecord {
            chat_id,
            title: None,
            state: None,
        }
    }

    fn hits(ids: &[i64]) -> Vec<ScoredPassage> {
        ids.iter()
            .map(|&id| ScoredPassage {
                passage: passage_fixture(id, &format!("doc-{}", id)),
                score: 0.9,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_blank_rewrite_falls_back_to_original() {
        let resolver = resolver_with(
            Arc::new(MemoryHistory::with_chat(1)),
            MockGenerationClient::scripted(Vec::new(), vec!["   ".to_string()]),
            MockSearchClient::empty(),
            Arc::new(MockRerankClient::identity()),
        );

        let context = resolver
            .resolve(&chat(1), "what about the second one?", &SearchFilters::default(), true)
            .await
            .unwrap();

        assert_eq!(context.rewritten_query, "what about the second one?");
        assert_eq!(context.original_query, context.rewritten_query);
    }

    #[tokio::test]
    async fn test_rewrite_replaces_query_for_retrieval() {
        let resolver = resolver_with(
            Arc::new(MemoryHistory::with_chat(1)),
            MockGenerationClient::scripted(
                Vec::new(),
                vec!["what indexing strategies does pgvector support".to_string()],
            ),
            MockSearchClient::empty(),
            Arc::new(MockRerankClient::identity()),
        );

        let context = resolver
            .resolve(&chat(1), "and its indexes?", &SearchFilters::default(), true)
            .await
            .unwrap();

        assert_eq!(
            context.rewritten_query,
            "what indexing strategies does pgvector support"
        );
        assert_eq!(context.original_query, "and its indexes?");
    }

    #[tokio::test]
    async fn test_direct_mode_skips_retrieval_and_rerank() {
        let rerank = Arc::new(MockRerankClient::identity());
        let resolver = resolver_with(
            Arc::new(MemoryHistory::with_chat(1)),
            MockGenerationClient::scripted(Vec::new(), vec!["standalone".to_string()]),
            MockSearchClient::new(hits(&[1, 2]), Vec::new()),
            rerank.clone(),
        );

        let context = resolver
            .resolve(&chat(1), "just chat", &SearchFilters::default(), false)
            .await
            .unwrap();

        assert!(context.passages.is_empty());
        assert_eq!(context.rendered, "");
        assert_eq!(rerank.call_count(), 0);
    }

    #[tokio::test]
    async fn test_history_window_is_limited_and_oldest_first() {
        let history = Arc::new(MemoryHistory::with_chat(1));
        for i in 1..=5 {
            history.add_answered_turn(1, &format!("q{}", i), &format!("a{}", i));
        }

        let resolver = resolver_with(
            history,
            MockGenerationClient::scripted(Vec::new(), vec!["standalone".to_string()]),
            MockSearchClient::empty(),
            Arc::new(MockRerankClient::identity()),
        );

        let context = resolver
            .resolve(&chat(1), "q6", &SearchFilters::default(), true)
            .await
            .unwrap();

        let queries: Vec<&str> = context.turns.iter().map(|t| t.query.as_str()).collect();
        assert_eq!(queries, vec!["q3", "q4", "q5"]);
    }

    #[tokio::test]
    async fn test_resolved_passages_come_from_rerank_order() {
        let resolver = resolver_with(
            Arc::new(MemoryHistory::with_chat(1)),
            MockGenerationClient::scripted(Vec::new(), vec!["standalone".to_string()]),
            MockSearchClient::new(hits(&[1, 2, 3]), Vec::new()),
            Arc::new(MockRerankClient::with_order(vec![2, 3, 1])),
        );

        let context = resolver
            .resolve(&chat(1), "q", &SearchFilters::default(), true)
            .await
            .unwrap();

        let ids: Vec<i64> = context
            .passages
            .iter()
            .map(|p| p.passage.chunk_id)
            .collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_context_rendering_shape() {
        let passages = vec![
            RankedPassage {
                passage: passage_fixture(1, "Alpha"),
                score: 0.9,
            },
            RankedPassage {
                passage: passage_fixture(2, "Beta"),
                score: 0.8,
            },
        ];

        let rendered = render_context(&passages);
        assert_eq!(
            rendered,
            "# Alpha\n## Overview\nContent of Alpha\nSnippet of Alpha\n\n\
             # Beta\n## Overview\nContent of Beta\nSnippet of Beta"
        );
    }

    #[tokio::test]
    async fn test_summarize_trims_model_output() {
        let resolver = resolver_with(
            Arc::new(MemoryHistory::with_chat(1)),
            MockGenerationClient::scripted(Vec::new(), vec!["  the summary  ".to_string()]),
            MockSearchClient::empty(),
            Arc::new(MockRerankClient::identity()),
        );

        let summary = resolver
            .summarize(&chat(1), "q", "we will use pgvector")
            .await
            .unwrap();
        assert_eq!(summary, "the summary");
    }
}
