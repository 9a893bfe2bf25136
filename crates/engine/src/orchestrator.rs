//! Answer orchestration
//!
//! `ask` runs the synchronous part of the pipeline on the request path:
//! resolve the live stream handle and chat row, ground the question
//! (rewrite, retrieve, rerank), insert the pending turn. Then it hands
//! off to a detached streaming task and returns the turn id, so the
//! caller gets its response while tokens are still flowing.
//!
//! The streaming task owns the terminal framing for its session and is
//! the only place persistence starts from. Persistence runs after the
//! terminal frame, fire-and-forget: its failures are logged and never
//! reach a stream the consumer already saw complete.
//!
//! Callers run one ask at a time per session; frames from concurrent
//! asks on one session would interleave.

use crate::context::{ConversationContextResolver, QuestionContext};
use crate::decision::DecisionDetector;
use crate::stream::{EventChannel, EventKind, StreamHandle, StreamRegistry};
use futures::StreamExt;
use ragline_common::clients::generation::{GenerationClient, GenerationRequest};
use ragline_common::clients::rerank::RankedPassage;
use ragline_common::clients::search::SearchFilters;
use ragline_common::errors::{AppError, Result};
use ragline_common::history::{
    ChatRecord, HistoryStore, PromptSpec, StoredPassage, TurnCompletion,
};
use ragline_common::{metrics, MAX_STORED_PASSAGES};
use regex_lite::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// How the answer is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AskMode {
    /// Retrieval-augmented: evidence passages ground the answer
    #[default]
    Retrieval,
    /// Plain model answer; no retrieval, no reference frame
    Direct,
}

/// One question against an open session stream
#[derive(Debug, Clone)]
pub struct AskRequest {
    pub session_id: String,
    pub chat_id: i64,
    pub query: String,
    pub filters: SearchFilters,
    pub mode: AskMode,
    pub prompt: PromptSpec,
}

/// Returned once the streaming task is off the request path
#[derive(Debug, Clone, Serialize)]
pub struct AskReceipt {
    pub turn_id: i64,
}

/// Orchestrator knobs, fixed at construction
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Answers matching any of these patterns cite nothing
    pub no_hit_patterns: Vec<String>,
    pub decision_keywords: Vec<String>,
    pub negative_keywords: Vec<String>,
    /// Model label attached to generation metrics
    pub model: String,
}

#[derive(Clone)]
pub struct AnswerOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    resolver: ConversationContextResolver,
    generation: Arc<dyn GenerationClient>,
    history: Arc<dyn HistoryStore>,
    registry: StreamRegistry,
    detector: DecisionDetector,
    no_hit: Option<Regex>,
    model: String,
}

enum StreamOutcome {
    Completed,
    Failed(AppError),
    Cancelled,
}

impl AnswerOrchestrator {
    pub fn new(
        resolver: ConversationContextResolver,
        generation: Arc<dyn GenerationClient>,
        history: Arc<dyn HistoryStore>,
        registry: StreamRegistry,
        settings: OrchestratorSettings,
    ) -> Result<Self> {
        let no_hit = if settings.no_hit_patterns.is_empty() {
            None
        } else {
            let joined = settings
                .no_hit_patterns
                .iter()
                .map(|p| format!("(?:{})", p))
                .collect::<Vec<_>>()
                .join("|");
            Some(
                Regex::new(&joined).map_err(|e| AppError::Configuration {
                    message: format!("Invalid no-hit pattern: {}", e),
                })?,
            )
        };

        Ok(Self {
            inner: Arc::new(Inner {
                resolver,
                generation,
                history,
                registry,
                detector: DecisionDetector::new(
                    &settings.decision_keywords,
                    &settings.negative_keywords,
                ),
                no_hit,
                model: settings.model,
            }),
        })
    }

    /// Answer one question over the session's open stream.
    ///
    /// Errors returned here mean nothing was streamed and no turn was
    /// left pending beyond the failure point; once this returns a
    /// receipt, the outcome arrives as frames.
    pub async fn ask(&self, request: AskRequest) -> Result<AskReceipt> {
        let inner = &self.inner;
        let handle = inner.registry.get(&request.session_id)?;

        let chat = inner
            .history
            .find_chat(request.chat_id)
            .await?
            .ok_or(AppError::ChatNotFound {
                id: request.chat_id,
            })?;

        let with_retrieval = request.mode == AskMode::Retrieval;
        let context = inner
            .resolver
            .resolve(&chat, &request.query, &request.filters, with_retrieval)
            .await?;

        let turn_id = inner.history.begin_turn(chat.chat_id, &request.query).await?;

        tracing::info!(
            session = %request.session_id,
            chat_id = chat.chat_id,
            turn_id,
            mode = ?request.mode,
            passages = context.passages.len(),
            "Answer stream starting"
        );

        tokio::spawn(Arc::clone(inner).stream_answer(handle, chat, context, request, turn_id));

        Ok(AskReceipt { turn_id })
    }
}

impl Inner {
    async fn stream_answer(
        self: Arc<Self>,
        handle: StreamHandle,
        chat: ChatRecord,
        context: QuestionContext,
        request: AskRequest,
        turn_id: i64,
    ) {
        let session = handle.session().to_string();
        let cancel = handle.cancellation();
        let mut channel = EventChannel::new(handle);
        let started = Instant::now();

        let generation_request = GenerationRequest {
            prompt: request.prompt.content.clone(),
            query: context.rewritten_query.clone(),
            context: context.rendered.clone(),
            chat_state: chat.state.clone(),
            conversations: context.turns.clone(),
            temperature: request.prompt.temperature,
            top_p: request.prompt.top_p,
        };

        let mut stream = match self.generation.stream(generation_request).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(
                    session = %session,
                    turn_id,
                    error = %e,
                    "Failed to open generation stream"
                );
                metrics::record_generation(started.elapsed().as_secs_f64(), &self.model, false);
                channel.fail(&e.to_string()).await;
                self.registry.remove(&session, "failed");
                return;
            }
        };

        let mut answer = String::new();
        let mut reasoning_tokens = 0usize;
        let mut answer_tokens = 0usize;

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break StreamOutcome::Cancelled,
                token = stream.next() => match token {
                    Some(Ok(token)) => {
                        if token.reasoning {
                            reasoning_tokens += 1;
                            channel.emit(EventKind::Reasoning, &token.text).await;
                        } else {
                            answer_tokens += 1;
                            answer.push_str(&token.text);
                            channel.emit(EventKind::Answer, &token.text).await;
                        }
                    }
                    Some(Err(e)) => break StreamOutcome::Failed(e),
                    None => break StreamOutcome::Completed,
                }
            }
        };

        metrics::record_tokens("reasoning", reasoning_tokens);
        metrics::record_tokens("answer", answer_tokens);
        let duration = started.elapsed().as_secs_f64();

        match outcome {
            StreamOutcome::Completed => {
                let answer = answer.trim().to_string();
                if request.mode == AskMode::Retrieval {
                    let payload = self.reference_payload(&answer, &context.passages);
                    channel.emit(EventKind::Reference, &payload).await;
                }
                channel.complete().await;
                metrics::record_generation(duration, &self.model, true);
                self.registry.remove(&session, "completed");
                tracing::info!(
                    session = %session,
                    turn_id,
                    answer_tokens,
                    "Answer stream completed"
                );

                let inner = Arc::clone(&self);
                tokio::spawn(async move {
                    inner
                        .persist_turn(chat, context, request.query, turn_id, answer)
                        .await;
                });
            }
            StreamOutcome::Failed(e) => {
                tracing::error!(
                    session = %session,
                    turn_id,
                    error = %e,
                    "Generation stream failed"
                );
                channel.fail(&e.to_string()).await;
                metrics::record_generation(duration, &self.model, false);
                self.registry.remove(&session, "failed");
            }
            StreamOutcome::Cancelled => {
                tracing::info!(session = %session, turn_id, "Answer stream cancelled");
                channel.cancelled().await;
                self.registry.remove(&session, "cancelled");
            }
        }
    }

    /// Serialized citation list for the reference lane. The no-hit
    /// patterns collapse it to a literal `{}` when the model says it
    /// found nothing, so consumers never render citations under an
    /// answer that disclaimed them.
    fn reference_payload(&self, answer: &str, passages: &[RankedPassage]) -> String {
        let no_hit = self
            .no_hit
            .as_ref()
            .map(|re| re.is_match(answer))
            .unwrap_or(false);
        if no_hit {
            return "{}".to_string();
        }

        let documents: Vec<ReferenceDocument<'_>> = passages
            .iter()
            .map(|ranked| ReferenceDocument {
                chunk_id: ranked.passage.chunk_id,
                title: &ranked.passage.title,
                source: &ranked.passage.source,
                category: &ranked.passage.category,
                url: ranked.passage.url.as_deref(),
            })
            .collect();
        serde_json::to_string(&documents).unwrap_or_else(|_| "{}".to_string())
    }

    async fn persist_turn(
        &self,
        chat: ChatRecord,
        context: QuestionContext,
        query: String,
        turn_id: i64,
        answer: String,
    ) {
        let passages = context
            .passages
            .iter()
            .take(MAX_STORED_PASSAGES)
            .map(|ranked| StoredPassage {
                file_id: ranked.passage.file_id,
                category: ranked.passage.category.clone(),
                title: ranked.passage.title.clone(),
                content: ranked.passage.content.clone(),
            })
            .collect();

        let completion = TurnCompletion {
            turn_id,
            rewritten_query: context.rewritten_query.clone(),
            answer: answer.clone(),
            passages,
        };

        match self.history.complete_turn(completion).await {
            Ok(()) => metrics::record_persistence(true),
            Err(e) => {
                tracing::error!(turn_id, error = %e, "Failed to persist completed turn");
                metrics::record_persistence(false);
                return;
            }
        }

        if !self.detector.detect(&query, &answer) {
            return;
        }

        match self.resolver.summarize(&chat, &query, &answer).await {
            Ok(summary) if summary.is_empty() => {}
            Ok(summary) => {
                if let Err(e) = self.history.update_chat_state(chat.chat_id, &summary).await {
                    tracing::error!(
                        chat_id = chat.chat_id,
                        error = %e,
                        "Failed to update chat state"
                    );
                } else {
                    tracing::debug!(chat_id = chat.chat_id, "Chat state refreshed");
                }
            }
            Err(e) => {
                tracing::error!(
                    chat_id = chat.chat_id,
                    error = %e,
                    "Chat state summarization failed"
                );
            }
        }
    }
}

#[derive(Serialize)]
struct ReferenceDocument<'a> {
    chunk_id: i64,
    title: &'a str,
    source: &'a str,
    category: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConversationContextResolver;
    use crate::retrieval::{RerankGate, RetrievalCoordinator, RetrievalSettings};
    use crate::stream::EventStream;
    use ragline_common::clients::generation::{GenerationToken, MockGenerationClient};
    use ragline_common::clients::rerank::MockRerankClient;
    use ragline_common::clients::search::{passage_fixture, MockSearchClient, ScoredPassage};
    use ragline_common::history::MemoryHistory;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    const CHAT_ID: i64 = 7;

    struct Harness {
        orchestrator: AnswerOrchestrator,
        registry: StreamRegistry,
        history: Arc<MemoryHistory>,
    }

    fn harness(generation: MockGenerationClient, search: MockSearchClient) -> Harness {
        harness_with(generation, search, MockRerankClient::identity())
    }

    fn harness_with(
        generation: MockGenerationClient,
        search: MockSearchClient,
        rerank: MockRerankClient,
    ) -> Harness {
        let history = Arc::new(MemoryHistory::with_chat(CHAT_ID));
        let generation: Arc<dyn GenerationClient> = Arc::new(generation);
        let registry = StreamRegistry::new(64);

        let resolver = ConversationContextResolver::new(
            history.clone(),
            generation.clone(),
            RetrievalCoordinator::new(Arc::new(search), RetrievalSettings::default()),
            RerankGate::new(Arc::new(rerank), 3),
            3,
        );

        let orchestrator = AnswerOrchestrator::new(
            resolver,
            generation,
            history.clone(),
            registry.clone(),
            OrchestratorSettings {
                no_hit_patterns: vec![
                    "(?i)couldn'?t find any relevant documents".to_string(),
                    "(?i)no relevant documents were found".to_string(),
                ],
                decision_keywords: vec!["decided".to_string(), "we will use".to_string()],
                negative_keywords: vec!["not sure".to_string()],
                model: "test-model".to_string(),
            },
        )
        .unwrap();

        Harness {
            orchestrator,
            registry,
            history,
        }
    }

    fn ask_request(session: &str, query: &str) -> AskRequest {
        AskRequest {
            session_id: session.to_string(),
            chat_id: CHAT_ID,
            query: query.to_string(),
            filters: SearchFilters::default(),
            mode: AskMode::Retrieval,
            prompt: PromptSpec {
                content: "You are a careful assistant.".to_string(),
                temperature: 0.7,
                top_p: 0.9,
            },
        }
    }

    fn scored(chunk_id: i64, score: f64) -> ScoredPassage {
        ScoredPassage {
            passage: passage_fixture(chunk_id, &format!("doc-{}", chunk_id)),
            score,
        }
    }

    async fn next_frame(stream: &mut EventStream) -> crate::stream::StreamFrame {
        timeout(Duration::from_secs(2), stream.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("stream closed unexpectedly")
    }

    async fn frames_until_disconnect(stream: &mut EventStream) -> Vec<crate::stream::StreamFrame> {
        let mut frames = Vec::new();
        loop {
            let frame = next_frame(stream).await;
            let is_disconnect = frame.event == "disconnect";
            frames.push(frame);
            if is_disconnect {
                return frames;
            }
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_full_stream_framing_and_persistence() {
        let generation = MockGenerationClient::scripted(
            vec![
                GenerationToken::reasoning("weighing"),
                GenerationToken::reasoning("options"),
                GenerationToken::answer("Use"),
                GenerationToken::answer(" HNSW"),
            ],
            vec!["standalone query".to_string()],
        );
        let search = MockSearchClient::new(vec![scored(1, 0.9)], vec![scored(2, 0.8)]);
        let h = harness(generation, search);

        let mut stream = h.registry.create("s1").unwrap();
        let receipt = h
            .orchestrator
            .ask(ask_request("s1", "which index?"))
            .await
            .unwrap();

        let frames = frames_until_disconnect(&mut stream).await;
        let events: Vec<&str> = frames.iter().map(|f| f.event.as_str()).collect();
        assert_eq!(
            events,
            vec![
                "connect",
                "reasoning-start",
                "reasoning",
                "reasoning",
                "reasoning-done",
                "answer-start",
                "answer",
                "answer",
                "answer-done",
                "reference-start",
                "reference",
                "reference-done",
                "disconnect",
            ]
        );

        let reference = frames.iter().find(|f| f.event == "reference").unwrap();
        assert!(reference.data.starts_with('['));
        assert!(reference.data.contains("\"chunk_id\":1"));
        assert!(reference.data.contains("\"chunk_id\":2"));

        wait_until(|| !h.history.completions().is_empty()).await;
        let completions = h.history.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].turn_id, receipt.turn_id);
        assert_eq!(completions[0].answer, "Use HNSW");
        assert_eq!(completions[0].rewritten_query, "standalone query");
        assert_eq!(completions[0].passages.len(), 2);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_no_hit_answer_collapses_reference_payload() {
        let generation = MockGenerationClient::scripted(
            vec![GenerationToken::answer(
                "I couldn't find any relevant documents for this question.",
            )],
            vec!["standalone".to_string()],
        );
        let search = MockSearchClient::new(vec![scored(1, 0.9)], Vec::new());
        let h = harness(generation, search);

        let mut stream = h.registry.create("s1").unwrap();
        h.orchestrator.ask(ask_request("s1", "q")).await.unwrap();

        let frames = frames_until_disconnect(&mut stream).await;
        let reference = frames.iter().find(|f| f.event == "reference").unwrap();
        assert_eq!(reference.data, "{}");
    }

    #[tokio::test]
    async fn test_direct_mode_skips_reference_lane() {
        let generation = MockGenerationClient::scripted(
            vec![GenerationToken::answer("Hello!")],
            vec!["standalone".to_string()],
        );
        // Search would return hits, but direct mode never asks
        let search = MockSearchClient::new(vec![scored(1, 0.9)], Vec::new());
        let h = harness(generation, search);

        let mut stream = h.registry.create("s1").unwrap();
        let mut request = ask_request("s1", "hi there");
        request.mode = AskMode::Direct;
        h.orchestrator.ask(request).await.unwrap();

        let events: Vec<String> = frames_until_disconnect(&mut stream)
            .await
            .into_iter()
            .map(|f| f.event)
            .collect();
        assert_eq!(
            events,
            vec!["connect", "answer-start", "answer", "answer-done", "disconnect"]
        );

        wait_until(|| !h.history.completions().is_empty()).await;
        assert!(h.history.completions()[0].passages.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_stops_stream_and_skips_persistence() {
        let generation = MockGenerationClient::stalling(
            vec![GenerationToken::answer("partial")],
            vec!["standalone".to_string()],
        );
        let h = harness(generation, MockSearchClient::empty());

        let mut stream = h.registry.create("s1").unwrap();
        h.orchestrator.ask(ask_request("s1", "q")).await.unwrap();

        // Read until the first token is on the wire, then cancel
        let mut frames = Vec::new();
        loop {
            let frame = next_frame(&mut stream).await;
            let is_token = frame.event == "answer";
            frames.push(frame);
            if is_token {
                break;
            }
        }
        assert!(h.registry.remove("s1", "client_request"));

        frames.extend(frames_until_disconnect(&mut stream).await);
        let events: Vec<&str> = frames.iter().map(|f| f.event.as_str()).collect();
        assert_eq!(
            events,
            vec!["connect", "answer-start", "answer", "answer-done", "disconnect"]
        );

        sleep(Duration::from_millis(50)).await;
        assert!(h.history.completions().is_empty());
        assert_eq!(h.history.turn_count(), 1);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_stream_open_failure_emits_exception_framing() {
        let h = harness(MockGenerationClient::failing(), MockSearchClient::empty());

        let mut stream = h.registry.create("s1").unwrap();
        h.orchestrator.ask(ask_request("s1", "q")).await.unwrap();

        let frames = frames_until_disconnect(&mut stream).await;
        let events: Vec<&str> = frames.iter().map(|f| f.event.as_str()).collect();
        assert_eq!(events, vec!["connect", "exception", "disconnect"]);

        let exception = frames.iter().find(|f| f.event == "exception").unwrap();
        assert!(exception.data.contains("mock stream failure"));

        sleep(Duration::from_millis(50)).await;
        assert!(h.history.completions().is_empty());
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_mid_stream_error_closes_lane_then_excepts() {
        let generation = MockGenerationClient::erroring_after(
            vec![GenerationToken::answer("half an")],
            vec!["standalone".to_string()],
        );
        let h = harness(generation, MockSearchClient::empty());

        let mut stream = h.registry.create("s1").unwrap();
        h.orchestrator.ask(ask_request("s1", "q")).await.unwrap();

        let events: Vec<String> = frames_until_disconnect(&mut stream)
            .await
            .into_iter()
            .map(|f| f.event)
            .collect();
        assert_eq!(
            events,
            vec![
                "connect",
                "answer-start",
                "answer",
                "answer-done",
                "exception",
                "disconnect"
            ]
        );

        sleep(Duration::from_millis(50)).await;
        assert!(h.history.completions().is_empty());
    }

    #[tokio::test]
    async fn test_ask_without_open_stream_fails_fast() {
        let h = harness(
            MockGenerationClient::scripted(Vec::new(), Vec::new()),
            MockSearchClient::empty(),
        );

        let err = h
            .orchestrator
            .ask(ask_request("ghost", "q"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::StreamNotFound { .. }));
        assert_eq!(h.history.turn_count(), 0);
    }

    #[tokio::test]
    async fn test_ask_unknown_chat_leaves_no_turn() {
        let h = harness(
            MockGenerationClient::scripted(Vec::new(), Vec::new()),
            MockSearchClient::empty(),
        );

        let _stream = h.registry.create("s1").unwrap();
        let mut request = ask_request("s1", "q");
        request.chat_id = 999;

        let err = h.orchestrator.ask(request).await.unwrap_err();
        assert!(matches!(err, AppError::ChatNotFound { .. }));
        assert_eq!(h.history.turn_count(), 0);
    }

    #[tokio::test]
    async fn test_decision_answer_refreshes_chat_state() {
        let generation = MockGenerationClient::scripted(
            vec![GenerationToken::answer("We decided to adopt HNSW.")],
            vec![
                "standalone".to_string(),
                "Adopted HNSW for vector search.".to_string(),
            ],
        );
        let h = harness(generation, MockSearchClient::empty());

        let mut stream = h.registry.create("s1").unwrap();
        h.orchestrator
            .ask(ask_request("s1", "which one do we pick?"))
            .await
            .unwrap();
        frames_until_disconnect(&mut stream).await;

        wait_until(|| !h.history.state_updates().is_empty()).await;
        let updates = h.history.state_updates();
        assert_eq!(updates[0].0, CHAT_ID);
        assert_eq!(updates[0].1, "Adopted HNSW for vector search.");
    }

    #[tokio::test]
    async fn test_plain_answer_skips_summarization() {
        let generation = MockGenerationClient::scripted(
            vec![GenerationToken::answer("It reorders candidates by relevance.")],
            vec!["standalone".to_string()],
        );
        let h = harness(generation, MockSearchClient::empty());

        let mut stream = h.registry.create("s1").unwrap();
        h.orchestrator
            .ask(ask_request("s1", "how does reranking work?"))
            .await
            .unwrap();
        frames_until_disconnect(&mut stream).await;

        wait_until(|| !h.history.completions().is_empty()).await;
        sleep(Duration::from_millis(50)).await;
        assert!(h.history.state_updates().is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_never_reaches_the_stream() {
        let generation = MockGenerationClient::scripted(
            vec![GenerationToken::answer("fine")],
            vec!["standalone".to_string()],
        );
        let h = harness(generation, MockSearchClient::empty());
        h.history.fail_completions();

        let mut stream = h.registry.create("s1").unwrap();
        h.orchestrator.ask(ask_request("s1", "q")).await.unwrap();

        // Framing completes normally even though persistence will fail
        let events: Vec<String> = frames_until_disconnect(&mut stream)
            .await
            .into_iter()
            .map(|f| f.event)
            .collect();
        assert_eq!(events.last().map(String::as_str), Some("disconnect"));

        sleep(Duration::from_millis(50)).await;
        assert!(h.history.completions().is_empty());
        assert_eq!(h.history.turn_count(), 1);
    }
}
