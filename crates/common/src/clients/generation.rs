//! Generation (LLM) service client
//!
//! Talks to an OpenAI-compatible completion endpoint. Two shapes:
//! - `stream()` returns a token stream decoded from SSE lines, with
//!   reasoning and answer text kept on separate lanes
//! - `generate()` is a one-shot completion used for query rewriting and
//!   chat-state summarization
//!
//! Stream decode is deliberately forgiving: a malformed line is skipped,
//! never fatal. Only transport failures surface as errors.

use crate::config::GenerationConfig;
use crate::errors::{AppError, Result};
use crate::history::ConversationTurn;
use async_trait::async_trait;
use futures::{stream, Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

/// Fixed sampling knobs sent with every request
const MIN_P: f64 = 0.0;
const SAMPLING_TOP_K: u32 = 20;

/// One decoded token from the generation stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationToken {
    /// Upstream completion id this token belongs to
    pub id: String,

    /// Token text, unescaped
    pub text: String,

    /// True for reasoning-lane tokens, false for answer text
    pub reasoning: bool,

    /// Set on the token that closes the completion, when reported
    pub finish_reason: Option<String>,
}

impl GenerationToken {
    /// Answer-lane token
    pub fn answer(text: &str) -> Self {
        Self {
            id: String::new(),
            text: text.to_string(),
            reasoning: false,
            finish_reason: None,
        }
    }

    /// Reasoning-lane token
    pub fn reasoning(text: &str) -> Self {
        Self {
            id: String::new(),
            text: text.to_string(),
            reasoning: true,
            finish_reason: None,
        }
    }
}

/// Boxed stream of decoded tokens
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<GenerationToken>> + Send>>;

/// Everything the model needs for one completion
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// System prompt content
    pub prompt: String,

    /// The user's question (rewritten form for answer generation)
    pub query: String,

    /// Rendered context passages, empty in direct mode
    pub context: String,

    /// Rolling chat summary, when one exists
    pub chat_state: Option<String>,

    /// Recent answered turns, oldest first
    pub conversations: Vec<ConversationTurn>,

    /// Sampling temperature
    pub temperature: f64,

    /// Nucleus sampling parameter
    pub top_p: f64,
}

/// Trait for the generation service
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Open a streaming completion
    async fn stream(&self, request: GenerationRequest) -> Result<TokenStream>;

    /// One-shot completion, returns the trimmed answer text
    async fn generate(&self, request: GenerationRequest) -> Result<String>;
}

/// HTTP client for the generation endpoint
pub struct HttpGenerationClient {
    client: reqwest::Client,
    url: String,
    model: String,
    limits: GenerationConfig,
}

#[derive(Serialize)]
struct GenerationApiRequest<'a> {
    model: &'a str,
    temperature: f64,
    top_p: f64,
    min_p: f64,
    top_k: u32,
    max_tokens: usize,
    stream: bool,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_state: Option<&'a str>,
    conversations: &'a [ConversationTurn],
    context: &'a str,
    query: &'a str,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: TokenDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct TokenDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: CompletionMessage,
}

#[derive(Deserialize, Default)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Decode one SSE line into tokens
///
/// Strips the `data:` prefix, drops `[DONE]` and blank lines, and skips
/// anything that fails to parse. Each choice can yield a reasoning token
/// and an answer token from the same chunk.
fn decode_line(line: &str) -> Vec<GenerationToken> {
    let payload = line.strip_prefix("data:").unwrap_or(line).trim();
    if payload.is_empty() || payload == "[DONE]" {
        return Vec::new();
    }

    let chunk: StreamChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping malformed stream line");
            return Vec::new();
        }
    };

    let mut tokens = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.reasoning_content.filter(|t| !t.is_empty()) {
            tokens.push(GenerationToken {
                id: chunk.id.clone(),
                text,
                reasoning: true,
                finish_reason: choice.finish_reason.clone(),
            });
        }
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            tokens.push(GenerationToken {
                id: chunk.id.clone(),
                text,
                reasoning: false,
                finish_reason: choice.finish_reason,
            });
        }
    }
    tokens
}

/// Rough token estimate: four characters per token
fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

impl HttpGenerationClient {
    /// Create a new generation client from configuration
    pub fn new(config: &GenerationConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            url: config.url.clone(),
            model: config.model.clone(),
            limits: config.clone(),
        }
    }

    /// Output token budget: what's left of the context window after the
    /// estimated input and a safety margin, clamped to the configured range
    fn output_budget(&self, request: &GenerationRequest) -> usize {
        let mut input = estimate_tokens(&request.prompt)
            + estimate_tokens(&request.context)
            + estimate_tokens(&request.query);

        if let Some(state) = &request.chat_state {
            input += estimate_tokens(state);
        }
        for turn in &request.conversations {
            input += estimate_tokens(&turn.query) + estimate_tokens(&turn.answer);
        }

        self.limits
            .context_limit_tokens
            .saturating_sub(input + self.limits.safety_margin_tokens)
            .clamp(
                self.limits.min_output_tokens,
                self.limits.max_output_tokens,
            )
    }

    fn api_request<'a>(
        &'a self,
        request: &'a GenerationRequest,
        stream: bool,
    ) -> GenerationApiRequest<'a> {
        GenerationApiRequest {
            model: &self.model,
            temperature: request.temperature,
            top_p: request.top_p,
            min_p: MIN_P,
            top_k: SAMPLING_TOP_K,
            max_tokens: self.output_budget(request),
            stream,
            prompt: &request.prompt,
            chat_state: request.chat_state.as_deref(),
            conversations: &request.conversations,
            context: &request.context,
            query: &request.query,
        }
    }

    async fn complete_once(&self, body: &GenerationApiRequest<'_>) -> Result<String> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::GenerationError {
                message: format!("Request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::GenerationError {
                message: format!("API error {}: {}", status, text),
            });
        }

        let result: CompletionResponse =
            response.json().await.map_err(|e| AppError::GenerationError {
                message: format!("Failed to parse response: {}", e),
            })?;

        Ok(result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn stream(&self, request: GenerationRequest) -> Result<TokenStream> {
        let body = self.api_request(&request, true);

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::GenerationError {
                message: format!("Request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::GenerationError {
                message: format!("API error {}: {}", status, text),
            });
        }

        // Cut the byte stream on line boundaries so every decode sees a
        // whole SSE line, then fan each line out into its tokens
        let bytes = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let lines = FramedRead::new(StreamReader::new(bytes), LinesCodec::new());

        let tokens = lines.flat_map(|line| {
            let decoded: Vec<Result<GenerationToken>> = match line {
                Ok(line) => decode_line(&line).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(AppError::GenerationError {
                    message: format!("Stream decode failed: {}", e),
                })],
            };
            stream::iter(decoded)
        });

        Ok(Box::pin(tokens))
    }

    async fn generate(&self, request: GenerationRequest) -> Result<String> {
        let body = self.api_request(&request, false);
        let max_retries = 3;
        let mut last_error = None;

        for attempt in 0..max_retries {
            if attempt > 0 {
                // Exponential backoff with jitter
                use rand::Rng;
                let jitter = rand::thread_rng().gen_range(0..50);
                let delay = Duration::from_millis(100 * 2_u64.pow(attempt as u32) + jitter);
                tokio::time::sleep(delay).await;
            }

            match self.complete_once(&body).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = max_retries,
                        error = %e,
                        "Generation request failed, retrying"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::GenerationError {
            message: "Unknown error after retries".to_string(),
        }))
    }
}

/// What a mock token stream does once its scripted tokens run out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockTail {
    End,
    Stall,
    Error,
}

/// Scripted generation client for tests and local development
pub struct MockGenerationClient {
    tokens: Vec<GenerationToken>,
    tail: MockTail,
    replies: Vec<String>,
    reply_cursor: AtomicUsize,
    fail_stream: AtomicBool,
}

impl MockGenerationClient {
    /// Stream the given tokens; answer `generate()` calls from `replies`
    /// in order (empty string once exhausted)
    pub fn scripted(tokens: Vec<GenerationToken>, replies: Vec<String>) -> Self {
        Self {
            tokens,
            tail: MockTail::End,
            replies,
            reply_cursor: AtomicUsize::new(0),
            fail_stream: AtomicBool::new(false),
        }
    }

    /// Stream the given tokens, then hang without ever finishing
    pub fn stalling(tokens: Vec<GenerationToken>, replies: Vec<String>) -> Self {
        let mut client = Self::scripted(tokens, replies);
        client.tail = MockTail::Stall;
        client
    }

    /// Stream the given tokens, then yield an error mid-stream
    pub fn erroring_after(tokens: Vec<GenerationToken>, replies: Vec<String>) -> Self {
        let mut client = Self::scripted(tokens, replies);
        client.tail = MockTail::Error;
        client
    }

    /// A client whose `stream()` fails to open
    pub fn failing() -> Self {
        let client = Self::scripted(Vec::new(), Vec::new());
        client.fail_stream.store(true, Ordering::SeqCst);
        client
    }
}

#[async_trait]
impl GenerationClient for MockGenerationClient {
    async fn stream(&self, _request: GenerationRequest) -> Result<TokenStream> {
        if self.fail_stream.load(Ordering::SeqCst) {
            return Err(AppError::GenerationError {
                message: "mock stream failure".to_string(),
            });
        }

        let tokens: Vec<Result<GenerationToken>> =
            self.tokens.iter().cloned().map(Ok).collect();
        let head = stream::iter(tokens);
        Ok(match self.tail {
            MockTail::End => Box::pin(head),
            MockTail::Stall => Box::pin(head.chain(stream::pending())),
            MockTail::Error => Box::pin(head.chain(stream::iter(vec![Err(
                AppError::GenerationError {
                    message: "mock mid-stream failure".to_string(),
                },
            )]))),
        })
    }

    async fn generate(&self, _request: GenerationRequest) -> Result<String> {
        let idx = self.reply_cursor.fetch_add(1, Ordering::SeqCst);
        Ok(self.replies.get(idx).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_skips_done_and_blank() {
        assert!(decode_line("data: [DONE]").is_empty());
        assert!(decode_line("").is_empty());
        assert!(decode_line("   ").is_empty());
    }

    #[test]
    fn test_decode_skips_malformed() {
        assert!(decode_line("data: {not json").is_empty());
        assert!(decode_line("data: 42").is_empty());
    }

    #[test]
    fn test_decode_content_token() {
        let line = r#"data: {"id":"c1","choices":[{"delta":{"content":"hello"},"finish_reason":null}]}"#;
        let tokens = decode_line(line);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].text, "hello");
        assert!(!tokens[0].reasoning);
        assert_eq!(tokens[0].id, "c1");
    }

    #[test]
    fn test_decode_reasoning_lane() {
        let line = r#"data: {"id":"c1","choices":[{"delta":{"reasoning_content":"because"},"finish_reason":null}]}"#;
        let tokens = decode_line(line);
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].reasoning);
    }

    #[test]
    fn test_decode_both_lanes_in_one_chunk() {
        let line = r#"{"id":"c2","choices":[{"delta":{"content":"x","reasoning_content":"y"}}]}"#;
        let tokens = decode_line(line);
        assert_eq!(tokens.len(), 2);
        assert!(tokens[0].reasoning);
        assert!(!tokens[1].reasoning);
    }

    #[test]
    fn test_decode_drops_empty_delta() {
        let line = r#"data: {"id":"c3","choices":[{"delta":{"content":""},"finish_reason":"stop"}]}"#;
        assert!(decode_line(line).is_empty());
    }

    #[test]
    fn test_output_budget_clamps() {
        let config = GenerationConfig {
            url: "http://localhost:8000/v1/generate".to_string(),
            model: "test".to_string(),
            timeout_secs: 5,
            context_limit_tokens: 1000,
            min_output_tokens: 50,
            max_output_tokens: 400,
            safety_margin_tokens: 100,
        };
        let client = HttpGenerationClient::new(&config);

        let small = GenerationRequest {
            prompt: "p".to_string(),
            query: "q".to_string(),
            context: String::new(),
            chat_state: None,
            conversations: Vec::new(),
            temperature: 0.7,
            top_p: 0.9,
        };
        // Nearly the whole window is free, so the ceiling applies
        assert_eq!(client.output_budget(&small), 400);

        let large = GenerationRequest {
            context: "x".repeat(5000),
            ..small
        };
        // Window exhausted, so the floor applies
        assert_eq!(client.output_budget(&large), 50);
    }

    #[tokio::test]
    async fn test_mock_stream_yields_scripted_tokens() {
        let client = MockGenerationClient::scripted(
            vec![
                GenerationToken::reasoning("thinking"),
                GenerationToken::answer("done"),
            ],
            vec!["rewritten".to_string()],
        );

        let request = GenerationRequest {
            prompt: String::new(),
            query: String::new(),
            context: String::new(),
            chat_state: None,
            conversations: Vec::new(),
            temperature: 0.0,
            top_p: 1.0,
        };

        let mut stream = client.stream(request.clone()).await.unwrap();
        let mut texts = Vec::new();
        while let Some(token) = stream.next().await {
            texts.push(token.unwrap().text);
        }
        assert_eq!(texts, vec!["thinking", "done"]);

        assert_eq!(client.generate(request.clone()).await.unwrap(), "rewritten");
        // Replies exhaust to empty
        assert_eq!(client.generate(request).await.unwrap(), "");
    }
}
