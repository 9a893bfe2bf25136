//! Configuration management for Ragline services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Search service configuration
    pub search: SearchConfig,

    /// Reranker service configuration
    pub reranker: RerankerConfig,

    /// Generation (LLM) service configuration
    pub generation: GenerationConfig,

    /// Answer pipeline configuration
    pub answer: AnswerConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Maximum concurrent requests
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    /// Search service base URL
    #[serde(default = "default_search_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_sidecar_timeout")]
    pub timeout_secs: u64,

    /// Candidates requested from the keyword leg
    #[serde(default = "default_keyword_top_k")]
    pub keyword_top_k: usize,

    /// Candidates requested from the vector leg
    #[serde(default = "default_vector_top_k")]
    pub vector_top_k: usize,

    /// Minimum retrieval score kept after merging
    #[serde(default = "default_score_min")]
    pub score_min: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RerankerConfig {
    /// Reranker service base URL
    #[serde(default = "default_reranker_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_sidecar_timeout")]
    pub timeout_secs: u64,

    /// Passages kept after reranking
    #[serde(default = "default_rerank_top_k")]
    pub top_k: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationConfig {
    /// Generation endpoint URL
    #[serde(default = "default_generation_url")]
    pub url: String,

    /// Model name sent with each request
    #[serde(default = "default_generation_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,

    /// Model context window in tokens
    #[serde(default = "default_context_limit")]
    pub context_limit_tokens: usize,

    /// Floor for the output token budget
    #[serde(default = "default_min_output_tokens")]
    pub min_output_tokens: usize,

    /// Ceiling for the output token budget
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: usize,

    /// Tokens reserved for template overhead
    #[serde(default = "default_safety_margin")]
    pub safety_margin_tokens: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnswerConfig {
    /// Answered turns carried into query rewriting
    #[serde(default = "default_multiturn_turns")]
    pub multiturn_turns: usize,

    /// Frame buffer capacity per session stream
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,

    /// System prompt used when no preset is selected
    #[serde(default = "default_prompt")]
    pub default_prompt: String,

    /// Sampling temperature for the default prompt
    #[serde(default = "default_temperature")]
    pub default_temperature: f64,

    /// Nucleus sampling parameter for the default prompt
    #[serde(default = "default_top_p")]
    pub default_top_p: f64,

    /// Patterns marking a "no relevant documents" answer
    #[serde(default = "default_no_hit_patterns")]
    pub no_hit_patterns: Vec<String>,

    /// Phrases that mark a turn as a decision worth summarizing
    #[serde(default = "default_decision_keywords")]
    pub decision_keywords: Vec<String>,

    /// Phrases that veto decision detection
    #[serde(default = "default_negative_keywords")]
    pub negative_keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second (per client IP)
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_concurrent() -> usize { 100 }
fn default_max_connections() -> u32 { 50 }
fn default_min_connections() -> u32 { 5 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_search_url() -> String { "http://localhost:8001".to_string() }
fn default_reranker_url() -> String { "http://localhost:8002".to_string() }
fn default_sidecar_timeout() -> u64 { 10 }
fn default_keyword_top_k() -> usize { 10 }
fn default_vector_top_k() -> usize { 10 }
fn default_score_min() -> f64 { 0.2 }
fn default_rerank_top_k() -> usize { 3 }
fn default_generation_url() -> String { "http://localhost:8000/v1/generate".to_string() }
fn default_generation_model() -> String { "qwen3-32b".to_string() }
fn default_generation_timeout() -> u64 { 120 }
fn default_context_limit() -> usize { 32768 }
fn default_min_output_tokens() -> usize { 512 }
fn default_max_output_tokens() -> usize { 8192 }
fn default_safety_margin() -> usize { 1024 }
fn default_multiturn_turns() -> usize { 3 }
fn default_frame_buffer() -> usize { 256 }
fn default_temperature() -> f64 { 0.7 }
fn default_top_p() -> f64 { 0.9 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "ragline".to_string() }
fn default_rate_limit() -> u32 { 50 }
fn default_burst() -> u32 { 100 }
fn default_enabled() -> bool { true }

fn default_prompt() -> String {
    "You are a careful assistant. Answer using only the supplied context; \
     if the context does not cover the question, say that you couldn't find \
     any relevant documents."
        .to_string()
}

fn default_no_hit_patterns() -> Vec<String> {
    vec![
        r"(?i)couldn'?t find any relevant documents".to_string(),
        r"(?i)could not find any relevant documents".to_string(),
        r"(?i)no relevant documents were found".to_string(),
        r"(?i)can only answer questions about the provided documents".to_string(),
    ]
}

fn default_decision_keywords() -> Vec<String> {
    [
        "decided", "decision", "we will use", "going with", "switch to",
        "adopt", "apply this", "from now on", "in summary", "to summarize",
        "conclusion", "final answer",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_negative_keywords() -> Vec<String> {
    [
        "considering", "thinking about", "not sure", "maybe", "might",
        "tentative", "for now", "temporarily", "undecided", "open question",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?

            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__SERVER__PORT=8081
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                request_timeout_secs: default_request_timeout(),
                shutdown_timeout_secs: default_shutdown_timeout(),
                max_concurrent_requests: default_max_concurrent(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/ragline".to_string(),
                read_url: None,
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
            },
            search: SearchConfig {
                base_url: default_search_url(),
                timeout_secs: default_sidecar_timeout(),
                keyword_top_k: default_keyword_top_k(),
                vector_top_k: default_vector_top_k(),
                score_min: default_score_min(),
            },
            reranker: RerankerConfig {
                base_url: default_reranker_url(),
                timeout_secs: default_sidecar_timeout(),
                top_k: default_rerank_top_k(),
            },
            generation: GenerationConfig {
                url: default_generation_url(),
                model: default_generation_model(),
                timeout_secs: default_generation_timeout(),
                context_limit_tokens: default_context_limit(),
                min_output_tokens: default_min_output_tokens(),
                max_output_tokens: default_max_output_tokens(),
                safety_margin_tokens: default_safety_margin(),
            },
            answer: AnswerConfig {
                multiturn_turns: default_multiturn_turns(),
                frame_buffer: default_frame_buffer(),
                default_prompt: default_prompt(),
                default_temperature: default_temperature(),
                default_top_p: default_top_p(),
                no_hit_patterns: default_no_hit_patterns(),
                decision_keywords: default_decision_keywords(),
                negative_keywords: default_negative_keywords(),
            },
            observability: ObservabilityConfig {
                log_level: default_log_level(),
                json_logging: default_json_logging(),
                metrics_port: default_metrics_port(),
                service_name: default_service_name(),
            },
            rate_limit: RateLimitConfig {
                requests_per_second: default_rate_limit(),
                burst: default_burst(),
                enabled: default_enabled(),
            },
        }
    }
}
