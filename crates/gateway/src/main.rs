//! Ragline API Gateway
//!
//! The HTTP surface of the answer pipeline.
//! Handles:
//! - Session stream endpoints (SSE push)
//! - Chat, turn, and prompt management
//! - Rate limiting and request routing
//! - Observability (logging, metrics)

mod handlers;
mod middleware;

use axum::{
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use ragline_common::{
    clients::generation::{GenerationClient, HttpGenerationClient},
    clients::rerank::HttpRerankClient,
    clients::search::HttpSearchClient,
    config::AppConfig,
    db::{DbPool, Repository},
    metrics,
};
use ragline_engine::{
    AnswerOrchestrator, ConversationContextResolver, OrchestratorSettings, RerankGate,
    RetrievalCoordinator, RetrievalSettings, StreamRegistry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DbPool,
    pub registry: StreamRegistry,
    pub orchestrator: AnswerOrchestrator,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration, then bring up logging with its settings
    let config = AppConfig::load()?;
    init_tracing(&config);

    info!("Starting Ragline Gateway v{}", ragline_common::VERSION);

    // Initialize metrics and the Prometheus scrape endpoint
    metrics::register_metrics();
    if config.observability.metrics_port != 0 {
        let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()?;
        info!("Prometheus exporter listening on {}", metrics_addr);
    }

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;

    let config = Arc::new(config);
    let state = build_state(config.clone(), db)?;

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wire the answer pipeline against its HTTP collaborators and the database
fn build_state(config: Arc<AppConfig>, db: DbPool) -> anyhow::Result<AppState> {
    let repository = Arc::new(Repository::new(db.clone()));
    let registry = StreamRegistry::new(config.answer.frame_buffer);

    let search = Arc::new(HttpSearchClient::new(
        config.search.base_url.clone(),
        config.search.timeout_secs,
    ));
    let rerank = Arc::new(HttpRerankClient::new(
        config.reranker.base_url.clone(),
        config.reranker.timeout_secs,
    ));
    let generation: Arc<dyn GenerationClient> =
        Arc::new(HttpGenerationClient::new(&config.generation));

    let retrieval = RetrievalCoordinator::new(
        search,
        RetrievalSettings {
            keyword_top_k: config.search.keyword_top_k,
            vector_top_k: config.search.vector_top_k,
            score_min: config.search.score_min,
        },
    );
    let gate = RerankGate::new(rerank, config.reranker.top_k);

    let resolver = ConversationContextResolver::new(
        repository.clone(),
        generation.clone(),
        retrieval,
        gate,
        config.answer.multiturn_turns,
    );

    let orchestrator = AnswerOrchestrator::new(
        resolver,
        generation,
        repository,
        registry.clone(),
        OrchestratorSettings {
            no_hit_patterns: config.answer.no_hit_patterns.clone(),
            decision_keywords: config.answer.decision_keywords.clone(),
            negative_keywords: config.answer.negative_keywords.clone(),
            model: config.generation.model.clone(),
        },
    )?;

    Ok(AppState {
        config,
        db,
        registry,
        orchestrator,
    })
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // API routes
    let api_routes = Router::new()
        // Session streams
        .route("/streams/{session_id}", get(handlers::stream::open_stream))
        .route(
            "/streams/{session_id}",
            delete(handlers::stream::close_stream),
        )
        // Chats and turns
        .route("/chats", post(handlers::chat::create_chat))
        .route("/chats/{chat_id}/turns", get(handlers::chat::list_turns))
        .route("/chats/{chat_id}/ask", post(handlers::chat::ask))
        // Prompt presets
        .route("/prompts", post(handlers::chat::create_prompt));

    // Compose the app
    let app = Router::new()
        // Health endpoints (outside the versioned API)
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .nest("/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(
            middleware::metrics::track_metrics,
        ))
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state.clone());

    if state.config.rate_limit.enabled {
        let limiter = middleware::rate_limit::create_rate_limiter(
            state.config.rate_limit.requests_per_second,
            state.config.rate_limit.burst,
        );
        app.layer(axum::middleware::from_fn(
            move |request: axum::extract::Request, next: axum::middleware::Next| {
                let limiter = limiter.clone();
                async move {
                    middleware::rate_limit::rate_limit_middleware(request, next, limiter).await
                }
            },
        ))
    } else {
        app
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
