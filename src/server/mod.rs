//! HTTP server and shared application state

use axum::{
    extract::FromRef,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent::AgentLoop;
use crate::api;
use crate::api::chat::ChatCancellationState;
use crate::cache::ResultCache;
use crate::config::Config;
use crate::error::Result;
use crate::gateway::ModelGateway;
use crate::kv::KvStore;
use crate::limiter::RateLimiter;
use crate::search::{PageFetcher, PipelineConfig, SearchPipeline, SearchProvider, Summarizer};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub gateway: Arc<dyn ModelGateway>,
    pub limiter: RateLimiter,
    pub agent: Arc<AgentLoop>,
    pub config: Arc<Config>,
    pub cancellations: ChatCancellationState,
}

impl AppState {
    /// Wire the pipeline from its collaborators. The gateway, search
    /// provider, fetcher, and KV store are injected so tests can substitute
    /// scripted implementations.
    pub fn new(
        pool: SqlitePool,
        gateway: Arc<dyn ModelGateway>,
        provider: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn PageFetcher>,
        kv: Arc<dyn KvStore>,
        config: Config,
    ) -> Self {
        let cache = ResultCache::new(Arc::clone(&kv), config.cache_ttl_secs);
        let summarizer = Summarizer::new(Arc::clone(&gateway), cache);
        let pipeline = SearchPipeline::new(
            provider,
            fetcher,
            summarizer,
            PipelineConfig {
                search_results_count: config.agent.search_results_count,
                max_pages_to_scrape: config.agent.max_pages_to_scrape,
            },
        );
        let agent = Arc::new(AgentLoop::new(Arc::clone(&gateway), pipeline));

        Self {
            pool,
            gateway,
            limiter: RateLimiter::new(kv),
            agent,
            config: Arc::new(config),
            cancellations: ChatCancellationState::new(),
        }
    }
}

impl FromRef<AppState> for SqlitePool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", post(api::chat::chat_handler))
        .route("/chat", get(api::chat::get_chat_handler))
        .route("/chat", delete(api::chat::delete_chat_handler))
        .route("/chats", get(api::chat::list_chats_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server.
pub async fn run(state: AppState, host: &str, port: u16) -> Result<()> {
    let app = router(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("GIT_COMMIT"),
    }))
}
