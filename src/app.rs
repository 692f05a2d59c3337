//! Application state and service initialization
//!
//! This module centralizes all service initialization and dependency injection,
//! making it easier to manage the application lifecycle and test services.

use std::sync::Arc;

use crate::db::{MemoryRunStore, PgRunStore, RunStore};
use crate::model::{AnalysisConfig, Config, RetrieverConfig};
use crate::retriever::{BraveSearchProvider, Fetcher, SearchProvider, WebFetcher};
use crate::service::llm::{CompletionProvider, DEFAULT_MODEL};
use crate::service::{
    AnalysisService, CachedFetcher, CachedSearch, LlmClient, PipelineDispatcher,
    ProvenanceValidator, ResearchDeps, ResearchOrchestrator, RigCompletionProvider, SourceCache,
};

const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
const ENV_LLM_MODEL: &str = "FACTHARBOR_LLM_MODEL";
/// Set to `memory` to keep runs in process instead of PostgreSQL
const ENV_RUN_STORE: &str = "FACTHARBOR_RUN_STORE";

/// Application state containing all services and shared resources
pub struct AppState {
    /// Redis cache (optional)
    pub cache: Option<SourceCache>,
    /// Analysis job service
    pub analysis_service: AnalysisService,
}

impl AppState {
    /// Initialize all services and build application state
    ///
    /// This performs:
    /// 1. Run store initialization (PostgreSQL unless the memory store is selected)
    /// 2. Redis cache initialization (optional)
    /// 3. LLM client initialization (requires OPENAI_API_KEY)
    /// 4. Search provider initialization (requires BRAVE_SEARCH_API_KEY)
    /// 5. Research and pipeline dependency graph construction
    pub async fn new(config: Config) -> Result<Self, AppError> {
        let store = Self::build_run_store().await?;

        // Initialize Redis cache (optional - will log warning if Redis is unavailable)
        let cache = match SourceCache::new().await {
            Ok(cache) => {
                tracing::info!("Redis cache enabled");
                Some(cache)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis cache unavailable, running without cache");
                None
            }
        };

        let api_key = std::env::var(ENV_OPENAI_API_KEY)
            .map_err(|_| AppError::MissingConfig(ENV_OPENAI_API_KEY))?;

        let llm_client = LlmClient::new(&api_key)
            .map_err(|_| AppError::InvalidConfig("Invalid OPENAI_API_KEY"))?;

        let model = std::env::var(ENV_LLM_MODEL).unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        tracing::info!(model = %model, "LLM provider configured");
        let llm: Arc<dyn CompletionProvider> = Arc::new(RigCompletionProvider::new(llm_client, model));

        let search = BraveSearchProvider::from_env()
            .map_err(|_| AppError::MissingConfig("BRAVE_SEARCH_API_KEY"))?;

        let orchestrator = Self::build_orchestrator(
            config.analysis,
            config.retrievers,
            Arc::new(search),
            Arc::new(WebFetcher::new()),
            llm,
            cache.clone(),
        );

        let dispatcher = Arc::new(PipelineDispatcher::new(orchestrator));
        tracing::info!(default_variant = %dispatcher.default_variant(), "Pipeline dispatcher ready");

        Ok(Self {
            cache,
            analysis_service: AnalysisService::new(dispatcher, store),
        })
    }

    async fn build_run_store() -> Result<Arc<dyn RunStore>, AppError> {
        if std::env::var(ENV_RUN_STORE).is_ok_and(|v| v.eq_ignore_ascii_case("memory")) {
            tracing::warn!("Using in-memory run store, runs are lost on restart");
            return Ok(Arc::new(MemoryRunStore::new()));
        }

        let db_pool = crate::db::create_pool()
            .await
            .map_err(|e| AppError::DatabaseInit(e.to_string()))?;

        crate::db::init_schema(&db_pool)
            .await
            .map_err(|e| AppError::DatabaseInit(e.to_string()))?;

        Ok(Arc::new(PgRunStore::new(db_pool)))
    }

    /// Build the research orchestrator, wrapping retrievers in the cache when enabled
    fn build_orchestrator(
        analysis: AnalysisConfig,
        policy: RetrieverConfig,
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn Fetcher>,
        llm: Arc<dyn CompletionProvider>,
        cache: Option<SourceCache>,
    ) -> ResearchOrchestrator {
        let (search, fetcher): (Arc<dyn SearchProvider>, Arc<dyn Fetcher>) = match cache {
            Some(cache) => (
                Arc::new(CachedSearch::new(search, cache.clone())),
                Arc::new(CachedFetcher::new(fetcher, cache)),
            ),
            None => (search, fetcher),
        };

        ResearchOrchestrator::new(ResearchDeps {
            search,
            grounded_search: None,
            fetcher,
            llm,
            validator: ProvenanceValidator::new(&analysis.provenance),
            policy,
            config: Arc::new(analysis),
        })
    }
}

/// Application-level errors
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AppError {
    /// Database initialization failed
    #[error("Database initialization failed: {0}")]
    DatabaseInit(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingConfig(&'static str),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
