//! Search and fetch collaborators used by the research orchestrator

mod brave;
mod reliability;
mod web;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::{GroundingMetadata, SourceCategory};

pub use brave::BraveSearchProvider;
pub use reliability::{rank_hits, reliability_score};
pub use web::WebFetcher;

/// Identifies this service to remote hosts
const USER_AGENT: &str = "factharbor-engine/1.0";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RetrieverError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Search provider not configured (missing {0})")]
    NotConfigured(&'static str),
}

impl RetrieverError {
    /// Worth another attempt after backoff
    pub fn is_transient(&self) -> bool {
        match self {
            RetrieverError::HttpError(e) => !e.is_builder() && !e.is_decode(),
            RetrieverError::RateLimited => true,
            _ => false,
        }
    }
}

/// Fetch failures, split by how the orchestrator reacts
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FetchError {
    /// Network or upstream failure; retried with backoff
    #[error("transport failure: {0}")]
    Transport(String),

    /// The document exists but carries no usable text; skipped
    #[error("document is empty: {0}")]
    Empty(String),

    /// Permanently unavailable (blocked, not found, bad status); skipped
    #[error("document unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport(_))
    }
}

impl From<RetrieverError> for FetchError {
    fn from(e: RetrieverError) -> Self {
        if e.is_transient() {
            FetchError::Transport(e.to_string())
        } else {
            FetchError::Unavailable(e.to_string())
        }
    }
}

/// One search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub snippet: String,
    pub title: Option<String>,
    pub category: SourceCategory,
    pub grounding: Option<GroundingMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Html,
    Markdown,
    Json,
    Text,
}

/// Normalized content of a fetched URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedDocument {
    /// Markdown for HTML pages, the raw body otherwise
    pub text: String,
    pub content_type: ContentType,
    pub title: Option<String>,
}

/// Web search collaborator
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, RetrieverError>;

    /// Category assigned to every hit of this provider
    fn category(&self) -> SourceCategory {
        SourceCategory::StandardSearch
    }
}

/// Document fetch collaborator
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedDocument, FetchError>;
}

/// Convert HTML to Markdown
fn html_to_markdown(html: &str) -> String {
    htmd::convert(html).unwrap_or_else(|_| html.to_string())
}

fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
