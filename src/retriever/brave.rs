//! Brave Search web search provider

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{RetrieverError, SearchHit, SearchProvider, http_client};
use crate::model::SourceCategory;

pub const ENV_BRAVE_SEARCH_API_KEY: &str = "BRAVE_SEARCH_API_KEY";

const BRAVE_SEARCH_URL: &str = "https://api.search.brave.com/res/v1/web/search";

/// The API rejects larger page sizes
const MAX_COUNT: usize = 20;

const SEARCH_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWebResults>,
}

#[derive(Debug, Deserialize)]
struct BraveWebResults {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Standard web search backed by the Brave Search API
pub struct BraveSearchProvider {
    client: Client,
    api_key: String,
}

impl BraveSearchProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: http_client(SEARCH_TIMEOUT_SECS),
            api_key: api_key.into(),
        }
    }

    /// Build from `BRAVE_SEARCH_API_KEY`
    pub fn from_env() -> Result<Self, RetrieverError> {
        std::env::var(ENV_BRAVE_SEARCH_API_KEY)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(Self::new)
            .ok_or(RetrieverError::NotConfigured(ENV_BRAVE_SEARCH_API_KEY))
    }

    fn into_hits(response: BraveResponse, limit: usize) -> Vec<SearchHit> {
        response
            .web
            .map(|w| w.results)
            .unwrap_or_default()
            .into_iter()
            .take(limit)
            .map(|r| SearchHit {
                url: r.url,
                snippet: r.description.map(|d| strip_tags(&d)).unwrap_or_default(),
                title: r.title,
                category: SourceCategory::StandardSearch,
                grounding: None,
            })
            .collect()
    }
}

#[async_trait]
impl SearchProvider for BraveSearchProvider {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, RetrieverError> {
        let count = limit.clamp(1, MAX_COUNT).to_string();
        tracing::debug!(query = %query, count = %count, "Brave web search");

        let response = self
            .client
            .get(BRAVE_SEARCH_URL)
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .query(&[("q", query), ("count", count.as_str())])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!(query = %query, "Search rate limited");
            return Err(RetrieverError::RateLimited);
        }

        if !response.status().is_success() {
            return Err(RetrieverError::ParseError(format!(
                "HTTP {} from search provider",
                response.status()
            )));
        }

        let body: BraveResponse = response
            .json()
            .await
            .map_err(|e| RetrieverError::ParseError(e.to_string()))?;

        Ok(Self::into_hits(body, limit))
    }
}

/// Snippets carry `<strong>` highlighting
fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}
