//! Generic web page fetcher

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use url::Url;

use super::{ContentType, FetchError, FetchedDocument, Fetcher, RetrieverError, html_to_markdown, http_client};

/// Per-request timeout; the job deadline bounds the whole fetch as well
const FETCH_TIMEOUT_SECS: u64 = 30;

/// Fetches any http(s) URL and normalizes HTML to Markdown
pub struct WebFetcher {
    client: Client,
}

impl WebFetcher {
    pub fn new() -> Self {
        Self {
            client: http_client(FETCH_TIMEOUT_SECS),
        }
    }

    /// Extract title from <title> or <meta property="og:title">
    fn extract_title(document: &Html) -> Option<String> {
        if let Ok(selector) = Selector::parse("title")
            && let Some(el) = document.select(&selector).next()
        {
            let title = el.text().collect::<String>().trim().to_string();
            if !title.is_empty() {
                return Some(title);
            }
        }

        Self::extract_meta_property(document, "og:title")
    }

    fn extract_meta_property(document: &Html, property: &str) -> Option<String> {
        let selector = Selector::parse(&format!("meta[property=\"{}\"]", property)).ok()?;
        document
            .select(&selector)
            .next()
            .and_then(|el| el.value().attr("content"))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Turn a response body into a document; HTML becomes Markdown
    fn normalize(url: &Url, content_type_header: &str, raw: String) -> Result<FetchedDocument, FetchError> {
        let (content_type, text, title) = if content_type_header.contains("application/json") {
            (ContentType::Json, raw, None)
        } else if content_type_header.contains("text/markdown") {
            (ContentType::Markdown, raw, None)
        } else if content_type_header.contains("text/plain") {
            (ContentType::Text, raw, None)
        } else {
            let document = Html::parse_document(&raw);
            let title = Self::extract_title(&document);
            (ContentType::Html, html_to_markdown(&raw), title)
        };

        if text.trim().is_empty() {
            return Err(FetchError::Empty(url.to_string()));
        }

        Ok(FetchedDocument {
            text,
            content_type,
            title,
        })
    }
}

#[async_trait]
impl Fetcher for WebFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedDocument, FetchError> {
        tracing::debug!(url = %url, "Fetching web page");

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(RetrieverError::from)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(RetrieverError::NotFound(url.to_string()).into());
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!(url = %url, "Web request rate limited");
            return Err(RetrieverError::RateLimited.into());
        }
        if status.is_server_error() {
            return Err(FetchError::Transport(format!("HTTP {}: {}", status, url)));
        }
        if !status.is_success() {
            return Err(FetchError::Unavailable(format!("HTTP {}: {}", status, url)));
        }

        let content_type_header = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| "text/html".to_string());

        if content_type_header.contains("application/pdf") || content_type_header.starts_with("image/") {
            return Err(FetchError::Unavailable(format!(
                "unsupported content type {}: {}",
                content_type_header, url
            )));
        }

        let raw = response.text().await.map_err(RetrieverError::from)?;
        Self::normalize(url, &content_type_header, raw)
    }
}

impl Default for WebFetcher {
    fn default() -> Self {
        Self::new()
    }
}
