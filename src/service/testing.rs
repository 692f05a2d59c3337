//! Hand-written fake collaborators for tests

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::model::{GroundingMetadata, SourceCategory};
use crate::retriever::{
    ContentType, FetchError, FetchedDocument, Fetcher, RetrieverError, SearchHit, SearchProvider,
};
use crate::service::llm::{CompletionProvider, CompletionRequest, CompletionResponse, LlmError, RetryPolicy};

/// Single attempt per structured call
pub const NO_RETRY: RetryPolicy = RetryPolicy {
    schema_retries: 0,
    request_retries: 0,
    backoff_ms: 0,
};

type Responder = Box<dyn Fn(&CompletionRequest) -> Result<Value, LlmError> + Send + Sync>;

/// Completion provider answering per schema name.
///
/// Queued replies are consumed in order; the last one is repeated.
/// A responder function, when set for a schema, takes precedence.
#[derive(Default)]
pub struct ScriptedProvider {
    queued: Mutex<HashMap<String, Vec<Value>>>,
    responders: HashMap<String, Responder>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, schema_name: &str, reply: Value) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(schema_name.to_string())
            .or_default()
            .push(reply);
        self
    }

    pub fn respond<F>(mut self, schema_name: &str, f: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<Value, LlmError> + Send + Sync + 'static,
    {
        self.responders.insert(schema_name.to_string(), Box::new(f));
        self
    }

    pub fn requests_for(&self, schema_name: &str) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.schema_name == schema_name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());

        let content = if let Some(responder) = self.responders.get(&request.schema_name) {
            responder(request)?
        } else {
            let mut queued = self.queued.lock().unwrap();
            match queued.get_mut(&request.schema_name) {
                Some(replies) if replies.len() > 1 => replies.remove(0),
                Some(replies) if replies.len() == 1 => replies[0].clone(),
                _ => {
                    return Err(LlmError::Request(format!(
                        "no scripted reply for {}",
                        request.schema_name
                    )));
                }
            }
        };

        Ok(CompletionResponse {
            content,
            tokens_used: 500,
        })
    }
}

/// Search provider returning fixed hits; routed queries get their own hits
pub struct FakeSearch {
    hits: Vec<SearchHit>,
    routes: Vec<(String, Vec<SearchHit>)>,
    category: SourceCategory,
    fail: bool,
    pub calls: AtomicUsize,
    pub queries: Mutex<Vec<String>>,
}

impl FakeSearch {
    pub fn new(urls: &[&str]) -> Self {
        Self {
            hits: standard_hits(urls),
            routes: Vec::new(),
            category: SourceCategory::StandardSearch,
            fail: false,
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Grounded hits; `grounded` controls whether metadata is attached
    pub fn grounded(urls: &[&str], grounded: bool) -> Self {
        let mut search = Self::new(urls);
        search.category = SourceCategory::GroundedSearch;
        for hit in &mut search.hits {
            hit.category = SourceCategory::GroundedSearch;
            hit.grounding = grounded.then(|| GroundingMetadata {
                query: "q".to_string(),
                supports: vec!["grounded support".to_string()],
            });
        }
        search
    }

    /// Queries containing `needle` get hits for `urls`
    pub fn route(mut self, needle: &str, urls: &[&str]) -> Self {
        self.routes.push((needle.to_string(), standard_hits(urls)));
        self
    }

    pub fn failing() -> Self {
        let mut search = Self::new(&[]);
        search.fail = true;
        search
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for FakeSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, RetrieverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.to_string());
        if self.fail {
            return Err(RetrieverError::RateLimited);
        }
        let hits = self
            .routes
            .iter()
            .find(|(needle, _)| query.contains(needle.as_str()))
            .map(|(_, hits)| hits)
            .unwrap_or(&self.hits);
        Ok(hits.iter().take(limit).cloned().collect())
    }

    fn category(&self) -> SourceCategory {
        self.category
    }
}

fn standard_hits(urls: &[&str]) -> Vec<SearchHit> {
    urls.iter()
        .map(|u| SearchHit {
            url: u.to_string(),
            snippet: String::new(),
            title: None,
            category: SourceCategory::StandardSearch,
            grounding: None,
        })
        .collect()
}

/// Fetcher serving documents from memory
#[derive(Default)]
pub struct FakeFetcher {
    pages: HashMap<String, String>,
    transient_failures: Mutex<HashMap<String, u32>>,
    panic_on: Vec<String>,
    pub calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, text: &str) -> Self {
        self.pages.insert(url.to_string(), text.to_string());
        self
    }

    /// Fail the first `times` fetches of `url` with a transport error
    pub fn flaky(self, url: &str, times: u32) -> Self {
        self.transient_failures
            .lock()
            .unwrap()
            .insert(url.to_string(), times);
        self
    }

    pub fn panicking(mut self, url: &str) -> Self {
        self.panic_on.push(url.to_string());
        self
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedDocument, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = url.as_str();

        if self.panic_on.iter().any(|u| u == key) {
            panic!("fetcher crashed on {}", key);
        }

        {
            let mut failures = self.transient_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(key)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(FetchError::Transport(format!("connection reset: {}", key)));
            }
        }

        match self.pages.get(key) {
            Some(text) if text.trim().is_empty() => Err(FetchError::Empty(key.to_string())),
            Some(text) => Ok(FetchedDocument {
                text: text.clone(),
                content_type: ContentType::Text,
                title: Some(format!("Title of {}", key)),
            }),
            None => Err(FetchError::Unavailable(key.to_string())),
        }
    }
}
