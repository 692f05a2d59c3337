//! Research orchestrator
//!
//! Runs one worker per context on a bounded pool. Workers share only the job
//! budget; their results are merged once every worker has terminated.

pub mod prompts;
pub mod query;
mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;

use crate::model::{
    AnalysisConfig, AnalysisContext, Claim, ContextResearchReport, EvidenceFact, FetchedSource,
    RetrieverConfig,
};
use crate::retriever::{Fetcher, RetrieverError, SearchProvider};
use crate::service::budget::SharedBudget;
use crate::service::llm::CompletionProvider;
use crate::service::provenance::ProvenanceValidator;

use worker::{CallError, ContextOutcome, ContextWorker, fetch_sources, select_candidates, with_retries};


/// Collaborators and settings shared by every research worker of the process
pub struct ResearchDeps {
    pub search: Arc<dyn SearchProvider>,
    /// Queried before standard search when `grounded_search` is enabled
    pub grounded_search: Option<Arc<dyn SearchProvider>>,
    pub fetcher: Arc<dyn Fetcher>,
    pub llm: Arc<dyn CompletionProvider>,
    pub validator: ProvenanceValidator,
    pub policy: RetrieverConfig,
    pub config: Arc<AnalysisConfig>,
}

/// Merged research result of a job, sorted by context id
#[derive(Debug, Default)]
pub struct ResearchOutcome {
    pub sources: Vec<FetchedSource>,
    pub facts: Vec<EvidenceFact>,
    pub reports: Vec<ContextResearchReport>,
}

#[derive(Clone)]
pub struct ResearchOrchestrator {
    deps: Arc<ResearchDeps>,
}

impl ResearchOrchestrator {
    pub fn new(deps: ResearchDeps) -> Self {
        Self { deps: Arc::new(deps) }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.deps.config
    }

    pub fn validator(&self) -> &ProvenanceValidator {
        &self.deps.validator
    }

    pub fn llm(&self) -> &dyn CompletionProvider {
        self.deps.llm.as_ref()
    }

    /// Deadline of a job starting now
    pub fn job_deadline(&self) -> Instant {
        Instant::now() + Duration::from_secs(self.deps.config.research.job_timeout_secs)
    }

    /// Research every context except `UNSCOPED`
    pub async fn research(
        &self,
        contexts: &[AnalysisContext],
        claims: &[Claim],
        budget: &SharedBudget,
        deadline: Instant,
    ) -> ResearchOutcome {
        let settings = &self.deps.config.research;
        let targets: Vec<&AnalysisContext> = contexts.iter().filter(|c| !c.is_unscoped()).collect();
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_contexts.max(1)));
        let (tx, mut rx) = mpsc::channel::<ContextOutcome>(targets.len().max(1));

        tracing::info!(
            contexts = targets.len(),
            max_concurrent = settings.max_concurrent_contexts,
            "Starting research"
        );

        let mut handles = Vec::with_capacity(targets.len());
        for context in targets {
            let context_claims: Vec<Claim> = claims
                .iter()
                .filter(|c| c.context_id == context.id)
                .cloned()
                .collect();
            let worker = ContextWorker::new(
                Arc::clone(&self.deps),
                context.clone(),
                context_claims,
                budget.clone(),
                deadline,
            );
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();

            let handle = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let outcome = worker.run().await;
                let _ = tx.send(outcome).await;
            });
            handles.push((context.id.clone(), handle));
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(handles.len());
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }

        // A crashed worker never reports; give its context a failed report
        for (context_id, handle) in handles {
            if let Err(e) = handle.await
                && !outcomes.iter().any(|o| o.report.context_id == context_id)
            {
                tracing::error!(context_id = %context_id, error = %e, "Research worker crashed");
                outcomes.push(ContextOutcome::failed(
                    &context_id,
                    format!("research worker crashed: {}", e),
                    settings,
                ));
            }
        }

        merge(outcomes)
    }

    /// Search and fetch for one query outside the per-context loop (tool-loop strategies).
    /// Uses the same retry, URL policy and ranking as context research.
    pub async fn gather(
        &self,
        query: &str,
        seen_urls: &mut HashSet<String>,
        deadline: Instant,
    ) -> Result<Vec<FetchedSource>, RetrieverError> {
        let settings = &self.deps.config.research;
        let search = Arc::clone(&self.deps.search);
        let limit = settings.max_search_results;

        let hits = match with_retries(
            settings.fetch_retries,
            settings.retry_backoff_ms,
            deadline,
            RetrieverError::is_transient,
            || search.search(query, limit),
        )
        .await
        {
            Ok(hits) => hits,
            Err(CallError::Failed(e)) => return Err(e),
            Err(CallError::Deadline) => return Ok(Vec::new()),
        };

        let candidates = select_candidates(&self.deps, hits, seen_urls);
        let batch = fetch_sources(&self.deps, candidates, deadline).await;
        for (url, e) in &batch.failures {
            tracing::warn!(url = %url, error = %e, "Fetch failed after retries");
        }
        Ok(batch.fetched)
    }
}

/// Merge worker outcomes: sources deduplicated by URL, facts by id, all sorted
fn merge(mut outcomes: Vec<ContextOutcome>) -> ResearchOutcome {
    outcomes.sort_by(|a, b| a.report.context_id.cmp(&b.report.context_id));

    let mut sources: HashMap<String, FetchedSource> = HashMap::new();
    let mut facts: HashMap<String, EvidenceFact> = HashMap::new();
    let mut reports = Vec::with_capacity(outcomes.len());

    for outcome in outcomes {
        for source in outcome.sources {
            sources.entry(source.url.clone()).or_insert(source);
        }
        for fact in outcome.facts {
            facts.entry(fact.id.clone()).or_insert(fact);
        }
        reports.push(outcome.report);
    }

    let mut sources: Vec<FetchedSource> = sources.into_values().collect();
    sources.sort_by(|a, b| a.url.cmp(&b.url));
    let mut facts: Vec<EvidenceFact> = facts.into_values().collect();
    facts.sort_by(|a, b| a.context_id.cmp(&b.context_id).then_with(|| a.id.cmp(&b.id)));

    ResearchOutcome {
        sources,
        facts,
        reports,
    }
}

fn short_hash(input: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(input.as_bytes()));
    digest[..12].to_string()
}

/// Stable source id derived from the URL
pub fn source_id_for(url: &str) -> String {
    format!("S_{}", short_hash(url))
}

/// Stable fact id derived from context, URL and whitespace-normalized excerpt
pub fn fact_id_for(context_id: &str, url: &str, excerpt: &str) -> String {
    let excerpt = excerpt.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("F_{}", short_hash(&format!("{}|{}|{}", context_id, url, excerpt)))
}
