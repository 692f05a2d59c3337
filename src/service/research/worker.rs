//! Research state machine of a single context
//!
//! Iterations within a context run sequentially. Every network or model call
//! is bounded by the job deadline; the deadline is also checked before each
//! iteration and after each fetch and extraction unit.

use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use url::Url;

use super::query::{NextQuery, QueryPlanner};
use super::{ResearchDeps, fact_id_for, source_id_for};
use crate::model::{
    AnalysisContext, BudgetExceedReason, Claim, ContextResearchReport, EvidenceFact, ExtractedFacts,
    FetchedSource, ResearchPhase, ResearchSettings, UNSCOPED_ID,
};
use crate::retriever::{FetchError, FetchedDocument, RetrieverError, SearchHit, rank_hits, reliability_score};
use crate::service::budget::SharedBudget;
use crate::service::llm::{LlmError, RetryPolicy, complete_structured};
use crate::service::provenance::validate_source_url;

use super::prompts::{EXTRACTION_SYSTEM_PROMPT, build_extraction_prompt};

/// Everything one context worker produced
#[derive(Debug)]
pub struct ContextOutcome {
    pub report: ContextResearchReport,
    pub sources: Vec<FetchedSource>,
    pub facts: Vec<EvidenceFact>,
}

impl ContextOutcome {
    /// Report for a context whose worker died before producing anything
    pub fn failed(context_id: &str, note: String, settings: &ResearchSettings) -> Self {
        Self {
            report: ContextResearchReport {
                context_id: context_id.to_string(),
                phase: ResearchPhase::Exhausted,
                iterations: 0,
                facts_added: 0,
                sources_fetched: 0,
                failures: vec![note],
                confidence_penalty: failure_penalty(1, settings),
            },
            sources: Vec::new(),
            facts: Vec::new(),
        }
    }
}

/// Why an iteration stopped the worker early
enum Halt {
    Deadline,
    Budget(BudgetExceedReason),
}

pub(super) enum CallError<E> {
    Failed(E),
    Deadline,
}

pub(super) struct ContextWorker {
    deps: Arc<ResearchDeps>,
    context: AnalysisContext,
    claims: Vec<Claim>,
    budget: SharedBudget,
    deadline: Instant,
    phase: ResearchPhase,
    iterations: u32,
    planner: QueryPlanner,
    resolved: HashSet<usize>,
    seen_urls: HashSet<String>,
    fact_ids: HashSet<String>,
    facts: Vec<EvidenceFact>,
    sources: Vec<FetchedSource>,
    failures: Vec<String>,
    rejected_facts: usize,
}

impl ContextWorker {
    pub fn new(
        deps: Arc<ResearchDeps>,
        context: AnalysisContext,
        claims: Vec<Claim>,
        budget: SharedBudget,
        deadline: Instant,
    ) -> Self {
        Self {
            deps,
            context,
            claims,
            budget,
            deadline,
            phase: ResearchPhase::Pending,
            iterations: 0,
            planner: QueryPlanner::new(),
            resolved: HashSet::new(),
            seen_urls: HashSet::new(),
            fact_ids: HashSet::new(),
            facts: Vec::new(),
            sources: Vec::new(),
            failures: Vec::new(),
            rejected_facts: 0,
        }
    }

    fn settings(&self) -> &ResearchSettings {
        &self.deps.config.research
    }

    fn transition(&mut self, next: ResearchPhase) {
        if self.phase.can_transition_to(next) {
            self.phase = next;
        } else {
            tracing::error!(
                context_id = %self.context.id,
                from = ?self.phase,
                to = ?next,
                "Invalid research phase transition"
            );
        }
    }

    fn context_fact_count(&self) -> usize {
        self.facts.iter().filter(|f| f.context_id == self.context.id).count()
    }

    pub async fn run(mut self) -> ContextOutcome {
        let started = std::time::Instant::now();
        tracing::debug!(context_id = %self.context.id, claims = self.claims.len(), "Context research started");

        loop {
            if Instant::now() >= self.deadline {
                self.on_deadline();
                break;
            }

            let query = match self.planner.next(&self.context, &self.claims, &self.resolved) {
                NextQuery::Query(q) => q,
                NextQuery::AllResolved => {
                    self.transition(ResearchPhase::Converged);
                    break;
                }
                NextQuery::OutOfQueries => {
                    self.transition(ResearchPhase::Exhausted);
                    break;
                }
            };

            let check = self.budget.try_begin_iteration(&self.context.id);
            if !check.allowed {
                tracing::info!(
                    context_id = %self.context.id,
                    reason = ?check.reason,
                    "Iteration budget exhausted"
                );
                self.transition(ResearchPhase::BudgetExceeded);
                break;
            }
            self.iterations += 1;

            match self.iterate(&query).await {
                Ok(0) if self.context_fact_count() > 0 => {
                    self.transition(ResearchPhase::Converged);
                    break;
                }
                Ok(_) => {}
                Err(Halt::Deadline) => {
                    self.on_deadline();
                    break;
                }
                Err(Halt::Budget(reason)) => {
                    tracing::info!(context_id = %self.context.id, reason = %reason, "Token budget exhausted");
                    self.transition(ResearchPhase::BudgetExceeded);
                    break;
                }
            }
        }

        if !self.phase.is_terminal() {
            self.transition(ResearchPhase::Exhausted);
        }

        let facts_added = self.context_fact_count();
        tracing::info!(
            context_id = %self.context.id,
            phase = ?self.phase,
            iterations = self.iterations,
            facts = facts_added,
            rejected_facts = self.rejected_facts,
            sources = self.sources.len(),
            failures = self.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Context research finished"
        );

        let confidence_penalty = failure_penalty(self.failures.len(), self.settings());
        ContextOutcome {
            report: ContextResearchReport {
                context_id: self.context.id.clone(),
                phase: self.phase,
                iterations: self.iterations,
                facts_added,
                sources_fetched: self.sources.len(),
                failures: self.failures,
                confidence_penalty,
            },
            sources: self.sources,
            facts: self.facts,
        }
    }

    fn on_deadline(&mut self) {
        tracing::warn!(context_id = %self.context.id, "Job deadline elapsed, keeping partial results");
        self.budget.mark_exceeded(BudgetExceedReason::Timeout {
            seconds: self.settings().job_timeout_secs,
        });
        self.transition(ResearchPhase::BudgetExceeded);
    }

    fn checkpoint(&self) -> Result<(), Halt> {
        if Instant::now() >= self.deadline {
            Err(Halt::Deadline)
        } else {
            Ok(())
        }
    }

    /// One search, fetch and extract round. Returns the number of new context facts.
    async fn iterate(&mut self, query: &str) -> Result<usize, Halt> {
        self.transition(ResearchPhase::Searching);
        let hits = self.search(query).await?;
        let candidates = select_candidates(&self.deps, hits, &mut self.seen_urls);

        self.transition(ResearchPhase::Fetching);
        let fetched = self.fetch_all(candidates).await?;
        if fetched.is_empty() {
            return Ok(0);
        }

        self.transition(ResearchPhase::Extracting);
        let mut added = 0;
        let mut pending = fetched.into_iter();
        while let Some(source) = pending.next() {
            if let Err(halt) = self.checkpoint() {
                self.sources.push(source);
                self.sources.extend(pending);
                return Err(halt);
            }
            let result = self.extract(&source).await;
            self.sources.push(source);
            match result {
                Ok(n) => added += n,
                Err(halt) => {
                    self.sources.extend(pending);
                    return Err(halt);
                }
            }
        }

        tracing::debug!(context_id = %self.context.id, query = %query, new_facts = added, "Iteration complete");
        Ok(added)
    }

    /// Grounded search first when enabled; its batch must pass provenance or
    /// the query is re-issued through standard search
    async fn search(&mut self, query: &str) -> Result<Vec<SearchHit>, Halt> {
        let limit = self.settings().max_search_results;
        let (retries, backoff) = (self.settings().fetch_retries, self.settings().retry_backoff_ms);

        if self.settings().grounded_search
            && let Some(grounded) = self.deps.grounded_search.clone()
        {
            let result = with_retries(retries, backoff, self.deadline, RetrieverError::is_transient, || {
                grounded.search(query, limit)
            })
            .await;

            match result {
                Ok(hits) if !hits.is_empty() => {
                    let provisional: Vec<FetchedSource> = hits.iter().map(provisional_source).collect();
                    let check = self.deps.validator.validate_source_batch(&provisional);
                    if !check.should_fallback_to_external_search {
                        return Ok(hits);
                    }
                    tracing::info!(
                        context_id = %self.context.id,
                        rejected = check.rejected.len(),
                        "Grounded results failed provenance, using standard search"
                    );
                }
                Ok(_) => {}
                Err(CallError::Deadline) => return Err(Halt::Deadline),
                Err(CallError::Failed(e)) => {
                    tracing::warn!(context_id = %self.context.id, error = %e, "Grounded search failed, using standard search");
                }
            }
        }

        let search = Arc::clone(&self.deps.search);
        match with_retries(retries, backoff, self.deadline, RetrieverError::is_transient, || {
            search.search(query, limit)
        })
        .await
        {
            Ok(hits) => Ok(hits),
            Err(CallError::Deadline) => Err(Halt::Deadline),
            Err(CallError::Failed(e)) => {
                tracing::warn!(context_id = %self.context.id, query = %query, error = %e, "Search failed");
                self.failures.push(format!("search failed for '{}': {}", query, e));
                Ok(Vec::new())
            }
        }
    }

    async fn fetch_all(&mut self, candidates: Vec<(Url, SearchHit)>) -> Result<Vec<FetchedSource>, Halt> {
        let batch = fetch_sources(&self.deps, candidates, self.deadline).await;

        for (url, e) in batch.failures {
            tracing::warn!(context_id = %self.context.id, url = %url, error = %e, "Fetch failed after retries");
            self.failures.push(format!("fetch failed for {}: {}", url, e));
        }

        if batch.deadline_hit || self.checkpoint().is_err() {
            self.sources.extend(batch.fetched);
            return Err(Halt::Deadline);
        }

        Ok(batch.fetched)
    }

    /// Extract facts from one source; each fact passes provenance and grounding or is dropped
    async fn extract(&mut self, source: &FetchedSource) -> Result<usize, Halt> {
        let prompt = build_extraction_prompt(&self.context, &self.claims, &source.url, &source.full_text);
        let retry = RetryPolicy::from_config(&self.deps.config);

        let call = complete_structured::<ExtractedFacts>(
            self.deps.llm.as_ref(),
            &self.budget,
            EXTRACTION_SYSTEM_PROMPT,
            &prompt,
            retry,
        );
        let extracted = match tokio::time::timeout_at(self.deadline, call).await {
            Err(_) => return Err(Halt::Deadline),
            Ok(Ok(extracted)) => extracted,
            Ok(Err(LlmError::Budget(reason))) => return Err(Halt::Budget(reason)),
            Ok(Err(e)) => {
                tracing::warn!(context_id = %self.context.id, url = %source.url, error = %e, "Fact extraction failed");
                self.failures.push(format!("extraction failed for {}: {}", source.url, e));
                return Ok(0);
            }
        };

        let mut added = 0;
        for candidate in extracted.facts {
            let context_id = if candidate.relevant_to_context {
                self.context.id.clone()
            } else {
                UNSCOPED_ID.to_string()
            };
            let excerpt = candidate.excerpt.trim().to_string();
            let fact = EvidenceFact {
                id: fact_id_for(&context_id, &source.url, &excerpt),
                text: candidate.text.trim().to_string(),
                source_id: source.id.clone(),
                source_url: source.url.clone(),
                source_excerpt: excerpt,
                context_id,
            };

            let check = self.deps.validator.validate_fact_against_source(&fact, &source.full_text);
            if !check.valid {
                self.rejected_facts += 1;
                tracing::debug!(
                    context_id = %self.context.id,
                    source_url = %fact.source_url,
                    severity = ?check.severity,
                    reason = ?check.reason,
                    "Extracted fact rejected by provenance gate"
                );
                continue;
            }
            if !self.fact_ids.insert(fact.id.clone()) {
                continue;
            }

            if candidate.relevant_to_context {
                added += 1;
                if self.claims.is_empty() {
                    self.resolved.insert(0);
                }
                self.resolved.extend(
                    candidate
                        .supports_claims
                        .iter()
                        .copied()
                        .filter(|&i| i < self.claims.len()),
                );
            }
            self.facts.push(fact);
        }

        Ok(added)
    }
}

/// Public, allowed, unseen URLs ranked by reliability, capped per iteration
pub(super) fn select_candidates(
    deps: &ResearchDeps,
    hits: Vec<SearchHit>,
    seen_urls: &mut HashSet<String>,
) -> Vec<(Url, SearchHit)> {
    let max = deps.config.research.max_sources_per_iteration;
    let mut selected = Vec::new();

    for hit in rank_hits(hits) {
        if selected.len() >= max {
            break;
        }
        let url = match validate_source_url(&hit.url) {
            Ok(url) => url,
            Err(reason) => {
                tracing::debug!(url = %hit.url, reason = %reason, "Skipping search hit");
                continue;
            }
        };
        if !deps.policy.is_url_allowed(&url) {
            tracing::debug!(url = %url, "URL blocked by configuration");
            continue;
        }
        if !seen_urls.insert(url.to_string()) {
            continue;
        }
        selected.push((url, hit));
    }

    selected
}

/// Result of one capped fetch fan-out
pub(super) struct FetchBatch {
    pub fetched: Vec<FetchedSource>,
    /// Transport failures that survived every retry
    pub failures: Vec<(Url, String)>,
    pub deadline_hit: bool,
}

/// Fetch candidates concurrently, retrying transport failures
pub(super) async fn fetch_sources(
    deps: &ResearchDeps,
    candidates: Vec<(Url, SearchHit)>,
    deadline: Instant,
) -> FetchBatch {
    let settings = &deps.config.research;
    let (retries, backoff) = (settings.fetch_retries, settings.retry_backoff_ms);

    let results = join_all(candidates.into_iter().map(|(url, hit)| {
        let fetcher = Arc::clone(&deps.fetcher);
        async move {
            let result = with_retries(retries, backoff, deadline, FetchError::is_retryable, || {
                fetcher.fetch(&url)
            })
            .await;
            (url, hit, result)
        }
    }))
    .await;

    let mut batch = FetchBatch {
        fetched: Vec::new(),
        failures: Vec::new(),
        deadline_hit: false,
    };
    for (url, hit, result) in results {
        match result {
            Ok(doc) => batch.fetched.push(to_source(url, hit, doc, settings.max_source_chars)),
            Err(CallError::Deadline) => batch.deadline_hit = true,
            Err(CallError::Failed(FetchError::Transport(e))) => batch.failures.push((url, e)),
            Err(CallError::Failed(e)) => {
                tracing::debug!(url = %url, error = %e, "Skipping source");
            }
        }
    }
    batch
}

fn to_source(url: Url, hit: SearchHit, doc: FetchedDocument, max_chars: usize) -> FetchedSource {
    let full_text = if doc.text.chars().count() > max_chars {
        doc.text.chars().take(max_chars).collect()
    } else {
        doc.text
    };

    FetchedSource {
        id: source_id_for(url.as_str()),
        url: url.to_string(),
        title: doc.title.or(hit.title),
        full_text,
        category: hit.category,
        reliability_score: reliability_score(&url),
        grounding: hit.grounding,
    }
}

/// Candidate sources built from grounded hits, used for the batch provenance check
fn provisional_source(hit: &SearchHit) -> FetchedSource {
    FetchedSource {
        id: source_id_for(&hit.url),
        url: hit.url.clone(),
        title: hit.title.clone(),
        full_text: String::new(),
        category: hit.category,
        reliability_score: 0.0,
        grounding: hit.grounding.clone(),
    }
}

/// Confidence removed from a context per recorded failure, capped
pub fn failure_penalty(failures: usize, settings: &ResearchSettings) -> f64 {
    (failures as f64 * settings.failure_penalty_step).min(settings.max_failure_penalty)
}

/// Run `op`, retrying retryable errors with exponential backoff.
/// Every attempt and every wait is bounded by `deadline`.
pub(super) async fn with_retries<T, E, F, Fut>(
    retries: u32,
    backoff_ms: u64,
    deadline: Instant,
    retryable: fn(&E) -> bool,
    mut op: F,
) -> Result<T, CallError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout_at(deadline, op()).await {
            Ok(result) => result,
            Err(_) => return Err(CallError::Deadline),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if retryable(&e) && attempt < retries => {
                let delay = Duration::from_millis(backoff_ms.saturating_mul(1 << attempt));
                attempt += 1;
                tracing::warn!(
                    attempt = attempt,
                    max_retries = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                if Instant::now() + delay >= deadline {
                    return Err(CallError::Deadline);
                }
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(CallError::Failed(e)),
        }
    }
}
