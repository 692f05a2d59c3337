//! Pipeline dispatcher
//!
//! Selects a strategy per job, falls back to the staged pipeline when a
//! tool-loop strategy fails, and finalizes the run exactly once.

pub mod canonical;
pub mod dynamic;
pub mod error;
pub mod prompts;
pub mod staged;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use crate::model::{
    AnalysisContext, Claim, ContextResearchReport, EvidenceFact, FallbackInfo, FetchedSource, OverallVerdict,
    PipelineRun, PipelineVariant, RunStatus, is_unscoped_id,
};
use crate::service::budget::SharedBudget;
use crate::service::input::{NormalizedInput, normalize_input};
use crate::service::research::ResearchOrchestrator;
use crate::service::verdict::Aggregation;

pub use canonical::ToolLoopCanonical;
pub use dynamic::ToolLoopDynamic;
pub use error::PipelineError;
pub use staged::StagedPipeline;

/// Pseudo context under which tool-loop search turns are counted
const TOOL_LOOP_SCOPE: &str = "TOOL_LOOP";

/// Everything a strategy needs for one job
pub struct AnalysisJob {
    pub job_id: String,
    pub input: NormalizedInput,
    pub budget: SharedBudget,
    pub deadline: Instant,
}

/// Result of a strategy that completed
#[derive(Debug)]
pub struct StrategyOutput {
    pub contexts: Vec<AnalysisContext>,
    pub claims: Vec<Claim>,
    pub sources: Vec<FetchedSource>,
    pub facts: Vec<EvidenceFact>,
    pub aggregation: Aggregation,
    pub context_reports: Vec<ContextResearchReport>,
    pub raw_output: Option<serde_json::Value>,
}

#[async_trait]
pub trait PipelineStrategy: Send + Sync {
    fn variant(&self) -> PipelineVariant;

    async fn run(&self, job: &AnalysisJob) -> Result<StrategyOutput, PipelineError>;
}

/// Append the `UNSCOPED` display context when any claim or fact landed there
pub(crate) fn with_display_contexts(
    mut contexts: Vec<AnalysisContext>,
    claims: &[Claim],
    facts: &[EvidenceFact],
) -> Vec<AnalysisContext> {
    let needs_unscoped = claims.iter().any(|c| is_unscoped_id(&c.context_id))
        || facts.iter().any(|f| is_unscoped_id(&f.context_id));
    if needs_unscoped && !contexts.iter().any(|c| c.is_unscoped()) {
        contexts.push(AnalysisContext::unscoped());
    }
    contexts
}

/// Sources gathered by a tool loop, deduplicated by URL
#[derive(Default)]
pub(crate) struct SourceLedger {
    sources: Vec<FetchedSource>,
    seen: HashSet<String>,
}

impl SourceLedger {
    pub fn sources(&self) -> &[FetchedSource] {
        &self.sources
    }

    pub fn into_sources(self) -> Vec<FetchedSource> {
        self.sources
    }

    /// Run one turn of model-requested searches under the job budget and deadline
    pub async fn search(
        &mut self,
        orchestrator: &ResearchOrchestrator,
        job: &AnalysisJob,
        queries: &[String],
    ) -> Result<(), PipelineError> {
        let check = job.budget.try_begin_iteration(TOOL_LOOP_SCOPE);
        if !check.allowed {
            return Err(match check.reason {
                Some(reason) => PipelineError::Budget(reason),
                None => PipelineError::Contract("search turn denied by budget".to_string()),
            });
        }

        let max_queries = orchestrator.config().pipeline.max_queries_per_turn;
        for query in queries.iter().map(|q| q.trim()).filter(|q| !q.is_empty()).take(max_queries) {
            if Instant::now() >= job.deadline {
                return Err(PipelineError::Deadline);
            }
            let fetched = orchestrator.gather(query, &mut self.seen, job.deadline).await?;
            tracing::debug!(job_id = %job.job_id, query = %query, fetched = fetched.len(), "Tool loop search");
            self.sources.extend(fetched);
        }
        Ok(())
    }
}

/// Selects and runs strategies; the staged pipeline is the fallback of every other one
pub struct PipelineDispatcher {
    orchestrator: ResearchOrchestrator,
    strategies: HashMap<PipelineVariant, Arc<dyn PipelineStrategy>>,
}

impl PipelineDispatcher {
    pub fn new(orchestrator: ResearchOrchestrator) -> Self {
        let mut dispatcher = Self {
            orchestrator: orchestrator.clone(),
            strategies: HashMap::new(),
        };
        dispatcher.register(Arc::new(StagedPipeline::new(orchestrator.clone())));
        dispatcher.register(Arc::new(ToolLoopCanonical::new(orchestrator.clone())));
        dispatcher.register(Arc::new(ToolLoopDynamic::new(orchestrator)));
        dispatcher
    }

    /// Register or replace the strategy for its variant
    pub fn register(&mut self, strategy: Arc<dyn PipelineStrategy>) {
        self.strategies.insert(strategy.variant(), strategy);
    }

    pub fn default_variant(&self) -> PipelineVariant {
        self.orchestrator.config().pipeline.default_variant
    }

    /// Run one analysis job to completion. Never fails: a job whose strategies
    /// all failed is finalized as an insufficient-evidence run.
    pub async fn dispatch(&self, job_id: String, input_text: &str, variant: Option<PipelineVariant>) -> PipelineRun {
        let created_at = Utc::now();
        let started = std::time::Instant::now();
        let selected = variant.unwrap_or_else(|| self.default_variant());
        let config = self.orchestrator.config();

        let job = AnalysisJob {
            job_id,
            input: normalize_input(input_text),
            budget: SharedBudget::new(config.budget.clone()),
            deadline: self.orchestrator.job_deadline(),
        };

        let mut status = RunStatus::Selected;
        advance(&mut status, RunStatus::Running, &job.job_id);

        tracing::info!(
            job_id = %job.job_id,
            variant = %selected,
            input_type = ?job.input.input_type,
            "Analysis started"
        );

        let mut fallback = None;
        let mut rejected_output = None;
        let mut produced_by = selected;
        let result = match self.run_strategy(selected, &job).await {
            Ok(output) => Ok(output),
            Err(e) if selected != PipelineVariant::Staged => {
                tracing::warn!(
                    job_id = %job.job_id,
                    from = %selected,
                    error = %e,
                    "Strategy failed, falling back to staged pipeline"
                );
                fallback = Some(FallbackInfo {
                    used: true,
                    from: selected,
                    to: PipelineVariant::Staged,
                    reason: e.to_string(),
                });
                rejected_output = e.raw_output().cloned();
                produced_by = PipelineVariant::Staged;
                self.run_strategy(PipelineVariant::Staged, &job).await
            }
            Err(e) => Err(e),
        };

        let next = match (&result, &fallback) {
            (Ok(_), None) => RunStatus::Succeeded,
            (Ok(_), Some(_)) => RunStatus::FallbackSucceeded,
            (Err(_), _) => RunStatus::Failed,
        };
        advance(&mut status, next, &job.job_id);

        let mut run = finalize(job, status, produced_by, fallback, result, created_at);
        if run.raw_output.is_none() {
            run.raw_output = rejected_output;
        }
        tracing::info!(
            job_id = %run.job_id,
            status = ?run.status,
            variant = %run.pipeline_variant,
            quality = ?run.quality,
            overall = ?run.overall_verdict.label,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Analysis finished"
        );
        run
    }

    async fn run_strategy(&self, variant: PipelineVariant, job: &AnalysisJob) -> Result<StrategyOutput, PipelineError> {
        let strategy = self
            .strategies
            .get(&variant)
            .ok_or_else(|| PipelineError::Contract(format!("no strategy registered for {}", variant)))?;
        strategy.run(job).await
    }
}

fn advance(status: &mut RunStatus, next: RunStatus, job_id: &str) {
    if status.can_transition_to(next) {
        *status = next;
    } else {
        tracing::error!(job_id = %job_id, from = ?status, to = ?next, "Invalid run status transition");
    }
}

fn finalize(
    job: AnalysisJob,
    status: RunStatus,
    variant: PipelineVariant,
    fallback: Option<FallbackInfo>,
    result: Result<StrategyOutput, PipelineError>,
    created_at: chrono::DateTime<Utc>,
) -> PipelineRun {
    let budget_stats = job.budget.stats();
    let mut run = PipelineRun {
        job_id: job.job_id,
        input_text: job.input.original,
        canonical_input: job.input.canonical,
        input_type: job.input.input_type,
        pipeline_variant: variant,
        status,
        contexts: Vec::new(),
        claims: Vec::new(),
        sources: Vec::new(),
        facts: Vec::new(),
        claim_verdicts: Vec::new(),
        context_verdicts: Vec::new(),
        overall_verdict: OverallVerdict::insufficient(),
        budget_stats,
        context_reports: Vec::new(),
        fallback,
        failure_reason: None,
        raw_output: None,
        quality: crate::model::ResultQuality::InsufficientEvidence,
        created_at,
        completed_at: Utc::now(),
    };

    match result {
        Ok(output) => {
            run.contexts = output.contexts;
            run.claims = output.claims;
            run.sources = output.sources;
            run.facts = output.facts;
            run.claim_verdicts = output.aggregation.claim_verdicts;
            run.context_verdicts = output.aggregation.context_verdicts;
            run.overall_verdict = output.aggregation.overall;
            run.context_reports = output.context_reports;
            run.raw_output = output.raw_output;
        }
        Err(e) => {
            tracing::error!(job_id = %run.job_id, error = %e, "Analysis failed closed");
            run.failure_reason = Some(e.to_string());
        }
    }

    run.quality = run.assess_quality();
    run
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AnalysisConfig, InputType, ResultQuality, RetrieverConfig, VerdictLabel,
    };
    use crate::service::llm::CompletionRequest;
    use crate::service::provenance::ProvenanceValidator;
    use crate::service::research::ResearchDeps;
    use crate::service::testing::{FakeFetcher, FakeSearch, ScriptedProvider};
    use crate::service::verdict::within_neutrality_tolerance;
    use serde_json::{Value, json};

    const RULING_URL: &str = "https://www.tse.jus.br/ruling";
    const RULING_TEXT: &str = "On 30 June 2023 the Superior Electoral Court declared Jair Bolsonaro \
        ineligible for eight years for abuse of political power and misuse of the media.";
    const RULING_EXCERPT: &str = "the Superior Electoral Court declared Jair Bolsonaro ineligible for eight years";

    fn understanding() -> Value {
        json!({
            "contexts": [{"name": "TSE electoral case", "subject": "Eligibility after the 2022 election",
                "court": "TSE", "date_anchor": "2023-06-30"}],
            "claims": [{"text": "Jair Bolsonaro was declared ineligible", "context_name": "TSE electoral case",
                "harm_potential": true, "structural_centrality": true}]
        })
    }

    fn facts() -> Value {
        json!({"facts": [{"text": "The TSE declared Bolsonaro ineligible", "excerpt": RULING_EXCERPT,
            "relevant_to_context": true, "supports_claims": [0]}]})
    }

    /// Answers with every fact id listed in the prompt
    fn verdicts_citing_prompt_facts(request: &CompletionRequest) -> Result<Value, crate::service::llm::LlmError> {
        let ids: Vec<String> = request
            .prompt
            .split("[F_")
            .skip(1)
            .filter_map(|rest| rest.split(']').next())
            .map(|id| format!("F_{}", id))
            .collect();
        Ok(json!({"verdicts": [{"claim_index": 0, "truth_percentage": 95.0, "confidence": 85.0,
            "supporting_fact_ids": ids, "rationale": "ruling confirms the claim"}]}))
    }

    fn staged_provider() -> ScriptedProvider {
        ScriptedProvider::new()
            .with("ExtractedUnderstanding", understanding())
            .with("ExtractedFacts", facts())
            .respond("ExtractedVerdicts", verdicts_citing_prompt_facts)
    }

    fn dispatcher(llm: ScriptedProvider) -> PipelineDispatcher {
        let mut config = AnalysisConfig::default();
        config.research.retry_backoff_ms = 1;
        let orchestrator = ResearchOrchestrator::new(ResearchDeps {
            search: Arc::new(FakeSearch::new(&[RULING_URL])),
            grounded_search: None,
            fetcher: Arc::new(FakeFetcher::new().page(RULING_URL, RULING_TEXT)),
            llm: Arc::new(llm),
            validator: ProvenanceValidator::new(&config.provenance),
            policy: RetrieverConfig::default(),
            config: Arc::new(config),
        });
        PipelineDispatcher::new(orchestrator)
    }

    fn canonical_answer(source_url: &str, excerpt: &str) -> Value {
        json!({"search_queries": [], "answer": {
            "contexts": [{"name": "TSE electoral case", "subject": "Eligibility", "court": "TSE"}],
            "claims": [{"text": "Jair Bolsonaro was declared ineligible", "context_name": "TSE electoral case",
                "harm_potential": true, "structural_centrality": true}],
            "facts": [{"text": "The TSE declared Bolsonaro ineligible", "source_url": source_url,
                "excerpt": excerpt, "context_name": "TSE electoral case"}],
            "verdicts": [{"claim_index": 0, "truth_percentage": 90.0, "confidence": 80.0,
                "supporting_fact_indexes": [0], "rationale": null}]
        }})
    }

    #[tokio::test]
    async fn test_staged_run_succeeds() {
        let dispatcher = dispatcher(staged_provider());

        let run = dispatcher
            .dispatch("job-1".to_string(), "Jair Bolsonaro was declared ineligible.", None)
            .await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.pipeline_variant, PipelineVariant::Staged);
        assert_eq!(run.quality, ResultQuality::Verified);
        assert_eq!(run.facts.len(), 1);
        assert_eq!(run.claim_verdicts[0].supporting_fact_ids, vec![run.facts[0].id.clone()]);
        assert_eq!(run.overall_verdict.label, VerdictLabel::True);
        assert!(run.fallback.is_none());
        assert!(run.contexts[0].id.starts_with("TSE_"));
    }

    #[tokio::test]
    async fn test_question_and_statement_agree() {
        let question = dispatcher(staged_provider())
            .dispatch("job-q".to_string(), "Was Jair Bolsonaro declared ineligible?", None)
            .await;
        let statement = dispatcher(staged_provider())
            .dispatch("job-s".to_string(), "Jair Bolsonaro was declared ineligible.", None)
            .await;

        assert_eq!(question.input_type, InputType::Question);
        assert_eq!(statement.input_type, InputType::Statement);
        assert_eq!(question.canonical_input, statement.canonical_input);
        assert!(within_neutrality_tolerance(
            &question.overall_verdict,
            &statement.overall_verdict,
            4.0
        ));
    }

    #[tokio::test]
    async fn test_canonical_tool_loop_succeeds() {
        let provider = staged_provider()
            .with("ToolLoopTurn", json!({"search_queries": ["Bolsonaro TSE ineligible"], "answer": null}))
            .with("ToolLoopTurn", canonical_answer(RULING_URL, RULING_EXCERPT));
        let dispatcher = dispatcher(provider);

        let run = dispatcher
            .dispatch(
                "job-2".to_string(),
                "Jair Bolsonaro was declared ineligible.",
                Some(PipelineVariant::ToolLoopCanonical),
            )
            .await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.pipeline_variant, PipelineVariant::ToolLoopCanonical);
        assert_eq!(run.sources.len(), 1);
        assert_eq!(run.facts[0].source_url, RULING_URL);
        assert_eq!(run.budget_stats.iterations_by_context.get(TOOL_LOOP_SCOPE), Some(&1));
    }

    #[tokio::test]
    async fn test_invented_source_falls_back_to_staged() {
        let provider = staged_provider().with(
            "ToolLoopTurn",
            canonical_answer("https://invented.example.org/ruling", RULING_EXCERPT),
        );
        let dispatcher = dispatcher(provider);

        let run = dispatcher
            .dispatch(
                "job-3".to_string(),
                "Jair Bolsonaro was declared ineligible.",
                Some(PipelineVariant::ToolLoopCanonical),
            )
            .await;

        assert_eq!(run.status, RunStatus::FallbackSucceeded);
        assert_eq!(run.pipeline_variant, PipelineVariant::Staged);
        let fallback = run.fallback.as_ref().unwrap();
        assert!(fallback.used);
        assert_eq!(fallback.from, PipelineVariant::ToolLoopCanonical);
        assert!(fallback.reason.contains("never fetched"));
        assert_eq!(run.quality, ResultQuality::VerifiedWithCaveats);
    }

    #[tokio::test]
    async fn test_paraphrased_excerpt_falls_back() {
        let provider = staged_provider()
            .with("ToolLoopTurn", json!({"search_queries": ["Bolsonaro TSE"], "answer": null}))
            .with(
                "ToolLoopTurn",
                canonical_answer(RULING_URL, "The court made Bolsonaro unable to run for office for a long time"),
            );

        let run = dispatcher(provider)
            .dispatch(
                "job-4".to_string(),
                "Jair Bolsonaro was declared ineligible.",
                Some(PipelineVariant::ToolLoopCanonical),
            )
            .await;

        assert_eq!(run.status, RunStatus::FallbackSucceeded);
        assert!(run.fallback.unwrap().reason.contains("provenance"));
    }

    #[tokio::test]
    async fn test_dynamic_loop_keeps_raw_output() {
        let provider = staged_provider()
            .with("DynamicAnswer", json!({"summary": "", "citations": [], "search_queries": ["Bolsonaro TSE"]}))
            .with(
                "DynamicAnswer",
                json!({
                    "summary": "The ruling confirms the statement",
                    "citations": [{"url": RULING_URL, "excerpt": RULING_EXCERPT, "title": "TSE ruling"}],
                    "assessments": [{"claim": "Jair Bolsonaro was declared ineligible", "truth_percentage": 92.0,
                        "confidence": 75.0, "citation_indexes": [0]}],
                    "search_queries": null
                }),
            );

        let run = dispatcher(provider)
            .dispatch(
                "job-5".to_string(),
                "Jair Bolsonaro was declared ineligible.",
                Some(PipelineVariant::ToolLoopDynamic),
            )
            .await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.pipeline_variant, PipelineVariant::ToolLoopDynamic);
        let raw = run.raw_output.as_ref().unwrap();
        assert_eq!(raw["citations"][0]["url"], RULING_URL);
        assert_eq!(run.overall_verdict.label, VerdictLabel::True);
    }

    #[tokio::test]
    async fn test_dynamic_without_citations_falls_back() {
        let provider = staged_provider().with(
            "DynamicAnswer",
            json!({"summary": "It is true", "citations": [], "assessments": [], "search_queries": null}),
        );

        let run = dispatcher(provider)
            .dispatch(
                "job-6".to_string(),
                "Jair Bolsonaro was declared ineligible.",
                Some(PipelineVariant::ToolLoopDynamic),
            )
            .await;

        assert_eq!(run.status, RunStatus::FallbackSucceeded);
        assert_eq!(run.fallback.unwrap().from, PipelineVariant::ToolLoopDynamic);
        let raw = run.raw_output.as_ref().unwrap();
        assert_eq!(raw["summary"], "It is true");
        assert_eq!(raw["citations"], json!([]));
    }

    #[tokio::test]
    async fn test_failed_run_has_no_verdicts() {
        let run = dispatcher(ScriptedProvider::new())
            .dispatch(
                "job-7".to_string(),
                "Jair Bolsonaro was declared ineligible.",
                Some(PipelineVariant::ToolLoopCanonical),
            )
            .await;

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.claim_verdicts.is_empty());
        assert_eq!(run.overall_verdict, OverallVerdict::insufficient());
        assert_eq!(run.quality, ResultQuality::InsufficientEvidence);
        assert!(run.failure_reason.is_some());
        assert!(run.fallback.is_some());
    }
}
