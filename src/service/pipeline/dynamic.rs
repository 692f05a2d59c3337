//! Experimental tool loop with a flexible answer schema
//!
//! The raw answer is kept on the run for audit, also when it is rejected. Citations are the safety
//! contract: at least one, every one a real URL that was actually fetched.

use std::collections::HashMap;

use async_trait::async_trait;

use super::prompts::{DYNAMIC_SYSTEM_PROMPT, build_turn_prompt};
use super::{AnalysisJob, PipelineError, PipelineStrategy, SourceLedger, StrategyOutput, with_display_contexts};
use crate::model::{
    ClaimVerdict, DynamicAnswer, EvidenceFact, ExtractedClaim, FetchedSource, PipelineVariant, UNSCOPED_ID,
};
use crate::service::llm::{RetryPolicy, Structured, complete_structured_raw};
use crate::service::provenance::{excerpt_is_grounded, validate_source_url};
use crate::service::research::{ResearchOrchestrator, fact_id_for};
use crate::service::understand::build_understanding;
use crate::service::verdict::aggregate;

pub struct ToolLoopDynamic {
    orchestrator: ResearchOrchestrator,
}

impl ToolLoopDynamic {
    pub fn new(orchestrator: ResearchOrchestrator) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl PipelineStrategy for ToolLoopDynamic {
    fn variant(&self) -> PipelineVariant {
        PipelineVariant::ToolLoopDynamic
    }

    async fn run(&self, job: &AnalysisJob) -> Result<StrategyOutput, PipelineError> {
        let settings = &self.orchestrator.config().pipeline;
        let mut ledger = SourceLedger::default();

        for turn in 0..settings.tool_loop_max_turns {
            let prompt = build_turn_prompt(&job.input.canonical, ledger.sources(), turn, settings.tool_loop_max_turns);
            let call = complete_structured_raw::<DynamicAnswer>(
                self.orchestrator.llm(),
                &job.budget,
                DYNAMIC_SYSTEM_PROMPT,
                &prompt,
                RetryPolicy::from_config(self.orchestrator.config()),
            );
            let Structured { value: reply, raw } = tokio::time::timeout_at(job.deadline, call)
                .await
                .map_err(|_| PipelineError::Deadline)??;

            let queries = reply.search_queries.clone().unwrap_or_default();
            if !queries.is_empty() && turn + 1 < settings.tool_loop_max_turns {
                ledger.search(&self.orchestrator, job, &queries).await?;
                continue;
            }

            return self
                .validate(job, reply, &raw, ledger.into_sources())
                .map_err(|e| e.with_raw_output(raw));
        }

        Err(PipelineError::Contract("tool loop is configured with zero turns".to_string()))
    }
}

impl ToolLoopDynamic {
    fn validate(
        &self,
        job: &AnalysisJob,
        answer: DynamicAnswer,
        raw: &serde_json::Value,
        sources: Vec<FetchedSource>,
    ) -> Result<StrategyOutput, PipelineError> {
        let raw_output = Some(raw.clone());

        if answer.citations.is_empty() {
            return Err(PipelineError::Contract("answer has no citations".to_string()));
        }
        if answer.assessments.is_empty() {
            return Err(PipelineError::Contract("answer has no claim assessments".to_string()));
        }

        let by_url: HashMap<&str, &FetchedSource> = sources.iter().map(|s| (s.url.as_str(), s)).collect();
        for citation in &answer.citations {
            validate_source_url(&citation.url)
                .map_err(|e| PipelineError::Contract(format!("citation {}: {}", citation.url, e)))?;
            if !by_url.contains_key(citation.url.trim()) {
                return Err(PipelineError::Contract(format!(
                    "citation {} was never fetched",
                    citation.url
                )));
            }
        }

        let extracted_claims: Vec<ExtractedClaim> = answer
            .assessments
            .iter()
            .map(|a| ExtractedClaim {
                text: a.claim.clone(),
                context_name: None,
                harm_potential: false,
                structural_centrality: false,
            })
            .collect();
        let understanding = build_understanding(&job.input.canonical, &[], &extracted_claims);
        let context_id = understanding
            .contexts
            .first()
            .map(|c| c.id.clone())
            .unwrap_or_else(|| UNSCOPED_ID.to_string());

        // Citation index -> fact id, for citations that survive provenance and grounding
        let candidates: Vec<EvidenceFact> = answer
            .citations
            .iter()
            .map(|c| {
                let source = by_url[c.url.trim()];
                let excerpt = c.excerpt.trim().to_string();
                EvidenceFact {
                    id: fact_id_for(&context_id, &source.url, &excerpt),
                    text: c.title.clone().unwrap_or_else(|| excerpt.clone()),
                    source_id: source.id.clone(),
                    source_url: source.url.clone(),
                    source_excerpt: excerpt,
                    context_id: context_id.clone(),
                }
            })
            .collect();
        let citation_ids: Vec<String> = candidates.iter().map(|f| f.id.clone()).collect();

        let filtered = self.orchestrator.validator().filter_facts_by_provenance(candidates);
        let mut facts: Vec<EvidenceFact> = filtered
            .accepted
            .into_iter()
            .filter(|f| {
                let grounded = excerpt_is_grounded(&f.source_excerpt, &by_url[f.source_url.as_str()].full_text);
                if !grounded {
                    tracing::warn!(source_url = %f.source_url, "Citation excerpt not found in source");
                }
                grounded
            })
            .collect();
        facts.sort_by(|a, b| a.id.cmp(&b.id));
        facts.dedup_by(|a, b| a.id == b.id);

        if facts.is_empty() {
            return Err(PipelineError::Contract("no citation passed provenance validation".to_string()));
        }

        let mut verdicts: Vec<Option<ClaimVerdict>> = vec![None; understanding.claims.len()];
        for assessment in &answer.assessments {
            let Some(position) = understanding.claims.iter().position(|c| c.text == assessment.claim.trim()) else {
                continue;
            };
            let supporting_fact_ids: Vec<String> = assessment
                .citation_indexes
                .iter()
                .filter_map(|&i| citation_ids.get(i))
                .filter(|id| facts.iter().any(|f| &f.id == *id))
                .cloned()
                .collect();
            let claim = &understanding.claims[position];
            verdicts[position].get_or_insert_with(|| ClaimVerdict {
                claim_text: claim.text.clone(),
                context_id: claim.context_id.clone(),
                truth_percentage: assessment.truth_percentage,
                confidence: assessment.confidence,
                supporting_fact_ids,
                is_central: claim.is_central(),
                dedup_weight: 1.0,
                rationale: Some(answer.summary.clone()),
            });
        }
        let verdicts: Vec<ClaimVerdict> = verdicts
            .into_iter()
            .zip(&understanding.claims)
            .map(|(v, c)| v.unwrap_or_else(|| ClaimVerdict::insufficient(c, "no assessment for this claim")))
            .collect();

        let aggregation = aggregate(
            verdicts,
            &facts,
            &understanding.contexts,
            &[],
            &self.orchestrator.config().verdict,
        );

        tracing::info!(
            job_id = %job.job_id,
            citations = answer.citations.len(),
            facts = facts.len(),
            "Dynamic tool loop answer accepted"
        );

        Ok(StrategyOutput {
            contexts: with_display_contexts(understanding.contexts, &understanding.claims, &facts),
            claims: understanding.claims,
            sources,
            facts,
            aggregation,
            context_reports: Vec::new(),
            raw_output,
        })
    }
}
