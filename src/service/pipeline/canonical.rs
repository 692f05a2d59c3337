//! Tool-loop strategy emitting the canonical answer schema
//!
//! The model drives research itself for a bounded number of turns. Its final
//! answer is validated post hoc; any violation is an error so the dispatcher
//! falls back to the staged pipeline.

use std::collections::HashMap;

use async_trait::async_trait;

use super::prompts::{CANONICAL_SYSTEM_PROMPT, build_turn_prompt};
use super::{AnalysisJob, PipelineError, PipelineStrategy, SourceLedger, StrategyOutput, with_display_contexts};
use crate::model::{
    AnalysisContext, CanonicalAnswer, Claim, ClaimVerdict, EvidenceFact, FetchedSource, PipelineVariant, ToolLoopTurn,
};
use crate::service::llm::{RetryPolicy, complete_structured};
use crate::service::provenance::ProvenanceValidator;
use crate::service::research::{ResearchOrchestrator, fact_id_for};
use crate::service::scope::attribute_context;
use crate::service::understand::build_understanding;
use crate::service::verdict::aggregate;

pub struct ToolLoopCanonical {
    orchestrator: ResearchOrchestrator,
}

impl ToolLoopCanonical {
    pub fn new(orchestrator: ResearchOrchestrator) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl PipelineStrategy for ToolLoopCanonical {
    fn variant(&self) -> PipelineVariant {
        PipelineVariant::ToolLoopCanonical
    }

    async fn run(&self, job: &AnalysisJob) -> Result<StrategyOutput, PipelineError> {
        let settings = &self.orchestrator.config().pipeline;
        let mut ledger = SourceLedger::default();

        for turn in 0..settings.tool_loop_max_turns {
            let prompt = build_turn_prompt(&job.input.canonical, ledger.sources(), turn, settings.tool_loop_max_turns);
            let call = complete_structured::<ToolLoopTurn>(
                self.orchestrator.llm(),
                &job.budget,
                CANONICAL_SYSTEM_PROMPT,
                &prompt,
                RetryPolicy::from_config(self.orchestrator.config()),
            );
            let reply = tokio::time::timeout_at(job.deadline, call)
                .await
                .map_err(|_| PipelineError::Deadline)??;

            if let Some(answer) = reply.answer {
                tracing::info!(job_id = %job.job_id, turn = turn + 1, sources = ledger.sources().len(), "Tool loop answered");
                return self.validate(job, answer, ledger.into_sources());
            }
            if reply.search_queries.is_empty() {
                return Err(PipelineError::Contract("turn has neither searches nor an answer".to_string()));
            }

            ledger.search(&self.orchestrator, job, &reply.search_queries).await?;
        }

        Err(PipelineError::Contract(format!(
            "no answer within {} turns",
            settings.tool_loop_max_turns
        )))
    }
}

impl ToolLoopCanonical {
    fn validate(
        &self,
        job: &AnalysisJob,
        answer: CanonicalAnswer,
        sources: Vec<FetchedSource>,
    ) -> Result<StrategyOutput, PipelineError> {
        let config = self.orchestrator.config();
        let understanding = build_understanding(&job.input.canonical, &answer.contexts, &answer.claims);
        if understanding.claims.is_empty() {
            return Err(PipelineError::Contract("answer has no claims".to_string()));
        }

        let facts = ground_facts(
            self.orchestrator.validator(),
            &answer,
            &understanding.contexts,
            &sources,
        )?;
        let verdicts = build_verdicts(&answer, &understanding.claims, &facts)?;
        let aggregation = aggregate(verdicts, &facts, &understanding.contexts, &[], &config.verdict);

        Ok(StrategyOutput {
            contexts: with_display_contexts(understanding.contexts, &understanding.claims, &facts),
            claims: understanding.claims,
            sources,
            facts,
            aggregation,
            context_reports: Vec::new(),
            raw_output: None,
        })
    }
}

/// Turn answer facts into evidence. Every fact must cite a gathered source and
/// pass provenance and grounding against that source's text.
fn ground_facts(
    validator: &ProvenanceValidator,
    answer: &CanonicalAnswer,
    contexts: &[AnalysisContext],
    sources: &[FetchedSource],
) -> Result<Vec<EvidenceFact>, PipelineError> {
    if answer.facts.is_empty() {
        return Err(PipelineError::Contract("answer has no facts".to_string()));
    }

    let by_url: HashMap<&str, &FetchedSource> = sources.iter().map(|s| (s.url.as_str(), s)).collect();
    let mut facts = Vec::with_capacity(answer.facts.len());

    for (i, candidate) in answer.facts.iter().enumerate() {
        let Some(source) = by_url.get(candidate.source_url.trim()) else {
            return Err(PipelineError::Contract(format!(
                "fact {} cites a source that was never fetched: {}",
                i, candidate.source_url
            )));
        };
        let context_id = match (candidate.context_name.as_deref(), contexts) {
            (None, [only]) => only.id.clone(),
            (reference, _) => attribute_context(reference, contexts),
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

        let check = validator.validate_fact_against_source(&fact, &source.full_text);
        if !check.valid {
            let reason = check.reason.map(|r| r.to_string()).unwrap_or_default();
            return Err(PipelineError::Contract(format!("fact {} failed provenance: {}", i, reason)));
        }
        facts.push(fact);
    }

    Ok(facts)
}

/// Map answer verdicts onto claims by index; claims without a verdict get an
/// insufficient one
fn build_verdicts(
    answer: &CanonicalAnswer,
    claims: &[Claim],
    facts: &[EvidenceFact],
) -> Result<Vec<ClaimVerdict>, PipelineError> {
    let mut verdicts: Vec<Option<ClaimVerdict>> = vec![None; claims.len()];

    for v in &answer.verdicts {
        let text = answer
            .claims
            .get(v.claim_index)
            .map(|c| c.text.trim())
            .ok_or_else(|| PipelineError::Contract(format!("verdict for unknown claim {}", v.claim_index)))?;
        let Some(position) = claims.iter().position(|c| c.text == text) else {
            continue;
        };
        let supporting_fact_ids = v
            .supporting_fact_indexes
            .iter()
            .map(|&i| {
                facts
                    .get(i)
                    .map(|f| f.id.clone())
                    .ok_or_else(|| PipelineError::Contract(format!("verdict cites unknown fact {}", i)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let claim = &claims[position];
        verdicts[position].get_or_insert_with(|| ClaimVerdict {
            claim_text: claim.text.clone(),
            context_id: claim.context_id.clone(),
            truth_percentage: v.truth_percentage,
            confidence: v.confidence,
            supporting_fact_ids,
            is_central: claim.is_central(),
            dedup_weight: 1.0,
            rationale: v.rationale.clone(),
        });
    }

    Ok(verdicts
        .into_iter()
        .zip(claims)
        .map(|(v, c)| v.unwrap_or_else(|| ClaimVerdict::insufficient(c, "tool loop returned no verdict for this claim")))
        .collect())
}
