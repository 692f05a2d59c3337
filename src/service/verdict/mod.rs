//! Verdict stage and aggregation
//!
//! Each context is judged in isolation: the model only sees that context's
//! claims and facts. Any failure yields zero-confidence verdicts for the
//! affected claims instead of fabricated ones.

pub mod aggregate;
pub mod prompts;

use futures::future::join_all;

use crate::model::{AnalysisContext, Claim, ClaimVerdict, EvidenceFact, ExtractedVerdicts, is_unscoped_id};
use crate::service::budget::SharedBudget;
use crate::service::llm::{CompletionProvider, LlmError, RetryPolicy, complete_structured};

pub use aggregate::{Aggregation, aggregate, within_neutrality_tolerance};

use prompts::{VERDICT_SYSTEM_PROMPT, build_verdict_prompt};

/// Judge the claims of one context against that context's facts
pub async fn judge_context(
    provider: &dyn CompletionProvider,
    budget: &SharedBudget,
    context: &AnalysisContext,
    claims: &[Claim],
    facts: &[EvidenceFact],
    retry: RetryPolicy,
) -> Result<Vec<ClaimVerdict>, LlmError> {
    if claims.is_empty() {
        return Ok(Vec::new());
    }
    if facts.is_empty() {
        tracing::info!(context_id = %context.id, "No evidence for context, skipping verdict call");
        return Ok(claims
            .iter()
            .map(|c| ClaimVerdict::insufficient(c, "no evidence passed provenance validation"))
            .collect());
    }

    let extracted: ExtractedVerdicts = complete_structured(
        provider,
        budget,
        VERDICT_SYSTEM_PROMPT,
        &build_verdict_prompt(context, claims, facts),
        retry,
    )
    .await?;

    let mut verdicts: Vec<Option<ClaimVerdict>> = vec![None; claims.len()];
    for v in extracted.verdicts {
        let Some(claim) = claims.get(v.claim_index) else {
            tracing::debug!(context_id = %context.id, claim_index = v.claim_index, "Verdict for unknown claim ignored");
            continue;
        };
        let slot = &mut verdicts[v.claim_index];
        if slot.is_some() {
            continue;
        }
        *slot = Some(ClaimVerdict {
            claim_text: claim.text.clone(),
            context_id: context.id.clone(),
            truth_percentage: v.truth_percentage,
            confidence: v.confidence,
            supporting_fact_ids: v.supporting_fact_ids,
            is_central: claim.is_central(),
            dedup_weight: 1.0,
            rationale: v.rationale,
        });
    }

    Ok(verdicts
        .into_iter()
        .zip(claims)
        .map(|(v, c)| v.unwrap_or_else(|| ClaimVerdict::insufficient(c, "model returned no verdict for this claim")))
        .collect())
}

/// Judge every context concurrently. Claims outside any context get
/// display-only insufficient verdicts.
pub async fn judge_all(
    provider: &dyn CompletionProvider,
    budget: &SharedBudget,
    contexts: &[AnalysisContext],
    claims: &[Claim],
    facts: &[EvidenceFact],
    retry: RetryPolicy,
) -> Vec<ClaimVerdict> {
    let scoped: Vec<&AnalysisContext> = contexts.iter().filter(|c| !c.is_unscoped()).collect();

    let results = join_all(scoped.iter().map(|context| async move {
        let context_claims: Vec<Claim> = claims.iter().filter(|c| c.context_id == context.id).cloned().collect();
        let context_facts: Vec<EvidenceFact> = facts.iter().filter(|f| f.context_id == context.id).cloned().collect();

        match judge_context(provider, budget, context, &context_claims, &context_facts, retry).await {
            Ok(verdicts) => verdicts,
            Err(e) => {
                tracing::warn!(context_id = %context.id, error = %e, "Verdict stage failed for context");
                context_claims
                    .iter()
                    .map(|c| ClaimVerdict::insufficient(c, format!("verdict stage failed: {}", e)))
                    .collect()
            }
        }
    }))
    .await;

    let mut verdicts: Vec<ClaimVerdict> = results.into_iter().flatten().collect();
    verdicts.extend(
        claims
            .iter()
            .filter(|c| is_unscoped_id(&c.context_id) || !scoped.iter().any(|ctx| ctx.id == c.context_id))
            .map(|c| ClaimVerdict::insufficient(c, "claim is not attributed to any analysed context")),
    );
    verdicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContextMetadata, ResearchBudget, UNSCOPED_ID};
    use crate::service::testing::{NO_RETRY, ScriptedProvider};
    use serde_json::json;

    fn context(id: &str) -> AnalysisContext {
        AnalysisContext {
            id: id.to_string(),
            name: format!("Context {}", id),
            subject: "subject".to_string(),
            description: None,
            metadata: ContextMetadata::default(),
        }
    }

    fn claim(context_id: &str, text: &str) -> Claim {
        Claim {
            text: text.to_string(),
            context_id: context_id.to_string(),
            harm_potential: true,
            structural_centrality: true,
        }
    }

    fn fact(id: &str, context_id: &str) -> EvidenceFact {
        EvidenceFact {
            id: id.to_string(),
            text: format!("fact {}", id),
            source_id: "S_1".to_string(),
            source_url: "https://a.example/1".to_string(),
            source_excerpt: "A verbatim excerpt from the source".to_string(),
            context_id: context_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_model_only_sees_its_context() {
        let provider = ScriptedProvider::new().with(
            "ExtractedVerdicts",
            json!({"verdicts": [{"claim_index": 0, "truth_percentage": 80.0, "confidence": 70.0,
                "supporting_fact_ids": ["F_a"], "rationale": "ruling confirms"}]}),
        );
        let budget = SharedBudget::new(ResearchBudget::default());
        let contexts = vec![context("A_0001"), context("B_0001")];
        let claims = vec![claim("A_0001", "Claim A"), claim("B_0001", "Claim B")];
        let facts = vec![fact("F_a", "A_0001"), fact("F_b", "B_0001")];

        let verdicts = judge_all(&provider, &budget, &contexts, &claims, &facts, NO_RETRY).await;

        assert_eq!(verdicts.len(), 2);
        let requests = provider.requests_for("ExtractedVerdicts");
        assert_eq!(requests.len(), 2);
        for request in &requests {
            let sees_a = request.prompt.contains("[F_a]");
            let sees_b = request.prompt.contains("[F_b]");
            assert!(sees_a ^ sees_b);
        }
    }

    #[tokio::test]
    async fn test_failed_call_yields_zero_confidence() {
        let provider = ScriptedProvider::new();
        let budget = SharedBudget::new(ResearchBudget::default());
        let contexts = vec![context("A_0001")];
        let claims = vec![claim("A_0001", "Claim A"), claim(UNSCOPED_ID, "Stray claim")];
        let facts = vec![fact("F_a", "A_0001")];

        let verdicts = judge_all(&provider, &budget, &contexts, &claims, &facts, NO_RETRY).await;

        assert_eq!(verdicts.len(), 2);
        assert!(verdicts.iter().all(|v| v.confidence == 0.0));
        assert!(verdicts.iter().all(|v| v.supporting_fact_ids.is_empty()));
    }

    #[tokio::test]
    async fn test_missing_and_duplicate_verdicts() {
        let provider = ScriptedProvider::new().with(
            "ExtractedVerdicts",
            json!({"verdicts": [
                {"claim_index": 0, "truth_percentage": 10.0, "confidence": 90.0, "supporting_fact_ids": ["F_a"], "rationale": null},
                {"claim_index": 0, "truth_percentage": 99.0, "confidence": 99.0, "supporting_fact_ids": ["F_a"], "rationale": null},
                {"claim_index": 7, "truth_percentage": 50.0, "confidence": 50.0, "supporting_fact_ids": [], "rationale": null}
            ]}),
        );
        let budget = SharedBudget::new(ResearchBudget::default());
        let claims = vec![claim("A_0001", "First"), claim("A_0001", "Second")];
        let facts = vec![fact("F_a", "A_0001")];

        let verdicts = judge_context(&provider, &budget, &context("A_0001"), &claims, &facts, NO_RETRY)
            .await
            .unwrap();

        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].truth_percentage, 10.0);
        assert!(verdicts[0].is_central);
        assert_eq!(verdicts[1].confidence, 0.0);
    }

    #[tokio::test]
    async fn test_no_facts_skips_model_call() {
        let provider = ScriptedProvider::new();
        let budget = SharedBudget::new(ResearchBudget::default());
        let claims = vec![claim("A_0001", "First")];

        let verdicts = judge_context(&provider, &budget, &context("A_0001"), &claims, &[], NO_RETRY)
            .await
            .unwrap();

        assert_eq!(verdicts[0].confidence, 0.0);
        assert!(provider.requests_for("ExtractedVerdicts").is_empty());
        assert_eq!(budget.stats().llm_calls, 0);
    }
}
