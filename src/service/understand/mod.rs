//! Understand stage: decompose the canonical input into contexts and claims

pub mod prompts;

use std::collections::HashSet;

use crate::model::{
    AnalysisContext, CandidateContext, Claim, ContextMetadata, ExtractedClaim, ExtractedContext,
    ExtractedUnderstanding,
};
use crate::service::budget::SharedBudget;
use crate::service::llm::{CompletionProvider, LlmError, RetryPolicy, complete_structured};
use crate::service::scope::{attribute_context, canonicalize};

use prompts::{UNDERSTAND_SYSTEM_PROMPT, build_understand_prompt};

/// Name given to the single context created when the model proposes none
const FALLBACK_CONTEXT_NAME: &str = "General";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum UnderstandError {
    #[error("Understand stage LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("No claims could be derived from the input")]
    NoClaims,
}

/// Canonical contexts and the claims attributed to them
#[derive(Debug, Clone, Default)]
pub struct Understanding {
    pub contexts: Vec<AnalysisContext>,
    pub claims: Vec<Claim>,
}

/// Run the Understand stage for a canonical statement
pub async fn understand(
    provider: &dyn CompletionProvider,
    budget: &SharedBudget,
    statement: &str,
    retry: RetryPolicy,
) -> Result<Understanding, UnderstandError> {
    let extracted: ExtractedUnderstanding = complete_structured(
        provider,
        budget,
        UNDERSTAND_SYSTEM_PROMPT,
        &build_understand_prompt(statement),
        retry,
    )
    .await?;

    let understanding = build_understanding(statement, &extracted.contexts, &extracted.claims);
    if understanding.claims.is_empty() {
        return Err(UnderstandError::NoClaims);
    }

    tracing::info!(
        contexts = understanding.contexts.len(),
        claims = understanding.claims.len(),
        "Understand stage complete"
    );
    Ok(understanding)
}

/// Canonicalize extracted contexts and attribute claims to them.
///
/// With a single context, claims without a context reference belong to it;
/// otherwise unresolvable references go to `UNSCOPED`. When the model proposes
/// no context at all, one generic context is created from the statement.
pub fn build_understanding(
    statement: &str,
    contexts: &[ExtractedContext],
    claims: &[ExtractedClaim],
) -> Understanding {
    let mut candidates: Vec<CandidateContext> = contexts
        .iter()
        .filter(|c| !c.name.trim().is_empty())
        .map(candidate_from)
        .collect();

    if candidates.is_empty() {
        candidates.push(CandidateContext {
            name: FALLBACK_CONTEXT_NAME.to_string(),
            subject: statement.to_string(),
            description: None,
            metadata: ContextMetadata::default(),
        });
    }

    let contexts = canonicalize(candidates);

    let mut seen = HashSet::new();
    let claims = claims
        .iter()
        .filter(|c| !c.text.trim().is_empty())
        .filter_map(|c| {
            let context_id = match (c.context_name.as_deref(), contexts.as_slice()) {
                (None, [only]) => only.id.clone(),
                (reference, _) => attribute_context(reference, &contexts),
            };
            let claim = Claim {
                text: c.text.trim().to_string(),
                context_id,
                harm_potential: c.harm_potential,
                structural_centrality: c.structural_centrality,
            };
            seen.insert((claim.context_id.clone(), claim.text.to_lowercase()))
                .then_some(claim)
        })
        .collect();

    Understanding { contexts, claims }
}

pub fn candidate_from(extracted: &ExtractedContext) -> CandidateContext {
    fn clean(value: &Option<String>) -> Option<String> {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    CandidateContext {
        name: extracted.name.clone(),
        subject: extracted.subject.clone(),
        description: clean(&extracted.description),
        metadata: ContextMetadata {
            institution: clean(&extracted.institution),
            court: clean(&extracted.court),
            jurisdiction: clean(&extracted.jurisdiction),
            date_anchor: clean(&extracted.date_anchor),
            methodology: clean(&extracted.methodology),
        },
    }
}
