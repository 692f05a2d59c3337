//! Prompts for the per-context verdict stage

use crate::model::{AnalysisContext, Claim, EvidenceFact};

pub const VERDICT_SYSTEM_PROMPT: &str = r#"You assess claims against evidence gathered for one analytical context.

## Rules

1. Judge each claim only on the facts listed. Do not use outside knowledge.
2. truth_percentage: 0 means the facts show the claim is false, 100 that they show it is true.
3. confidence reflects how directly and how strongly the facts bear on the claim (0 to 100).
4. supporting_fact_ids must only contain ids from the facts list. A claim with no bearing facts gets an empty list and confidence 0.
5. Return one verdict per claim, identified by claim_index.
6. Evaluate the claim as stated. Do not reward or penalize it for being phrased as a question."#;

pub fn build_verdict_prompt(context: &AnalysisContext, claims: &[Claim], facts: &[EvidenceFact]) -> String {
    let claims_list = claims
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {}", i, c.text))
        .collect::<Vec<_>>()
        .join("\n");

    let facts_list = facts
        .iter()
        .map(|f| format!("- [{}] {}\n  Quote: \"{}\"\n  Source: {}", f.id, f.text, f.source_excerpt, f.source_url))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"## Context
- Name: {name}
- Subject: {subject}

## Claims
{claims_list}

## Facts
{facts_list}

---

Return a verdict for every claim."#,
        name = context.name,
        subject = context.subject,
    )
}
