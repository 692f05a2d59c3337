//! Prompts for evidence extraction

use crate::model::{AnalysisContext, Claim};

pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"You extract evidence for fact-checking from one source document.

## Rules

1. Every fact must be stated in the document. Never add knowledge of your own.
2. The excerpt must be copied verbatim from the document (one to three sentences). Do not paraphrase, summarize or shorten it with ellipses.
3. Never write excerpts in the first person and never describe your own analysis ("based on my analysis", "I found that").
4. Set relevant_to_context to false when the fact concerns a different case, institution or time period than the context described.
5. supports_claims lists the indexes of the claims the fact bears on, whether it confirms or contradicts them.
6. Return an empty facts array when the document contains nothing relevant.

Prefer fewer, precise facts over many vague ones."#;

pub fn build_extraction_prompt(
    context: &AnalysisContext,
    claims: &[Claim],
    url: &str,
    content: &str,
) -> String {
    let mut metadata = Vec::new();
    if let Some(v) = &context.metadata.institution {
        metadata.push(format!("- Institution: {}", v));
    }
    if let Some(v) = &context.metadata.court {
        metadata.push(format!("- Court: {}", v));
    }
    if let Some(v) = &context.metadata.jurisdiction {
        metadata.push(format!("- Jurisdiction: {}", v));
    }
    if let Some(v) = &context.metadata.date_anchor {
        metadata.push(format!("- Date: {}", v));
    }

    let claims_list = claims
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {}", i, c.text))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"## Context
- Name: {name}
- Subject: {subject}
{metadata}

## Claims
{claims_list}

## Source
URL: {url}

{content}

---

Extract the facts from this source that bear on the claims above."#,
        name = context.name,
        subject = context.subject,
        metadata = metadata.join("\n"),
    )
}
