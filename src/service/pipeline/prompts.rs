//! Prompts for the tool-loop strategies

use crate::model::FetchedSource;

/// Characters of each gathered source shown to the model per turn
const SOURCE_PREVIEW_CHARS: usize = 4_000;

pub const CANONICAL_SYSTEM_PROMPT: &str = r#"You verify a statement by researching it with web search.

Each turn you either request searches or give the final answer, never both.

## Searching
- Put up to three precise queries in search_queries and leave answer null.
- Search results are shown to you in the next turn.

## Final answer
- contexts: the distinct analytical frames of the statement (separate legal cases, studies, time periods).
- claims: atomic, falsifiable claims; context_name names the context each belongs to.
  harm_potential and structural_centrality are both true only for claims the statement's overall truth depends on.
- facts: evidence from the sources shown to you. source_url must be one of those URLs and excerpt must be copied verbatim from that source.
- verdicts: one per claim, with supporting_fact_indexes pointing into the facts list.

Never cite a source that was not shown to you and never quote text that is not in it."#;

pub const DYNAMIC_SYSTEM_PROMPT: &str = r#"You verify a statement by researching it with web search.

To search, return search_queries with up to three queries. Results are shown in the next turn.
When you are done, leave search_queries null and return:
- summary: your assessment of the statement.
- citations: every source you rely on, with its URL and a verbatim excerpt from the text shown to you.
- assessments: optional per-claim truth and confidence (0 to 100) with indexes into citations.

Only cite sources shown to you. An answer without citations is rejected."#;

pub fn build_turn_prompt(statement: &str, sources: &[FetchedSource], turn: u32, max_turns: u32) -> String {
    let sources_section = if sources.is_empty() {
        "No sources yet.".to_string()
    } else {
        sources
            .iter()
            .map(|s| {
                let preview: String = s.full_text.chars().take(SOURCE_PREVIEW_CHARS).collect();
                format!(
                    "### {}\nURL: {}\n\n{}",
                    s.title.as_deref().unwrap_or("Untitled"),
                    s.url,
                    preview
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    let closing = if turn + 1 >= max_turns {
        "This is the last turn: give the final answer now."
    } else {
        "Request searches or give the final answer."
    };

    format!(
        r#"## Statement
{statement}

## Sources gathered so far
{sources_section}

---

Turn {current} of {max_turns}. {closing}"#,
        current = turn + 1,
    )
}
