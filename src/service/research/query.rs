//! Search query planning for one context

use std::collections::HashSet;

use crate::model::{AnalysisContext, Claim};

/// What the planner decided for the next iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextQuery {
    Query(String),
    /// Every claim already has supporting evidence
    AllResolved,
    /// Unresolved claims remain but every query for them was already issued
    OutOfQueries,
}

/// Builds queries from the context's unresolved claims, never repeating one
#[derive(Debug, Default)]
pub struct QueryPlanner {
    issued: HashSet<String>,
}

impl QueryPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, context: &AnalysisContext, claims: &[Claim], resolved: &HashSet<usize>) -> NextQuery {
        let unresolved: Vec<&str> = if claims.is_empty() {
            // A context without claims is researched through its subject
            if resolved.is_empty() {
                vec![context.subject.as_str()]
            } else {
                vec![]
            }
        } else {
            claims
                .iter()
                .enumerate()
                .filter(|(i, _)| !resolved.contains(i))
                .map(|(_, c)| c.text.as_str())
                .collect()
        };

        if unresolved.is_empty() {
            return NextQuery::AllResolved;
        }

        for text in unresolved {
            for candidate in variants(context, text) {
                if self.issued.insert(normalize(&candidate)) {
                    return NextQuery::Query(candidate);
                }
            }
        }

        NextQuery::OutOfQueries
    }

    #[cfg(test)]
    fn issued(&self) -> usize {
        self.issued.len()
    }
}

/// Qualified query first (claim plus the context's institution or name), then the bare claim
fn variants(context: &AnalysisContext, text: &str) -> Vec<String> {
    let text = text.trim().trim_end_matches('.');
    let qualifier = context
        .metadata
        .court
        .as_deref()
        .or(context.metadata.institution.as_deref())
        .unwrap_or(context.name.as_str())
        .trim();

    let mut out = Vec::with_capacity(3);
    if !qualifier.is_empty() && !text.to_lowercase().contains(&qualifier.to_lowercase()) {
        out.push(format!("{} {}", text, qualifier));
    }
    if let Some(date) = context.metadata.date_anchor.as_deref().filter(|d| !d.trim().is_empty()) {
        out.push(format!("{} {}", text, date.trim()));
    }
    out.push(text.to_string());
    out.retain(|q| !q.trim().is_empty());
    out
}

fn normalize(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContextMetadata;

    fn context() -> AnalysisContext {
        AnalysisContext {
            id: "TSE_1234".to_string(),
            name: "Electoral case".to_string(),
            subject: "Eligibility".to_string(),
            description: None,
            metadata: ContextMetadata {
                court: Some("TSE".to_string()),
                ..Default::default()
            },
        }
    }

    fn claim(text: &str) -> Claim {
        Claim {
            text: text.to_string(),
            context_id: "TSE_1234".to_string(),
            harm_potential: false,
            structural_centrality: false,
        }
    }

    #[test]
    fn test_queries_never_repeat_and_run_out() {
        let mut planner = QueryPlanner::new();
        let claims = vec![claim("He was declared ineligible.")];
        let resolved = HashSet::new();

        assert_eq!(
            planner.next(&context(), &claims, &resolved),
            NextQuery::Query("He was declared ineligible TSE".to_string())
        );
        assert_eq!(
            planner.next(&context(), &claims, &resolved),
            NextQuery::Query("He was declared ineligible".to_string())
        );
        assert_eq!(planner.next(&context(), &claims, &resolved), NextQuery::OutOfQueries);
        assert_eq!(planner.issued(), 2);
    }

    #[test]
    fn test_resolved_claims_are_skipped() {
        let mut planner = QueryPlanner::new();
        let claims = vec![claim("First claim"), claim("Second claim")];
        let resolved: HashSet<usize> = [0].into_iter().collect();

        assert_eq!(
            planner.next(&context(), &claims, &resolved),
            NextQuery::Query("Second claim TSE".to_string())
        );

        let all: HashSet<usize> = [0, 1].into_iter().collect();
        assert_eq!(planner.next(&context(), &claims, &all), NextQuery::AllResolved);
    }
}
