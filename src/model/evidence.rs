use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One piece of extracted evidence.
///
/// Only facts that passed provenance validation are ever stored on a run;
/// verdicts reference them by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceFact {
    pub id: String,
    pub text: String,
    /// Weak reference to the FetchedSource the fact was extracted from
    pub source_id: String,
    pub source_url: String,
    /// Verbatim quote from the source backing the fact
    pub source_excerpt: String,
    pub context_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    StandardSearch,
    GroundedSearch,
}

/// Grounding attribution returned by a grounded search provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroundingMetadata {
    /// Query the grounding was produced for
    pub query: String,
    /// Text segments of the grounded answer attributed to this source
    #[serde(default)]
    pub supports: Vec<String>,
}

impl GroundingMetadata {
    pub fn is_empty(&self) -> bool {
        self.supports.iter().all(|s| s.trim().is_empty())
    }
}

/// A retrieved document, owned by the research orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FetchedSource {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Normalized document text (markdown for HTML pages)
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub full_text: String,
    pub category: SourceCategory,
    /// 0.0 to 1.0
    pub reliability_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding: Option<GroundingMetadata>,
}
