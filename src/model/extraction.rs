//! LLM-extractable models
//!
//! These are the structured outputs requested from the completion provider.
//! They are converted into domain models only after validation.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Output of the Understand stage
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedUnderstanding {
    pub contexts: Vec<ExtractedContext>,
    pub claims: Vec<ExtractedClaim>,
}

/// A candidate analytical context
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedContext {
    #[schemars(description = "Short name of the analytical frame (e.g. one legal case or methodology)")]
    pub name: String,
    #[schemars(description = "What is examined in this frame")]
    pub subject: String,
    pub description: Option<String>,
    #[schemars(description = "Institution that decided or published, if any")]
    pub institution: Option<String>,
    pub court: Option<String>,
    pub jurisdiction: Option<String>,
    #[schemars(description = "Date the frame is anchored to (ISO 8601 when possible)")]
    pub date_anchor: Option<String>,
    pub methodology: Option<String>,
}

/// An atomic claim attributed to one context by name
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedClaim {
    pub text: String,
    #[schemars(description = "Name of the context this claim belongs to, or null when none applies")]
    pub context_name: Option<String>,
    pub harm_potential: bool,
    pub structural_centrality: bool,
}

/// Facts extracted from one fetched source
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedFacts {
    pub facts: Vec<ExtractedFact>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedFact {
    #[schemars(description = "The fact stated in neutral terms")]
    pub text: String,
    #[schemars(description = "Verbatim quote from the source that states the fact")]
    pub excerpt: String,
    #[schemars(description = "False when the fact is about a different case or frame than the one researched")]
    pub relevant_to_context: bool,
    #[schemars(description = "Indexes of the listed claims this fact bears on")]
    #[serde(default)]
    pub supports_claims: Vec<usize>,
}

/// Claim verdicts for one context
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedVerdicts {
    pub verdicts: Vec<ExtractedVerdict>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedVerdict {
    #[schemars(description = "Index of the claim in the list provided")]
    pub claim_index: usize,
    #[schemars(description = "0 (certainly false) to 100 (certainly true)")]
    pub truth_percentage: f64,
    #[schemars(description = "0 to 100")]
    pub confidence: f64,
    #[schemars(description = "Ids of the facts that support this verdict")]
    pub supporting_fact_ids: Vec<String>,
    pub rationale: Option<String>,
}

/// One turn of the canonical tool loop
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolLoopTurn {
    #[schemars(description = "Web searches to run before the next turn; empty when finishing")]
    pub search_queries: Vec<String>,
    #[schemars(description = "Final answer; set only when no more searches are needed")]
    pub answer: Option<CanonicalAnswer>,
}

/// Canonical answer schema shared with the staged pipeline
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CanonicalAnswer {
    pub contexts: Vec<ExtractedContext>,
    pub claims: Vec<ExtractedClaim>,
    pub facts: Vec<CanonicalFact>,
    pub verdicts: Vec<CanonicalVerdict>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CanonicalFact {
    pub text: String,
    pub source_url: String,
    pub excerpt: String,
    pub context_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CanonicalVerdict {
    pub claim_index: usize,
    pub truth_percentage: f64,
    pub confidence: f64,
    #[schemars(description = "Indexes into the facts list")]
    pub supporting_fact_indexes: Vec<usize>,
    pub rationale: Option<String>,
}

/// Flexible answer of the experimental dynamic tool loop
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DynamicAnswer {
    pub summary: String,
    pub citations: Vec<Citation>,
    #[schemars(description = "Optional per-claim assessments")]
    #[serde(default)]
    pub assessments: Vec<DynamicAssessment>,
    pub search_queries: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Citation {
    pub url: String,
    pub excerpt: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DynamicAssessment {
    pub claim: String,
    pub truth_percentage: f64,
    pub confidence: f64,
    #[schemars(description = "Indexes into the citations list")]
    #[serde(default)]
    pub citation_indexes: Vec<usize>,
}
