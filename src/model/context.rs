use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Reserved id for evidence that cannot be attributed to any detected context.
/// Display-only: never part of verdict aggregation.
pub const UNSCOPED_ID: &str = "UNSCOPED";

/// Returns true for the reserved `UNSCOPED` sentinel id
pub fn is_unscoped_id(id: &str) -> bool {
    id == UNSCOPED_ID
}

// A distinct analytical frame inside one input
// - id: stable, content-derived (see service::scope)
// - name: human readable label
// - subject: what is being examined in this frame
// - metadata: institution, court, jurisdiction and date anchor when known
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisContext {
    pub id: String,
    pub name: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: ContextMetadata,
}

impl AnalysisContext {
    /// The sentinel context used for display of unattributable evidence
    pub fn unscoped() -> Self {
        Self {
            id: UNSCOPED_ID.to_string(),
            name: "Unscoped evidence".to_string(),
            subject: String::new(),
            description: None,
            metadata: ContextMetadata::default(),
        }
    }

    pub fn is_unscoped(&self) -> bool {
        is_unscoped_id(&self.id)
    }
}

/// Documented optional attributes of a context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContextMetadata {
    /// Issuing or deciding institution (e.g. an electoral tribunal, an agency)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
    /// Court hearing the proceeding, when the context is a legal case
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub court: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,
    /// Date the context is anchored to (ruling date, study period, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_anchor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methodology: Option<String>,
}

impl ContextMetadata {
    /// Fill fields that are missing here from `other`
    pub fn merge_missing(&mut self, other: &ContextMetadata) {
        fn fill(target: &mut Option<String>, source: &Option<String>) {
            if target.is_none() {
                target.clone_from(source);
            }
        }
        fill(&mut self.institution, &other.institution);
        fill(&mut self.court, &other.court);
        fill(&mut self.jurisdiction, &other.jurisdiction);
        fill(&mut self.date_anchor, &other.date_anchor);
        fill(&mut self.methodology, &other.methodology);
    }
}

/// A context as proposed by the Understand stage, before it has an id
#[derive(Debug, Clone, Default)]
pub struct CandidateContext {
    pub name: String,
    pub subject: String,
    pub description: Option<String>,
    pub metadata: ContextMetadata,
}
