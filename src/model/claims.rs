use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// An atomic, falsifiable assertion derived from the input
// - context_id: exactly one AnalysisContext (or UNSCOPED)
// - harm_potential / structural_centrality: both must hold for a claim to be central
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub text: String,
    pub context_id: String,
    pub harm_potential: bool,
    pub structural_centrality: bool,
}

impl Claim {
    /// Logical AND of the two centrality flags
    pub fn is_central(&self) -> bool {
        self.harm_potential && self.structural_centrality
    }
}

/// Verdict for one claim, produced once per claim per run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimVerdict {
    pub claim_text: String,
    pub context_id: String,
    /// 0 to 100
    pub truth_percentage: f64,
    /// 0 to 100
    pub confidence: f64,
    pub supporting_fact_ids: Vec<String>,
    pub is_central: bool,
    /// Weight left after near-duplicate claims were clustered (1.0 = full weight)
    #[serde(default = "full_weight")]
    pub dedup_weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

fn full_weight() -> f64 {
    1.0
}

impl ClaimVerdict {
    /// A zero-confidence verdict for a claim that could not be assessed
    pub fn insufficient(claim: &Claim, rationale: impl Into<String>) -> Self {
        Self {
            claim_text: claim.text.clone(),
            context_id: claim.context_id.clone(),
            truth_percentage: 50.0,
            confidence: 0.0,
            supporting_fact_ids: Vec::new(),
            is_central: claim.is_central(),
            dedup_weight: 1.0,
            rationale: Some(rationale.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(harm: bool, structural: bool) -> Claim {
        Claim {
            text: "The court annulled the election".to_string(),
            context_id: "TSE_0a1b".to_string(),
            harm_potential: harm,
            structural_centrality: structural,
        }
    }

    #[test]
    fn test_centrality_requires_both_flags() {
        assert!(claim(true, true).is_central());
        assert!(!claim(true, false).is_central());
        assert!(!claim(false, true).is_central());
        assert!(!claim(false, false).is_central());
    }

    #[test]
    fn test_insufficient_verdict_carries_no_weight() {
        let verdict = ClaimVerdict::insufficient(&claim(true, true), "verdict stage failed");
        assert_eq!(verdict.confidence, 0.0);
        assert!(verdict.supporting_fact_ids.is_empty());
        assert!(verdict.is_central);
    }
}
