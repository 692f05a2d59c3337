use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::claims::{Claim, ClaimVerdict};
use super::context::AnalysisContext;
use super::evidence::{EvidenceFact, FetchedSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    Question,
    Statement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineVariant {
    /// Understand -> Research -> Verdict with per-context isolation
    Staged,
    /// Budget-capped tool loop emitting the canonical schema
    ToolLoopCanonical,
    /// Experimental flexible-schema tool loop
    ToolLoopDynamic,
}

impl fmt::Display for PipelineVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineVariant::Staged => "staged",
            PipelineVariant::ToolLoopCanonical => "tool_loop_canonical",
            PipelineVariant::ToolLoopDynamic => "tool_loop_dynamic",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Selected,
    Running,
    Succeeded,
    FallbackSucceeded,
    Failed,
}

impl RunStatus {
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Selected, RunStatus::Running)
                | (RunStatus::Selected, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Succeeded)
                | (RunStatus::Running, RunStatus::FallbackSucceeded)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

/// Records that the selected strategy was replaced by a more conservative one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FallbackInfo {
    pub used: bool,
    pub from: PipelineVariant,
    pub to: PipelineVariant,
    pub reason: String,
}

/// Why a budget stopped research. Only the first reason of a job is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BudgetExceedReason {
    ScopeIterations { context_id: String, limit: u32 },
    TotalIterations { limit: u32 },
    TotalTokens { limit: u64 },
    TokensPerCall { requested: u64, limit: u64 },
    Timeout { seconds: u64 },
}

impl fmt::Display for BudgetExceedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetExceedReason::ScopeIterations { context_id, limit } => {
                write!(f, "context {} reached {} iterations", context_id, limit)
            }
            BudgetExceedReason::TotalIterations { limit } => {
                write!(f, "job reached {} total iterations", limit)
            }
            BudgetExceedReason::TotalTokens { limit } => {
                write!(f, "job would exceed {} total tokens", limit)
            }
            BudgetExceedReason::TokensPerCall { requested, limit } => {
                write!(f, "call of {} tokens exceeds per-call cap of {}", requested, limit)
            }
            BudgetExceedReason::Timeout { seconds } => {
                write!(f, "job deadline of {}s elapsed", seconds)
            }
        }
    }
}

/// Snapshot of the job budget tracker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStats {
    pub tokens_used: u64,
    pub llm_calls: u32,
    pub total_iterations: u32,
    pub iterations_by_context: BTreeMap<String, u32>,
    pub budget_exceeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exceed_reason: Option<BudgetExceedReason>,
    pub max_total_iterations: u32,
    pub max_iterations_per_context: u32,
    pub max_total_tokens: u64,
    pub enforce_hard: bool,
    /// Limits crossed while running in monitor-only mode
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub monitor_warnings: Vec<String>,
}

/// Research state of a single context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResearchPhase {
    Pending,
    Searching,
    Fetching,
    Extracting,
    Converged,
    BudgetExceeded,
    Exhausted,
}

impl ResearchPhase {
    pub fn can_transition_to(self, next: ResearchPhase) -> bool {
        use ResearchPhase::*;
        if next == BudgetExceeded {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Pending, Searching)
                | (Pending, Converged)
                | (Pending, Exhausted)
                | (Searching, Fetching)
                | (Searching, Exhausted)
                | (Fetching, Extracting)
                | (Fetching, Searching)
                | (Fetching, Converged)
                | (Fetching, Exhausted)
                | (Extracting, Searching)
                | (Extracting, Converged)
                | (Extracting, Exhausted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResearchPhase::Converged | ResearchPhase::BudgetExceeded | ResearchPhase::Exhausted
        )
    }
}

/// Per-context research summary, including failure notes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContextResearchReport {
    pub context_id: String,
    pub phase: ResearchPhase,
    pub iterations: u32,
    pub facts_added: usize,
    pub sources_fetched: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
    /// Fraction (0.0 to 1.0) removed from this context's claim confidences
    pub confidence_penalty: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VerdictLabel {
    True,
    MostlyTrue,
    Mixed,
    MostlyFalse,
    False,
    InsufficientEvidence,
}

impl VerdictLabel {
    pub fn from_truth(truth: Option<f64>) -> Self {
        match truth {
            None => VerdictLabel::InsufficientEvidence,
            Some(t) if t >= 85.0 => VerdictLabel::True,
            Some(t) if t >= 70.0 => VerdictLabel::MostlyTrue,
            Some(t) if t >= 43.0 => VerdictLabel::Mixed,
            Some(t) if t >= 28.0 => VerdictLabel::MostlyFalse,
            Some(_) => VerdictLabel::False,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContextVerdict {
    pub context_id: String,
    /// None when no claim of the context carries weight
    pub truth_percentage: Option<f64>,
    pub confidence: f64,
    pub claim_count: usize,
    pub label: VerdictLabel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OverallVerdict {
    pub truth_percentage: Option<f64>,
    pub confidence: f64,
    pub label: VerdictLabel,
    pub contexts_considered: usize,
}

impl OverallVerdict {
    pub fn insufficient() -> Self {
        Self {
            truth_percentage: None,
            confidence: 0.0,
            label: VerdictLabel::InsufficientEvidence,
            contexts_considered: 0,
        }
    }
}

/// How much a reader can rely on a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResultQuality {
    Verified,
    VerifiedWithCaveats,
    InsufficientEvidence,
}

/// Top-level unit of work, finalized exactly once and handed to persistence
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub job_id: String,
    pub input_text: String,
    /// Statement form the pipeline actually analysed
    pub canonical_input: String,
    pub input_type: InputType,
    pub pipeline_variant: PipelineVariant,
    pub status: RunStatus,
    pub contexts: Vec<AnalysisContext>,
    pub claims: Vec<Claim>,
    pub sources: Vec<FetchedSource>,
    pub facts: Vec<EvidenceFact>,
    pub claim_verdicts: Vec<ClaimVerdict>,
    pub context_verdicts: Vec<ContextVerdict>,
    pub overall_verdict: OverallVerdict,
    pub budget_stats: BudgetStats,
    pub context_reports: Vec<ContextResearchReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackInfo>,
    /// Set on failed runs only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Raw structured model output, retained for audit of experimental strategies
    /// (kept as well when that output was rejected and a fallback answered)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub raw_output: Option<serde_json::Value>,
    pub quality: ResultQuality,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Classify a finished run for display
    pub fn assess_quality(&self) -> ResultQuality {
        if self.status == RunStatus::Failed || self.overall_verdict.truth_percentage.is_none() {
            return ResultQuality::InsufficientEvidence;
        }

        let degraded = self.fallback.as_ref().is_some_and(|f| f.used)
            || self.budget_stats.budget_exceeded
            || self.context_reports.iter().any(|r| !r.failures.is_empty());

        if degraded {
            ResultQuality::VerifiedWithCaveats
        } else {
            ResultQuality::Verified
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_transitions() {
        assert!(RunStatus::Selected.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::FallbackSucceeded));
        assert!(!RunStatus::Succeeded.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Selected.can_transition_to(RunStatus::Succeeded));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Running));
    }

    #[test]
    fn test_research_phase_transitions() {
        assert!(ResearchPhase::Pending.can_transition_to(ResearchPhase::Searching));
        assert!(ResearchPhase::Extracting.can_transition_to(ResearchPhase::Converged));
        assert!(ResearchPhase::Fetching.can_transition_to(ResearchPhase::BudgetExceeded));
        assert!(!ResearchPhase::Converged.can_transition_to(ResearchPhase::Searching));
        assert!(!ResearchPhase::Converged.can_transition_to(ResearchPhase::BudgetExceeded));
        assert!(!ResearchPhase::Pending.can_transition_to(ResearchPhase::Extracting));
    }

    #[test]
    fn test_verdict_labels() {
        assert_eq!(VerdictLabel::from_truth(None), VerdictLabel::InsufficientEvidence);
        assert_eq!(VerdictLabel::from_truth(Some(92.0)), VerdictLabel::True);
        assert_eq!(VerdictLabel::from_truth(Some(50.0)), VerdictLabel::Mixed);
        assert_eq!(VerdictLabel::from_truth(Some(5.0)), VerdictLabel::False);
    }

    #[test]
    fn test_result_keys_are_camel_case() {
        let stats = BudgetStats {
            budget_exceeded: true,
            exceed_reason: Some(BudgetExceedReason::TotalIterations { limit: 2 }),
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["budgetExceeded"], true);
        assert_eq!(json["exceedReason"]["kind"], "total_iterations");
    }
}
