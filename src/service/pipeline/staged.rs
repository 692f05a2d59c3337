//! Staged pipeline: Understand, per-context research, per-context verdicts, aggregation

use async_trait::async_trait;

use super::{AnalysisJob, PipelineError, PipelineStrategy, StrategyOutput, with_display_contexts};
use crate::model::PipelineVariant;
use crate::service::llm::RetryPolicy;
use crate::service::research::ResearchOrchestrator;
use crate::service::understand::understand;
use crate::service::verdict::{aggregate, judge_all};

pub struct StagedPipeline {
    orchestrator: ResearchOrchestrator,
}

impl StagedPipeline {
    pub fn new(orchestrator: ResearchOrchestrator) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl PipelineStrategy for StagedPipeline {
    fn variant(&self) -> PipelineVariant {
        PipelineVariant::Staged
    }

    async fn run(&self, job: &AnalysisJob) -> Result<StrategyOutput, PipelineError> {
        let config = self.orchestrator.config();
        let llm = self.orchestrator.llm();
        let retry = RetryPolicy::from_config(config);

        let understanding = tokio::time::timeout_at(
            job.deadline,
            understand(llm, &job.budget, &job.input.canonical, retry),
        )
        .await
        .map_err(|_| PipelineError::Deadline)??;

        let research = self
            .orchestrator
            .research(&understanding.contexts, &understanding.claims, &job.budget, job.deadline)
            .await;

        // Verdicts are produced from whatever evidence research kept, even past the deadline
        let verdicts = judge_all(
            llm,
            &job.budget,
            &understanding.contexts,
            &understanding.claims,
            &research.facts,
            retry,
        )
        .await;

        let aggregation = aggregate(
            verdicts,
            &research.facts,
            &understanding.contexts,
            &research.reports,
            &config.verdict,
        );

        tracing::info!(
            job_id = %job.job_id,
            contexts = understanding.contexts.len(),
            facts = research.facts.len(),
            overall = ?aggregation.overall.label,
            "Staged pipeline complete"
        );

        Ok(StrategyOutput {
            contexts: with_display_contexts(understanding.contexts, &understanding.claims, &research.facts),
            claims: understanding.claims,
            sources: research.sources,
            facts: research.facts,
            aggregation,
            context_reports: research.reports,
            raw_output: None,
        })
    }
}
