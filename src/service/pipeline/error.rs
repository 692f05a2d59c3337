//! Error types for pipeline strategies

use serde_json::Value;
use thiserror::Error;

use crate::model::BudgetExceedReason;
use crate::retriever::RetrieverError;
use crate::service::llm::LlmError;
use crate::service::understand::UnderstandError;

/// Why a strategy produced no usable result.
///
/// Any of these makes the dispatcher fall back to the staged pipeline, or
/// fail closed when the staged pipeline itself failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    #[error("Understand stage failed: {0}")]
    Understand(#[from] UnderstandError),

    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Search failed: {0}")]
    Search(#[from] RetrieverError),

    #[error("Budget exceeded: {0}")]
    Budget(BudgetExceedReason),

    #[error("Output violates the answer contract: {0}")]
    Contract(String),

    #[error("Job deadline elapsed")]
    Deadline,

    /// Failure of a strategy whose model output is kept for audit
    #[error("{error}")]
    Rejected { error: Box<PipelineError>, raw_output: Value },
}

impl PipelineError {
    pub fn with_raw_output(self, raw_output: Value) -> Self {
        PipelineError::Rejected {
            error: Box::new(self),
            raw_output,
        }
    }

    /// Model output the failed strategy rejected, if it kept one
    pub fn raw_output(&self) -> Option<&Value> {
        match self {
            PipelineError::Rejected { raw_output, .. } => Some(raw_output),
            _ => None,
        }
    }
}
