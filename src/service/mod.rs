pub mod budget;
pub mod cache;
pub mod input;
pub mod jobs;
pub mod llm;
pub mod pipeline;
pub mod provenance;
pub mod research;
pub mod scope;
pub mod understand;
pub mod verdict;

#[cfg(test)]
pub mod testing;

pub use cache::{CachedFetcher, CachedSearch, SourceCache};
pub use jobs::AnalysisService;
pub use llm::{LlmClient, RigCompletionProvider};
pub use pipeline::PipelineDispatcher;
pub use provenance::ProvenanceValidator;
pub use research::{ResearchDeps, ResearchOrchestrator};
