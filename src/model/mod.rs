pub mod claims;
pub mod config;
pub mod context;
pub mod evidence;
pub mod extraction;
pub mod run;

pub use claims::{Claim, ClaimVerdict};
pub use config::{
    AggregationSettings, AnalysisConfig, Config, ProvenanceSettings,
    ResearchBudget, ResearchSettings, RetrieverConfig,
};
pub use context::{AnalysisContext, CandidateContext, ContextMetadata, UNSCOPED_ID, is_unscoped_id};
pub use evidence::{EvidenceFact, FetchedSource, GroundingMetadata, SourceCategory};
pub use extraction::*;
pub use run::*;
