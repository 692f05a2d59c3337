use serde::Deserialize;
use std::fs;
use std::path::Path;
use url::Url;

use super::run::PipelineVariant;

const ENV_CONFIG_PATH: &str = "FACTHARBOR_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Retriever filtering configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrieverConfig {
    /// Allowed domains (whitelist). If empty, all domains are allowed.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Denied domains (blacklist). Applied after allow list.
    #[serde(default)]
    pub deny: Vec<String>,
}

impl RetrieverConfig {
    /// Check if a URL is allowed based on the allow/deny lists
    pub fn is_url_allowed(&self, url: &Url) -> bool {
        let host = match url.host_str() {
            Some(h) => h.to_lowercase(),
            None => return false,
        };

        if self.deny.iter().any(|d| host.contains(&d.to_lowercase())) {
            return false;
        }

        if self.allow.is_empty() {
            return true;
        }

        self.allow.iter().any(|a| host.contains(&a.to_lowercase()))
    }
}

/// Iteration and token caps for one job.
///
/// Defaults are calibrated so the 95th percentile of legitimate multi-context
/// inputs completes without hitting a cap.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResearchBudget {
    pub max_iterations_per_context: u32,
    pub max_total_iterations: u32,
    pub max_total_tokens: u64,
    pub max_tokens_per_call: u64,
    /// When false, limits are only reported (monitor-only mode)
    pub enforce_hard: bool,
}

impl Default for ResearchBudget {
    fn default() -> Self {
        Self {
            max_iterations_per_context: 5,
            max_total_iterations: 20,
            max_total_tokens: 750_000,
            max_tokens_per_call: 100_000,
            enforce_hard: true,
        }
    }
}

/// Research orchestrator settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResearchSettings {
    /// Worker pool size across contexts
    pub max_concurrent_contexts: usize,
    /// Fan-out cap of documents fetched per iteration
    pub max_sources_per_iteration: usize,
    pub max_search_results: usize,
    /// Retries for transport failures of search and fetch calls
    pub fetch_retries: u32,
    pub retry_backoff_ms: u64,
    /// Hard wall-clock deadline for the whole job
    pub job_timeout_secs: u64,
    /// Source text shown to the extraction model is truncated to this length
    pub max_source_chars: usize,
    /// Query the grounded search provider first, when one is configured
    pub grounded_search: bool,
    /// Confidence removed per recorded context failure
    pub failure_penalty_step: f64,
    pub max_failure_penalty: f64,
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_contexts: 3,
            max_sources_per_iteration: 4,
            max_search_results: 8,
            fetch_retries: 2,
            retry_backoff_ms: 500,
            job_timeout_secs: 300,
            max_source_chars: 15_000,
            grounded_search: false,
            failure_penalty_step: 0.1,
            max_failure_penalty: 0.5,
        }
    }
}

/// Verdict aggregation calibration constants
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregationSettings {
    /// Jaccard similarity at which two claims count as near-duplicates
    pub similarity_threshold: f64,
    /// Weight multiplier of central claims (non-central claims weigh 1.0)
    pub central_weight: f64,
    /// Allowed overall-verdict divergence between a question and its statement form
    pub neutrality_tolerance: f64,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            central_weight: 2.0,
            neutrality_tolerance: 4.0,
        }
    }
}

/// Ground Realism gate settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvenanceSettings {
    pub min_excerpt_chars: usize,
    /// Additional case-insensitive regex markers of synthesized text
    pub extra_synthesis_markers: Vec<String>,
    /// Require excerpts to be found in the fetched document text
    pub require_grounded_excerpts: bool,
}

impl Default for ProvenanceSettings {
    fn default() -> Self {
        Self {
            min_excerpt_chars: 20,
            extra_synthesis_markers: Vec::new(),
            require_grounded_excerpts: true,
        }
    }
}

/// Strategy dispatch settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub default_variant: PipelineVariant,
    /// Turn cap of the tool-loop strategies
    pub tool_loop_max_turns: u32,
    pub max_queries_per_turn: usize,
    /// Retries when model output fails schema validation
    pub schema_retries: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            default_variant: PipelineVariant::Staged,
            tool_loop_max_turns: 4,
            max_queries_per_turn: 3,
            schema_retries: 2,
        }
    }
}

/// Immutable per-job analysis configuration.
///
/// Built once at startup and handed to every job by reference; core logic
/// never reads the process environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub budget: ResearchBudget,
    pub research: ResearchSettings,
    pub verdict: AggregationSettings,
    pub provenance: ProvenanceSettings,
    pub pipeline: PipelineSettings,
}

/// YAML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub retrievers: RetrieverConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub retrievers: RetrieverConfig,
    pub analysis: AnalysisConfig,
    pub port: u16,
    pub host: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retrievers: RetrieverConfig::default(),
            analysis: AnalysisConfig::default(),
            port: 8080,
            host: "127.0.0.1".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment and config file
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let config_path = std::env::var(ENV_CONFIG_PATH)
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let file = Self::load_config_file(&config_path).unwrap_or_default();

        Self {
            retrievers: file.retrievers,
            analysis: file.analysis,
            port,
            host,
        }
    }

    /// Load configuration from YAML file
    fn load_config_file(path: &str) -> Option<ConfigFile> {
        let path = Path::new(path);

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return None;
        }

        match fs::read_to_string(path) {
            Ok(contents) => {
                let contents = contents.trim();
                if contents.is_empty() {
                    tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
                    return Some(ConfigFile::default());
                }

                match Self::parse(contents) {
                    Ok(config) => {
                        tracing::info!(path = %path.display(), "Loaded configuration from file");
                        Some(config)
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to parse config file, using defaults");
                        None
                    }
                }
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read config file, using defaults");
                None
            }
        }
    }

    fn parse(contents: &str) -> Result<ConfigFile, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_analysis_section_keeps_defaults() {
        let yaml = r#"
retrievers:
  deny: ["example.org"]
analysis:
  budget:
    max_total_iterations: 2
  pipeline:
    default_variant: tool_loop_canonical
"#;
        let file = Config::parse(yaml).unwrap();
        assert_eq!(file.analysis.budget.max_total_iterations, 2);
        assert_eq!(file.analysis.budget.max_iterations_per_context, 5);
        assert!(file.analysis.budget.enforce_hard);
        assert_eq!(
            file.analysis.pipeline.default_variant,
            PipelineVariant::ToolLoopCanonical
        );
        assert_eq!(file.analysis.verdict.similarity_threshold, 0.6);
        assert_eq!(file.retrievers.deny, vec!["example.org".to_string()]);
    }

    #[test]
    fn test_deny_list_blocks_host() {
        let config = RetrieverConfig {
            allow: vec![],
            deny: vec!["spam.example".to_string()],
        };
        assert!(!config.is_url_allowed(&Url::parse("https://spam.example/a").unwrap()));
        assert!(config.is_url_allowed(&Url::parse("https://court.gov/ruling").unwrap()));
    }
}
