//! Provenance validation (the Ground Realism gate)
//!
//! Only evidence with real, attributable provenance may influence a verdict.
//! Rules run in order and the first failure wins:
//! 1. the source URL is a public, absolute http(s) URL
//! 2. the excerpt is present and long enough
//! 3. the excerpt carries no marker of synthesized text
//!
//! Absence of provenance is treated as absence of evidence, never as weak evidence.

use std::net::{Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::model::{EvidenceFact, FetchedSource, ProvenanceSettings, SourceCategory};

pub mod grounding;
pub mod rules;

pub use grounding::excerpt_is_grounded;
pub use rules::SynthesisRuleSet;

/// URL schemes that can never carry provenance
const FORBIDDEN_SCHEMES: &[&str] = &["javascript", "about", "chrome", "data", "file", "blob"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Passed every rule
    Info,
    /// Missing or malformed attribution
    Error,
    /// Attribution that looks fabricated or unsafe
    Critical,
}

/// Why a fact was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RejectionReason {
    #[error("source URL is empty")]
    MissingUrl,
    #[error("source URL is anchor-only: {0}")]
    AnchorOnly(String),
    #[error("source URL is not a valid absolute URL: {0}")]
    InvalidUrl(String),
    #[error("source URL uses a forbidden scheme: {0}")]
    ForbiddenScheme(String),
    #[error("source URL does not point to a public host: {0}")]
    NonPublicHost(String),
    #[error("source excerpt is empty")]
    MissingExcerpt,
    #[error("source excerpt has {len} characters, minimum is {min}")]
    ExcerptTooShort { len: usize, min: usize },
    #[error("source excerpt matches synthesis marker '{0}'")]
    SyntheticExcerpt(String),
    #[error("source excerpt not found in the fetched document")]
    ExcerptNotInSource,
}

impl RejectionReason {
    pub fn severity(&self) -> Severity {
        match self {
            RejectionReason::ForbiddenScheme(_)
            | RejectionReason::NonPublicHost(_)
            | RejectionReason::SyntheticExcerpt(_)
            | RejectionReason::ExcerptNotInSource => Severity::Critical,
            _ => Severity::Error,
        }
    }
}

/// Outcome of validating one fact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceCheck {
    pub valid: bool,
    pub severity: Severity,
    pub reason: Option<RejectionReason>,
}

impl ProvenanceCheck {
    fn passed() -> Self {
        Self {
            valid: true,
            severity: Severity::Info,
            reason: None,
        }
    }

    fn rejected(reason: RejectionReason) -> Self {
        Self {
            valid: false,
            severity: reason.severity(),
            reason: Some(reason),
        }
    }
}

impl From<Result<(), RejectionReason>> for ProvenanceCheck {
    fn from(result: Result<(), RejectionReason>) -> Self {
        match result {
            Ok(()) => ProvenanceCheck::passed(),
            Err(reason) => ProvenanceCheck::rejected(reason),
        }
    }
}

/// Facts split into those that may reach the verdict stage and those that may not
#[derive(Debug, Default)]
pub struct ProvenanceFilterOutcome {
    pub accepted: Vec<EvidenceFact>,
    pub rejected: Vec<(EvidenceFact, RejectionReason)>,
}

/// Result of checking a batch of grounded-search sources
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceBatchCheck {
    /// Discard grounded results and re-issue the query through standard search
    pub should_fallback_to_external_search: bool,
    /// URLs of grounded sources that failed the check, with reasons
    pub rejected: Vec<(String, String)>,
}

/// The Ground Realism gate
pub struct ProvenanceValidator {
    rules: SynthesisRuleSet,
    min_excerpt_chars: usize,
    require_grounded_excerpts: bool,
}

impl ProvenanceValidator {
    pub fn new(settings: &ProvenanceSettings) -> Self {
        Self {
            rules: SynthesisRuleSet::with_extras(&settings.extra_synthesis_markers),
            min_excerpt_chars: settings.min_excerpt_chars,
            require_grounded_excerpts: settings.require_grounded_excerpts,
        }
    }

    /// Apply the ordered provenance rules to a fact
    pub fn validate_fact(&self, fact: &EvidenceFact) -> ProvenanceCheck {
        self.check_fact(fact).into()
    }

    /// Provenance rules plus the requirement that the excerpt is quoted from `source_text`
    pub fn validate_fact_against_source(&self, fact: &EvidenceFact, source_text: &str) -> ProvenanceCheck {
        self.check_fact(fact)
            .and_then(|()| {
                if self.require_grounded_excerpts && !excerpt_is_grounded(&fact.source_excerpt, source_text) {
                    Err(RejectionReason::ExcerptNotInSource)
                } else {
                    Ok(())
                }
            })
            .into()
    }

    fn check_fact(&self, fact: &EvidenceFact) -> Result<(), RejectionReason> {
        validate_source_url(&fact.source_url)?;
        self.check_excerpt(&fact.source_excerpt)
    }

    fn check_excerpt(&self, excerpt: &str) -> Result<(), RejectionReason> {
        let excerpt = excerpt.trim();
        if excerpt.is_empty() {
            return Err(RejectionReason::MissingExcerpt);
        }

        let len = excerpt.chars().count();
        if len < self.min_excerpt_chars {
            return Err(RejectionReason::ExcerptTooShort {
                len,
                min: self.min_excerpt_chars,
            });
        }

        match self.rules.first_match(excerpt) {
            Some(marker) => Err(RejectionReason::SyntheticExcerpt(marker.to_string())),
            None => Ok(()),
        }
    }

    /// Keep only facts passing provenance; every rejection is logged
    pub fn filter_facts_by_provenance(&self, facts: Vec<EvidenceFact>) -> ProvenanceFilterOutcome {
        let mut outcome = ProvenanceFilterOutcome::default();

        for fact in facts {
            match self.check_fact(&fact) {
                Ok(()) => outcome.accepted.push(fact),
                Err(reason) => {
                    log_rejection(&fact, &reason);
                    outcome.rejected.push((fact, reason));
                }
            }
        }

        outcome
    }

    /// Inspect grounded-search sources; any source without a real URL or
    /// grounding metadata sends the whole batch to standard search
    pub fn validate_source_batch(&self, sources: &[FetchedSource]) -> SourceBatchCheck {
        let mut check = SourceBatchCheck::default();

        for source in sources
            .iter()
            .filter(|s| s.category == SourceCategory::GroundedSearch)
        {
            let problem = match validate_source_url(&source.url) {
                Err(reason) => Some(reason.to_string()),
                Ok(_) => match &source.grounding {
                    None => Some("missing grounding metadata".to_string()),
                    Some(g) if g.is_empty() => Some("empty grounding metadata".to_string()),
                    Some(_) => None,
                },
            };

            if let Some(problem) = problem {
                tracing::warn!(
                    url = %source.url,
                    problem = %problem,
                    "Grounded source failed provenance, falling back to standard search"
                );
                check.should_fallback_to_external_search = true;
                check.rejected.push((source.url.clone(), problem));
            }
        }

        check
    }
}

impl Default for ProvenanceValidator {
    fn default() -> Self {
        Self::new(&ProvenanceSettings::default())
    }
}

fn log_rejection(fact: &EvidenceFact, reason: &RejectionReason) {
    match reason.severity() {
        Severity::Critical => tracing::warn!(
            fact_id = %fact.id,
            context_id = %fact.context_id,
            source_url = %fact.source_url,
            reason = %reason,
            "Fact rejected by provenance gate"
        ),
        _ => tracing::debug!(
            fact_id = %fact.id,
            context_id = %fact.context_id,
            source_url = %fact.source_url,
            reason = %reason,
            "Fact rejected by provenance gate"
        ),
    }
}

/// Parse and vet a source URL: absolute, http(s), public host
pub fn validate_source_url(raw: &str) -> Result<Url, RejectionReason> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(RejectionReason::MissingUrl);
    }
    if raw.starts_with('#') {
        return Err(RejectionReason::AnchorOnly(raw.to_string()));
    }

    let url = Url::parse(raw).map_err(|_| RejectionReason::InvalidUrl(raw.to_string()))?;

    let scheme = url.scheme();
    if FORBIDDEN_SCHEMES.contains(&scheme) {
        return Err(RejectionReason::ForbiddenScheme(scheme.to_string()));
    }
    if scheme != "http" && scheme != "https" {
        return Err(RejectionReason::InvalidUrl(raw.to_string()));
    }

    match url.host() {
        None => Err(RejectionReason::InvalidUrl(raw.to_string())),
        Some(Host::Domain(domain)) => {
            let domain = domain.to_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") || domain.ends_with(".local") {
                Err(RejectionReason::NonPublicHost(domain))
            } else {
                Ok(url)
            }
        }
        Some(Host::Ipv4(ip)) if !is_public_ipv4(&ip) => Err(RejectionReason::NonPublicHost(ip.to_string())),
        Some(Host::Ipv6(ip)) if !is_public_ipv6(&ip) => Err(RejectionReason::NonPublicHost(ip.to_string())),
        Some(_) => Ok(url),
    }
}

fn is_public_ipv4(ip: &Ipv4Addr) -> bool {
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation())
}

fn is_public_ipv6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    !(ip.is_loopback() || ip.is_unspecified() || unique_local || link_local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GroundingMetadata;

    fn fact(url: &str, excerpt: &str) -> EvidenceFact {
        EvidenceFact {
            id: "F_test".to_string(),
            text: "The judge ruled on the appeal".to_string(),
            source_id: "S_test".to_string(),
            source_url: url.to_string(),
            source_excerpt: excerpt.to_string(),
            context_id: "TSE_0000".to_string(),
        }
    }

    fn source(url: &str, grounding: Option<GroundingMetadata>) -> FetchedSource {
        FetchedSource {
            id: "S_1".to_string(),
            url: url.to_string(),
            title: None,
            full_text: String::new(),
            category: SourceCategory::GroundedSearch,
            reliability_score: 0.5,
            grounding,
        }
    }

    #[test]
    fn test_synthesized_excerpt_rejected() {
        let validator = ProvenanceValidator::default();
        let check = validator.validate_fact(&fact(
            "https://news.example.com/ruling",
            "Based on my analysis, X happened",
        ));
        assert!(!check.valid);
        assert_eq!(check.severity, Severity::Critical);
        assert!(matches!(check.reason, Some(RejectionReason::SyntheticExcerpt(_))));
    }

    #[test]
    fn test_attributed_excerpt_accepted() {
        let validator = ProvenanceValidator::default();
        let check = validator.validate_fact(&fact(
            "https://news.example.com/ruling",
            "According to the court filing dated March 3, the judge ruled...",
        ));
        assert!(check.valid, "{:?}", check.reason);
        assert_eq!(check.severity, Severity::Info);
    }

    #[test]
    fn test_url_rules() {
        for url in [
            "",
            "#section-2",
            "javascript:alert(1)",
            "about:blank",
            "chrome://settings",
            "http://localhost:3000/a",
            "http://192.168.1.10/doc",
            "http://10.0.0.7/doc",
            "http://127.0.0.1/doc",
            "http://[::1]/doc",
            "ftp://files.example.com/doc",
            "/relative/path",
        ] {
            assert!(validate_source_url(url).is_err(), "should reject {:?}", url);
        }
        assert!(validate_source_url("https://www.tse.jus.br/comunicacao").is_ok());
        assert!(validate_source_url("http://93.184.216.34/page").is_ok());
    }

    #[test]
    fn test_url_rule_runs_before_excerpt_rules() {
        let validator = ProvenanceValidator::default();
        let check = validator.validate_fact(&fact("about:blank", "short"));
        assert_eq!(check.reason, Some(RejectionReason::ForbiddenScheme("about".to_string())));
    }

    #[test]
    fn test_short_excerpt_rejected() {
        let validator = ProvenanceValidator::default();
        let check = validator.validate_fact(&fact("https://example.com/a", "Too short"));
        assert_eq!(
            check.reason,
            Some(RejectionReason::ExcerptTooShort { len: 9, min: 20 })
        );
        assert_eq!(check.severity, Severity::Error);
    }

    #[test]
    fn test_excerpt_must_be_in_source() {
        let validator = ProvenanceValidator::default();
        let f = fact(
            "https://example.com/a",
            "The tribunal declared the candidate ineligible for eight years",
        );
        let grounded = validator.validate_fact_against_source(
            &f,
            "On Friday the tribunal declared the candidate ineligible for eight years.",
        );
        let invented = validator.validate_fact_against_source(&f, "Unrelated page about football.");

        assert!(grounded.valid);
        assert_eq!(invented.reason, Some(RejectionReason::ExcerptNotInSource));
    }

    #[test]
    fn test_filter_drops_rejected_facts() {
        let validator = ProvenanceValidator::default();
        let outcome = validator.filter_facts_by_provenance(vec![
            fact(
                "https://example.com/a",
                "The electoral court ruled 5-2 against the candidate.",
            ),
            fact("http://localhost/a", "The electoral court ruled 5-2 against the candidate."),
            fact("https://example.com/b", "I found that the court ruled against him."),
        ]);

        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.rejected.len(), 2);
    }

    #[test]
    fn test_grounded_batch_without_metadata_falls_back() {
        let validator = ProvenanceValidator::default();
        let good = source(
            "https://example.com/a",
            Some(GroundingMetadata {
                query: "q".to_string(),
                supports: vec!["The court ruled".to_string()],
            }),
        );

        let ok = validator.validate_source_batch(std::slice::from_ref(&good));
        assert!(!ok.should_fallback_to_external_search);

        let check = validator.validate_source_batch(&[good, source("https://example.com/b", None)]);
        assert!(check.should_fallback_to_external_search);
        assert_eq!(check.rejected.len(), 1);

        let fake_url = validator.validate_source_batch(&[source(
            "",
            Some(GroundingMetadata {
                query: "q".to_string(),
                supports: vec!["x".to_string()],
            }),
        )]);
        assert!(fake_url.should_fallback_to_external_search);
    }

    #[test]
    fn test_standard_sources_not_inspected_by_batch_check() {
        let validator = ProvenanceValidator::default();
        let mut s = source("https://example.com/a", None);
        s.category = SourceCategory::StandardSearch;
        assert!(!validator.validate_source_batch(&[s]).should_fallback_to_external_search);
    }
}
