//! Synthesis-marker rules
//!
//! Ordered, pluggable predicates that detect excerpts written by a model rather
//! than quoted from a source. The list is heuristic; the tests pin down the
//! accepted and rejected exemplars.

use regex::Regex;

/// Built-in markers (name, case-insensitive pattern)
const DEFAULT_MARKERS: &[(&str, &str)] = &[
    (
        "based_on_my_analysis",
        r"\bbased on (my|our) (own )?(analysis|research|review|findings|understanding|knowledge|search)\b",
    ),
    (
        "according_to_my_findings",
        r"\baccording to (my|our) (analysis|research|review|findings|sources|knowledge|search)\b",
    ),
    (
        "first_person_finding",
        r"\b(i|we) (have )?(found|determined|concluded|verified|confirmed|believe|think) that\b",
    ),
    (
        "my_analysis_shows",
        r"\b(my|our) (analysis|research|review|findings|investigation) (shows?|indicates?|suggests?|reveals?|confirms?)\b",
    ),
    (
        "upon_review",
        r"\b(upon|after|from) (my|our) (review|analysis|research)\b",
    ),
    ("model_disclaimer", r"\bas an ai\b|\bas a (large )?language model\b"),
];

/// A named synthesized-text predicate
pub struct SynthesisMarker {
    name: String,
    pattern: Regex,
}

impl SynthesisMarker {
    /// Build a marker from a regex; matching is case-insensitive
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            pattern: Regex::new(&format!("(?i){}", pattern))?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

/// Ordered marker list; the first matching marker is reported
pub struct SynthesisRuleSet {
    markers: Vec<SynthesisMarker>,
}

impl SynthesisRuleSet {
    /// The built-in markers plus configured extras.
    /// Extras that fail to compile are skipped with a warning.
    pub fn with_extras(extra_patterns: &[String]) -> Self {
        let mut markers: Vec<SynthesisMarker> = DEFAULT_MARKERS
            .iter()
            .filter_map(|(name, pattern)| SynthesisMarker::new(*name, pattern).ok())
            .collect();

        for (i, pattern) in extra_patterns.iter().enumerate() {
            match SynthesisMarker::new(format!("configured_{}", i + 1), pattern) {
                Ok(marker) => markers.push(marker),
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "Ignoring invalid synthesis marker");
                }
            }
        }

        Self { markers }
    }

    /// Name of the first marker matching `text`
    pub fn first_match(&self, text: &str) -> Option<&str> {
        self.markers
            .iter()
            .find(|m| m.matches(text))
            .map(SynthesisMarker::name)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.markers.len()
    }
}

impl Default for SynthesisRuleSet {
    fn default() -> Self {
        Self::with_extras(&[])
    }
}
