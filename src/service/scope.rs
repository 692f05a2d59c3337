//! Scope canonicalization
//!
//! Assigns deterministic, content-derived ids to analytical contexts and merges
//! candidates that describe the same frame. The same semantic content yields
//! the same id across runs, regardless of detection order or of whether the
//! input was phrased as a question or a statement.

use std::collections::{BTreeMap, HashMap, HashSet};

use sha2::{Digest, Sha256};

use crate::model::{AnalysisContext, CandidateContext, UNSCOPED_ID};

/// Prefix of ids for contexts without an extractable institution code
const GENERIC_PREFIX: &str = "SCOPE";

/// Projection fields are truncated to this many characters before hashing
const PROJECTION_FIELD_CHARS: usize = 100;

const MIN_CODE_LEN: usize = 2;
const MAX_CODE_LEN: usize = 6;

/// Institutions whose customary acronym differs from their English initials
const KNOWN_INSTITUTIONS: &[(&str, &str)] = &[
    ("supreme electoral tribunal", "TSE"),
    ("superior electoral court", "TSE"),
    ("tribunal superior eleitoral", "TSE"),
    ("supreme federal court", "STF"),
    ("supremo tribunal federal", "STF"),
    ("superior court of justice", "STJ"),
    ("superior tribunal de justiça", "STJ"),
    ("supreme court of the united states", "SCOTUS"),
    ("u.s. supreme court", "SCOTUS"),
    ("us supreme court", "SCOTUS"),
    ("european court of human rights", "ECHR"),
    ("international court of justice", "ICJ"),
    ("international criminal court", "ICC"),
    ("court of justice of the european union", "CJEU"),
    ("world health organization", "WHO"),
    ("food and drug administration", "FDA"),
    ("intergovernmental panel on climate change", "IPCC"),
];

/// Words skipped when building initials from a name
const INITIALS_STOPWORDS: &[&str] = &[
    "of", "the", "and", "for", "on", "in", "de", "da", "do", "des", "du", "la", "le", "del", "y",
    "et", "a", "an",
];

/// Assign stable ids to candidate contexts.
///
/// Candidates with identical normalized projections are merged into one
/// context. Distinct projections that hash to the same id are ranked by
/// projection: the smallest keeps the id, the others receive a numeric suffix
/// and a warning is logged. Output keeps first-appearance order.
pub fn canonicalize(candidates: Vec<CandidateContext>) -> Vec<AnalysisContext> {
    let mut contexts: Vec<AnalysisContext> = Vec::with_capacity(candidates.len());
    let mut projections: Vec<String> = Vec::with_capacity(candidates.len());
    let mut by_projection: HashMap<String, usize> = HashMap::new();

    for candidate in candidates {
        let projection = projection(&candidate);

        if let Some(&idx) = by_projection.get(&projection) {
            tracing::debug!(
                context_id = %contexts[idx].id,
                name = %candidate.name,
                "Merging duplicate context candidate"
            );
            contexts[idx].metadata.merge_missing(&candidate.metadata);
            if contexts[idx].description.is_none() {
                contexts[idx].description = candidate.description.clone();
            }
            continue;
        }

        by_projection.insert(projection.clone(), contexts.len());
        contexts.push(AnalysisContext {
            id: context_id_for(&candidate, &projection),
            name: candidate.name.trim().to_string(),
            subject: candidate.subject.trim().to_string(),
            description: candidate
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            metadata: candidate.metadata,
        });
        projections.push(projection);
    }

    disambiguate(&mut contexts, &projections);
    contexts
}

/// Compute the id of a single candidate, without collision handling
pub fn context_id_for(candidate: &CandidateContext, projection: &str) -> String {
    let hash = content_hash(projection);
    match institution_code(candidate) {
        Some(code) => format!("{}_{}", code, &hash[..4]),
        None => format!("{}_{}", GENERIC_PREFIX, &hash[..8]),
    }
}

/// Resolve a context reference (id or name) against canonical contexts.
/// Unknown references resolve to `UNSCOPED`.
pub fn attribute_context(reference: Option<&str>, contexts: &[AnalysisContext]) -> String {
    let Some(reference) = reference.map(str::trim).filter(|r| !r.is_empty()) else {
        return UNSCOPED_ID.to_string();
    };

    let normalized = normalize(reference);
    contexts
        .iter()
        .find(|c| c.id == reference || normalize(&c.name) == normalized)
        .map(|c| c.id.clone())
        .unwrap_or_else(|| UNSCOPED_ID.to_string())
}

/// Normalized projection `{name, description[:100], institution, subject[:100]}`
fn projection(candidate: &CandidateContext) -> String {
    let institution = candidate
        .metadata
        .institution
        .as_deref()
        .or(candidate.metadata.court.as_deref())
        .unwrap_or("");

    format!(
        "{}|{}|{}|{}",
        normalize(&candidate.name),
        truncate(&normalize(candidate.description.as_deref().unwrap_or("")), PROJECTION_FIELD_CHARS),
        normalize(institution),
        truncate(&normalize(&candidate.subject), PROJECTION_FIELD_CHARS),
    )
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Hex-encoded SHA-256 of the projection
fn content_hash(projection: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(projection.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Suffix colliding ids; `projections[i]` belongs to `contexts[i]`
fn disambiguate(contexts: &mut [AnalysisContext], projections: &[String]) {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, context) in contexts.iter().enumerate() {
        groups.entry(context.id.clone()).or_default().push(idx);
    }
    let mut taken: HashSet<String> = groups.keys().cloned().collect();

    for (base_id, mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        members.sort_by(|a, b| projections[*a].cmp(&projections[*b]));

        let mut suffix = 2;
        for &idx in &members[1..] {
            let mut id = format!("{}_{}", base_id, suffix);
            while taken.contains(&id) {
                suffix += 1;
                id = format!("{}_{}", base_id, suffix);
            }
            suffix += 1;
            tracing::warn!(
                base_id = %base_id,
                assigned_id = %id,
                projection = %projections[idx],
                "Context id collision, appended disambiguating suffix"
            );
            taken.insert(id.clone());
            contexts[idx].id = id;
        }
    }
}

/// Extract a short institution code from institution, court, or name
fn institution_code(candidate: &CandidateContext) -> Option<String> {
    [
        candidate.metadata.institution.as_deref(),
        candidate.metadata.court.as_deref(),
        Some(candidate.name.as_str()),
    ]
    .into_iter()
    .flatten()
    .find_map(code_from_text)
    .filter(|code| code != UNSCOPED_ID && code != GENERIC_PREFIX)
}

fn code_from_text(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    if let Some((_, code)) = KNOWN_INSTITUTIONS.iter().find(|(name, _)| lower.contains(name)) {
        return Some((*code).to_string());
    }

    parenthesized_acronym(text)
        .or_else(|| all_caps_token(text))
        .or_else(|| initials(text))
}

/// "Tribunal Superior Eleitoral (TSE)" -> TSE
fn parenthesized_acronym(text: &str) -> Option<String> {
    let start = text.find('(')?;
    let end = text[start..].find(')')? + start;
    let inner = text[start + 1..end].trim();
    is_code(inner).then(|| inner.to_string())
}

fn all_caps_token(text: &str) -> Option<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .find(|token| is_code(token))
        .map(str::to_string)
}

/// Initials of capitalized words, only for names of two or more such words
fn initials(text: &str) -> Option<String> {
    let words: Vec<&str> = text
        .split_whitespace()
        .filter(|w| !INITIALS_STOPWORDS.contains(&w.to_lowercase().as_str()))
        .collect();

    let capitalized: Vec<char> = words
        .iter()
        .filter_map(|w| w.chars().next())
        .filter(|c| c.is_uppercase())
        .collect();

    // Only institution-like names: every significant word capitalized
    if capitalized.len() < MIN_CODE_LEN || capitalized.len() != words.len() {
        return None;
    }

    let code: String = capitalized.into_iter().flat_map(char::to_uppercase).collect();
    is_code(&code).then_some(code)
}

fn is_code(token: &str) -> bool {
    (MIN_CODE_LEN..=MAX_CODE_LEN).contains(&token.chars().count())
        && token.chars().all(|c| c.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContextMetadata;

    fn candidate(name: &str, subject: &str, institution: Option<&str>) -> CandidateContext {
        CandidateContext {
            name: name.to_string(),
            subject: subject.to_string(),
            description: None,
            metadata: ContextMetadata {
                institution: institution.map(str::to_string),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_same_content_same_id_across_runs() {
        let first = canonicalize(vec![candidate(
            "Supreme Electoral Tribunal ruling on eligibility",
            "Eligibility of the former president",
            None,
        )]);
        let second = canonicalize(vec![candidate(
            "Supreme Electoral Tribunal ruling on eligibility",
            "Eligibility of the former president",
            None,
        )]);

        assert_eq!(first[0].id, second[0].id);
        assert!(first[0].id.starts_with("TSE_"), "got {}", first[0].id);
        assert_eq!(first[0].id.len(), "TSE_".len() + 4);
    }

    #[test]
    fn test_whitespace_and_case_do_not_change_id() {
        let a = canonicalize(vec![candidate("Climate model study", "Warming trend", None)]);
        let b = canonicalize(vec![candidate("  climate   MODEL study ", "warming trend", None)]);
        assert_eq!(a[0].id, b[0].id);
    }

    #[test]
    fn test_detection_order_does_not_change_ids() {
        let a = candidate("Criminal case", "Fraud conviction", Some("STF"));
        let b = candidate("Electoral case", "Ineligibility", Some("TSE"));

        let forward = canonicalize(vec![a.clone(), b.clone()]);
        let reverse = canonicalize(vec![b, a]);

        let mut forward_ids: Vec<_> = forward.iter().map(|c| c.id.clone()).collect();
        let mut reverse_ids: Vec<_> = reverse.iter().map(|c| c.id.clone()).collect();
        forward_ids.sort();
        reverse_ids.sort();
        assert_eq!(forward_ids, reverse_ids);
    }

    #[test]
    fn test_distinct_content_distinct_ids() {
        let contexts = canonicalize(vec![
            candidate("Electoral case", "Ineligibility until 2030", Some("TSE")),
            candidate("Electoral case", "Campaign finance fine", Some("TSE")),
        ]);
        assert_eq!(contexts.len(), 2);
        assert_ne!(contexts[0].id, contexts[1].id);
    }

    #[test]
    fn test_identical_candidates_merge() {
        let mut second = candidate("Electoral case", "Ineligibility", Some("TSE"));
        second.metadata.date_anchor = Some("2023-06-30".to_string());

        let contexts = canonicalize(vec![
            candidate("Electoral case", "Ineligibility", Some("TSE")),
            second,
        ]);

        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].metadata.date_anchor.as_deref(), Some("2023-06-30"));
    }

    #[test]
    fn test_generic_prefix_without_institution() {
        let contexts = canonicalize(vec![candidate(
            "effects of remote work",
            "productivity studies",
            None,
        )]);
        assert!(contexts[0].id.starts_with("SCOPE_"));
        assert_eq!(contexts[0].id.len(), "SCOPE_".len() + 8);
    }

    #[test]
    fn test_collision_gets_suffix() {
        let contexts = canonicalize(vec![
            candidate("Ruling", "Subject 35", Some("TSE")),
            candidate("Ruling", "Subject 252", Some("TSE")),
            candidate("Ruling", "Subject 1", Some("STF")),
        ]);
        let ids: HashSet<&str> = contexts.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert!(contexts[2].id.starts_with("STF_"));
        assert!(!contexts[2].id.ends_with("_2"));
    }

    #[test]
    fn test_institution_code_extraction() {
        assert_eq!(code_from_text("Tribunal Superior Eleitoral"), Some("TSE".to_string()));
        assert_eq!(code_from_text("Federal Police (PF)"), Some("PF".to_string()));
        assert_eq!(code_from_text("ruling by the STF panel"), Some("STF".to_string()));
        assert_eq!(code_from_text("National Statistics Office"), Some("NSO".to_string()));
        assert_eq!(code_from_text("a study of wages"), None);
    }

    #[test]
    fn test_unscoped_never_generated() {
        let contexts = canonicalize(vec![candidate("UNSCOPED", "anything", Some("UNSCOPED"))]);
        assert_ne!(contexts[0].id, UNSCOPED_ID);
        assert!(!contexts[0].id.starts_with("UNSCOPED"));
    }

    #[test]
    fn test_attribute_context_by_name_or_id() {
        let contexts = canonicalize(vec![candidate("Electoral case", "Ineligibility", Some("TSE"))]);
        let id = contexts[0].id.clone();

        assert_eq!(attribute_context(Some("electoral CASE"), &contexts), id);
        assert_eq!(attribute_context(Some(&id), &contexts), id);
        assert_eq!(attribute_context(Some("unknown"), &contexts), UNSCOPED_ID);
        assert_eq!(attribute_context(None, &contexts), UNSCOPED_ID);
    }

    #[test]
    fn test_colliding_ids_do_not_depend_on_detection_order() {
        // Both projections hash to TSE_c8a6
        let a = candidate("Ruling", "Subject 35", Some("TSE"));
        let b = candidate("Ruling", "Subject 252", Some("TSE"));

        let forward = canonicalize(vec![a.clone(), b.clone()]);
        let reverse = canonicalize(vec![b, a]);

        assert_eq!(forward[0].subject, "Subject 35");
        assert_eq!(forward[0].id, "TSE_c8a6_2");
        assert_eq!(forward[1].id, "TSE_c8a6");
        assert_eq!(reverse[0].subject, "Subject 252");
        assert_eq!(reverse[0].id, "TSE_c8a6");
        assert_eq!(reverse[1].id, "TSE_c8a6_2");
    }
}
