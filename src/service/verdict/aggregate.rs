//! Deduplication and weighted rollup of claim verdicts
//!
//! Pure functions over the verdicts of one run. The result does not depend on
//! the order of the inputs: verdicts are sorted canonically before any
//! clustering or summation.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::model::{
    AggregationSettings, AnalysisContext, ClaimVerdict, ContextResearchReport, ContextVerdict, EvidenceFact,
    OverallVerdict, VerdictLabel, is_unscoped_id,
};

/// Claim, context and overall verdicts of a run
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub claim_verdicts: Vec<ClaimVerdict>,
    pub context_verdicts: Vec<ContextVerdict>,
    pub overall: OverallVerdict,
}

/// Aggregate claim verdicts into context and overall verdicts.
///
/// `UNSCOPED` verdicts are returned for display but never contribute weight.
/// Verdicts whose supporting facts all fail the same-context check keep zero
/// confidence.
pub fn aggregate(
    verdicts: Vec<ClaimVerdict>,
    facts: &[EvidenceFact],
    contexts: &[AnalysisContext],
    reports: &[ContextResearchReport],
    settings: &AggregationSettings,
) -> Aggregation {
    let mut facts_by_context: HashMap<&str, HashSet<&str>> = HashMap::new();
    for fact in facts.iter().filter(|f| !is_unscoped_id(&f.context_id)) {
        facts_by_context
            .entry(fact.context_id.as_str())
            .or_default()
            .insert(fact.id.as_str());
    }

    let mut verdicts: Vec<ClaimVerdict> = verdicts
        .into_iter()
        .map(|v| restrict_support(v, &facts_by_context))
        .collect();
    verdicts.sort_by(canonical_order);

    assign_dedup_weights(&mut verdicts, settings.similarity_threshold);

    let penalties: HashMap<&str, f64> = reports
        .iter()
        .map(|r| (r.context_id.as_str(), r.confidence_penalty.clamp(0.0, 1.0)))
        .collect();

    let mut ordered_contexts: Vec<&AnalysisContext> = contexts.iter().filter(|c| !c.is_unscoped()).collect();
    ordered_contexts.sort_by(|a, b| a.id.cmp(&b.id));
    ordered_contexts.dedup_by(|a, b| a.id == b.id);

    let context_verdicts: Vec<ContextVerdict> = ordered_contexts
        .iter()
        .map(|context| {
            let members: Vec<&ClaimVerdict> = verdicts.iter().filter(|v| v.context_id == context.id).collect();
            let penalty = penalties.get(context.id.as_str()).copied().unwrap_or(0.0);
            rollup_context(&context.id, &members, penalty, settings)
        })
        .collect();

    let orphaned = verdicts
        .iter()
        .filter(|v| !is_unscoped_id(&v.context_id) && !ordered_contexts.iter().any(|c| c.id == v.context_id))
        .count();
    if orphaned > 0 {
        tracing::warn!(verdicts = orphaned, "Verdicts reference unknown contexts and were not aggregated");
    }

    let overall = rollup_overall(&context_verdicts);

    Aggregation {
        claim_verdicts: verdicts,
        context_verdicts,
        overall,
    }
}

/// True when two overall verdicts (e.g. of a question and of its statement form)
/// are within `tolerance` truth points of each other
pub fn within_neutrality_tolerance(a: &OverallVerdict, b: &OverallVerdict, tolerance: f64) -> bool {
    match (a.truth_percentage, b.truth_percentage) {
        (None, None) => true,
        (Some(x), Some(y)) => (x - y).abs() <= tolerance,
        _ => false,
    }
}

fn restrict_support(mut verdict: ClaimVerdict, facts_by_context: &HashMap<&str, HashSet<&str>>) -> ClaimVerdict {
    let allowed = facts_by_context.get(verdict.context_id.as_str());
    let before = verdict.supporting_fact_ids.len();

    verdict
        .supporting_fact_ids
        .retain(|id| !is_unscoped_id(&verdict.context_id) && allowed.is_some_and(|ids| ids.contains(id.as_str())));
    verdict.supporting_fact_ids.sort();
    verdict.supporting_fact_ids.dedup();

    if verdict.supporting_fact_ids.len() < before {
        tracing::debug!(
            context_id = %verdict.context_id,
            dropped = before - verdict.supporting_fact_ids.len(),
            "Removed supporting facts from other contexts or unknown ids"
        );
    }

    verdict.truth_percentage = clamp_percentage(verdict.truth_percentage);
    verdict.confidence = if verdict.supporting_fact_ids.is_empty() {
        0.0
    } else {
        clamp_percentage(verdict.confidence)
    };
    verdict
}

fn clamp_percentage(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 100.0) }
}

fn canonical_order(a: &ClaimVerdict, b: &ClaimVerdict) -> Ordering {
    a.context_id
        .cmp(&b.context_id)
        .then_with(|| a.claim_text.cmp(&b.claim_text))
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.truth_percentage.total_cmp(&b.truth_percentage))
        .then_with(|| a.supporting_fact_ids.cmp(&b.supporting_fact_ids))
        .then_with(|| a.is_central.cmp(&b.is_central))
}

/// Lowercased alphanumeric tokens of a claim
pub fn token_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// J(A, B) = |A ∩ B| / |A ∪ B|, 0.0 when both sets are empty
pub fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Single-link clustering per context; weights are recomputed from scratch.
/// `verdicts` must already be in canonical order.
fn assign_dedup_weights(verdicts: &mut [ClaimVerdict], threshold: f64) {
    let tokens: Vec<HashSet<String>> = verdicts.iter().map(|v| token_set(&v.claim_text)).collect();
    let mut parent: Vec<usize> = (0..verdicts.len()).collect();

    for i in 0..verdicts.len() {
        for j in (i + 1)..verdicts.len() {
            if verdicts[i].context_id != verdicts[j].context_id {
                break;
            }
            if jaccard_similarity(&tokens[i], &tokens[j]) >= threshold {
                union(&mut parent, i, j);
            }
        }
    }

    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..verdicts.len() {
        let root = find(&mut parent, i);
        clusters.entry(root).or_default().push(i);
    }

    for members in clusters.values() {
        // Canonical order puts the highest-confidence member first on equal text;
        // across texts, pick explicitly
        let keeper = members
            .iter()
            .copied()
            .min_by(|&a, &b| {
                verdicts[b]
                    .confidence
                    .total_cmp(&verdicts[a].confidence)
                    .then_with(|| verdicts[a].claim_text.cmp(&verdicts[b].claim_text))
                    .then_with(|| a.cmp(&b))
            })
            .unwrap_or(members[0]);
        let shared = 1.0 / members.len() as f64;

        for &i in members {
            verdicts[i].dedup_weight = if i == keeper { 1.0 } else { shared };
        }
    }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let (ra, rb) = (find(parent, a), find(parent, b));
    if ra != rb {
        // Lower index wins so roots follow canonical order
        let (low, high) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parent[high] = low;
    }
}

fn centrality_weight(verdict: &ClaimVerdict, settings: &AggregationSettings) -> f64 {
    if verdict.is_central { settings.central_weight } else { 1.0 }
}

fn rollup_context(
    context_id: &str,
    members: &[&ClaimVerdict],
    penalty: f64,
    settings: &AggregationSettings,
) -> ContextVerdict {
    let mut truth_sum = 0.0;
    let mut weight_sum = 0.0;
    let mut confidence_sum = 0.0;
    let mut structural_sum = 0.0;

    for verdict in members {
        let confidence = verdict.confidence * (1.0 - penalty);
        let structural = centrality_weight(verdict, settings) * verdict.dedup_weight;
        let w = confidence * structural;

        truth_sum += verdict.truth_percentage * w;
        weight_sum += w;
        confidence_sum += confidence * structural;
        structural_sum += structural;
    }

    let truth_percentage = (weight_sum > 0.0).then(|| truth_sum / weight_sum);
    let confidence = if structural_sum > 0.0 && truth_percentage.is_some() {
        confidence_sum / structural_sum
    } else {
        0.0
    };

    ContextVerdict {
        context_id: context_id.to_string(),
        truth_percentage,
        confidence,
        claim_count: members.len(),
        label: VerdictLabel::from_truth(truth_percentage),
    }
}

fn rollup_overall(context_verdicts: &[ContextVerdict]) -> OverallVerdict {
    let weighted: Vec<(f64, f64)> = context_verdicts
        .iter()
        .filter(|c| !is_unscoped_id(&c.context_id))
        .filter_map(|c| c.truth_percentage.map(|t| (t, c.confidence)))
        .filter(|(_, confidence)| *confidence > 0.0)
        .collect();

    let weight_sum: f64 = weighted.iter().map(|(_, w)| w).sum();
    if weighted.is_empty() || weight_sum <= 0.0 {
        return OverallVerdict::insufficient();
    }

    let truth = weighted.iter().map(|(t, w)| t * w).sum::<f64>() / weight_sum;
    let confidence = weight_sum / weighted.len() as f64;

    OverallVerdict {
        truth_percentage: Some(truth),
        confidence,
        label: VerdictLabel::from_truth(Some(truth)),
        contexts_considered: weighted.len(),
    }
}
